use bytes::Bytes;
use core::fmt;

/// A contiguous column range of a row: `[start, end)`, optionally capped at
/// `limit` entries. An `end` of `None` reads to the end of the row.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SliceQuery {
    start: Bytes,
    end: Option<Bytes>,
    limit: Option<usize>,
}

impl SliceQuery {
    pub fn new(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            start: start.into(),
            end: Some(end.into()),
            limit: None,
        }
    }

    /// Every column of the row.
    pub const fn all() -> Self {
        Self {
            start: Bytes::new(),
            end: None,
            limit: None,
        }
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub const fn start(&self) -> &Bytes {
        &self.start
    }

    pub const fn end(&self) -> Option<&Bytes> {
        self.end.as_ref()
    }

    pub const fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn contains(&self, column: &[u8]) -> bool {
        column >= &self.start[..] && self.end.as_ref().is_none_or(|end| column < &end[..])
    }

    pub(crate) fn byte_size(&self) -> usize {
        self.start.len() + self.end.as_ref().map_or(0, Bytes::len) + size_of::<usize>()
    }
}

impl fmt::Display for SliceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, ", self.start)?;
        match &self.end {
            Some(end) => write!(f, "{end:?})")?,
            None => f.write_str("..)")?,
        }
        if let Some(limit) = self.limit {
            write!(f, " limit {limit}")?;
        }
        Ok(())
    }
}

/// A [`SliceQuery`] against one row key. This is the unit the cache stores
/// results under.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeySliceQuery {
    key: Bytes,
    slice: SliceQuery,
}

impl KeySliceQuery {
    pub fn new(key: impl Into<Bytes>, slice: SliceQuery) -> Self {
        Self {
            key: key.into(),
            slice,
        }
    }

    pub const fn key(&self) -> &Bytes {
        &self.key
    }

    pub const fn slice(&self) -> &SliceQuery {
        &self.slice
    }

    pub(crate) fn byte_size(&self) -> usize {
        self.key.len() + self.slice.byte_size()
    }
}
