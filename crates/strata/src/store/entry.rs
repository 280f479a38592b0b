use bytes::{Buf, BufMut, Bytes};
use core::ops::Deref;
use std::sync::Arc;

use crate::error::{Error, Result};

const TAG_TTL: u8 = 1;
const TAG_TIMESTAMP: u8 = 2;
const TAG_VISIBILITY: u8 = 3;

/// Per-entry metadata understood by the store.
///
/// The set is closed: every variant knows how to encode, decode and validate
/// itself, and adding a variant means extending each `match` below.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EntryMetadata {
    /// Seconds until the entry expires in the backing store.
    Ttl(u32),
    /// Write timestamp, in microseconds since the Unix epoch.
    Timestamp(u64),
    /// Visibility label restricting who may read the entry.
    Visibility(String),
}

impl EntryMetadata {
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Ttl(_) => TAG_TTL,
            Self::Timestamp(_) => TAG_TIMESTAMP,
            Self::Visibility(_) => TAG_VISIBILITY,
        }
    }

    /// Bytes written by [`Self::encode`], tag included.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Ttl(_) => 4,
            Self::Timestamp(_) => 8,
            Self::Visibility(label) => 2 + label.len(),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] for a zero TTL or a visibility
    /// label that is empty or longer than `u16::MAX` bytes.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Ttl(0) => Err(Error::invariant("ttl metadata must be positive")),
            Self::Ttl(_) | Self::Timestamp(_) => Ok(()),
            Self::Visibility(label) if label.is_empty() => {
                Err(Error::invariant("visibility metadata must not be empty"))
            }
            Self::Visibility(label) if label.len() > usize::from(u16::MAX) => Err(Error::invariant(
                format!("visibility label of {} bytes is too long", label.len()),
            )),
            Self::Visibility(_) => Ok(()),
        }
    }

    /// Writes `tag || payload`. Integers are big-endian; the visibility label
    /// is length-prefixed with a `u16`.
    ///
    /// # Errors
    ///
    /// Fails if [`Self::validate`] does.
    pub fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        self.validate()?;
        buf.put_u8(self.tag());
        match self {
            Self::Ttl(secs) => buf.put_u32(*secs),
            Self::Timestamp(micros) => buf.put_u64(*micros),
            Self::Visibility(label) => {
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u16(label.len() as u16);
                buf.put_slice(label.as_bytes());
            }
        }
        Ok(())
    }

    /// Reads one value written by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] on an unknown tag, a truncated
    /// payload, or a decoded value that does not validate.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(Error::invariant("missing entry metadata tag"));
        }
        let tag = buf.get_u8();
        let need = match tag {
            TAG_TTL => 4,
            TAG_TIMESTAMP => 8,
            TAG_VISIBILITY => 2,
            other => return Err(Error::invariant(format!("unknown entry metadata tag {other}"))),
        };
        if buf.remaining() < need {
            return Err(Error::invariant(format!("truncated entry metadata (tag {tag})")));
        }
        let meta = match tag {
            TAG_TTL => Self::Ttl(buf.get_u32()),
            TAG_TIMESTAMP => Self::Timestamp(buf.get_u64()),
            _ => {
                let len = usize::from(buf.get_u16());
                if buf.remaining() < len {
                    return Err(Error::invariant("truncated visibility label"));
                }
                let raw = buf.copy_to_bytes(len);
                let label = String::from_utf8(raw.to_vec())
                    .map_err(|_| Error::invariant("visibility label is not valid utf-8"))?;
                Self::Visibility(label)
            }
        };
        meta.validate()?;
        Ok(meta)
    }
}

/// A single column/value pair of a row, with optional metadata.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Entry {
    column: Bytes,
    value: Bytes,
    metadata: Vec<EntryMetadata>,
}

impl Entry {
    pub fn new(column: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
            metadata: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: EntryMetadata) -> Self {
        self.metadata.push(metadata);
        self
    }

    pub const fn column(&self) -> &Bytes {
        &self.column
    }

    pub const fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn metadata(&self) -> &[EntryMetadata] {
        &self.metadata
    }

    /// Bytes held by the entry's buffers and encoded metadata.
    pub fn byte_size(&self) -> usize {
        self.column.len()
            + self.value.len()
            + self.metadata.iter().map(EntryMetadata::encoded_len).sum::<usize>()
    }

    /// # Errors
    ///
    /// Fails if any attached metadata does not validate.
    pub fn validate(&self) -> Result<()> {
        self.metadata.iter().try_for_each(EntryMetadata::validate)
    }
}

/// An immutable, column-ordered slice of a row.
///
/// Clones share the same allocation, so handing a cached list to many readers
/// is cheap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryList {
    entries: Arc<[Entry]>,
    byte_size: usize,
}

impl EntryList {
    /// Sum of [`Entry::byte_size`] over all entries.
    pub const fn byte_size(&self) -> usize {
        self.byte_size
    }
}

impl Deref for EntryList {
    type Target = [Entry];

    fn deref(&self) -> &Self::Target {
        &self.entries
    }
}

impl From<Vec<Entry>> for EntryList {
    fn from(entries: Vec<Entry>) -> Self {
        let byte_size = entries.iter().map(Entry::byte_size).sum();
        Self {
            entries: entries.into(),
            byte_size,
        }
    }
}

impl FromIterator<Entry> for EntryList {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        iter.into_iter().collect::<Vec<_>>().into()
    }
}

impl<'a> IntoIterator for &'a EntryList {
    type Item = &'a Entry;
    type IntoIter = core::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn metadata_encodes_and_decodes_each_variant() {
        let all = [
            EntryMetadata::Ttl(3600),
            EntryMetadata::Timestamp(1_700_000_000_000_000),
            EntryMetadata::Visibility("admin".into()),
        ];
        let mut buf = BytesMut::new();
        for meta in &all {
            meta.encode(&mut buf).unwrap();
        }
        assert_eq!(buf.len(), all.iter().map(EntryMetadata::encoded_len).sum::<usize>());

        let mut buf = buf.freeze();
        for meta in &all {
            assert_eq!(&EntryMetadata::decode(&mut buf).unwrap(), meta);
        }
        assert!(!buf.has_remaining());
    }

    #[test]
    fn invalid_metadata_is_rejected() {
        let mut buf = BytesMut::new();
        assert!(EntryMetadata::Ttl(0).encode(&mut buf).is_err());
        assert!(EntryMetadata::Visibility(String::new()).validate().is_err());
        assert!(buf.is_empty());

        assert!(EntryMetadata::decode(&mut &[9u8][..]).is_err());
        assert!(EntryMetadata::decode(&mut &[TAG_TIMESTAMP, 0, 1][..]).is_err());
        assert!(EntryMetadata::decode(&mut &[TAG_VISIBILITY, 0, 4, b'a'][..]).is_err());
    }

    #[test]
    fn entry_list_tracks_byte_size() {
        let list: EntryList = [
            Entry::new("a", "1234"),
            Entry::new("bb", "").with_metadata(EntryMetadata::Ttl(5)),
        ]
        .into_iter()
        .collect();

        assert_eq!(list.len(), 2);
        assert_eq!(list.byte_size(), (1 + 4) + (2 + 5));
        assert_eq!(list[1].column(), &Bytes::from_static(b"bb"));
        assert!(EntryList::default().is_empty());
    }
}
