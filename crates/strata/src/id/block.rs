use core::fmt;

use crate::error::{Error, Result};

/// A contiguous, half-open range `[start, end)` of ids reserved for one
/// partition by an [`IdAuthority`].
///
/// A block is never empty: [`IdBlock::new`] rejects `end <= start`.
///
/// [`IdAuthority`]: crate::IdAuthority
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdBlock {
    start: u64,
    end: u64,
}

impl IdBlock {
    /// Creates a block covering `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if the range is empty or
    /// inverted.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if end <= start {
            return Err(Error::invariant(format!(
                "id block [{start}, {end}) is empty or inverted"
            )));
        }
        Ok(Self { start, end })
    }

    pub const fn start(&self) -> u64 {
        self.start
    }

    /// Exclusive upper end of the block.
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// Number of ids in the block. Always at least one.
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Always `false`; kept for API symmetry with `len`.
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Returns the id at `index` within the block.
    pub const fn get(&self, index: u64) -> Option<u64> {
        if index < self.len() {
            Some(self.start + index)
        } else {
            None
        }
    }

    pub const fn contains(&self, id: u64) -> bool {
        id >= self.start && id < self.end
    }
}

impl fmt::Debug for IdBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdBlock[{}, {})", self.start, self.end)
    }
}

impl fmt::Display for IdBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Decides how many ids an authority reserves per block for a partition.
pub trait BlockSizer: Send + Sync {
    fn block_size(&self, partition: u32) -> u64;
}

impl<F> BlockSizer for F
where
    F: Fn(u32) -> u64 + Send + Sync,
{
    fn block_size(&self, partition: u32) -> u64 {
        self(partition)
    }
}

/// Uses the same block size for every partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedBlockSizer {
    size: u64,
}

impl FixedBlockSizer {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `size` is zero.
    pub fn new(size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::config("block size must be positive"));
        }
        Ok(Self { size })
    }
}

impl BlockSizer for FixedBlockSizer {
    fn block_size(&self, _partition: u32) -> u64 {
        self.size
    }
}
