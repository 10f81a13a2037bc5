//! Mapping from LSN to file offset.

use crate::error::{LogError, LogResult};
use crate::types::Lsn;
use ringlog_storage::BLOCK_SIZE;
use serde::Serialize;

/// Size facts of one log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogGeometry {
    file_size: u64,
    lsn_space: u64,
}

impl LogGeometry {
    /// Smallest accepted file: two master blocks plus sixteen record blocks.
    pub const MIN_FILE_SIZE: u64 = 18 * BLOCK_SIZE as u64;

    /// Derives the geometry of a file of `file_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the size is unaligned or too small.
    pub fn new(file_size: u64) -> LogResult<Self> {
        if file_size % BLOCK_SIZE as u64 != 0 || file_size < Self::MIN_FILE_SIZE {
            return Err(LogError::invalid_argument(format!(
                "file size {file_size} must be a multiple of {BLOCK_SIZE} and at least {}",
                Self::MIN_FILE_SIZE
            )));
        }
        Ok(Self {
            file_size,
            lsn_space: file_size - 2 * BLOCK_SIZE as u64,
        })
    }

    /// Total file size.
    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes of circular record space.
    #[must_use]
    pub const fn lsn_space(&self) -> u64 {
        self.lsn_space
    }

    /// Offset of the trailing master block.
    #[must_use]
    pub const fn tail_master_offset(&self) -> u64 {
        self.file_size - BLOCK_SIZE as u64
    }

    /// Position of `lsn` within the LSN space.
    #[must_use]
    pub const fn position(&self, lsn: Lsn) -> u64 {
        (lsn.as_i64() as u64) % self.lsn_space
    }

    /// File offset of `lsn`.
    #[must_use]
    pub const fn physical_offset(&self, lsn: Lsn) -> u64 {
        BLOCK_SIZE as u64 + self.position(lsn)
    }

    /// Splits a `len` byte extent at `lsn` into up to two file extents.
    ///
    /// The second extent is present only when the record wraps.
    #[must_use]
    pub fn extents(&self, lsn: Lsn, len: u64) -> ((u64, u64), Option<(u64, u64)>) {
        let position = self.position(lsn);
        let first_len = len.min(self.lsn_space - position);
        let first = (BLOCK_SIZE as u64 + position, first_len);
        if first_len == len {
            (first, None)
        } else {
            (first, Some((BLOCK_SIZE as u64, len - first_len)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const B: u64 = BLOCK_SIZE as u64;

    #[test]
    fn rejects_bad_sizes() {
        assert!(LogGeometry::new(B * 18 + 1).is_err());
        assert!(LogGeometry::new(B * 4).is_err());
    }

    #[test]
    fn offsets_wrap_past_master_block() {
        let geometry = LogGeometry::new(B * 20).unwrap();
        assert_eq!(geometry.lsn_space(), B * 18);
        assert_eq!(geometry.physical_offset(Lsn::ZERO), B);
        assert_eq!(geometry.physical_offset(Lsn::new((B * 18) as i64)), B);
        assert_eq!(geometry.tail_master_offset(), B * 19);
    }

    #[test]
    fn wrapping_extent_splits_in_two() {
        let geometry = LogGeometry::new(B * 20).unwrap();
        let (first, second) = geometry.extents(Lsn::new((B * 17) as i64), B * 3);
        assert_eq!(first, (B * 18, B));
        assert_eq!(second, Some((B, B * 2)));

        let (first, second) = geometry.extents(Lsn::new((B * 2) as i64), B * 3);
        assert_eq!(first, (B * 3, B * 3));
        assert_eq!(second, None);
    }
}
