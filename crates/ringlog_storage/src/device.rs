//! Block device trait definition.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;

/// Size of one device block in bytes.
///
/// Every read and write issued against a [`BlockDevice`] starts on a block
/// boundary and covers a whole number of blocks.
pub const BLOCK_SIZE: usize = 4096;

/// An asynchronous block-oriented device.
///
/// Devices are **opaque byte regions**. The engine decides where master
/// blocks and records live; the device only moves bytes.
///
/// # Invariants
///
/// - `read_at` returns exactly the bytes last written at that range
/// - `write_at` is not durable until a subsequent `flush` completes
/// - Concurrent `write_at` calls on disjoint ranges are permitted and may
///   complete in any order
/// - Offsets and lengths are multiples of [`BLOCK_SIZE`]
///
/// # Implementors
///
/// - [`super::InMemoryDevice`] - For testing
/// - [`super::FileDevice`] - For persistent storage
#[async_trait]
pub trait BlockDevice: Send + Sync + std::fmt::Debug {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The range is not block aligned
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    async fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not block aligned, extends beyond
    /// the current size, or an I/O error occurs.
    async fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Makes every completed write durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    async fn flush(&self) -> StorageResult<()>;

    /// Returns the current size of the device in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    async fn size(&self) -> StorageResult<u64>;

    /// Grows or shrinks the device to `len` bytes.
    ///
    /// Newly added bytes read back as zeros.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is not block aligned or resizing fails.
    async fn set_len(&self, len: u64) -> StorageResult<()>;
}

/// Checks that `offset` and `len` are both block aligned.
///
/// # Errors
///
/// Returns [`StorageError::Misaligned`] otherwise.
pub fn check_alignment(offset: u64, len: usize) -> StorageResult<()> {
    let block = BLOCK_SIZE as u64;
    if offset % block != 0 || (len as u64) % block != 0 {
        return Err(StorageError::Misaligned { offset, len });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_ranges_pass() {
        assert!(check_alignment(0, 0).is_ok());
        assert!(check_alignment(4096, 8192).is_ok());
    }

    #[test]
    fn misaligned_ranges_fail() {
        assert!(matches!(
            check_alignment(100, 4096),
            Err(StorageError::Misaligned { offset: 100, .. })
        ));
        assert!(matches!(
            check_alignment(4096, 10),
            Err(StorageError::Misaligned { len: 10, .. })
        ));
    }
}
