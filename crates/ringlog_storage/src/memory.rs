//! In-memory block device for testing.

use crate::device::{check_alignment, BlockDevice};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use parking_lot::RwLock;

/// An in-memory block device.
///
/// Suitable for:
/// - Unit tests
/// - Integration tests that snapshot and replay device contents
/// - Ephemeral logs that don't need persistence
///
/// Every write is immediately "durable"; `flush` is a no-op.
///
/// # Example
///
/// ```rust
/// use ringlog_storage::{BlockDevice, InMemoryDevice, BLOCK_SIZE};
///
/// let device = InMemoryDevice::with_len(2 * BLOCK_SIZE as u64);
/// assert_eq!(device.data().len(), 2 * BLOCK_SIZE);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryDevice {
    data: RwLock<Vec<u8>>,
}

impl InMemoryDevice {
    /// Creates a new empty device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a zero-filled device of `len` bytes.
    #[must_use]
    pub fn with_len(len: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; len as usize]),
        }
    }

    /// Creates a device with pre-existing contents.
    ///
    /// Useful for replaying a snapshot taken before a simulated crash.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of the device contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    fn check_range(&self, size: usize, offset: u64, len: usize) -> StorageResult<()> {
        check_alignment(offset, len)?;
        if offset.saturating_add(len as u64) > size as u64 {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: size as u64,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlockDevice for InMemoryDevice {
    async fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        self.check_range(data.len(), offset, len)?;
        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    async fn write_at(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        self.check_range(data.len(), offset, bytes.len())?;
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    async fn set_len(&self, len: u64) -> StorageResult<()> {
        check_alignment(0, len as usize)?;
        self.data.write().resize(len as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;

    #[tokio::test]
    async fn memory_new_is_empty() {
        let device = InMemoryDevice::new();
        assert_eq!(device.size().await.unwrap(), 0);
        assert!(device.data().is_empty());
    }

    #[tokio::test]
    async fn memory_write_then_read() {
        let device = InMemoryDevice::with_len(4 * BLOCK_SIZE as u64);
        device
            .write_at(2 * BLOCK_SIZE as u64, &[9u8; BLOCK_SIZE])
            .await
            .unwrap();

        let data = device.read_at(2 * BLOCK_SIZE as u64, BLOCK_SIZE).await.unwrap();
        assert!(data.iter().all(|b| *b == 9));
        let before = device.read_at(BLOCK_SIZE as u64, BLOCK_SIZE).await.unwrap();
        assert!(before.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn memory_write_past_end_fails() {
        let device = InMemoryDevice::with_len(BLOCK_SIZE as u64);
        let result = device.write_at(BLOCK_SIZE as u64, &[0u8; BLOCK_SIZE]).await;
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[tokio::test]
    async fn memory_misaligned_read_fails() {
        let device = InMemoryDevice::with_len(BLOCK_SIZE as u64);
        let result = device.read_at(0, 100).await;
        assert!(matches!(result, Err(StorageError::Misaligned { .. })));
    }

    #[tokio::test]
    async fn memory_with_data_and_set_len() {
        let device = InMemoryDevice::with_data(vec![1u8; BLOCK_SIZE]);
        device.set_len(2 * BLOCK_SIZE as u64).await.unwrap();
        let data = device.data();
        assert_eq!(data.len(), 2 * BLOCK_SIZE);
        assert_eq!(data[0], 1);
        assert_eq!(data[BLOCK_SIZE], 0);
    }

    #[tokio::test]
    async fn memory_flush_succeeds() {
        let device = InMemoryDevice::with_len(BLOCK_SIZE as u64);
        assert!(device.flush().await.is_ok());
    }
}
