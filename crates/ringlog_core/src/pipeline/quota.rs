//! Write admission quota.

use crate::error::{LogError, LogResult};
use ringlog_storage::BLOCK_SIZE;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the bytes of issued but not yet completed writes.
///
/// Permits are counted in blocks. A request larger than the whole quota is
/// clamped to it, so it waits for the log to drain rather than forever.
#[derive(Debug)]
pub(crate) struct WriteQuota {
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

impl WriteQuota {
    pub(crate) fn new(max_queued_bytes: u64) -> Self {
        let blocks = (max_queued_bytes / BLOCK_SIZE as u64)
            .clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize) as u64);
        Self {
            semaphore: Arc::new(Semaphore::new(blocks as usize)),
            capacity: blocks as u32,
        }
    }

    /// Waits until `bytes` of quota are free and takes them.
    ///
    /// The quota is returned when the permit drops.
    pub(crate) async fn acquire(&self, bytes: u64) -> LogResult<OwnedSemaphorePermit> {
        let blocks = bytes
            .div_ceil(BLOCK_SIZE as u64)
            .clamp(1, u64::from(self.capacity)) as u32;
        Arc::clone(&self.semaphore)
            .acquire_many_owned(blocks)
            .await
            .map_err(|_| LogError::Closed)
    }

    /// Fails every current and future waiter with `Closed`.
    pub(crate) fn close(&self) {
        self.semaphore.close();
    }

    /// Bytes of quota not currently held.
    #[cfg(test)]
    pub(crate) fn available_bytes(&self) -> u64 {
        self.semaphore.available_permits() as u64 * BLOCK_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const B: u64 = BLOCK_SIZE as u64;

    #[tokio::test]
    async fn waits_for_released_quota() {
        let quota = WriteQuota::new(4 * B);
        let held = quota.acquire(3 * B).await.unwrap();
        assert_eq!(quota.available_bytes(), B);

        let blocked = tokio::time::timeout(Duration::from_millis(20), quota.acquire(2 * B)).await;
        assert!(blocked.is_err());

        drop(held);
        let _permit = quota.acquire(2 * B).await.unwrap();
        assert_eq!(quota.available_bytes(), 2 * B);
    }

    #[tokio::test]
    async fn oversized_request_is_clamped() {
        let quota = WriteQuota::new(2 * B);
        let permit = quota.acquire(100 * B).await.unwrap();
        assert_eq!(quota.available_bytes(), 0);
        drop(permit);
        assert_eq!(quota.available_bytes(), 2 * B);
    }

    #[tokio::test]
    async fn close_fails_waiters() {
        let quota = WriteQuota::new(B);
        let _held = quota.acquire(B).await.unwrap();
        quota.close();
        assert!(matches!(quota.acquire(B).await, Err(LogError::Closed)));
    }
}
