//! Crash simulation for recovery tests.
//!
//! [`CrashableDevice`] wraps another [`BlockDevice`] and misbehaves on
//! request:
//!
//! - **Byte budget**: after a set number of written bytes the device
//!   "crashes". The write that crosses the budget lands only partially (whole
//!   blocks up to the budget) and every later write fails.
//! - **Failing flush**: `flush` returns an error.
//! - **Delayed writes**: a write to a chosen offset completes late, so
//!   records finish out of LSN order.
//! - **Stalled writes**: a write to a chosen offset never completes, like
//!   an I/O that was in flight when the power went out.
//!
//! Tests keep a handle on the inner device and reopen the log on it after
//! dropping the crashed one.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ringlog_testkit::CrashableDevice;
//! use ringlog_storage::InMemoryDevice;
//! use std::sync::Arc;
//!
//! let inner = Arc::new(InMemoryDevice::new());
//! let device = Arc::new(CrashableDevice::new(inner.clone()));
//! device.crash_after(64 * 1024);
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use ringlog_storage::{BlockDevice, StorageError, StorageResult, BLOCK_SIZE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
enum Hold {
    Delay(Duration),
    Stall,
}

/// A block device wrapper that can simulate crashes.
#[derive(Debug)]
pub struct CrashableDevice {
    inner: Arc<dyn BlockDevice>,
    crash_after_bytes: AtomicU64,
    bytes_written: AtomicU64,
    crashed: AtomicBool,
    fail_on_flush: AtomicBool,
    holds: Mutex<HashMap<u64, Hold>>,
}

fn simulated(message: &str) -> StorageError {
    StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, message.to_string()))
}

impl CrashableDevice {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn BlockDevice>) -> Self {
        Self {
            inner,
            crash_after_bytes: AtomicU64::new(u64::MAX),
            bytes_written: AtomicU64::new(0),
            crashed: AtomicBool::new(false),
            fail_on_flush: AtomicBool::new(false),
            holds: Mutex::new(HashMap::new()),
        }
    }

    /// Crashes once `bytes` more bytes have been written.
    pub fn crash_after(&self, bytes: u64) {
        let written = self.bytes_written.load(Ordering::SeqCst);
        self.crash_after_bytes
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Sets whether flush should fail.
    pub fn set_fail_on_flush(&self, fail: bool) {
        self.fail_on_flush.store(fail, Ordering::SeqCst);
    }

    /// Delays the write starting at file `offset` by `delay`.
    pub fn delay_write_at(&self, offset: u64, delay: Duration) {
        self.holds.lock().insert(offset, Hold::Delay(delay));
    }

    /// Makes the write starting at file `offset` never complete.
    pub fn stall_write_at(&self, offset: u64) {
        self.holds.lock().insert(offset, Hold::Stall);
    }

    /// Clears every injected fault.
    pub fn reset(&self) {
        self.crash_after_bytes.store(u64::MAX, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.fail_on_flush.store(false, Ordering::SeqCst);
        self.holds.lock().clear();
    }

    /// Returns whether the device has crashed.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Bytes accepted by the inner device so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockDevice for CrashableDevice {
    async fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len).await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let hold = self.holds.lock().get(&offset).copied();
        match hold {
            Some(Hold::Delay(delay)) => tokio::time::sleep(delay).await,
            Some(Hold::Stall) => std::future::pending::<()>().await,
            None => {}
        }

        if self.crashed.load(Ordering::SeqCst) {
            return Err(simulated("simulated crash: device is gone"));
        }
        let len = data.len() as u64;
        let current = self.bytes_written.fetch_add(len, Ordering::SeqCst);
        let threshold = self.crash_after_bytes.load(Ordering::SeqCst);

        if current + len > threshold {
            self.crashed.store(true, Ordering::SeqCst);
            // Only whole blocks reach the disk before the crash.
            let budget = threshold.saturating_sub(current) as usize;
            let partial = budget / BLOCK_SIZE * BLOCK_SIZE;
            if partial > 0 {
                let _ = self.inner.write_at(offset, &data[..partial]).await;
            }
            return Err(simulated("simulated crash during write"));
        }
        self.inner.write_at(offset, data).await
    }

    async fn flush(&self) -> StorageResult<()> {
        if self.fail_on_flush.load(Ordering::SeqCst) || self.crashed.load(Ordering::SeqCst) {
            self.crashed.store(true, Ordering::SeqCst);
            return Err(simulated("simulated crash during flush"));
        }
        self.inner.flush().await
    }

    async fn size(&self) -> StorageResult<u64> {
        self.inner.size().await
    }

    async fn set_len(&self, len: u64) -> StorageResult<()> {
        self.inner.set_len(len).await
    }
}
