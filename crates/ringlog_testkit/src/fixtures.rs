//! Test fixtures and log helpers.
//!
//! Provides convenience functions for setting up test logs and common
//! test scenarios.

use ringlog_core::{LogConfig, LogId, LogResult, PhysicalLog};
use ringlog_storage::{BlockDevice, InMemoryDevice, BLOCK_SIZE};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Default size of a test log file: 4 MiB.
pub const TEST_FILE_SIZE: u64 = 1024 * BLOCK_SIZE as u64;

/// A configuration sized for small test logs.
///
/// Checkpoint segments are a single block so that a few hundred records
/// already produce multi-segment checkpoints.
pub fn small_config() -> LogConfig {
    LogConfig::new()
        .max_record_size(64 * 1024)
        .max_checkpoint_segment_size(BLOCK_SIZE as u32)
        .max_queued_write_bytes(512 * 1024)
        .stream_checkpoint_interval(256 * 1024)
        .physical_checkpoint_interval(512 * 1024)
        .recovery_chunk_size(64 * 1024)
        .max_streams(16)
        .max_metadata_size(8192)
}

/// Installs a `tracing` subscriber for test output.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A log on an in-memory device that can be "crashed" and reopened.
pub struct TestLog {
    /// The log instance.
    pub log: PhysicalLog,
    /// The device the log lives on; survives the log.
    pub device: Arc<InMemoryDevice>,
    /// Configuration used to create and reopen the log.
    pub config: LogConfig,
}

impl TestLog {
    /// Creates a log of [`TEST_FILE_SIZE`] bytes with [`small_config`].
    pub async fn new() -> Self {
        Self::with_config(small_config(), TEST_FILE_SIZE).await
    }

    /// Creates a log with the given configuration and size.
    pub async fn with_config(config: LogConfig, file_size: u64) -> Self {
        init_test_logging();
        let device = Arc::new(InMemoryDevice::new());
        let log = PhysicalLog::create(device.clone(), LogId::random(), file_size, config.clone())
            .await
            .expect("Failed to create test log");
        Self {
            log,
            device,
            config,
        }
    }

    /// Creates a log on `device`, keeping `inner` for reopening.
    ///
    /// Used with wrappers such as [`crate::CrashableDevice`].
    pub async fn on_device(inner: Arc<InMemoryDevice>, device: Arc<dyn BlockDevice>) -> Self {
        init_test_logging();
        let config = small_config();
        let log = PhysicalLog::create(device, LogId::random(), TEST_FILE_SIZE, config.clone())
            .await
            .expect("Failed to create test log");
        Self {
            log,
            device: inner,
            config,
        }
    }

    /// Drops the log without closing it, then opens the device again.
    ///
    /// Everything the device accepted before the drop survives.
    pub async fn crash_and_reopen(self) -> LogResult<Self> {
        let Self { log, device, config } = self;
        drop(log);
        let log = PhysicalLog::open(device.clone(), config.clone()).await?;
        Ok(Self {
            log,
            device,
            config,
        })
    }

    /// Closes the log cleanly, then opens the device again.
    pub async fn close_and_reopen(self) -> LogResult<Self> {
        self.log.close().await?;
        self.crash_and_reopen().await
    }
}

impl std::ops::Deref for TestLog {
    type Target = PhysicalLog;

    fn deref(&self) -> &Self::Target {
        &self.log
    }
}

/// Test scenario helpers.
pub mod scenarios {
    use ringlog_core::{Asn, LogStream, PhysicalLog, StreamId, StreamType};

    /// Payload written for `asn` by [`populated_stream`].
    pub fn payload_for(asn: u64, size: usize) -> Vec<u8> {
        (0..size).map(|i| (asn as usize + i) as u8).collect()
    }

    /// Creates a stream and writes Asns `1..=count`, version 1.
    pub async fn populated_stream(log: &PhysicalLog, count: u64, payload_size: usize) -> LogStream {
        let stream = log
            .create_stream(StreamId::random(), StreamType::random())
            .await
            .expect("Failed to create stream");
        for asn in 1..=count {
            stream
                .write(Asn::new(asn), 1, &asn.to_le_bytes(), &payload_for(asn, payload_size))
                .await
                .expect("Failed to write record");
        }
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringlog_core::{Asn, ReadType};

    #[tokio::test]
    async fn test_log_reopens() {
        let test_log = TestLog::new().await;
        let stream = scenarios::populated_stream(&test_log, 5, 100).await;
        let id = stream.id();
        stream.close();

        let test_log = test_log.crash_and_reopen().await.unwrap();
        let stream = test_log.open_stream(id).await.unwrap();
        let record = stream.read(Asn::new(5), ReadType::Exact).await.unwrap();
        assert_eq!(record.payload, scenarios::payload_for(5, 100));
    }

    #[test]
    fn small_config_is_valid() {
        assert!(small_config().validate().is_ok());
    }
}
