//! Log configuration.

use crate::error::{LogError, LogResult};
use ringlog_storage::BLOCK_SIZE;

/// Configuration for creating or opening a physical log.
///
/// The geometry subset (`max_record_size`, `max_checkpoint_segment_size`)
/// is persisted in the master block at create time; on open the persisted
/// values replace whatever the caller supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Largest record (header, metadata and payload) the log accepts.
    pub max_record_size: u32,

    /// Exact size of every non-final segment of a multi-part stream checkpoint.
    pub max_checkpoint_segment_size: u32,

    /// Upper bound on bytes of issued but not yet completed writes.
    pub max_queued_write_bytes: u64,

    /// Bytes written to one stream before a stream checkpoint is taken.
    pub stream_checkpoint_interval: u64,

    /// Bytes written to the log before a physical checkpoint is taken.
    pub physical_checkpoint_interval: u64,

    /// Bytes read per request while searching for the head of the log.
    pub recovery_chunk_size: u32,

    /// Maximum number of resident streams.
    pub max_streams: u32,

    /// Maximum size of caller metadata attached to one record.
    pub max_metadata_size: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_record_size: 1024 * 1024,                // 1 MiB
            max_checkpoint_segment_size: 64 * 1024,      // 64 KiB
            max_queued_write_bytes: 8 * 1024 * 1024,     // 8 MiB
            stream_checkpoint_interval: 1024 * 1024,     // 1 MiB
            physical_checkpoint_interval: 4 * 1024 * 1024, // 4 MiB
            recovery_chunk_size: 1024 * 1024,            // 1 MiB
            max_streams: 64,
            max_metadata_size: 16 * 1024,
        }
    }
}

impl LogConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum record size.
    #[must_use]
    pub const fn max_record_size(mut self, size: u32) -> Self {
        self.max_record_size = size;
        self
    }

    /// Sets the multi-part checkpoint segment size.
    #[must_use]
    pub const fn max_checkpoint_segment_size(mut self, size: u32) -> Self {
        self.max_checkpoint_segment_size = size;
        self
    }

    /// Sets the write admission quota.
    #[must_use]
    pub const fn max_queued_write_bytes(mut self, bytes: u64) -> Self {
        self.max_queued_write_bytes = bytes;
        self
    }

    /// Sets the stream checkpoint interval.
    #[must_use]
    pub const fn stream_checkpoint_interval(mut self, bytes: u64) -> Self {
        self.stream_checkpoint_interval = bytes;
        self
    }

    /// Sets the physical checkpoint interval.
    #[must_use]
    pub const fn physical_checkpoint_interval(mut self, bytes: u64) -> Self {
        self.physical_checkpoint_interval = bytes;
        self
    }

    /// Sets the recovery search chunk size.
    #[must_use]
    pub const fn recovery_chunk_size(mut self, size: u32) -> Self {
        self.recovery_chunk_size = size;
        self
    }

    /// Sets the maximum number of streams.
    #[must_use]
    pub const fn max_streams(mut self, count: u32) -> Self {
        self.max_streams = count;
        self
    }

    /// Sets the maximum metadata size.
    #[must_use]
    pub const fn max_metadata_size(mut self, size: u32) -> Self {
        self.max_metadata_size = size;
        self
    }

    /// Checks the configuration for inconsistent geometry.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::InvalidArgument`] describing the first problem.
    pub fn validate(&self) -> LogResult<()> {
        let block = BLOCK_SIZE as u32;
        let aligned = |v: u32| v != 0 && v % block == 0;

        if !aligned(self.max_record_size) {
            return Err(LogError::invalid_argument(
                "max_record_size must be a non-zero multiple of the block size",
            ));
        }
        if !aligned(self.max_checkpoint_segment_size) {
            return Err(LogError::invalid_argument(
                "max_checkpoint_segment_size must be a non-zero multiple of the block size",
            ));
        }
        if self.max_checkpoint_segment_size > self.max_record_size {
            return Err(LogError::invalid_argument(
                "max_checkpoint_segment_size exceeds max_record_size",
            ));
        }
        if !aligned(self.recovery_chunk_size) {
            return Err(LogError::invalid_argument(
                "recovery_chunk_size must be a non-zero multiple of the block size",
            ));
        }
        if self.max_queued_write_bytes < u64::from(self.max_record_size) {
            return Err(LogError::invalid_argument(
                "max_queued_write_bytes must admit at least one maximum-size record",
            ));
        }
        if self.max_streams == 0 {
            return Err(LogError::invalid_argument("max_streams must be non-zero"));
        }
        if self.max_metadata_size + 4096 > self.max_record_size {
            return Err(LogError::invalid_argument(
                "max_metadata_size leaves no room for a record header",
            ));
        }
        Ok(())
    }
}
