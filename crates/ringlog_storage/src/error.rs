//! Error types for device operations.

use std::io;
use thiserror::Error;

/// Result type for device operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during device operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to access beyond the end of the device.
    #[error("access beyond end of device: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested offset.
        offset: u64,
        /// The requested length.
        len: usize,
        /// The current device size.
        size: u64,
    },

    /// An offset or length was not a multiple of the block size.
    #[error("misaligned device access: offset {offset}, len {len}")]
    Misaligned {
        /// The requested offset.
        offset: u64,
        /// The requested length.
        len: usize,
    },

    /// Another process holds the device lock.
    #[error("device is locked by another process")]
    Locked,

    /// The device is closed.
    #[error("device is closed")]
    Closed,
}
