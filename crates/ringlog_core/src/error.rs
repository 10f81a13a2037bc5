//! Error types for the ringlog engine.

use crate::types::{Asn, Lsn, StreamId, Version};
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur in ringlog operations.
///
/// The variants fall into four families:
///
/// - **resource exhaustion** (`InsufficientResources`, `LogFull`,
///   `ReservationExceeded`): the caller may retry later
/// - **version / identity conflicts** (`VersionConflict`, `StreamExists`,
///   ...): expected under optimistic concurrency
/// - **structural faults** (`StructuralFault`, `ChecksumMismatch`,
///   `StreamIdentityMismatch`): on-disk content is inconsistent and is never
///   repaired
/// - **invariant violations** (`InvariantViolation`): the in-memory model
///   has diverged from the on-disk contract; the log is faulted
#[derive(Debug, Error)]
pub enum LogError {
    /// Device error.
    #[error("storage error: {0}")]
    Storage(#[from] ringlog_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Memory for index bookkeeping could not be allocated.
    #[error("insufficient resources: {what}")]
    InsufficientResources {
        /// What could not be allocated.
        what: String,
    },

    /// The circular file has no free space for the request.
    #[error("log full: requested {requested} bytes, {available} available")]
    LogFull {
        /// Bytes requested.
        requested: u64,
        /// Bytes available to this request.
        available: u64,
    },

    /// A reserved write exceeded the stream's reservation.
    #[error("reservation exceeded: requested {requested} bytes, {reserved} reserved")]
    ReservationExceeded {
        /// Bytes requested.
        requested: u64,
        /// Bytes currently reserved by the stream.
        reserved: u64,
    },

    /// The Asn already holds an equal or newer version.
    #[error("version conflict at {asn}: existing version {existing_version}")]
    VersionConflict {
        /// The contested Asn.
        asn: Asn,
        /// The version already recorded.
        existing_version: Version,
    },

    /// The Asn lies at or below the stream's truncation point.
    #[error("{asn} is at or below truncation point {truncation_point}")]
    AsnTruncated {
        /// The rejected Asn.
        asn: Asn,
        /// The stream's truncation point.
        truncation_point: Asn,
    },

    /// A stream with this id already exists.
    #[error("stream already exists: {0}")]
    StreamExists(StreamId),

    /// No stream with this id exists.
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    /// The stream is open and cannot be deleted.
    #[error("stream is open: {0}")]
    StreamOpen(StreamId),

    /// The stream already has an open handle.
    #[error("stream already open: {0}")]
    StreamAlreadyOpen(StreamId),

    /// The stream is being deleted.
    #[error("stream delete pending: {0}")]
    StreamDeletePending(StreamId),

    /// The log's stream table is full.
    #[error("too many streams: limit {limit}")]
    TooManyStreams {
        /// Configured maximum.
        limit: u32,
    },

    /// On-disk content failed cross-field validation.
    #[error("structural fault: {message}")]
    StructuralFault {
        /// Description of the fault.
        message: String,
    },

    /// A record header checksum did not match.
    #[error("checksum mismatch at {lsn}: expected {expected:016x}, got {actual:016x}")]
    ChecksumMismatch {
        /// LSN of the record.
        lsn: Lsn,
        /// Checksum stored in the header.
        expected: u64,
        /// Checksum computed over the content.
        actual: u64,
    },

    /// A record belongs to a different stream than the one being walked.
    #[error("stream identity mismatch at {lsn}: expected {expected}, found {found}")]
    StreamIdentityMismatch {
        /// LSN of the record.
        lsn: Lsn,
        /// Stream being recovered or read.
        expected: StreamId,
        /// Stream id found in the header.
        found: StreamId,
    },

    /// A programming-contract breach; the log is no longer trustworthy.
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// Description of the violated invariant.
        message: String,
    },

    /// Invalid argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// Positional index out of range.
    #[error("index {index} out of range for {count} entries")]
    OutOfRange {
        /// Requested index.
        index: usize,
        /// Number of entries.
        count: usize,
    },

    /// Caller-supplied capacity is too small.
    #[error("buffer too small: {needed} entries needed")]
    BufferTooSmall {
        /// Entries needed.
        needed: usize,
    },

    /// A record exceeds the configured maximum.
    #[error("record too large: {size} bytes exceeds maximum of {max} bytes")]
    RecordTooLarge {
        /// Size requested.
        size: u64,
        /// Configured maximum.
        max: u64,
    },

    /// No record matches the lookup.
    #[error("record not found")]
    NotFound,

    /// The record exists but is not yet durable.
    #[error("{asn} is not yet durable")]
    RecordNotDurable {
        /// The Asn looked up.
        asn: Asn,
    },

    /// The stream's registered verifier rejected a record.
    #[error("record verification failed at {lsn}")]
    VerificationFailed {
        /// LSN of the rejected record.
        lsn: Lsn,
    },

    /// The log or stream handle is closed.
    #[error("log or stream is closed")]
    Closed,

    /// The log hit an unrecoverable error and refuses further work.
    #[error("log is faulted: {reason}")]
    Faulted {
        /// The error that faulted the log.
        reason: String,
    },
}

impl LogError {
    /// Creates a structural fault error.
    pub fn structural(message: impl Into<String>) -> Self {
        Self::StructuralFault {
            message: message.into(),
        }
    }

    /// Creates an invariant violation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an insufficient resources error.
    pub fn insufficient_resources(what: impl Into<String>) -> Self {
        Self::InsufficientResources { what: what.into() }
    }

    /// Returns true for on-disk corruption that must fail the mount.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::StructuralFault { .. }
                | Self::ChecksumMismatch { .. }
                | Self::StreamIdentityMismatch { .. }
        )
    }

    /// Returns true for errors the caller may resolve by retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientResources { .. }
                | Self::LogFull { .. }
                | Self::ReservationExceeded { .. }
                | Self::VersionConflict { .. }
                | Self::StreamDeletePending(_)
        )
    }
}
