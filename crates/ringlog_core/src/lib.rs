//! # ringlog core
//!
//! A physical write-ahead log shared by many logical streams.
//!
//! One fixed-size file holds a circular LSN space. Every stream appends
//! records addressed by an application sequence number (Asn) and reclaims
//! space by truncating the Asns it no longer needs.
//!
//! This crate provides:
//! - The on-disk format: master blocks, record headers, checkpoints
//! - Per-stream indexes: the [`AsnIndex`] and the [`LsnExtentTracker`]
//! - Physical log recovery and lazy per-stream recovery
//! - The write and checkpoint pipeline behind [`PhysicalLog`] and
//!   [`LogStream`]
//!
//! ## Durability
//!
//! A write returns only after its record and every record at a lower LSN
//! are durable. Stream checkpoints bound how far back stream recovery has
//! to walk; physical checkpoints bound the whole-log replay and record
//! which space is still in use.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ringlog_core::{Asn, LogConfig, LogId, PhysicalLog, ReadType, StreamId, StreamType};
//! use ringlog_storage::InMemoryDevice;
//! use std::sync::Arc;
//!
//! let log = PhysicalLog::create(
//!     Arc::new(InMemoryDevice::new()),
//!     LogId::random(),
//!     16 * 1024 * 1024,
//!     LogConfig::default(),
//! )
//! .await?;
//! let stream = log.create_stream(StreamId::random(), StreamType::random()).await?;
//! stream.write(Asn::new(1), 1, b"", b"hello").await?;
//! stream.truncate(Asn::new(1)).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checksum;
mod config;
mod descriptor;
mod error;
pub mod format;
mod index;
mod io;
mod log;
mod pipeline;
mod recovery;
mod stream;
mod types;

pub use checksum::{compute_crc64, Crc64};
pub use config::LogConfig;
pub use error::{LogError, LogResult};
pub use index::{AddOrUpdateResult, AsnEntry, AsnIndex, LsnEntry, LsnExtentTracker, SavedAsnState};
pub use io::{read_lsn_range, write_lsn_range};
pub use log::{PhysicalLog, SpaceInfo};
pub use recovery::{
    recover_physical_log, RecoveredLogState, RecoveryOutcome, StreamRecovery, StreamRecoveryReport,
};
pub use stream::{
    AsnRange, LogStream, ReadRecord, ReadType, RecordInfo, RecordVerifier, StreamInfo,
};
pub use types::{Asn, Disposition, LogId, Lsn, StreamId, StreamType, Version};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
