//! Per-stream in-memory indexes.
//!
//! Each stream owns one [`LsnExtentTracker`] (where its records live on
//! disk) and one [`AsnIndex`] (which record holds each application
//! sequence number). Both are synchronous and guarded by their own lock;
//! callers never hold either across a device I/O.

mod asn_index;
mod lsn_tracker;

pub use asn_index::{AddOrUpdateResult, AsnEntry, AsnIndex, SavedAsnState};
pub use lsn_tracker::{LsnEntry, LsnExtentTracker};
