//! Rebuilding in-memory state from disk.
//!
//! Physical recovery runs once per open and yields the log-wide state plus
//! the extent of every resident stream. Stream recovery runs lazily, the
//! first time a stream is opened.

mod physical;
mod stream;

pub(crate) use physical::HeaderCheck;
pub use physical::{recover_physical_log, RecoveredLogState, RecoveryOutcome};
pub use stream::{StreamRecovery, StreamRecoveryReport};
