//! # ringlog testkit
//!
//! Test utilities for ringlog.
//!
//! This crate provides:
//! - Test fixtures and log helpers
//! - Property-based workload generators using proptest
//! - A fault-injecting block device for crash recovery tests
//!
//! The cross-module integration tests live in `tests/`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ringlog_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn survives_crash() {
//!     let test_log = TestLog::new().await;
//!     let stream = scenarios::populated_stream(&test_log, 10, 100).await;
//!     let id = stream.id();
//!     drop(stream);
//!     let test_log = test_log.crash_and_reopen().await.unwrap();
//!     test_log.open_stream(id).await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
