//! # ringlog storage
//!
//! Block device abstraction consumed by the ringlog engine.
//!
//! Devices are **opaque, fixed-size byte regions** addressed in whole
//! blocks. They know nothing about master blocks, record headers or the
//! circular LSN space; `ringlog_core` owns all format interpretation.
//!
//! ## Design Principles
//!
//! - Every offset and length is a multiple of [`BLOCK_SIZE`]
//! - All operations are asynchronous and never block a runtime worker
//! - Devices must be `Send + Sync` so concurrent writes can be in flight
//!
//! ## Available Devices
//!
//! - [`InMemoryDevice`] - For testing and ephemeral logs
//! - [`FileDevice`] - For persistent logs backed by an OS file
//!
//! ## Example
//!
//! ```rust
//! use ringlog_storage::{BlockDevice, InMemoryDevice, BLOCK_SIZE};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let device = InMemoryDevice::with_len(4 * BLOCK_SIZE as u64);
//! device.write_at(0, &[7u8; BLOCK_SIZE]).await.unwrap();
//! let data = device.read_at(0, BLOCK_SIZE).await.unwrap();
//! assert_eq!(data[0], 7);
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod device;
mod error;
mod file;
mod memory;

pub use device::{check_alignment, BlockDevice, BLOCK_SIZE};
pub use error::{StorageError, StorageResult};
pub use file::FileDevice;
pub use memory::InMemoryDevice;
