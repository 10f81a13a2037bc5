//! On-disk format of a ringlog file.
//!
//! ```text
//! +--------------+-------------------------------------+--------------+
//! | master block |  LSN space (circular record area)   | master block |
//! |   4096 B     |  file_size - 2 * 4096 bytes         |   4096 B     |
//! +--------------+-------------------------------------+--------------+
//! ```
//!
//! All integers are little-endian. Records start on block boundaries and
//! occupy a whole number of blocks; a record that runs past the end of the
//! LSN space continues at its start.

mod checkpoint;
mod geometry;
mod master;
mod record;
pub mod segmented;

pub use checkpoint::{
    PhysicalCheckpoint, StreamCheckpointImage, StreamCheckpointSegment, StreamExtent,
    PHYSICAL_CHECKPOINT_BODY_OFFSET,
};
pub use geometry::LogGeometry;
pub use master::{MasterBlock, MASTER_SIGNATURE};
pub use record::{
    body_checksum, round_up_to_block, seal, verify_checksum, CommonHeader, RecordImage,
    RecordIdentity, StreamFields, StreamRecordKind, UserRecordFields, CHECKPOINT_SEGMENT_PREAMBLE,
    COMMON_HEADER_SIZE, LSN_BLOCK_SIZE, USER_RECORD_METADATA_OFFSET,
};

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

pub(crate) fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn get_i64(bytes: &[u8], at: usize) -> i64 {
    get_u64(bytes, at) as i64
}

pub(crate) fn get_guid(bytes: &[u8], at: usize) -> [u8; 16] {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[at..at + 16]);
    raw
}

pub(crate) fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_i64(bytes: &mut [u8], at: usize, value: i64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
