//! Master block encoding.
//!
//! ```text
//! offset  size  field
//!      0    16  format signature
//!     16    16  log id
//!     32    16  per-log random signature (4 x u32)
//!     48     8  file size
//!     56     4  format version
//!     60     4  block size
//!     64     4  max record size
//!     68     4  max checkpoint segment size
//!     72     4  max metadata size
//!     76     4  reserved
//!     80     8  creation time (ms since the Unix epoch)
//!   4088     8  CRC-64 of bytes [0, 4088)
//! ```

use super::{get_guid, get_u32, get_u64, put_u32, put_u64, FORMAT_VERSION};
use crate::checksum::compute_crc64;
use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::types::LogId;
use ringlog_storage::BLOCK_SIZE;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Signature at the start of every master block.
pub const MASTER_SIGNATURE: [u8; 16] = *b"RINGLOG-MASTER\x00\x01";

const CHECKSUM_OFFSET: usize = BLOCK_SIZE - 8;

/// Identity and geometry of one log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MasterBlock {
    /// Identity of the log.
    pub log_id: LogId,
    /// Random words stamped into every record header.
    pub log_signature: [u32; 4],
    /// Size of the file in bytes.
    pub file_size: u64,
    /// Format version the file was created with.
    pub format_version: u32,
    /// Persisted `LogConfig::max_record_size`.
    pub max_record_size: u32,
    /// Persisted `LogConfig::max_checkpoint_segment_size`.
    pub max_checkpoint_segment_size: u32,
    /// Persisted `LogConfig::max_metadata_size`.
    pub max_metadata_size: u32,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

impl MasterBlock {
    /// Creates the master block of a new log with a fresh random signature.
    #[must_use]
    pub fn new(log_id: LogId, file_size: u64, config: &LogConfig) -> Self {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self {
            log_id,
            log_signature: rand::random(),
            file_size,
            format_version: FORMAT_VERSION,
            max_record_size: config.max_record_size,
            max_checkpoint_segment_size: config.max_checkpoint_segment_size,
            max_metadata_size: config.max_metadata_size,
            created_at_ms,
        }
    }

    /// Encodes the block into exactly [`BLOCK_SIZE`] bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[0..16].copy_from_slice(&MASTER_SIGNATURE);
        block[16..32].copy_from_slice(self.log_id.as_bytes());
        for (i, word) in self.log_signature.iter().enumerate() {
            put_u32(&mut block, 32 + i * 4, *word);
        }
        put_u64(&mut block, 48, self.file_size);
        put_u32(&mut block, 56, self.format_version);
        put_u32(&mut block, 60, BLOCK_SIZE as u32);
        put_u32(&mut block, 64, self.max_record_size);
        put_u32(&mut block, 68, self.max_checkpoint_segment_size);
        put_u32(&mut block, 72, self.max_metadata_size);
        put_u64(&mut block, 80, self.created_at_ms);
        let crc = compute_crc64(&block[..CHECKSUM_OFFSET]);
        put_u64(&mut block, CHECKSUM_OFFSET, crc);
        block
    }

    /// Decodes and validates a master block.
    ///
    /// # Errors
    ///
    /// Returns a structural fault if the signature, checksum or geometry
    /// is wrong.
    pub fn decode(block: &[u8]) -> LogResult<Self> {
        if block.len() != BLOCK_SIZE {
            return Err(LogError::structural("master block has wrong length"));
        }
        if block[0..16] != MASTER_SIGNATURE {
            return Err(LogError::structural("master block signature mismatch"));
        }
        let stored = get_u64(block, CHECKSUM_OFFSET);
        let computed = compute_crc64(&block[..CHECKSUM_OFFSET]);
        if stored != computed {
            return Err(LogError::structural(format!(
                "master block checksum mismatch: stored {stored:016x}, computed {computed:016x}"
            )));
        }

        let format_version = get_u32(block, 56);
        if format_version != FORMAT_VERSION {
            return Err(LogError::structural(format!(
                "unsupported format version {format_version}"
            )));
        }
        if get_u32(block, 60) as usize != BLOCK_SIZE {
            return Err(LogError::structural("master block records a foreign block size"));
        }

        let mut log_signature = [0u32; 4];
        for (i, word) in log_signature.iter_mut().enumerate() {
            *word = get_u32(block, 32 + i * 4);
        }
        let master = Self {
            log_id: LogId::from_bytes(get_guid(block, 16)),
            log_signature,
            file_size: get_u64(block, 48),
            format_version,
            max_record_size: get_u32(block, 64),
            max_checkpoint_segment_size: get_u32(block, 68),
            max_metadata_size: get_u32(block, 72),
            created_at_ms: get_u64(block, 80),
        };
        master
            .apply_to(LogConfig::default())
            .validate()
            .map_err(|e| LogError::structural(format!("master block geometry: {e}")))?;
        Ok(master)
    }

    /// Overrides the persisted geometry fields of `config`.
    #[must_use]
    pub fn apply_to(&self, config: LogConfig) -> LogConfig {
        let queued = config
            .max_queued_write_bytes
            .max(u64::from(self.max_record_size));
        config
            .max_record_size(self.max_record_size)
            .max_checkpoint_segment_size(self.max_checkpoint_segment_size)
            .max_metadata_size(self.max_metadata_size)
            .max_queued_write_bytes(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MasterBlock {
        MasterBlock::new(LogId::random(), 1 << 20, &LogConfig::default())
    }

    #[test]
    fn encode_decode_round_trip() {
        let master = sample();
        let block = master.encode();
        assert_eq!(block.len(), BLOCK_SIZE);
        assert_eq!(MasterBlock::decode(&block).unwrap(), master);
    }

    #[test]
    fn corrupted_block_rejected() {
        let mut block = sample().encode();
        block[100] ^= 1;
        let err = MasterBlock::decode(&block).unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn zeroed_block_rejected() {
        assert!(MasterBlock::decode(&vec![0u8; BLOCK_SIZE]).is_err());
    }

    #[test]
    fn persisted_geometry_wins() {
        let master = MasterBlock::new(
            LogId::random(),
            1 << 20,
            &LogConfig::new()
                .max_record_size(64 * 1024)
                .max_checkpoint_segment_size(8192)
                .max_metadata_size(4096),
        );
        let config = master.apply_to(LogConfig::default());
        assert_eq!(config.max_record_size, 64 * 1024);
        assert_eq!(config.max_checkpoint_segment_size, 8192);
        assert_eq!(config.max_metadata_size, 4096);
    }
}
