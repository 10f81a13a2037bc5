//! Record header layout and checksumming.
//!
//! Every record starts with a 128 byte common header:
//!
//! ```text
//! offset  size  field
//!      0     8  lsn                    ┐
//!      8     8  highest completed lsn  │ LSN block, stamped at
//!     16     8  last checkpoint lsn    │ allocation time
//!     24     8  prev lsn in stream     ┘
//!     32    16  log id
//!     48     4  format version
//!     52     4  reserved
//!     56    16  log signature (4 x u32)
//!     72    16  stream id
//!     88    16  stream type
//!    104     4  header size        (multiple of 4096)
//!    108     4  metadata size      (bytes used after the common header)
//!    112     4  io buffer size     (multiple of 4096)
//!    116     4  reserved
//!    120     8  checksum
//! ```
//!
//! The checksum is computed in two phases: first over bytes
//! `[32, 128 + metadata_size)` with the checksum field read as zero, then
//! over the LSN block `[0, 32)`. The first phase can therefore be done
//! before an LSN is assigned. The payload is not covered.
//!
//! User streams place their own fields right after the common header:
//!
//! ```text
//!    128     4  record kind (1 = user, 2 = checkpoint)
//!    136     8  truncation point asn
//!    144     8  copy-forward lsn
//!  user record:
//!    152     8  asn
//!    160     8  version
//!    168     4  user metadata size
//!    172     4  payload size
//!    176     -  user metadata
//!  checkpoint segment:
//!    152     4  segment count
//!    156     4  segment number
//!    160     4  asn entry count
//!    164     4  lsn entry count
//!    168     -  asn entries, then lsn entries
//! ```

use super::{get_guid, get_i64, get_u32, get_u64, put_i64, put_u32, put_u64};
use crate::checksum::Crc64;
use crate::error::{LogError, LogResult};
use crate::types::{Asn, LogId, Lsn, StreamId, StreamType, Version};
use ringlog_storage::BLOCK_SIZE;

/// Size of the common header.
pub const COMMON_HEADER_SIZE: usize = 128;

/// Size of the LSN block at the start of the header.
pub const LSN_BLOCK_SIZE: usize = 32;

const CHECKSUM_OFFSET: usize = 120;

const STREAM_FIELDS_OFFSET: usize = COMMON_HEADER_SIZE;
const KIND_FIELDS_OFFSET: usize = 152;

/// Offset of user metadata in a user record.
pub const USER_RECORD_METADATA_OFFSET: usize = 176;

/// Bytes at the start of every checkpoint segment before its entries.
pub const CHECKPOINT_SEGMENT_PREAMBLE: usize = 168;

/// Rounds `n` up to a whole number of blocks.
#[must_use]
pub const fn round_up_to_block(n: usize) -> usize {
    n.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// The common header of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    /// LSN of this record.
    pub lsn: Lsn,
    /// Highest LSN below which every write had completed at allocation.
    pub highest_completed_lsn: Lsn,
    /// LSN of the latest physical checkpoint at allocation.
    pub last_checkpoint_lsn: Lsn,
    /// Previous record of the same stream.
    pub prev_lsn_in_stream: Lsn,
    /// Owning log.
    pub log_id: LogId,
    /// Format version.
    pub format_version: u32,
    /// Per-log random signature.
    pub log_signature: [u32; 4],
    /// Owning stream.
    pub stream_id: StreamId,
    /// Type of the owning stream.
    pub stream_type: StreamType,
    /// Bytes of the header and metadata region.
    pub header_size: u32,
    /// Bytes in use after the common header.
    pub metadata_size: u32,
    /// Bytes of payload after the header region.
    pub io_buffer_size: u32,
    /// Stored checksum.
    pub checksum: u64,
}

impl CommonHeader {
    /// Total bytes the record occupies.
    #[must_use]
    pub const fn record_size(&self) -> u64 {
        self.header_size as u64 + self.io_buffer_size as u64
    }

    /// LSN just past this record.
    #[must_use]
    pub const fn next_lsn(&self) -> Lsn {
        self.lsn.advance(self.record_size())
    }

    /// Encodes every field except the checksum.
    pub fn encode_into(&self, out: &mut [u8]) {
        stamp_lsns(
            out,
            self.lsn,
            self.highest_completed_lsn,
            self.last_checkpoint_lsn,
            self.prev_lsn_in_stream,
        );
        out[32..48].copy_from_slice(self.log_id.as_bytes());
        put_u32(out, 48, self.format_version);
        put_u32(out, 52, 0);
        for (i, word) in self.log_signature.iter().enumerate() {
            put_u32(out, 56 + i * 4, *word);
        }
        out[72..88].copy_from_slice(self.stream_id.as_bytes());
        out[88..104].copy_from_slice(self.stream_type.as_bytes());
        put_u32(out, 104, self.header_size);
        put_u32(out, 108, self.metadata_size);
        put_u32(out, 112, self.io_buffer_size);
        put_u32(out, 116, 0);
        put_u64(out, CHECKSUM_OFFSET, 0);
    }

    /// Decodes the common header from the start of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns a structural fault if fewer than 128 bytes are supplied.
    pub fn decode(bytes: &[u8]) -> LogResult<Self> {
        if bytes.len() < COMMON_HEADER_SIZE {
            return Err(LogError::structural(format!(
                "record header truncated at {} bytes",
                bytes.len()
            )));
        }
        let mut log_signature = [0u32; 4];
        for (i, word) in log_signature.iter_mut().enumerate() {
            *word = get_u32(bytes, 56 + i * 4);
        }
        Ok(Self {
            lsn: Lsn::new(get_i64(bytes, 0)),
            highest_completed_lsn: Lsn::new(get_i64(bytes, 8)),
            last_checkpoint_lsn: Lsn::new(get_i64(bytes, 16)),
            prev_lsn_in_stream: Lsn::new(get_i64(bytes, 24)),
            log_id: LogId::from_bytes(get_guid(bytes, 32)),
            format_version: get_u32(bytes, 48),
            log_signature,
            stream_id: StreamId::from_bytes(get_guid(bytes, 72)),
            stream_type: StreamType::from_bytes(get_guid(bytes, 88)),
            header_size: get_u32(bytes, 104),
            metadata_size: get_u32(bytes, 108),
            io_buffer_size: get_u32(bytes, 112),
            checksum: get_u64(bytes, CHECKSUM_OFFSET),
        })
    }

    /// Checks the cross-field rules every well-formed header obeys.
    ///
    /// # Errors
    ///
    /// Returns a structural fault naming the first broken rule.
    pub fn check_shape(&self, max_record_size: u32) -> LogResult<()> {
        let block = BLOCK_SIZE as u32;
        let fault = |what: &str| {
            Err(LogError::structural(format!(
                "record at {}: {what}",
                self.lsn
            )))
        };
        if !self.lsn.is_valid() {
            return fault("lsn out of range");
        }
        if self.header_size == 0 || self.header_size % block != 0 || self.io_buffer_size % block != 0 {
            return fault("sizes are not block multiples");
        }
        if self.record_size() > u64::from(max_record_size) {
            return fault("record exceeds max record size");
        }
        if COMMON_HEADER_SIZE as u64 + u64::from(self.metadata_size) > u64::from(self.header_size) {
            return fault("metadata overruns header");
        }
        if !self.prev_lsn_in_stream.is_null() && self.prev_lsn_in_stream >= self.lsn {
            return fault("prev lsn in stream is not below lsn");
        }
        if self.highest_completed_lsn >= self.lsn {
            return fault("highest completed lsn is not below lsn");
        }
        if !self.last_checkpoint_lsn.is_null() && self.last_checkpoint_lsn >= self.lsn {
            return fault("last checkpoint lsn is not below lsn");
        }
        Ok(())
    }
}

/// Writes the four LSN fields at the start of `record`.
pub fn stamp_lsns(
    record: &mut [u8],
    lsn: Lsn,
    highest_completed_lsn: Lsn,
    last_checkpoint_lsn: Lsn,
    prev_lsn_in_stream: Lsn,
) {
    put_i64(record, 0, lsn.as_i64());
    put_i64(record, 8, highest_completed_lsn.as_i64());
    put_i64(record, 16, last_checkpoint_lsn.as_i64());
    put_i64(record, 24, prev_lsn_in_stream.as_i64());
}

/// First checksum phase: header body and metadata.
#[must_use]
pub fn body_checksum(record: &[u8], metadata_size: u32) -> Crc64 {
    let end = (COMMON_HEADER_SIZE + metadata_size as usize).min(record.len());
    let mut crc = Crc64::new();
    crc.update(&record[LSN_BLOCK_SIZE..CHECKSUM_OFFSET]);
    crc.update(&[0u8; 8]);
    crc.update(&record[COMMON_HEADER_SIZE..end]);
    crc
}

fn finish_checksum(record: &[u8], mut body: Crc64) -> u64 {
    body.update(&record[..LSN_BLOCK_SIZE]);
    body.finish()
}

/// Second checksum phase: folds in the LSN block and stores the result.
pub fn seal(record: &mut [u8], body: Crc64) {
    let checksum = finish_checksum(record, body);
    put_u64(record, CHECKSUM_OFFSET, checksum);
}

/// Verifies the stored checksum of a record header region.
///
/// # Errors
///
/// Returns `ChecksumMismatch` if the stored and computed values differ.
pub fn verify_checksum(record: &[u8]) -> LogResult<()> {
    let header = CommonHeader::decode(record)?;
    if COMMON_HEADER_SIZE + header.metadata_size as usize > record.len() {
        return Err(LogError::structural(format!(
            "record at {}: metadata extends past the supplied bytes",
            header.lsn
        )));
    }
    let actual = finish_checksum(record, body_checksum(record, header.metadata_size));
    if actual != header.checksum {
        return Err(LogError::ChecksumMismatch {
            lsn: header.lsn,
            expected: header.checksum,
            actual,
        });
    }
    Ok(())
}

/// Kind of a user-stream record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StreamRecordKind {
    /// An application record at an Asn.
    User = 1,
    /// One segment of a stream checkpoint.
    Checkpoint = 2,
}

impl StreamRecordKind {
    /// Converts a raw value to a kind.
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::User),
            2 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// Fields shared by all user-stream records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFields {
    /// Record kind.
    pub kind: StreamRecordKind,
    /// Stream truncation point when the record was built.
    pub truncation_point: Asn,
    /// Source LSN if the record was copied forward, else null.
    pub copy_forward_lsn: Lsn,
}

impl StreamFields {
    /// Encodes the fields into a record image.
    pub fn encode_into(&self, record: &mut [u8]) {
        put_u32(record, STREAM_FIELDS_OFFSET, self.kind as u32);
        put_u32(record, STREAM_FIELDS_OFFSET + 4, 0);
        put_u64(record, STREAM_FIELDS_OFFSET + 8, self.truncation_point.as_u64());
        put_i64(record, STREAM_FIELDS_OFFSET + 16, self.copy_forward_lsn.as_i64());
    }

    /// Decodes the fields from a record image.
    ///
    /// # Errors
    ///
    /// Returns a structural fault on a short buffer or an unknown kind.
    pub fn decode(record: &[u8]) -> LogResult<Self> {
        if record.len() < KIND_FIELDS_OFFSET {
            return Err(LogError::structural("stream record fields truncated"));
        }
        let raw_kind = get_u32(record, STREAM_FIELDS_OFFSET);
        let kind = StreamRecordKind::from_u32(raw_kind)
            .ok_or_else(|| LogError::structural(format!("unknown stream record kind {raw_kind}")))?;
        Ok(Self {
            kind,
            truncation_point: Asn::new(get_u64(record, STREAM_FIELDS_OFFSET + 8)),
            copy_forward_lsn: Lsn::new(get_i64(record, STREAM_FIELDS_OFFSET + 16)),
        })
    }
}

/// Fields of an application record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRecordFields {
    /// Application sequence number.
    pub asn: Asn,
    /// Version of the write.
    pub version: Version,
    /// Bytes of caller metadata.
    pub user_metadata_size: u32,
    /// Bytes of payload before block padding.
    pub payload_size: u32,
}

impl UserRecordFields {
    /// Encodes the fields into a record image.
    pub fn encode_into(&self, record: &mut [u8]) {
        put_u64(record, KIND_FIELDS_OFFSET, self.asn.as_u64());
        put_u64(record, KIND_FIELDS_OFFSET + 8, self.version);
        put_u32(record, KIND_FIELDS_OFFSET + 16, self.user_metadata_size);
        put_u32(record, KIND_FIELDS_OFFSET + 20, self.payload_size);
    }

    /// Decodes the fields from a record image.
    ///
    /// # Errors
    ///
    /// Returns a structural fault on a short buffer.
    pub fn decode(record: &[u8]) -> LogResult<Self> {
        if record.len() < USER_RECORD_METADATA_OFFSET {
            return Err(LogError::structural("user record fields truncated"));
        }
        Ok(Self {
            asn: Asn::new(get_u64(record, KIND_FIELDS_OFFSET)),
            version: get_u64(record, KIND_FIELDS_OFFSET + 8),
            user_metadata_size: get_u32(record, KIND_FIELDS_OFFSET + 16),
            payload_size: get_u32(record, KIND_FIELDS_OFFSET + 20),
        })
    }
}

/// Identity fields stamped into every record of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordIdentity {
    /// Owning log.
    pub log_id: LogId,
    /// Per-log random signature.
    pub log_signature: [u32; 4],
    /// Owning stream.
    pub stream_id: StreamId,
    /// Type of the owning stream.
    pub stream_type: StreamType,
}

impl RecordIdentity {
    /// Returns true if `header` carries this log's id and signature.
    #[must_use]
    pub fn same_log(&self, header: &CommonHeader) -> bool {
        header.log_id == self.log_id && header.log_signature == self.log_signature
    }
}

/// A record being assembled in memory.
///
/// The header region is rounded up to whole blocks and the payload
/// follows it, also block-padded.
#[derive(Debug, Clone)]
pub struct RecordImage {
    bytes: Vec<u8>,
    header_size: u32,
    metadata_size: u32,
    io_buffer_size: u32,
}

impl RecordImage {
    /// Allocates a zeroed image for `metadata_size` bytes after the common
    /// header and the given payload.
    #[must_use]
    pub fn new(metadata_size: usize, payload: &[u8]) -> Self {
        let header_size = round_up_to_block(COMMON_HEADER_SIZE + metadata_size);
        let io_buffer_size = round_up_to_block(payload.len());
        let mut bytes = vec![0u8; header_size + io_buffer_size];
        bytes[header_size..header_size + payload.len()].copy_from_slice(payload);
        Self {
            bytes,
            header_size: header_size as u32,
            metadata_size: metadata_size as u32,
            io_buffer_size: io_buffer_size as u32,
        }
    }

    /// Header region size.
    #[must_use]
    pub const fn header_size(&self) -> u32 {
        self.header_size
    }

    /// Bytes in use after the common header.
    #[must_use]
    pub const fn metadata_size(&self) -> u32 {
        self.metadata_size
    }

    /// Payload region size.
    #[must_use]
    pub const fn io_buffer_size(&self) -> u32 {
        self.io_buffer_size
    }

    /// Total record size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the image holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Writes the common header, taking the sizes from the image.
    pub fn write_common_header(&mut self, identity: &RecordIdentity) {
        let header = CommonHeader {
            lsn: Lsn::NULL,
            highest_completed_lsn: Lsn::NULL,
            last_checkpoint_lsn: Lsn::NULL,
            prev_lsn_in_stream: Lsn::NULL,
            log_id: identity.log_id,
            format_version: super::FORMAT_VERSION,
            log_signature: identity.log_signature,
            stream_id: identity.stream_id,
            stream_type: identity.stream_type,
            header_size: self.header_size,
            metadata_size: self.metadata_size,
            io_buffer_size: self.io_buffer_size,
            checksum: 0,
        };
        header.encode_into(&mut self.bytes);
    }

    /// Mutable view of the whole record.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// The whole record.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// First checksum phase over the current content.
    #[must_use]
    pub fn body_checksum(&self) -> Crc64 {
        body_checksum(&self.bytes, self.metadata_size)
    }

    /// Stamps the LSN block and completes the checksum.
    pub fn finalize(
        &mut self,
        body: Crc64,
        lsn: Lsn,
        highest_completed_lsn: Lsn,
        last_checkpoint_lsn: Lsn,
        prev_lsn_in_stream: Lsn,
    ) {
        stamp_lsns(
            &mut self.bytes,
            lsn,
            highest_completed_lsn,
            last_checkpoint_lsn,
            prev_lsn_in_stream,
        );
        seal(&mut self.bytes, body);
    }

    /// Consumes the image.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_image(payload: &[u8], metadata: &[u8]) -> RecordImage {
        let meta_len = USER_RECORD_METADATA_OFFSET - COMMON_HEADER_SIZE + metadata.len();
        let mut image = RecordImage::new(meta_len, payload);
        image.write_common_header(&RecordIdentity {
            log_id: LogId::random(),
            log_signature: [1, 2, 3, 4],
            stream_id: StreamId::random(),
            stream_type: StreamType::random(),
        });
        StreamFields {
            kind: StreamRecordKind::User,
            truncation_point: Asn::NULL,
            copy_forward_lsn: Lsn::NULL,
        }
        .encode_into(image.bytes_mut());
        UserRecordFields {
            asn: Asn::new(9),
            version: 2,
            user_metadata_size: metadata.len() as u32,
            payload_size: payload.len() as u32,
        }
        .encode_into(image.bytes_mut());
        image.bytes_mut()[USER_RECORD_METADATA_OFFSET..USER_RECORD_METADATA_OFFSET + metadata.len()]
            .copy_from_slice(metadata);
        image
    }

    #[test]
    fn image_sizes_are_block_multiples() {
        let image = user_image(&[7u8; 5000], b"meta");
        assert_eq!(image.header_size(), 4096);
        assert_eq!(image.io_buffer_size(), 8192);
        assert_eq!(image.len(), 12288);
    }

    #[test]
    fn two_phase_checksum_verifies() {
        let mut image = user_image(b"payload", b"meta");
        let body = image.body_checksum();
        image.finalize(body, Lsn::new(8192), Lsn::new(4095), Lsn::ZERO, Lsn::new(4096));

        verify_checksum(image.as_bytes()).unwrap();
        let header = CommonHeader::decode(image.as_bytes()).unwrap();
        assert_eq!(header.lsn, Lsn::new(8192));
        assert_eq!(header.next_lsn(), Lsn::new(16384));
        header.check_shape(1 << 20).unwrap();

        let fields = UserRecordFields::decode(image.as_bytes()).unwrap();
        assert_eq!(fields.asn, Asn::new(9));
        assert_eq!(fields.payload_size, 7);
        assert_eq!(StreamFields::decode(image.as_bytes()).unwrap().kind, StreamRecordKind::User);
    }

    #[test]
    fn checksum_covers_lsn_block_and_metadata() {
        let mut image = user_image(b"payload", b"meta");
        let body = image.body_checksum();
        image.finalize(body, Lsn::new(4096), Lsn::NULL, Lsn::ZERO, Lsn::NULL);

        let mut torn = image.as_bytes().to_vec();
        torn[0] ^= 1;
        assert!(matches!(
            verify_checksum(&torn),
            Err(LogError::ChecksumMismatch { .. })
        ));

        let mut torn = image.as_bytes().to_vec();
        torn[USER_RECORD_METADATA_OFFSET] ^= 1;
        assert!(verify_checksum(&torn).is_err());

        // The payload is outside the checksum.
        let mut torn = image.as_bytes().to_vec();
        torn[4096] ^= 1;
        assert!(verify_checksum(&torn).is_ok());
    }

    #[test]
    fn shape_rejects_backward_prev_lsn() {
        let mut image = user_image(b"", b"");
        let body = image.body_checksum();
        image.finalize(body, Lsn::new(4096), Lsn::NULL, Lsn::ZERO, Lsn::new(4096));
        let header = CommonHeader::decode(image.as_bytes()).unwrap();
        assert!(header.check_shape(1 << 20).unwrap_err().is_structural());
    }

    #[test]
    fn shape_rejects_oversized_record() {
        let image = user_image(&[0u8; 8192], b"");
        let mut header = CommonHeader::decode(image.as_bytes()).unwrap();
        header.lsn = Lsn::ZERO;
        assert!(header.check_shape(8192).is_err());
        assert!(header.check_shape(12288).is_ok());
    }
}
