//! Checkpoint record bodies.
//!
//! A physical checkpoint is one record on the reserved checkpoint stream:
//!
//! ```text
//!    128     8  log lowest lsn
//!    136     4  stream count
//!    144     -  stream extents, 64 bytes each:
//!               id (16) | type (16) | lowest (8) | highest (8) | next (8) | reservation (8)
//! ```
//!
//! A stream checkpoint is a run of segment records on the stream itself.
//! Each segment carries the counts of the ASN and LSN entries it holds;
//! all ASN entries precede all LSN entries across the run.

use super::record::{
    RecordIdentity, RecordImage, StreamFields, StreamRecordKind, CHECKPOINT_SEGMENT_PREAMBLE,
    COMMON_HEADER_SIZE,
};
use super::segmented::{SegmentEntry, SegmentReader, SegmentedBuffer};
use super::{get_guid, get_i64, get_u32, get_u64, put_i64, put_u32, put_u64};
use crate::error::{LogError, LogResult};
use crate::index::{AsnEntry, AsnIndex, LsnEntry, LsnExtentTracker};
use crate::types::{Asn, Lsn, StreamId, StreamType};
use serde::Serialize;

/// Offset of the physical checkpoint body.
pub const PHYSICAL_CHECKPOINT_BODY_OFFSET: usize = COMMON_HEADER_SIZE;

const EXTENTS_OFFSET: usize = PHYSICAL_CHECKPOINT_BODY_OFFSET + 16;
const EXTENT_SIZE: usize = 64;

/// Location of one stream within the LSN space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamExtent {
    /// Stream id.
    pub stream_id: StreamId,
    /// Stream type.
    pub stream_type: StreamType,
    /// Lowest LSN the stream still needs, or null if it holds no records.
    pub lowest_lsn: Lsn,
    /// LSN of the stream's newest record, or null.
    pub highest_lsn: Lsn,
    /// LSN just past the stream's newest record, or null.
    pub next_lsn: Lsn,
    /// Bytes of log space reserved by the stream.
    pub reservation: u64,
}

impl StreamExtent {
    /// Extent of a stream with no records.
    #[must_use]
    pub const fn empty(stream_id: StreamId, stream_type: StreamType) -> Self {
        Self {
            stream_id,
            stream_type,
            lowest_lsn: Lsn::NULL,
            highest_lsn: Lsn::NULL,
            next_lsn: Lsn::NULL,
            reservation: 0,
        }
    }

    /// Extends the extent to cover a record at `lsn` ending before `next`.
    pub fn cover(&mut self, lsn: Lsn, next: Lsn) {
        if self.lowest_lsn.is_null() {
            self.lowest_lsn = lsn;
        }
        if self.highest_lsn.is_null() || lsn > self.highest_lsn {
            self.highest_lsn = lsn;
            self.next_lsn = next;
        }
    }

    fn encode_into(&self, out: &mut [u8]) {
        out[0..16].copy_from_slice(self.stream_id.as_bytes());
        out[16..32].copy_from_slice(self.stream_type.as_bytes());
        put_i64(out, 32, self.lowest_lsn.as_i64());
        put_i64(out, 40, self.highest_lsn.as_i64());
        put_i64(out, 48, self.next_lsn.as_i64());
        put_u64(out, 56, self.reservation);
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            stream_id: StreamId::from_bytes(get_guid(bytes, 0)),
            stream_type: StreamType::from_bytes(get_guid(bytes, 16)),
            lowest_lsn: Lsn::new(get_i64(bytes, 32)),
            highest_lsn: Lsn::new(get_i64(bytes, 40)),
            next_lsn: Lsn::new(get_i64(bytes, 48)),
            reservation: get_u64(bytes, 56),
        }
    }
}

/// Log-wide checkpoint: where every resident stream lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhysicalCheckpoint {
    /// Lowest LSN the log still needs once this checkpoint is durable.
    pub log_lowest_lsn: Lsn,
    /// One extent per resident stream.
    pub streams: Vec<StreamExtent>,
}

impl PhysicalCheckpoint {
    /// Metadata bytes the record needs for `stream_count` streams.
    #[must_use]
    pub const fn metadata_size(stream_count: usize) -> usize {
        EXTENTS_OFFSET - COMMON_HEADER_SIZE + stream_count * EXTENT_SIZE
    }

    /// Builds the record image; LSN fields are stamped later.
    #[must_use]
    pub fn to_image(&self, identity: &RecordIdentity) -> RecordImage {
        let mut image = RecordImage::new(Self::metadata_size(self.streams.len()), &[]);
        image.write_common_header(identity);
        let bytes = image.bytes_mut();
        put_i64(bytes, PHYSICAL_CHECKPOINT_BODY_OFFSET, self.log_lowest_lsn.as_i64());
        put_u32(bytes, PHYSICAL_CHECKPOINT_BODY_OFFSET + 8, self.streams.len() as u32);
        for (i, extent) in self.streams.iter().enumerate() {
            let at = EXTENTS_OFFSET + i * EXTENT_SIZE;
            extent.encode_into(&mut bytes[at..at + EXTENT_SIZE]);
        }
        image
    }

    /// Decodes the body of a physical checkpoint record.
    ///
    /// # Errors
    ///
    /// Returns a structural fault if the declared stream count overruns
    /// the record.
    pub fn decode(record: &[u8], metadata_size: u32) -> LogResult<Self> {
        let end = COMMON_HEADER_SIZE + metadata_size as usize;
        if end > record.len() || end < EXTENTS_OFFSET {
            return Err(LogError::structural("physical checkpoint body truncated"));
        }
        let log_lowest_lsn = Lsn::new(get_i64(record, PHYSICAL_CHECKPOINT_BODY_OFFSET));
        let count = get_u32(record, PHYSICAL_CHECKPOINT_BODY_OFFSET + 8) as usize;
        if EXTENTS_OFFSET + count * EXTENT_SIZE > end {
            return Err(LogError::structural(format!(
                "physical checkpoint declares {count} streams beyond its metadata"
            )));
        }
        let streams = (0..count)
            .map(|i| {
                let at = EXTENTS_OFFSET + i * EXTENT_SIZE;
                StreamExtent::decode(&record[at..at + EXTENT_SIZE])
            })
            .collect();
        Ok(Self {
            log_lowest_lsn,
            streams,
        })
    }
}

/// The segment records of one stream checkpoint, lowest segment first.
#[derive(Debug, Clone)]
pub struct StreamCheckpointImage {
    /// One image per segment; segment `i` is written at the `i`-th LSN.
    pub segments: Vec<RecordImage>,
}

impl StreamCheckpointImage {
    /// Serializes the index state of one stream.
    ///
    /// Every segment but the last is exactly `segment_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `segment_size` cannot hold a single entry.
    pub fn build(
        index: &AsnIndex,
        tracker: &LsnExtentTracker,
        segment_size: usize,
        identity: &RecordIdentity,
        truncation_point: Asn,
    ) -> LogResult<Self> {
        let mut buffer = SegmentedBuffer::new(
            segment_size,
            CHECKPOINT_SEGMENT_PREAMBLE,
            CHECKPOINT_SEGMENT_PREAMBLE,
        )?;
        index.get_all_entries_into_segmented_buffer(&mut buffer)?;
        let asn_counts: Vec<usize> = (0..buffer.segment_count())
            .map(|i| buffer.entries_in_segment(i))
            .collect();
        tracker.get_all_record_lsns_into_segmented_buffer(&mut buffer)?;

        let segment_count = buffer.segment_count();
        let mut segments = Vec::with_capacity(segment_count);
        for number in 0..segment_count {
            let raw = buffer.segment(number);
            let asn_count = asn_counts.get(number).copied().unwrap_or(0);
            let lsn_count = buffer.entries_in_segment(number) - asn_count;

            let mut image = RecordImage::new(raw.len() - COMMON_HEADER_SIZE, &[]);
            image.write_common_header(identity);
            let bytes = image.bytes_mut();
            bytes[CHECKPOINT_SEGMENT_PREAMBLE..raw.len()]
                .copy_from_slice(&raw[CHECKPOINT_SEGMENT_PREAMBLE..]);
            StreamFields {
                kind: StreamRecordKind::Checkpoint,
                truncation_point,
                copy_forward_lsn: Lsn::NULL,
            }
            .encode_into(bytes);
            StreamCheckpointSegment::encode_counts(
                bytes,
                segment_count as u32,
                number as u32,
                asn_count as u32,
                lsn_count as u32,
            );
            segments.push(image);
        }
        Ok(Self { segments })
    }

    /// Total bytes of all segments.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }
}

/// One decoded stream checkpoint segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCheckpointSegment {
    /// Segments in the checkpoint.
    pub segment_count: u32,
    /// Number of this segment; 0 is the lowest LSN.
    pub segment_number: u32,
    /// ASN entries held by this segment.
    pub asn_entries: Vec<AsnEntry>,
    /// LSN entries held by this segment.
    pub lsn_entries: Vec<LsnEntry>,
}

const SEGMENT_COUNTS_OFFSET: usize = 152;

impl StreamCheckpointSegment {
    fn encode_counts(bytes: &mut [u8], count: u32, number: u32, asn: u32, lsn: u32) {
        put_u32(bytes, SEGMENT_COUNTS_OFFSET, count);
        put_u32(bytes, SEGMENT_COUNTS_OFFSET + 4, number);
        put_u32(bytes, SEGMENT_COUNTS_OFFSET + 8, asn);
        put_u32(bytes, SEGMENT_COUNTS_OFFSET + 12, lsn);
    }

    /// Decodes a segment from its record bytes.
    ///
    /// # Errors
    ///
    /// Returns a structural fault if the counts are inconsistent or the
    /// entries overrun the metadata.
    pub fn decode(record: &[u8], metadata_size: u32) -> LogResult<Self> {
        let end = COMMON_HEADER_SIZE + metadata_size as usize;
        if end > record.len() || end < CHECKPOINT_SEGMENT_PREAMBLE {
            return Err(LogError::structural("checkpoint segment truncated"));
        }
        let segment_count = get_u32(record, SEGMENT_COUNTS_OFFSET);
        let segment_number = get_u32(record, SEGMENT_COUNTS_OFFSET + 4);
        let asn_count = get_u32(record, SEGMENT_COUNTS_OFFSET + 8) as usize;
        let lsn_count = get_u32(record, SEGMENT_COUNTS_OFFSET + 12) as usize;
        if segment_number >= segment_count {
            return Err(LogError::structural(format!(
                "checkpoint segment {segment_number} of {segment_count}"
            )));
        }
        let needed = CHECKPOINT_SEGMENT_PREAMBLE
            + asn_count * AsnEntry::ENCODED_SIZE
            + lsn_count * LsnEntry::ENCODED_SIZE;
        if needed > end {
            return Err(LogError::structural(format!(
                "checkpoint segment entries need {needed} bytes, metadata ends at {end}"
            )));
        }

        let body = &record[..end];
        let mut reader = SegmentReader::new(
            body,
            body.len(),
            CHECKPOINT_SEGMENT_PREAMBLE,
            CHECKPOINT_SEGMENT_PREAMBLE,
        );
        let mut asn_entries = Vec::with_capacity(asn_count);
        for _ in 0..asn_count {
            asn_entries.push(reader.read_entry::<AsnEntry>()?);
        }
        let mut lsn_entries = Vec::with_capacity(lsn_count);
        for _ in 0..lsn_count {
            lsn_entries.push(reader.read_entry::<LsnEntry>()?);
        }
        Ok(Self {
            segment_count,
            segment_number,
            asn_entries,
            lsn_entries,
        })
    }
}
