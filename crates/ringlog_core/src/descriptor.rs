//! Per-stream in-memory state shared by the log and stream handles.

use crate::format::{RecordIdentity, StreamExtent};
use crate::index::{AsnIndex, LsnExtentTracker};
use crate::types::{Asn, LogId, Lsn, StreamId, StreamType};
use parking_lot::Mutex;

/// Lifecycle phase of a resident stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamPhase {
    Active,
    Deleting,
}

/// Mutable stream bookkeeping, guarded by the descriptor's meta lock.
///
/// Taken after the log state lock and before the index locks.
#[derive(Debug)]
pub(crate) struct StreamMeta {
    pub phase: StreamPhase,
    pub open: bool,
    /// The index and tracker reflect the records on disk.
    pub recovered: bool,
    /// Extent found by physical recovery, consumed by stream recovery.
    pub recovered_extent: StreamExtent,
    /// Lowest LSN recorded in physical checkpoints.
    pub lowest_lsn: Lsn,
    pub highest_lsn: Lsn,
    pub next_lsn: Lsn,
    pub truncation_point: Asn,
    pub highest_asn: Asn,
    /// LSN of segment 0 of the newest stream checkpoint.
    pub last_checkpoint_lsn: Lsn,
    pub bytes_since_checkpoint: u64,
    pub reservation: u64,
}

impl StreamMeta {
    /// Accounts for a record of `size` bytes allocated at `lsn`.
    pub(crate) fn note_record(&mut self, lsn: Lsn, size: u64) {
        if self.lowest_lsn.is_null() {
            self.lowest_lsn = lsn;
        }
        self.highest_lsn = lsn;
        self.next_lsn = lsn.advance(size);
        self.bytes_since_checkpoint += size;
    }
}

/// A resident stream.
#[derive(Debug)]
pub(crate) struct StreamDescriptor {
    pub id: StreamId,
    pub stream_type: StreamType,
    pub meta: Mutex<StreamMeta>,
    pub index: AsnIndex,
    pub tracker: LsnExtentTracker,
}

impl StreamDescriptor {
    /// A stream created in this session; its indexes start out current.
    pub(crate) fn created(id: StreamId, stream_type: StreamType) -> Self {
        let mut descriptor = Self::resident(StreamExtent::empty(id, stream_type));
        descriptor.meta.get_mut().recovered = true;
        descriptor
    }

    /// A stream found by physical recovery; its indexes load on first open.
    pub(crate) fn resident(extent: StreamExtent) -> Self {
        Self {
            id: extent.stream_id,
            stream_type: extent.stream_type,
            meta: Mutex::new(StreamMeta {
                phase: StreamPhase::Active,
                open: false,
                recovered: false,
                recovered_extent: extent,
                lowest_lsn: extent.lowest_lsn,
                highest_lsn: extent.highest_lsn,
                next_lsn: extent.next_lsn,
                truncation_point: Asn::NULL,
                highest_asn: Asn::NULL,
                last_checkpoint_lsn: Lsn::NULL,
                bytes_since_checkpoint: 0,
                reservation: extent.reservation,
            }),
            index: AsnIndex::new(),
            tracker: LsnExtentTracker::new(),
        }
    }

    /// Identity stamped into this stream's records.
    pub(crate) fn identity(&self, log_id: LogId, log_signature: [u32; 4]) -> RecordIdentity {
        RecordIdentity {
            log_id,
            log_signature,
            stream_id: self.id,
            stream_type: self.stream_type,
        }
    }

    /// Extent entry for a physical checkpoint.
    pub(crate) fn extent(&self, meta: &StreamMeta) -> StreamExtent {
        StreamExtent {
            stream_id: self.id,
            stream_type: self.stream_type,
            lowest_lsn: meta.lowest_lsn,
            highest_lsn: meta.highest_lsn,
            next_lsn: meta.next_lsn,
            reservation: meta.reservation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_record_sets_lowest() {
        let descriptor = StreamDescriptor::created(StreamId::random(), StreamType::random());
        let mut meta = descriptor.meta.lock();
        meta.note_record(Lsn::new(8192), 4096);
        meta.note_record(Lsn::new(16384), 8192);

        let extent = descriptor.extent(&meta);
        assert_eq!(extent.lowest_lsn, Lsn::new(8192));
        assert_eq!(extent.highest_lsn, Lsn::new(16384));
        assert_eq!(extent.next_lsn, Lsn::new(24576));
        assert_eq!(meta.bytes_since_checkpoint, 12288);
    }

    #[test]
    fn resident_stream_waits_for_recovery() {
        let mut extent = StreamExtent::empty(StreamId::random(), StreamType::random());
        extent.cover(Lsn::new(4096), Lsn::new(8192));
        extent.reservation = 4096;
        let descriptor = StreamDescriptor::resident(extent);
        let meta = descriptor.meta.lock();
        assert!(!meta.recovered);
        assert_eq!(meta.reservation, 4096);
        assert_eq!(descriptor.extent(&meta), extent);
    }
}
