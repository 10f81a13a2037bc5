//! Stream handles.

use crate::descriptor::StreamDescriptor;
use crate::error::{LogError, LogResult};
use crate::format::{StreamFields, StreamRecordKind, UserRecordFields, USER_RECORD_METADATA_OFFSET};
use crate::index::AsnEntry;
use crate::io::read_lsn_range;
use crate::pipeline::LogShared;
use crate::recovery::HeaderCheck;
use crate::types::{Asn, Disposition, Lsn, StreamId, StreamType, Version};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Caller-supplied check run over every record read back from disk.
///
/// Registered per stream type with
/// [`PhysicalLog::register_verifier`](crate::PhysicalLog::register_verifier).
/// Invoked during stream recovery and on every read.
pub trait RecordVerifier: Send + Sync {
    /// Returns false to reject the record.
    fn verify(&self, metadata: &[u8], payload: &[u8]) -> bool;
}

impl<F> RecordVerifier for F
where
    F: Fn(&[u8], &[u8]) -> bool + Send + Sync,
{
    fn verify(&self, metadata: &[u8], payload: &[u8]) -> bool {
        self(metadata, payload)
    }
}

/// How [`LogStream::read`] picks a record relative to an Asn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadType {
    /// The record at exactly the Asn.
    Exact,
    /// The record after the Asn, which must exist.
    Next,
    /// The record before the Asn, which must exist.
    Previous,
    /// The greatest record at or below the Asn.
    Containing,
    /// The smallest record above the Asn, which need not exist.
    NextFromSpecificAsn,
    /// The greatest record below the Asn, which need not exist.
    PreviousFromSpecificAsn,
}

/// A record read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    /// Application sequence number.
    pub asn: Asn,
    /// Version of the write.
    pub version: Version,
    /// Where the record lives.
    pub lsn: Lsn,
    /// Caller metadata.
    pub metadata: Vec<u8>,
    /// Payload.
    pub payload: Vec<u8>,
}

/// Asn bounds of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AsnRange {
    /// Lowest indexed Asn, or null.
    pub lowest: Asn,
    /// Highest indexed Asn, or null.
    pub highest: Asn,
    /// Asns at or below this are truncated.
    pub truncation_point: Asn,
}

/// Index state of one Asn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordInfo {
    /// Application sequence number.
    pub asn: Asn,
    /// Latest version.
    pub version: Version,
    /// LSN of the latest version, or null before one is assigned.
    pub lsn: Lsn,
    /// Lifecycle state.
    pub disposition: Disposition,
    /// Block-padded payload size.
    pub io_size: u32,
}

impl From<AsnEntry> for RecordInfo {
    fn from(entry: AsnEntry) -> Self {
        Self {
            asn: entry.asn,
            version: entry.version,
            lsn: entry.lsn,
            disposition: entry.disposition,
            io_size: entry.io_size_hint,
        }
    }
}

/// Summary of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    /// Stream id.
    pub stream_id: StreamId,
    /// Stream type.
    pub stream_type: StreamType,
    /// Lowest LSN recorded for the stream in physical checkpoints.
    pub lowest_lsn: Lsn,
    /// LSN of the newest record.
    pub highest_lsn: Lsn,
    /// LSN just past the newest record.
    pub next_lsn: Lsn,
    /// Segment 0 of the newest stream checkpoint.
    pub last_checkpoint_lsn: Lsn,
    /// Asns at or below this are truncated.
    pub truncation_point: Asn,
    /// Highest Asn ever written.
    pub highest_asn: Asn,
    /// Asn entries in the index.
    pub asn_entries: usize,
    /// Records the stream holds on disk.
    pub records: usize,
    /// Bytes those records occupy.
    pub on_disk_size: u64,
    /// Bytes of log space reserved for the stream.
    pub reservation: u64,
}

/// An open stream.
///
/// At most one handle per stream exists at a time. Dropping the handle
/// closes the stream.
#[derive(Debug)]
pub struct LogStream {
    shared: Arc<LogShared>,
    stream: Arc<StreamDescriptor>,
}

impl LogStream {
    pub(crate) fn new(shared: Arc<LogShared>, stream: Arc<StreamDescriptor>) -> Self {
        Self { shared, stream }
    }

    /// Stream id.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.stream.id
    }

    /// Stream type.
    #[must_use]
    pub fn stream_type(&self) -> StreamType {
        self.stream.stream_type
    }

    /// Writes `version` of `asn` and returns its LSN once it is durable.
    ///
    /// # Errors
    ///
    /// - `VersionConflict` if an equal or newer version exists
    /// - `AsnTruncated` if `asn` is at or below the truncation point
    /// - `LogFull` if the unreserved space cannot hold the record
    /// - `RecordTooLarge` if the record exceeds the configured maximum
    pub async fn write(
        &self,
        asn: Asn,
        version: Version,
        metadata: &[u8],
        payload: &[u8],
    ) -> LogResult<Lsn> {
        self.shared
            .write_user_record(&self.stream, asn, version, metadata, payload, false)
            .await
    }

    /// Like [`Self::write`], but consumes the stream's own reservation.
    ///
    /// # Errors
    ///
    /// Returns `ReservationExceeded` if the record is larger than what is
    /// left of the reservation, and otherwise the errors of [`Self::write`].
    pub async fn write_reserved(
        &self,
        asn: Asn,
        version: Version,
        metadata: &[u8],
        payload: &[u8],
    ) -> LogResult<Lsn> {
        self.shared
            .write_user_record(&self.stream, asn, version, metadata, payload, true)
            .await
    }

    fn lookup(&self, asn: Asn, read_type: ReadType) -> Option<AsnEntry> {
        let index = &self.stream.index;
        match read_type {
            ReadType::Exact => index.exact(asn),
            ReadType::Next => index.next(asn),
            ReadType::Previous => index.previous(asn),
            ReadType::Containing => index.containing(asn),
            ReadType::NextFromSpecificAsn => index.next_after(asn),
            ReadType::PreviousFromSpecificAsn => index.previous_before(asn),
        }
    }

    /// Reads a record and re-validates it against the index.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no record matches
    /// - `RecordNotDurable` if the match is still being written
    /// - `ChecksumMismatch`, `StreamIdentityMismatch` or a structural fault
    ///   if the record on disk does not match the index
    /// - `VerificationFailed` if the stream type's verifier rejects it
    pub async fn read(&self, asn: Asn, read_type: ReadType) -> LogResult<ReadRecord> {
        self.shared.check_usable()?;
        let entry = self.lookup(asn, read_type).ok_or(LogError::NotFound)?;
        if entry.disposition != Disposition::Persisted {
            return Err(LogError::RecordNotDurable { asn: entry.asn });
        }

        let shared = &self.shared;
        let check = HeaderCheck {
            master: &shared.master,
            geometry: &shared.geometry,
            max_record_size: shared.config.max_record_size,
        };
        let (header, region) = check.read_expected(shared.device.as_ref(), entry.lsn).await?;
        if header.stream_id != self.stream.id {
            return Err(LogError::StreamIdentityMismatch {
                lsn: entry.lsn,
                expected: self.stream.id,
                found: header.stream_id,
            });
        }
        let fields = StreamFields::decode(&region)?;
        let user = UserRecordFields::decode(&region)?;
        let metadata_end = USER_RECORD_METADATA_OFFSET + user.user_metadata_size as usize;
        if fields.kind != StreamRecordKind::User
            || user.asn != entry.asn
            || user.version != entry.version
            || metadata_end > region.len()
            || user.payload_size > header.io_buffer_size
        {
            return Err(LogError::structural(format!(
                "record at {} does not match {} version {}",
                entry.lsn, entry.asn, entry.version
            )));
        }

        let mut payload = read_lsn_range(
            shared.device.as_ref(),
            &shared.geometry,
            entry.lsn.advance(u64::from(header.header_size)),
            u64::from(header.io_buffer_size),
        )
        .await?;
        payload.truncate(user.payload_size as usize);
        let metadata = region[USER_RECORD_METADATA_OFFSET..metadata_end].to_vec();

        if let Some(verifier) = shared.verifier(self.stream.stream_type) {
            if !verifier.verify(&metadata, &payload) {
                return Err(LogError::VerificationFailed { lsn: entry.lsn });
            }
        }
        Ok(ReadRecord {
            asn: entry.asn,
            version: entry.version,
            lsn: entry.lsn,
            metadata,
            payload,
        })
    }

    /// Discards every Asn at or below `up_to` and reclaims their space.
    ///
    /// The truncation point stops below the lowest Asn still being written.
    /// The new point is made durable by a stream checkpoint, and the space
    /// is reclaimed by the physical checkpoint that follows it.
    ///
    /// # Errors
    ///
    /// Returns an error if either checkpoint cannot be written.
    pub async fn truncate(&self, up_to: Asn) -> LogResult<()> {
        self.shared.check_usable()?;
        let (target, removed) = {
            let mut meta = self.stream.meta.lock();
            let mut target = up_to;
            if let Some(pending) = self.stream.index.lowest_not_persisted() {
                if pending.asn <= target {
                    target = Asn::new(pending.asn.as_u64() - 1);
                }
            }
            if target <= meta.truncation_point {
                debug!(stream = %self.stream.id, requested = %up_to, "nothing to truncate");
                return Ok(());
            }
            meta.truncation_point = target;
            let truncatable = self
                .stream
                .index
                .truncate(target, self.stream.tracker.query_highest_lsn())
                .map_err(|e| self.shared.escalate(e))?;
            let removed = if truncatable.is_null() {
                0
            } else {
                self.stream.tracker.truncate(truncatable.advance(1))
            };
            (target, removed)
        };

        self.shared.write_stream_checkpoint(&self.stream).await?;
        {
            let mut meta = self.stream.meta.lock();
            let lowest = self.stream.tracker.query_lowest_lsn();
            meta.lowest_lsn = meta.lowest_lsn.max(lowest);
        }
        self.shared.write_physical_checkpoint().await?;
        debug!(stream = %self.stream.id, truncation_point = %target, removed, "stream truncated");
        Ok(())
    }

    /// Grows the stream's reservation by `delta` bytes, or shrinks it if
    /// `delta` is negative, and records the result durably.
    ///
    /// # Errors
    ///
    /// - `LogFull` if the unreserved space cannot cover the growth
    /// - `InvalidArgument` if the shrink exceeds the reservation
    pub async fn update_reservation(&self, delta: i64) -> LogResult<()> {
        self.shared.check_usable()?;
        {
            let mut state = self.shared.state.lock();
            let mut meta = self.stream.meta.lock();
            let amount = delta.unsigned_abs();
            if delta >= 0 {
                let available = self.shared.unreserved_space(&state);
                if amount > available {
                    return Err(LogError::LogFull {
                        requested: amount,
                        available,
                    });
                }
                meta.reservation += amount;
                state.reserved_total += amount;
            } else {
                if amount > meta.reservation {
                    return Err(LogError::invalid_argument(format!(
                        "cannot release {amount} bytes of a {} byte reservation",
                        meta.reservation
                    )));
                }
                meta.reservation -= amount;
                state.reserved_total -= amount;
            }
        }
        self.shared.write_physical_checkpoint().await?;
        Ok(())
    }

    /// Writes a checkpoint of the stream's indexes now.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be written.
    pub async fn checkpoint(&self) -> LogResult<Lsn> {
        self.shared.write_stream_checkpoint(&self.stream).await
    }

    /// Returns the Asn bounds of the stream.
    #[must_use]
    pub fn query_asn_range(&self) -> AsnRange {
        let truncation_point = self.stream.meta.lock().truncation_point;
        AsnRange {
            lowest: self.stream.index.lowest_asn().unwrap_or(Asn::NULL),
            highest: self.stream.index.highest_asn().unwrap_or(Asn::NULL),
            truncation_point,
        }
    }

    /// Returns the index state of `asn`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the Asn is not indexed.
    pub fn query_record(&self, asn: Asn) -> LogResult<RecordInfo> {
        self.stream
            .index
            .exact(asn)
            .map(RecordInfo::from)
            .ok_or(LogError::NotFound)
    }

    /// Returns the index state of every Asn in `[low, high]`.
    #[must_use]
    pub fn query_records(&self, low: Asn, high: Asn) -> Vec<RecordInfo> {
        self.stream
            .index
            .range(low, high)
            .into_iter()
            .map(RecordInfo::from)
            .collect()
    }

    /// Returns a summary of the stream.
    #[must_use]
    pub fn query_stream_info(&self) -> StreamInfo {
        let meta = self.stream.meta.lock();
        StreamInfo {
            stream_id: self.stream.id,
            stream_type: self.stream.stream_type,
            lowest_lsn: meta.lowest_lsn,
            highest_lsn: meta.highest_lsn,
            next_lsn: meta.next_lsn,
            last_checkpoint_lsn: meta.last_checkpoint_lsn,
            truncation_point: meta.truncation_point,
            highest_asn: meta.highest_asn,
            asn_entries: self.stream.index.len(),
            records: self.stream.tracker.query_number_of_records(),
            on_disk_size: self.stream.tracker.query_total_on_disk_size(),
            reservation: meta.reservation,
        }
    }

    /// Closes the handle so the stream can be reopened or deleted.
    pub fn close(self) {
        info!(stream = %self.stream.id, "stream closed");
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.stream.meta.lock().open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::log::PhysicalLog;
    use crate::types::LogId;
    use ringlog_storage::{InMemoryDevice, BLOCK_SIZE};

    async fn open_stream() -> (PhysicalLog, LogStream) {
        let config = LogConfig::new()
            .max_record_size(64 * 1024)
            .max_checkpoint_segment_size(8192)
            .max_queued_write_bytes(256 * 1024)
            .max_metadata_size(4096);
        let log = PhysicalLog::create(
            Arc::new(InMemoryDevice::new()),
            LogId::random(),
            256 * BLOCK_SIZE as u64,
            config,
        )
        .await
        .unwrap();
        let stream = log
            .create_stream(StreamId::random(), StreamType::random())
            .await
            .unwrap();
        (log, stream)
    }

    async fn write_asns(stream: &LogStream, asns: &[u64]) {
        for &asn in asns {
            stream
                .write(Asn::new(asn), 1, &asn.to_le_bytes(), format!("record {asn}").as_bytes())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn read_types_navigate_the_index() {
        let (_log, stream) = open_stream().await;
        write_asns(&stream, &[10, 20, 30]).await;

        let asn_of = |record: ReadRecord| record.asn.as_u64();
        assert_eq!(asn_of(stream.read(Asn::new(20), ReadType::Exact).await.unwrap()), 20);
        assert_eq!(asn_of(stream.read(Asn::new(20), ReadType::Next).await.unwrap()), 30);
        assert_eq!(asn_of(stream.read(Asn::new(20), ReadType::Previous).await.unwrap()), 10);
        assert_eq!(asn_of(stream.read(Asn::new(25), ReadType::Containing).await.unwrap()), 20);
        assert_eq!(
            asn_of(stream.read(Asn::new(15), ReadType::NextFromSpecificAsn).await.unwrap()),
            20
        );
        assert_eq!(
            asn_of(stream.read(Asn::new(15), ReadType::PreviousFromSpecificAsn).await.unwrap()),
            10
        );

        assert!(matches!(
            stream.read(Asn::new(15), ReadType::Exact).await,
            Err(LogError::NotFound)
        ));
        assert!(matches!(
            stream.read(Asn::new(15), ReadType::Next).await,
            Err(LogError::NotFound)
        ));
        assert!(matches!(
            stream.read(Asn::new(30), ReadType::Next).await,
            Err(LogError::NotFound)
        ));
        assert!(matches!(
            stream.read(Asn::new(5), ReadType::Containing).await,
            Err(LogError::NotFound)
        ));
    }

    #[tokio::test]
    async fn read_returns_metadata_and_payload() {
        let (_log, stream) = open_stream().await;
        let payload = vec![0xA5u8; 5000];
        let lsn = stream.write(Asn::new(1), 3, b"meta", &payload).await.unwrap();

        let record = stream.read(Asn::new(1), ReadType::Exact).await.unwrap();
        assert_eq!(record.lsn, lsn);
        assert_eq!(record.version, 3);
        assert_eq!(record.metadata, b"meta");
        assert_eq!(record.payload, payload);
    }

    #[tokio::test]
    async fn newer_version_replaces_older() {
        let (_log, stream) = open_stream().await;
        stream.write(Asn::new(1), 1, b"", b"first").await.unwrap();
        stream.write(Asn::new(1), 2, b"", b"second").await.unwrap();

        assert!(matches!(
            stream.write(Asn::new(1), 2, b"", b"stale").await,
            Err(LogError::VersionConflict { existing_version: 2, .. })
        ));
        let record = stream.read(Asn::new(1), ReadType::Exact).await.unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.payload, b"second");
    }

    #[tokio::test]
    async fn oversized_records_rejected() {
        let (_log, stream) = open_stream().await;
        assert!(matches!(
            stream.write(Asn::new(1), 1, &[0u8; 8192], b"").await,
            Err(LogError::RecordTooLarge { .. })
        ));
        assert!(matches!(
            stream.write(Asn::new(1), 1, b"", &[0u8; 64 * 1024]).await,
            Err(LogError::RecordTooLarge { .. })
        ));
        assert!(matches!(
            stream.write(Asn::NULL, 1, b"", b"x").await,
            Err(LogError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn queries_report_index_state() {
        let (_log, stream) = open_stream().await;
        write_asns(&stream, &[1, 2, 3, 4]).await;

        let info = stream.query_record(Asn::new(2)).unwrap();
        assert_eq!(info.disposition, Disposition::Persisted);
        assert_eq!(info.io_size, BLOCK_SIZE as u32);
        assert!(matches!(stream.query_record(Asn::new(9)), Err(LogError::NotFound)));

        let listed: Vec<u64> = stream
            .query_records(Asn::new(2), Asn::new(3))
            .iter()
            .map(|r| r.asn.as_u64())
            .collect();
        assert_eq!(listed, vec![2, 3]);

        let summary = stream.query_stream_info();
        assert_eq!(summary.stream_id, stream.id());
        assert_eq!(summary.highest_asn, Asn::new(4));
        assert_eq!(summary.asn_entries, 4);
        // four user records and the checkpoint written at create
        assert_eq!(summary.records, 5);
    }

    #[tokio::test]
    async fn truncate_is_idempotent() {
        let (log, stream) = open_stream().await;
        write_asns(&stream, &[1, 2, 3]).await;
        stream.truncate(Asn::new(2)).await.unwrap();
        let space = log.query_space_info();

        stream.truncate(Asn::new(1)).await.unwrap();
        assert_eq!(log.query_space_info(), space);
        assert_eq!(stream.query_asn_range().lowest, Asn::new(3));
    }

    #[tokio::test]
    async fn explicit_checkpoint_bounds_recovery() {
        let (_log, stream) = open_stream().await;
        write_asns(&stream, &[1, 2]).await;
        let lsn = stream.checkpoint().await.unwrap();
        assert_eq!(stream.query_stream_info().last_checkpoint_lsn, lsn);
    }

    #[tokio::test]
    async fn verifier_runs_on_read() {
        let (log, stream) = open_stream().await;
        log.register_verifier(stream.stream_type(), |metadata: &[u8], _: &[u8]| {
            metadata != b"reject"
        });
        stream.write(Asn::new(1), 1, b"accept", b"a").await.unwrap();
        stream.write(Asn::new(2), 1, b"reject", b"b").await.unwrap();

        assert!(stream.read(Asn::new(1), ReadType::Exact).await.is_ok());
        assert!(matches!(
            stream.read(Asn::new(2), ReadType::Exact).await,
            Err(LogError::VerificationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_writes_all_land() {
        let (_log, stream) = open_stream().await;
        let stream = Arc::new(stream);
        let writers: Vec<_> = (1..=16u64)
            .map(|asn| {
                let stream = Arc::clone(&stream);
                tokio::spawn(async move {
                    stream
                        .write(Asn::new(asn), 1, b"", &asn.to_le_bytes())
                        .await
                        .unwrap()
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let range = stream.query_asn_range();
        assert_eq!(range.lowest, Asn::new(1));
        assert_eq!(range.highest, Asn::new(16));
        let record = stream.read(Asn::new(9), ReadType::Exact).await.unwrap();
        assert_eq!(record.payload, 9u64.to_le_bytes());
    }
}
