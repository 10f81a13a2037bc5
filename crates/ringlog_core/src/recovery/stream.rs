//! Stream recovery.
//!
//! Rebuilds the ASN index and LSN extent tracker of one stream by walking
//! its records backward from the stream's highest LSN, following each
//! record's `prev_lsn_in_stream` pointer. User records are replayed one by
//! one. The first complete stream checkpoint met ends the walk: its entries
//! describe everything the stream holds at lower LSNs.

use super::physical::HeaderCheck;
use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::format::{
    CommonHeader, LogGeometry, MasterBlock, StreamCheckpointSegment, StreamExtent, StreamFields,
    StreamRecordKind, UserRecordFields, USER_RECORD_METADATA_OFFSET,
};
use crate::index::{AsnEntry, AsnIndex, LsnEntry, LsnExtentTracker};
use crate::io::read_lsn_range;
use crate::stream::RecordVerifier;
use crate::types::{Asn, Disposition, Lsn};
use ringlog_storage::BlockDevice;
use serde::Serialize;
use tracing::debug;

/// What the recovery walk learned about a stream beyond its indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamRecoveryReport {
    /// Highest truncation point recorded by any record walked.
    pub truncation_point: Asn,
    /// Highest Asn seen anywhere in the walk.
    pub highest_asn: Asn,
    /// LSN of segment 0 of the checkpoint that ended the walk, or null.
    pub last_checkpoint_lsn: Lsn,
    /// User records replayed above that checkpoint.
    pub replayed_records: u64,
    /// Segments of that checkpoint.
    pub checkpoint_segments: u32,
    /// Recovery truncated entries that no checkpoint has recorded yet.
    pub needs_checkpoint: bool,
}

impl Default for StreamRecoveryReport {
    fn default() -> Self {
        Self {
            truncation_point: Asn::NULL,
            highest_asn: Asn::NULL,
            last_checkpoint_lsn: Lsn::NULL,
            replayed_records: 0,
            checkpoint_segments: 0,
            needs_checkpoint: false,
        }
    }
}

/// Segments of one checkpoint collected while walking downward.
struct CheckpointRun {
    segment_count: u32,
    expected: u32,
    segments: Vec<StreamCheckpointSegment>,
}

impl CheckpointRun {
    fn new(segment_count: u32) -> Self {
        Self {
            segment_count,
            expected: segment_count.saturating_sub(1),
            segments: Vec::with_capacity(segment_count as usize),
        }
    }

    fn accept(
        &mut self,
        header: &CommonHeader,
        segment: StreamCheckpointSegment,
        segment_size: u32,
    ) -> LogResult<()> {
        if segment.segment_count != self.segment_count || segment.segment_number != self.expected {
            return Err(LogError::structural(format!(
                "checkpoint segment at {} is {} of {}, expected {} of {}",
                header.lsn,
                segment.segment_number,
                segment.segment_count,
                self.expected,
                self.segment_count
            )));
        }
        let is_final = segment.segment_number + 1 == self.segment_count;
        if !is_final && header.header_size != segment_size {
            return Err(LogError::structural(format!(
                "checkpoint segment at {} is {} bytes, non-final segments are {segment_size}",
                header.lsn, header.header_size
            )));
        }
        self.expected = self.expected.saturating_sub(1);
        self.segments.push(segment);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.segments
            .last()
            .is_some_and(|segment| segment.segment_number == 0)
    }

    /// Entries of the whole run in the order they were serialized.
    fn into_entries(self) -> (Vec<AsnEntry>, Vec<LsnEntry>) {
        let mut asn_entries = Vec::new();
        let mut lsn_entries = Vec::new();
        for segment in self.segments.into_iter().rev() {
            asn_entries.extend(segment.asn_entries);
            lsn_entries.extend(segment.lsn_entries);
        }
        (asn_entries, lsn_entries)
    }
}

/// Everything stream recovery needs from the surrounding log.
pub struct StreamRecovery<'a> {
    /// Device holding the log.
    pub device: &'a dyn BlockDevice,
    /// Master block of the log.
    pub master: &'a MasterBlock,
    /// Geometry of the log.
    pub geometry: &'a LogGeometry,
    /// Effective configuration, persisted geometry applied.
    pub config: &'a LogConfig,
    /// Lowest LSN the log still holds.
    pub log_lowest_lsn: Lsn,
    /// Callback run over every replayed user record.
    pub verifier: Option<&'a dyn RecordVerifier>,
}

impl StreamRecovery<'_> {
    fn header_check(&self) -> HeaderCheck<'_> {
        HeaderCheck {
            master: self.master,
            geometry: self.geometry,
            max_record_size: self.config.max_record_size,
        }
    }

    /// Rebuilds `index` and `tracker` for the stream described by `extent`.
    ///
    /// Both structures must be empty on entry.
    ///
    /// # Errors
    ///
    /// - `ChecksumMismatch` if a record the walk depends on is torn
    /// - `StreamIdentityMismatch` if the chain leads into another stream
    /// - `VerificationFailed` if the verifier rejects a record
    /// - a structural fault for any other inconsistency
    pub async fn recover(
        &self,
        extent: &StreamExtent,
        index: &AsnIndex,
        tracker: &LsnExtentTracker,
    ) -> LogResult<StreamRecoveryReport> {
        let mut report = StreamRecoveryReport::default();
        if extent.highest_lsn.is_null()
            || extent.lowest_lsn.is_null()
            || extent.highest_lsn < extent.lowest_lsn
        {
            debug!(stream = %extent.stream_id, "stream holds no records");
            return Ok(report);
        }

        let check = self.header_check();
        let low_bound = extent.lowest_lsn.max(self.log_lowest_lsn);
        let mut cursor = extent.highest_lsn;
        let mut run: Option<CheckpointRun> = None;

        while !cursor.is_null() && cursor >= low_bound {
            let (header, region) = check.read_expected(self.device, cursor).await?;
            if header.stream_id != extent.stream_id {
                return Err(LogError::StreamIdentityMismatch {
                    lsn: cursor,
                    expected: extent.stream_id,
                    found: header.stream_id,
                });
            }
            let fields = StreamFields::decode(&region)?;
            report.truncation_point = report.truncation_point.max(fields.truncation_point);

            match fields.kind {
                StreamRecordKind::User => {
                    if run.is_some() {
                        return Err(LogError::structural(format!(
                            "user record at {cursor} interrupts a checkpoint"
                        )));
                    }
                    self.replay_user_record(&header, &region, index, tracker, &mut report)
                        .await?;
                }
                StreamRecordKind::Checkpoint => {
                    let segment = StreamCheckpointSegment::decode(&region, header.metadata_size)?;
                    let current = run.get_or_insert_with(|| CheckpointRun::new(segment.segment_count));
                    current.accept(&header, segment, self.config.max_checkpoint_segment_size)?;
                    tracker.add_lower_lsn_record(header.lsn, header.header_size, header.io_buffer_size)?;
                    if current.is_complete() {
                        report.last_checkpoint_lsn = header.lsn;
                        report.checkpoint_segments = current.segment_count;
                        break;
                    }
                }
            }
            cursor = header.prev_lsn_in_stream;
        }

        match run {
            Some(run) if run.is_complete() => {
                load_checkpoint(run, low_bound, index, tracker, &mut report)?;
            }
            Some(run) => {
                return Err(LogError::structural(format!(
                    "checkpoint of {} segments ends at {cursor} before segment 0",
                    run.segment_count
                )));
            }
            None => {}
        }

        finish(index, tracker, &mut report)?;
        debug!(
            stream = %extent.stream_id,
            entries = index.len(),
            records = tracker.query_number_of_records(),
            replayed = report.replayed_records,
            truncation_point = %report.truncation_point,
            "stream recovered"
        );
        Ok(report)
    }

    async fn replay_user_record(
        &self,
        header: &CommonHeader,
        region: &[u8],
        index: &AsnIndex,
        tracker: &LsnExtentTracker,
        report: &mut StreamRecoveryReport,
    ) -> LogResult<()> {
        let fields = UserRecordFields::decode(region)?;
        let metadata_end = USER_RECORD_METADATA_OFFSET + fields.user_metadata_size as usize;
        if metadata_end > region.len()
            || fields.payload_size > header.io_buffer_size
            || fields.asn == Asn::NULL
        {
            return Err(LogError::structural(format!(
                "user record at {} has inconsistent fields",
                header.lsn
            )));
        }

        tracker.add_lower_lsn_record(header.lsn, header.header_size, header.io_buffer_size)?;

        if let Some(verifier) = self.verifier {
            let mut payload = read_lsn_range(
                self.device,
                self.geometry,
                header.lsn.advance(u64::from(header.header_size)),
                u64::from(header.io_buffer_size),
            )
            .await?;
            payload.truncate(fields.payload_size as usize);
            if !verifier.verify(&region[USER_RECORD_METADATA_OFFSET..metadata_end], &payload) {
                return Err(LogError::VerificationFailed { lsn: header.lsn });
            }
        }

        index.insert_recovered(AsnEntry::new(
            fields.asn,
            fields.version,
            header.lsn,
            header.io_buffer_size,
            Disposition::Persisted,
        ));
        report.highest_asn = report.highest_asn.max(fields.asn);
        report.replayed_records += 1;
        Ok(())
    }
}

/// Loads the entries of a complete checkpoint below what the walk found.
fn load_checkpoint(
    run: CheckpointRun,
    low_bound: Lsn,
    index: &AsnIndex,
    tracker: &LsnExtentTracker,
    report: &mut StreamRecoveryReport,
) -> LogResult<()> {
    let (asn_entries, lsn_entries) = run.into_entries();

    for entry in lsn_entries.iter().rev() {
        if entry.lsn < low_bound {
            continue;
        }
        let lowest = tracker.query_lowest_lsn();
        if !lowest.is_null() && entry.lsn >= lowest {
            return Err(LogError::structural(format!(
                "checkpoint LSN entry {} is not below {lowest}",
                entry.lsn
            )));
        }
        tracker.add_lower_lsn_record(entry.lsn, entry.header_and_metadata_size, entry.io_buffer_size)?;
    }

    for entry in asn_entries {
        report.highest_asn = report.highest_asn.max(entry.asn);
        if entry.lsn < low_bound {
            continue;
        }
        index.insert_recovered(AsnEntry::new(
            entry.asn,
            entry.version,
            entry.lsn,
            entry.io_size_hint,
            Disposition::Persisted,
        ));
    }
    Ok(())
}

/// Applies the truncation point and cross-checks the two structures.
fn finish(
    index: &AsnIndex,
    tracker: &LsnExtentTracker,
    report: &mut StreamRecoveryReport,
) -> LogResult<()> {
    index.recompute_all();
    let truncatable = index.truncate(report.truncation_point, Lsn::NULL)?;
    if !truncatable.is_null() {
        tracker.truncate(truncatable.advance(1));
        report.needs_checkpoint = true;
    }

    let on_disk = tracker.lsn_set();
    if let Some(missing) = index
        .entries()
        .into_iter()
        .find(|e| e.disposition == Disposition::Persisted && !on_disk.contains(&e.lsn))
    {
        return Err(LogError::structural(format!(
            "{} at {} has no matching record",
            missing.asn, missing.lsn
        )));
    }

    index.recompute_all();
    report.highest_asn = report.highest_asn.max(report.truncation_point);
    Ok(())
}
