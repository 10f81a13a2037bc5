//! Write and checkpoint pipeline.
//!
//! Every record, whether a user write, a stream checkpoint segment or a
//! physical checkpoint, goes through the same steps:
//!
//! 1. take write quota
//! 2. under the log state lock, mutate the index speculatively and assign
//!    the next LSN
//! 3. stamp the LSN block and seal the checksum
//! 4. write the record on a spawned task (two device writes if it wraps)
//! 5. wait at the completion gate until every lower LSN is durable too
//! 6. still on that task, mark the index entry persisted and free the quota
//!
//! Lock order is log state, then stream meta, then the index and tracker
//! locks. None of them is held across an await.

mod gate;
mod quota;

use crate::config::LogConfig;
use crate::descriptor::{StreamDescriptor, StreamPhase};
use crate::error::{LogError, LogResult};
use crate::format::segmented::SegmentEntry;
use crate::format::{
    round_up_to_block, LogGeometry, MasterBlock, PhysicalCheckpoint, RecordIdentity, RecordImage,
    StreamCheckpointImage, StreamExtent, StreamFields, StreamRecordKind, UserRecordFields,
    CHECKPOINT_SEGMENT_PREAMBLE, COMMON_HEADER_SIZE, USER_RECORD_METADATA_OFFSET,
};
use crate::index::{AsnEntry, LsnEntry};
use crate::io::write_lsn_range;
use crate::stream::RecordVerifier;
use crate::types::{Asn, Disposition, Lsn, StreamId, StreamType, Version};
use gate::CompletionGate;
use parking_lot::{Mutex, RwLock};
use quota::WriteQuota;
use ringlog_storage::BlockDevice;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, trace, warn};

/// Log-wide mutable state.
#[derive(Debug)]
pub(crate) struct LogState {
    /// LSN the next record is written at.
    pub next_lsn: Lsn,
    /// Lowest LSN still in use; space below it is free.
    pub lowest_lsn: Lsn,
    /// LSN of the newest physical checkpoint.
    pub last_checkpoint_lsn: Lsn,
    /// Bytes written since the last physical checkpoint was allocated.
    pub bytes_since_checkpoint: u64,
    /// Sum of all stream reservations.
    pub reserved_total: u64,
    /// Resident streams, ordered by id.
    pub streams: BTreeMap<StreamId, Arc<StreamDescriptor>>,
}

/// Everything the log and its stream handles share.
pub(crate) struct LogShared {
    /// Backing device.
    pub device: Arc<dyn BlockDevice>,
    /// Effective configuration, persisted geometry applied.
    pub config: LogConfig,
    /// Master block of the log.
    pub master: MasterBlock,
    /// File and LSN space sizes.
    pub geometry: LogGeometry,
    /// Log-wide mutable state.
    pub state: Mutex<LogState>,
    gate: CompletionGate,
    quota: WriteQuota,
    /// Space user writes leave free for checkpoints.
    checkpoint_headroom: u64,
    lifecycle: Mutex<HashMap<StreamId, Arc<tokio::sync::Mutex<()>>>>,
    verifiers: RwLock<HashMap<StreamType, Arc<dyn RecordVerifier>>>,
    fault: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LogShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogShared")
            .field("log_id", &self.master.log_id)
            .field("geometry", &self.geometry)
            .field("state", &self.state)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Position of the record being allocated.
#[derive(Debug, Clone, Copy)]
struct Allocation {
    lsn: Lsn,
    highest_completed: Lsn,
    last_checkpoint: Lsn,
    prev_in_stream: Lsn,
}

impl LogShared {
    /// Builds the shared state of a log whose head is `next_lsn`.
    pub(crate) fn new(
        device: Arc<dyn BlockDevice>,
        config: LogConfig,
        master: MasterBlock,
        geometry: LogGeometry,
        state: LogState,
        highest_completed: Lsn,
    ) -> Self {
        let physical = PhysicalCheckpoint::metadata_size(config.max_streams as usize);
        let checkpoint_headroom = round_up_to_block(COMMON_HEADER_SIZE + physical) as u64
            + u64::from(config.max_checkpoint_segment_size);
        Self {
            gate: CompletionGate::new(state.next_lsn, highest_completed),
            quota: WriteQuota::new(config.max_queued_write_bytes),
            device,
            config,
            master,
            geometry,
            state: Mutex::new(state),
            checkpoint_headroom,
            lifecycle: Mutex::new(HashMap::new()),
            verifiers: RwLock::new(HashMap::new()),
            fault: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Fails with `Closed` or `Faulted` if the log refuses work.
    pub(crate) fn check_usable(&self) -> LogResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        if let Some(reason) = self.fault.lock().as_ref() {
            return Err(LogError::Faulted {
                reason: reason.clone(),
            });
        }
        Ok(())
    }

    /// Moves the log into the faulted state.
    pub(crate) fn fault(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                error!(log_id = %self.master.log_id, reason = %reason, "log faulted");
                *fault = Some(reason.clone());
            }
        }
        self.gate.fail(reason);
    }

    /// Faults the log if `e` shows the in-memory model has diverged.
    pub(crate) fn escalate(&self, e: LogError) -> LogError {
        if matches!(e, LogError::InvariantViolation { .. }) {
            self.fault(e.to_string());
        }
        e
    }

    /// Returns the exclusive lifecycle lock of `id`.
    pub(crate) fn lifecycle_lock(&self, id: StreamId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.lifecycle.lock().entry(id).or_default())
    }

    /// Removes the lifecycle lock of `id` from the map when `held` is the
    /// last handle outside it.
    pub(crate) fn release_lifecycle_lock(&self, id: StreamId, held: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.lifecycle.lock();
        let ours = locks.get(&id).is_some_and(|lock| Arc::ptr_eq(lock, held));
        if ours && Arc::strong_count(held) == 2 {
            locks.remove(&id);
        }
    }

    #[cfg(test)]
    pub(crate) fn lifecycle_lock_count(&self) -> usize {
        self.lifecycle.lock().len()
    }

    pub(crate) fn register_verifier(&self, stream_type: StreamType, verifier: Arc<dyn RecordVerifier>) {
        self.verifiers.write().insert(stream_type, verifier);
    }

    pub(crate) fn verifier(&self, stream_type: StreamType) -> Option<Arc<dyn RecordVerifier>> {
        self.verifiers.read().get(&stream_type).cloned()
    }

    pub(crate) fn highest_completed(&self) -> Lsn {
        self.gate.highest_completed()
    }

    /// Bytes of LSN space not in use.
    pub(crate) fn free_space(&self, state: &LogState) -> u64 {
        self.geometry
            .lsn_space()
            .saturating_sub(state.next_lsn.distance_from(state.lowest_lsn))
    }

    /// Bytes a plain write or a new reservation may still take.
    pub(crate) fn unreserved_space(&self, state: &LogState) -> u64 {
        self.free_space(state)
            .saturating_sub(state.reserved_total + self.checkpoint_headroom)
    }

    fn log_identity(&self) -> RecordIdentity {
        RecordIdentity {
            log_id: self.master.log_id,
            log_signature: self.master.log_signature,
            stream_id: StreamId::PHYSICAL_CHECKPOINT,
            stream_type: StreamType::PHYSICAL_CHECKPOINT,
        }
    }

    fn ensure_fits(&self, state: &LogState, size: u64) -> LogResult<()> {
        let available = self.free_space(state);
        if size > available {
            return Err(LogError::LogFull {
                requested: size,
                available,
            });
        }
        Ok(())
    }

    /// Writes finalized records, waits until they and everything below them
    /// are durable, then runs `finish` with the outcome.
    ///
    /// Everything after allocation runs on a spawned task that owns `permit`.
    /// A cancelled caller therefore neither leaves a hole the completion gate
    /// waits on forever nor skips the in-memory bookkeeping of a write that
    /// still lands, and the quota stays held until the write is durable.
    async fn issue<F>(
        self: &Arc<Self>,
        records: Vec<(Lsn, Vec<u8>)>,
        permit: OwnedSemaphorePermit,
        finish: F,
    ) -> LogResult<()>
    where
        F: FnOnce(&LogShared, LogResult<()>) -> LogResult<()> + Send + 'static,
    {
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = shared.write_and_wait(records).await;
            drop(permit);
            finish(&shared, result)
        });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                let reason = format!("completion task failed: {e}");
                self.fault(reason.clone());
                Err(LogError::Faulted { reason })
            }
        }
    }

    async fn write_and_wait(self: &Arc<Self>, records: Vec<(Lsn, Vec<u8>)>) -> LogResult<()> {
        let Some(last) = records.last().map(|(lsn, _)| *lsn) else {
            return Ok(());
        };
        let handles: Vec<_> = records
            .into_iter()
            .map(|(lsn, bytes)| {
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let next = lsn.advance(bytes.len() as u64);
                    let result =
                        write_lsn_range(shared.device.as_ref(), &shared.geometry, lsn, &bytes).await;
                    match &result {
                        Ok(()) => shared.gate.complete(lsn, next),
                        Err(e) => shared.fault(format!("write at {lsn} failed: {e}")),
                    }
                    result
                })
            })
            .collect();

        for handle in handles {
            match handle.await {
                Ok(result) => result?,
                Err(e) => {
                    let reason = format!("write task failed: {e}");
                    self.fault(reason.clone());
                    return Err(LogError::Faulted { reason });
                }
            }
        }
        self.gate.wait_for(last).await
    }

    /// Writes one user record and returns its LSN once it is durable.
    pub(crate) async fn write_user_record(
        self: &Arc<Self>,
        stream: &Arc<StreamDescriptor>,
        asn: Asn,
        version: Version,
        metadata: &[u8],
        payload: &[u8],
        reserved: bool,
    ) -> LogResult<Lsn> {
        self.check_usable()?;
        if asn == Asn::NULL {
            return Err(LogError::invalid_argument("asn 0 is reserved"));
        }
        if metadata.len() > self.config.max_metadata_size as usize {
            return Err(LogError::RecordTooLarge {
                size: metadata.len() as u64,
                max: u64::from(self.config.max_metadata_size),
            });
        }
        if let Some(existing_version) = stream.index.check_for_records_with_higher_version(asn, version) {
            return Err(LogError::VersionConflict {
                asn,
                existing_version,
            });
        }

        let metadata_size = USER_RECORD_METADATA_OFFSET - COMMON_HEADER_SIZE + metadata.len();
        let mut image = RecordImage::new(metadata_size, payload);
        let size = image.len() as u64;
        if size > u64::from(self.config.max_record_size) {
            return Err(LogError::RecordTooLarge {
                size,
                max: u64::from(self.config.max_record_size),
            });
        }
        let permit = self.quota.acquire(size).await?;

        let truncation_point = stream.meta.lock().truncation_point;
        image.write_common_header(&stream.identity(self.master.log_id, self.master.log_signature));
        StreamFields {
            kind: StreamRecordKind::User,
            truncation_point,
            copy_forward_lsn: Lsn::NULL,
        }
        .encode_into(image.bytes_mut());
        UserRecordFields {
            asn,
            version,
            user_metadata_size: metadata.len() as u32,
            payload_size: payload.len() as u32,
        }
        .encode_into(image.bytes_mut());
        image.bytes_mut()[USER_RECORD_METADATA_OFFSET..USER_RECORD_METADATA_OFFSET + metadata.len()]
            .copy_from_slice(metadata);
        let body = image.body_checksum();

        let (allocation, previous) = {
            let mut state = self.state.lock();
            let mut meta = stream.meta.lock();
            if meta.phase == StreamPhase::Deleting {
                return Err(LogError::StreamDeletePending(stream.id));
            }
            if asn <= meta.truncation_point {
                return Err(LogError::AsnTruncated {
                    asn,
                    truncation_point: meta.truncation_point,
                });
            }
            if reserved {
                if size > meta.reservation {
                    return Err(LogError::ReservationExceeded {
                        requested: size,
                        reserved: meta.reservation,
                    });
                }
                self.ensure_fits(&state, size)?;
            } else {
                let available = self.unreserved_space(&state);
                if size > available {
                    return Err(LogError::LogFull {
                        requested: size,
                        available,
                    });
                }
            }

            let added = stream.index.add_or_update(AsnEntry::new(
                asn,
                version,
                Lsn::NULL,
                image.io_buffer_size(),
                Disposition::None,
            ))?;
            let lsn = state.next_lsn;
            let assigned = stream
                .tracker
                .guarantee_add_two_higher_records()
                .and_then(|()| {
                    stream
                        .index
                        .update_lsn_and_disposition(asn, version, lsn, Disposition::Pending)
                })
                .and_then(|()| {
                    stream
                        .tracker
                        .add_higher_lsn_record(lsn, image.header_size(), image.io_buffer_size())
                });
            if let Err(e) = assigned {
                if let Err(restore) = stream.index.restore(asn, version, added.previous) {
                    warn!(error = %restore, asn = %asn, "could not roll back index entry");
                }
                return Err(self.escalate(e));
            }

            let allocation = Allocation {
                lsn,
                highest_completed: self.gate.highest_completed(),
                last_checkpoint: state.last_checkpoint_lsn,
                prev_in_stream: meta.highest_lsn,
            };
            state.next_lsn = lsn.advance(size);
            state.bytes_since_checkpoint += size;
            meta.note_record(lsn, size);
            meta.highest_asn = meta.highest_asn.max(asn);
            if reserved {
                meta.reservation -= size;
                state.reserved_total -= size;
            }
            (allocation, added.previous)
        };

        image.finalize(
            body,
            allocation.lsn,
            allocation.highest_completed,
            allocation.last_checkpoint,
            allocation.prev_in_stream,
        );
        trace!(stream = %stream.id, asn = %asn, version, lsn = %allocation.lsn, size, "write issued");

        let descriptor = Arc::clone(stream);
        let lsn = allocation.lsn;
        self.issue(vec![(lsn, image.into_bytes())], permit, move |shared, result| {
            if let Err(e) = result {
                if let Err(restore) = descriptor.index.restore(asn, version, previous) {
                    debug!(error = %restore, asn = %asn, "index entry already replaced");
                }
                if descriptor.tracker.query_highest_lsn() == lsn {
                    let _ = descriptor.tracker.remove_highest_lsn_record();
                }
                return Err(e);
            }
            match descriptor
                .index
                .update_disposition(asn, version, Disposition::Persisted)
            {
                Ok(()) | Err(LogError::VersionConflict { .. }) => {}
                Err(e) => return Err(shared.escalate(e)),
            }
            trace!(stream = %descriptor.id, asn = %asn, lsn = %lsn, "write durable");
            Ok(())
        })
        .await?;

        self.run_due_checkpoints(stream).await?;
        Ok(allocation.lsn)
    }

    /// Takes the periodic checkpoints a write has made due.
    async fn run_due_checkpoints(self: &Arc<Self>, stream: &Arc<StreamDescriptor>) -> LogResult<()> {
        let (stream_due, physical_due) = {
            let mut state = self.state.lock();
            let mut meta = stream.meta.lock();
            let stream_due = meta.bytes_since_checkpoint >= self.config.stream_checkpoint_interval;
            if stream_due {
                meta.bytes_since_checkpoint = 0;
            }
            let physical_due =
                state.bytes_since_checkpoint >= self.config.physical_checkpoint_interval;
            if physical_due {
                state.bytes_since_checkpoint = 0;
            }
            (stream_due, physical_due)
        };
        if stream_due {
            self.write_stream_checkpoint(stream).await?;
        }
        if physical_due {
            self.write_physical_checkpoint().await?;
        }
        Ok(())
    }

    /// Writes a checkpoint of `stream`'s indexes and returns the LSN of its
    /// first segment.
    pub(crate) async fn write_stream_checkpoint(
        self: &Arc<Self>,
        stream: &Arc<StreamDescriptor>,
    ) -> LogResult<Lsn> {
        self.check_usable()?;
        let estimate = (CHECKPOINT_SEGMENT_PREAMBLE
            + stream.index.len() * AsnEntry::ENCODED_SIZE
            + stream.tracker.query_number_of_records() * LsnEntry::ENCODED_SIZE) as u64;
        let permit = self.quota.acquire(estimate).await?;
        let identity = stream.identity(self.master.log_id, self.master.log_signature);

        let records = {
            let mut state = self.state.lock();
            let mut meta = stream.meta.lock();
            let image = StreamCheckpointImage::build(
                &stream.index,
                &stream.tracker,
                self.config.max_checkpoint_segment_size as usize,
                &identity,
                meta.truncation_point,
            )?;
            self.ensure_fits(&state, image.total_size())?;
            stream
                .tracker
                .guarantee_add_higher_records(image.segments.len())?;

            let highest_completed = self.gate.highest_completed();
            let mut prev = meta.highest_lsn;
            let mut records = Vec::with_capacity(image.segments.len());
            for mut segment in image.segments {
                let lsn = state.next_lsn;
                let size = segment.len() as u64;
                let body = segment.body_checksum();
                segment.finalize(body, lsn, highest_completed, state.last_checkpoint_lsn, prev);
                stream
                    .tracker
                    .add_higher_lsn_record(lsn, segment.header_size(), segment.io_buffer_size())
                    .map_err(|e| self.escalate(e))?;
                state.next_lsn = lsn.advance(size);
                state.bytes_since_checkpoint += size;
                meta.note_record(lsn, size);
                prev = lsn;
                records.push((lsn, segment.into_bytes()));
            }
            meta.bytes_since_checkpoint = 0;
            records
        };

        let Some(first) = records.first().map(|(lsn, _)| *lsn) else {
            return Err(self.escalate(LogError::invariant("stream checkpoint without segments")));
        };
        let count = records.len();
        let descriptor = Arc::clone(stream);
        self.issue(records, permit, move |_, result| {
            result?;
            descriptor.meta.lock().last_checkpoint_lsn = first;
            debug!(stream = %descriptor.id, lsn = %first, segments = count, "stream checkpoint written");
            Ok(())
        })
        .await?;
        Ok(first)
    }

    /// Writes a physical checkpoint and reclaims the space it frees.
    pub(crate) async fn write_physical_checkpoint(self: &Arc<Self>) -> LogResult<Lsn> {
        self.check_usable()?;
        let estimate = {
            let state = self.state.lock();
            round_up_to_block(COMMON_HEADER_SIZE + PhysicalCheckpoint::metadata_size(state.streams.len()))
        };
        let permit = self.quota.acquire(estimate as u64).await?;

        let (lsn, bytes, log_lowest, stream_count) = {
            let mut state = self.state.lock();
            let streams: Vec<StreamExtent> = state
                .streams
                .values()
                .filter_map(|stream| {
                    let meta = stream.meta.lock();
                    (meta.phase == StreamPhase::Active).then(|| stream.extent(&meta))
                })
                .collect();
            let lsn = state.next_lsn;
            let log_lowest = streams
                .iter()
                .map(|extent| extent.lowest_lsn)
                .filter(|lowest| !lowest.is_null())
                .fold(lsn, Lsn::min);
            let stream_count = streams.len();

            let mut image = PhysicalCheckpoint {
                log_lowest_lsn: log_lowest,
                streams,
            }
            .to_image(&self.log_identity());
            let size = image.len() as u64;
            self.ensure_fits(&state, size)?;
            let body = image.body_checksum();
            image.finalize(
                body,
                lsn,
                self.gate.highest_completed(),
                state.last_checkpoint_lsn,
                state.last_checkpoint_lsn,
            );
            state.last_checkpoint_lsn = lsn;
            state.next_lsn = lsn.advance(size);
            state.bytes_since_checkpoint = 0;
            (lsn, image.into_bytes(), log_lowest, stream_count)
        };

        self.issue(vec![(lsn, bytes)], permit, move |shared, result| {
            result?;
            let reclaimed = {
                let mut state = shared.state.lock();
                let before = state.lowest_lsn;
                state.lowest_lsn = before.max(log_lowest);
                state.lowest_lsn.distance_from(before)
            };
            debug!(lsn = %lsn, streams = stream_count, lowest = %log_lowest, reclaimed, "physical checkpoint written");
            Ok(())
        })
        .await?;
        Ok(lsn)
    }

    /// Waits for every in-flight write and refuses further work.
    pub(crate) async fn close(&self) -> LogResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(LogError::Closed);
        }
        let _drained = self.quota.acquire(self.config.max_queued_write_bytes).await?;
        self.quota.close();
        self.device.flush().await?;
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
