//! Physical log handle.

use crate::config::LogConfig;
use crate::descriptor::{StreamDescriptor, StreamPhase};
use crate::error::{LogError, LogResult};
use crate::format::{LogGeometry, MasterBlock};
use crate::io::write_lsn_range;
use crate::pipeline::{LogShared, LogState};
use crate::recovery::{recover_physical_log, RecoveryOutcome, StreamRecovery};
use crate::stream::{LogStream, RecordVerifier};
use crate::types::{LogId, Lsn, StreamId, StreamType};
use ringlog_storage::{BlockDevice, FileDevice, BLOCK_SIZE};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Log-wide space accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpaceInfo {
    /// Size of the file in bytes.
    pub file_size: u64,
    /// Bytes of circular record space.
    pub lsn_space: u64,
    /// Bytes of record space not in use.
    pub free_space: u64,
    /// Bytes reserved by streams.
    pub reserved_space: u64,
    /// Bytes plain writes may still take.
    pub unreserved_space: u64,
    /// Lowest LSN still in use.
    pub lowest_lsn: Lsn,
    /// LSN the next record is written at.
    pub next_lsn: Lsn,
    /// LSN of the highest record with every lower record durable.
    pub highest_completed_lsn: Lsn,
    /// LSN of the newest physical checkpoint.
    pub last_checkpoint_lsn: Lsn,
    /// Resident streams.
    pub stream_count: usize,
}

/// An open physical log.
///
/// A log is one fixed-size file holding the records of many streams in a
/// circular LSN space. Space is reclaimed as streams truncate.
///
/// # Example
///
/// ```rust,ignore
/// use ringlog_core::{Asn, LogConfig, LogId, PhysicalLog, ReadType, StreamId, StreamType};
/// use ringlog_storage::InMemoryDevice;
/// use std::sync::Arc;
///
/// let device = Arc::new(InMemoryDevice::new());
/// let log = PhysicalLog::create(device, LogId::random(), 1 << 20, LogConfig::default()).await?;
///
/// let stream = log.create_stream(StreamId::random(), StreamType::random()).await?;
/// stream.write(Asn::new(1), 1, b"meta", b"payload").await?;
/// let record = stream.read(Asn::new(1), ReadType::Exact).await?;
/// assert_eq!(record.payload, b"payload");
///
/// stream.close();
/// log.close().await?;
/// ```
#[derive(Debug)]
pub struct PhysicalLog {
    shared: Arc<LogShared>,
}

impl PhysicalLog {
    /// Formats `device` as a new log of `file_size` bytes.
    ///
    /// Writes both master blocks and the initial physical checkpoint at
    /// LSN 0. Whatever the device held before is ignored by later
    /// recoveries because it carries another log's identity.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configuration or the size is
    /// inconsistent, or an I/O error.
    pub async fn create(
        device: Arc<dyn BlockDevice>,
        log_id: LogId,
        file_size: u64,
        config: LogConfig,
    ) -> LogResult<Self> {
        config.validate()?;
        let geometry = LogGeometry::new(file_size)?;
        if geometry.lsn_space() < 2 * u64::from(config.max_record_size) {
            return Err(LogError::invalid_argument(format!(
                "file size {file_size} cannot hold two records of {} bytes",
                config.max_record_size
            )));
        }
        let master = MasterBlock::new(log_id, file_size, &config);
        let config = master.apply_to(config);

        device.set_len(file_size).await?;
        let block = master.encode();
        device.write_at(0, &block).await?;
        device.write_at(geometry.tail_master_offset(), &block).await?;
        device.flush().await?;

        let log = Self::initialize(device, config, master, geometry).await?;
        info!(log_id = %log_id, file_size, "log created");
        Ok(log)
    }

    /// Opens the log on `device` and recovers its state.
    ///
    /// Streams are recovered lazily by [`Self::open_stream`].
    ///
    /// # Errors
    ///
    /// Returns a structural fault if the log on disk is inconsistent.
    pub async fn open(device: Arc<dyn BlockDevice>, config: LogConfig) -> LogResult<Self> {
        config.validate()?;
        let recovered = match recover_physical_log(device.as_ref(), &config).await? {
            RecoveryOutcome::Empty { master, geometry } => {
                warn!(log_id = %master.log_id, "log holds no records, reinitializing");
                let config = master.apply_to(config);
                return Self::initialize(device, config, master, geometry).await;
            }
            RecoveryOutcome::Recovered(state) => state,
        };

        let config = recovered.master.apply_to(config);
        let mut streams = BTreeMap::new();
        let mut reserved_total = 0u64;
        for extent in &recovered.streams {
            reserved_total += extent.reservation;
            streams.insert(extent.stream_id, Arc::new(StreamDescriptor::resident(*extent)));
        }
        let state = LogState {
            next_lsn: recovered.next_lsn,
            lowest_lsn: recovered.lowest_lsn,
            last_checkpoint_lsn: recovered.highest_checkpoint_lsn,
            bytes_since_checkpoint: 0,
            reserved_total,
            streams,
        };
        let shared = Arc::new(LogShared::new(
            device,
            config,
            recovered.master,
            recovered.geometry,
            state,
            recovered.highest_completed_lsn,
        ));
        scrub_stale_records(&shared, &recovered.stale_records, recovered.lowest_lsn).await?;

        info!(
            log_id = %recovered.master.log_id,
            next = %recovered.next_lsn,
            free = recovered.free_space,
            streams = recovered.streams.len(),
            "log opened"
        );
        Ok(Self { shared })
    }

    /// Starts a log with no records and writes its first physical
    /// checkpoint.
    async fn initialize(
        device: Arc<dyn BlockDevice>,
        config: LogConfig,
        master: MasterBlock,
        geometry: LogGeometry,
    ) -> LogResult<Self> {
        let state = LogState {
            next_lsn: Lsn::ZERO,
            lowest_lsn: Lsn::ZERO,
            last_checkpoint_lsn: Lsn::NULL,
            bytes_since_checkpoint: 0,
            reserved_total: 0,
            streams: BTreeMap::new(),
        };
        let shared = Arc::new(LogShared::new(device, config, master, geometry, state, Lsn::NULL));
        shared.write_physical_checkpoint().await?;
        Ok(Self { shared })
    }

    /// Creates a log backed by a new file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or the log cannot be created.
    pub async fn create_file(
        path: &Path,
        log_id: LogId,
        file_size: u64,
        config: LogConfig,
    ) -> LogResult<Self> {
        let device = FileDevice::create(path, file_size)?;
        Self::create(Arc::new(device), log_id, file_size, config).await
    }

    /// Opens the log stored in the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, locked or not a valid log.
    pub async fn open_file(path: &Path, config: LogConfig) -> LogResult<Self> {
        let device = FileDevice::open(path)?;
        Self::open(Arc::new(device), config).await
    }

    /// Deletes the log file at `path`. The log must not be open.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be removed.
    pub fn delete_file(path: &Path) -> LogResult<()> {
        FileDevice::remove(path)?;
        info!(path = %path.display(), "log file deleted");
        Ok(())
    }

    /// Identity of the log.
    #[must_use]
    pub fn log_id(&self) -> LogId {
        self.shared.master.log_id
    }

    /// Effective configuration, with the persisted geometry applied.
    #[must_use]
    pub fn config(&self) -> &LogConfig {
        &self.shared.config
    }

    /// Master block of the log.
    #[must_use]
    pub fn master(&self) -> &MasterBlock {
        &self.shared.master
    }

    /// Registers the verifier run over every record of `stream_type`.
    ///
    /// Replaces any verifier registered before. Streams already recovered
    /// are only checked on read.
    pub fn register_verifier(
        &self,
        stream_type: StreamType,
        verifier: impl RecordVerifier + 'static,
    ) {
        self.shared.register_verifier(stream_type, Arc::new(verifier));
    }

    /// Creates a stream and returns it open.
    ///
    /// The stream is durable once this returns: a physical checkpoint
    /// records it and its first stream checkpoint is written.
    ///
    /// # Errors
    ///
    /// - `StreamExists` if the id is in use
    /// - `StreamDeletePending` if a stream with the id is being deleted
    /// - `TooManyStreams` if the log holds `max_streams` streams
    pub async fn create_stream(&self, id: StreamId, stream_type: StreamType) -> LogResult<LogStream> {
        self.shared.check_usable()?;
        if id == StreamId::PHYSICAL_CHECKPOINT || stream_type == StreamType::PHYSICAL_CHECKPOINT {
            return Err(LogError::invalid_argument(
                "the physical checkpoint stream identity is reserved",
            ));
        }
        let lifecycle = self.shared.lifecycle_lock(id);
        let _guard = lifecycle.lock().await;

        let descriptor = {
            let mut state = self.shared.state.lock();
            if let Some(existing) = state.streams.get(&id) {
                return Err(match existing.meta.lock().phase {
                    StreamPhase::Deleting => LogError::StreamDeletePending(id),
                    StreamPhase::Active => LogError::StreamExists(id),
                });
            }
            if state.streams.len() >= self.shared.config.max_streams as usize {
                return Err(LogError::TooManyStreams {
                    limit: self.shared.config.max_streams,
                });
            }
            let descriptor = Arc::new(StreamDescriptor::created(id, stream_type));
            state.streams.insert(id, Arc::clone(&descriptor));
            descriptor
        };

        if let Err(e) = self.shared.write_physical_checkpoint().await {
            self.shared.state.lock().streams.remove(&id);
            return Err(e);
        }
        self.shared.write_stream_checkpoint(&descriptor).await?;
        descriptor.meta.lock().open = true;
        info!(stream = %id, stream_type = %stream_type, "stream created");
        Ok(LogStream::new(Arc::clone(&self.shared), descriptor))
    }

    /// Opens an existing stream, recovering its indexes on first open.
    ///
    /// # Errors
    ///
    /// - `StreamNotFound` if no such stream exists
    /// - `StreamAlreadyOpen` if another handle is open
    /// - `StreamDeletePending` if the stream is being deleted
    /// - a structural fault or `VerificationFailed` if recovery fails; the
    ///   log stays usable and the open may be retried
    pub async fn open_stream(&self, id: StreamId) -> LogResult<LogStream> {
        self.shared.check_usable()?;
        let lifecycle = self.shared.lifecycle_lock(id);
        let _guard = lifecycle.lock().await;

        let found = self.shared.state.lock().streams.get(&id).cloned();
        let Some(descriptor) = found else {
            self.shared.release_lifecycle_lock(id, &lifecycle);
            return Err(LogError::StreamNotFound(id));
        };
        let extent = {
            let mut meta = descriptor.meta.lock();
            if meta.phase == StreamPhase::Deleting {
                return Err(LogError::StreamDeletePending(id));
            }
            if meta.open {
                return Err(LogError::StreamAlreadyOpen(id));
            }
            if meta.recovered {
                meta.open = true;
                drop(meta);
                debug!(stream = %id, "stream reopened");
                return Ok(LogStream::new(Arc::clone(&self.shared), descriptor));
            }
            meta.recovered_extent
        };

        let verifier = self.shared.verifier(descriptor.stream_type);
        let log_lowest_lsn = self.shared.state.lock().lowest_lsn;
        let recovery = StreamRecovery {
            device: self.shared.device.as_ref(),
            master: &self.shared.master,
            geometry: &self.shared.geometry,
            config: &self.shared.config,
            log_lowest_lsn,
            verifier: verifier.as_deref(),
        };
        let report = match recovery
            .recover(&extent, &descriptor.index, &descriptor.tracker)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                descriptor.index.clear();
                descriptor.tracker.clear();
                warn!(stream = %id, error = %e, "stream recovery failed");
                return Err(e);
            }
        };

        {
            let mut meta = descriptor.meta.lock();
            meta.truncation_point = report.truncation_point;
            meta.highest_asn = report.highest_asn;
            meta.last_checkpoint_lsn = report.last_checkpoint_lsn;
            meta.recovered = true;
        }
        if report.needs_checkpoint {
            self.shared.write_stream_checkpoint(&descriptor).await?;
            let mut meta = descriptor.meta.lock();
            let lowest = descriptor.tracker.query_lowest_lsn();
            meta.lowest_lsn = meta.lowest_lsn.max(lowest);
        }
        descriptor.meta.lock().open = true;
        info!(
            stream = %id,
            replayed = report.replayed_records,
            truncation_point = %report.truncation_point,
            "stream opened"
        );
        Ok(LogStream::new(Arc::clone(&self.shared), descriptor))
    }

    /// Deletes a closed stream and frees its space and reservation.
    ///
    /// The slot is released only after a physical checkpoint that omits the
    /// stream is durable.
    ///
    /// # Errors
    ///
    /// - `StreamNotFound` if no such stream exists
    /// - `StreamOpen` if a handle is open
    /// - `StreamDeletePending` if another delete is in progress
    pub async fn delete_stream(&self, id: StreamId) -> LogResult<()> {
        self.shared.check_usable()?;
        let lifecycle = self.shared.lifecycle_lock(id);
        let _guard = lifecycle.lock().await;

        let (descriptor, reservation) = {
            let mut state = self.shared.state.lock();
            let found = state.streams.get(&id).cloned();
            let Some(descriptor) = found else {
                drop(state);
                self.shared.release_lifecycle_lock(id, &lifecycle);
                return Err(LogError::StreamNotFound(id));
            };
            let mut meta = descriptor.meta.lock();
            if meta.open {
                return Err(LogError::StreamOpen(id));
            }
            if meta.phase == StreamPhase::Deleting {
                return Err(LogError::StreamDeletePending(id));
            }
            meta.phase = StreamPhase::Deleting;
            let reservation = meta.reservation;
            state.reserved_total -= reservation;
            drop(meta);
            (descriptor, reservation)
        };

        if let Err(e) = self.shared.write_physical_checkpoint().await {
            let mut state = self.shared.state.lock();
            descriptor.meta.lock().phase = StreamPhase::Active;
            state.reserved_total += reservation;
            return Err(e);
        }
        self.shared.state.lock().streams.remove(&id);
        self.shared.release_lifecycle_lock(id, &lifecycle);
        info!(stream = %id, "stream deleted");
        Ok(())
    }

    /// Writes a physical checkpoint now and returns its LSN.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be written.
    pub async fn checkpoint(&self) -> LogResult<Lsn> {
        self.shared.write_physical_checkpoint().await
    }

    /// Returns log-wide space accounting.
    #[must_use]
    pub fn query_space_info(&self) -> SpaceInfo {
        let state = self.shared.state.lock();
        SpaceInfo {
            file_size: self.shared.geometry.file_size(),
            lsn_space: self.shared.geometry.lsn_space(),
            free_space: self.shared.free_space(&state),
            reserved_space: state.reserved_total,
            unreserved_space: self.shared.unreserved_space(&state),
            lowest_lsn: state.lowest_lsn,
            next_lsn: state.next_lsn,
            highest_completed_lsn: self.shared.highest_completed(),
            last_checkpoint_lsn: state.last_checkpoint_lsn,
            stream_count: state.streams.len(),
        }
    }

    /// Returns the ids of every stream not being deleted, in order.
    #[must_use]
    pub fn query_stream_ids(&self) -> Vec<StreamId> {
        self.shared
            .state
            .lock()
            .streams
            .values()
            .filter(|stream| stream.meta.lock().phase == StreamPhase::Active)
            .map(|stream| stream.id)
            .collect()
    }

    /// Writes a final physical checkpoint, waits for in-flight writes and
    /// closes the log.
    ///
    /// Reservation consumed since the last physical checkpoint is only
    /// recorded by that checkpoint; after a crash it is restored in full.
    /// Open stream handles fail with `Closed` afterwards.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the log was already closed, or an I/O error from
    /// the final flush.
    pub async fn close(&self) -> LogResult<()> {
        if self.shared.check_usable().is_ok() {
            self.shared.write_physical_checkpoint().await?;
        }
        self.shared.close().await?;
        info!(log_id = %self.shared.master.log_id, "log closed");
        Ok(())
    }

    /// Returns true once [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

/// Zeroes the first block of every valid record found past the head.
async fn scrub_stale_records(shared: &LogShared, stale: &[Lsn], lowest: Lsn) -> LogResult<()> {
    if stale.is_empty() {
        return Ok(());
    }
    let zeros = vec![0u8; BLOCK_SIZE];
    let mut scrubbed = 0usize;
    for &lsn in stale {
        if lsn.distance_from(lowest) >= shared.geometry.lsn_space() {
            continue;
        }
        write_lsn_range(shared.device.as_ref(), &shared.geometry, lsn, &zeros).await?;
        scrubbed += 1;
    }
    warn!(scrubbed, "scrubbed stale records past the head");
    Ok(())
}
