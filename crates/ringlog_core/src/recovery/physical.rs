//! Physical log recovery.
//!
//! Runs once per open:
//!
//! 1. validate the master blocks, preferring the leading one
//! 2. scan the LSN space chunk by chunk, from its end backward, for valid
//!    record headers; remember the one with the highest LSN
//! 3. walk forward from the highest completed LSN any header declares,
//!    following record sizes, while records stay contiguous and valid; the
//!    last one reached is the head
//! 4. load the physical checkpoint the head points at and replay the
//!    records between it and the head into the per-stream extent table
//!
//! Recovery never writes. Valid records found past the head are reported in
//! [`RecoveredLogState::stale_records`] so the caller can scrub them.

use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::format::{
    verify_checksum, CommonHeader, LogGeometry, MasterBlock, PhysicalCheckpoint, StreamExtent,
    COMMON_HEADER_SIZE, FORMAT_VERSION,
};
use crate::io::read_lsn_range;
use crate::types::{Lsn, StreamId};
use ringlog_storage::{BlockDevice, BLOCK_SIZE};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Whole-log state rebuilt from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveredLogState {
    /// The master block that validated.
    pub master: MasterBlock,
    /// File and LSN space sizes.
    pub geometry: LogGeometry,
    /// Lowest LSN still in use.
    pub lowest_lsn: Lsn,
    /// LSN the next record will be written at.
    pub next_lsn: Lsn,
    /// LSN of the head record; every record up to it is complete.
    pub highest_completed_lsn: Lsn,
    /// LSN of the newest physical checkpoint.
    pub highest_checkpoint_lsn: Lsn,
    /// Bytes of LSN space not in use.
    pub free_space: u64,
    /// One extent per resident stream, ordered by stream id.
    pub streams: Vec<StreamExtent>,
    /// Valid records found past the head, never made contiguous.
    pub stale_records: Vec<Lsn>,
}

/// Result of recovering a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RecoveryOutcome {
    /// Valid master block but no records anywhere.
    Empty {
        /// The master block that validated.
        master: MasterBlock,
        /// File and LSN space sizes.
        geometry: LogGeometry,
    },
    /// The log holds records.
    Recovered(RecoveredLogState),
}

/// Identity checks applied to every header found on disk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeaderCheck<'a> {
    pub master: &'a MasterBlock,
    pub geometry: &'a LogGeometry,
    pub max_record_size: u32,
}

impl HeaderCheck<'_> {
    /// Returns true if `header` claims to be a record of this log at the
    /// position it was read from.
    fn claims(&self, header: &CommonHeader, position: u64) -> bool {
        header.log_id == self.master.log_id
            && header.log_signature == self.master.log_signature
            && header.format_version == FORMAT_VERSION
            && header.lsn.is_valid()
            && self.geometry.position(header.lsn) == position
            && header.metadata_size <= self.max_record_size
    }

    /// Reads the header region of the record at `lsn` if one claims to be
    /// there.
    async fn read_region(
        &self,
        device: &dyn BlockDevice,
        lsn: Lsn,
    ) -> LogResult<Option<(CommonHeader, Vec<u8>)>> {
        let first = read_lsn_range(device, self.geometry, lsn, BLOCK_SIZE as u64).await?;
        let header = CommonHeader::decode(&first)?;
        if header.lsn != lsn || !self.claims(&header, self.geometry.position(lsn)) {
            return Ok(None);
        }
        let needed = COMMON_HEADER_SIZE as u64 + u64::from(header.metadata_size);
        let region = if needed <= BLOCK_SIZE as u64 {
            first
        } else {
            let len = needed.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64;
            read_lsn_range(device, self.geometry, lsn, len).await?
        };
        Ok(Some((header, region)))
    }

    /// Reads and fully validates the record header at `lsn`.
    ///
    /// Returns `Ok(None)` for anything that is not a complete record of
    /// this log at `lsn` (garbage, a stale record, or a torn write) and a
    /// structural fault for a checksummed header that breaks cross-field
    /// rules.
    pub(crate) async fn read_header(
        &self,
        device: &dyn BlockDevice,
        lsn: Lsn,
    ) -> LogResult<Option<(CommonHeader, Vec<u8>)>> {
        let Some((header, region)) = self.read_region(device, lsn).await? else {
            return Ok(None);
        };
        match verify_checksum(&region) {
            Ok(()) => {}
            Err(LogError::ChecksumMismatch { .. }) => return Ok(None),
            Err(e) => return Err(e),
        }
        header.check_shape(self.max_record_size)?;
        Ok(Some((header, region)))
    }

    /// Reads the header of a record that must exist at `lsn`.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch` if only the checksum disagrees and a
    /// structural fault for anything else.
    pub(crate) async fn read_expected(
        &self,
        device: &dyn BlockDevice,
        lsn: Lsn,
    ) -> LogResult<(CommonHeader, Vec<u8>)> {
        let (header, region) = self.read_region(device, lsn).await?.ok_or_else(|| {
            LogError::structural(format!("no record of this log at {lsn}"))
        })?;
        verify_checksum(&region)?;
        header.check_shape(self.max_record_size)?;
        Ok((header, region))
    }
}

/// Reads both master blocks and returns the one to trust.
async fn read_master(device: &dyn BlockDevice) -> LogResult<MasterBlock> {
    let leading = match device.read_at(0, BLOCK_SIZE).await {
        Ok(block) => MasterBlock::decode(&block),
        Err(e) => Err(e.into()),
    };
    let device_size = device.size().await?;
    let trailing = if device_size >= 2 * BLOCK_SIZE as u64 {
        match device.read_at(device_size - BLOCK_SIZE as u64, BLOCK_SIZE).await {
            Ok(block) => MasterBlock::decode(&block),
            Err(e) => Err(e.into()),
        }
    } else {
        Err(LogError::structural("device too small for a master block"))
    };

    let master = match (leading, trailing) {
        (Ok(a), Ok(b)) => {
            if a != b {
                warn!(log_id = %a.log_id, "master blocks disagree, using the leading copy");
            }
            a
        }
        (Ok(a), Err(e)) => {
            warn!(error = %e, "trailing master block invalid, using the leading copy");
            a
        }
        (Err(e), Ok(b)) => {
            warn!(error = %e, "leading master block invalid, using the trailing copy");
            b
        }
        (Err(a), Err(b)) => {
            return Err(LogError::structural(format!(
                "no valid master block: leading: {a}; trailing: {b}"
            )))
        }
    };
    if master.file_size > device_size {
        return Err(LogError::structural(format!(
            "master block records {} bytes but the device holds {device_size}",
            master.file_size
        )));
    }
    Ok(master)
}

/// Valid headers found by the head search.
#[derive(Debug)]
struct HeadSearch {
    highest: Option<CommonHeader>,
    highest_completed: Lsn,
    found: Vec<Lsn>,
}

/// Scans the whole LSN space for valid record headers.
async fn search_for_head(
    device: &dyn BlockDevice,
    check: &HeaderCheck<'_>,
    chunk_size: u64,
) -> LogResult<HeadSearch> {
    let space = check.geometry.lsn_space();
    let block = BLOCK_SIZE as u64;
    let mut search = HeadSearch {
        highest: None,
        highest_completed: Lsn::NULL,
        found: Vec::new(),
    };

    let chunk_count = space.div_ceil(chunk_size);
    for chunk in (0..chunk_count).rev() {
        let start = chunk * chunk_size;
        let len = chunk_size.min(space - start);
        let bytes = device.read_at(block + start, len as usize).await?;

        for at in (0..len / block).rev() {
            let offset = (at * block) as usize;
            let header = CommonHeader::decode(&bytes[offset..])?;
            if !check.claims(&header, start + at * block) {
                continue;
            }
            let needed = COMMON_HEADER_SIZE + header.metadata_size as usize;
            let verified = if offset + needed <= bytes.len() {
                match verify_checksum(&bytes[offset..]) {
                    Ok(()) => true,
                    Err(LogError::ChecksumMismatch { .. }) => false,
                    Err(e) => return Err(e),
                }
            } else {
                check.read_header(device, header.lsn).await?.is_some()
            };
            if !verified {
                continue;
            }
            header.check_shape(check.max_record_size)?;

            search.found.push(header.lsn);
            search.highest_completed = search.highest_completed.max(header.highest_completed_lsn);
            if search.highest.map_or(true, |h| header.lsn > h.lsn) {
                search.highest = Some(header);
            }
        }
    }
    Ok(search)
}

/// Recovers the whole-log state of the log on `device`.
///
/// # Errors
///
/// Returns a structural fault if no master block validates or the records
/// on disk contradict each other.
pub async fn recover_physical_log(
    device: &dyn BlockDevice,
    config: &LogConfig,
) -> LogResult<RecoveryOutcome> {
    let master = read_master(device).await?;
    let config = master.apply_to(config.clone());
    let geometry = LogGeometry::new(master.file_size)
        .map_err(|e| LogError::structural(format!("master block geometry: {e}")))?;
    let check = HeaderCheck {
        master: &master,
        geometry: &geometry,
        max_record_size: config.max_record_size,
    };
    info!(log_id = %master.log_id, file_size = master.file_size, "recovering log");

    let search = search_for_head(device, &check, u64::from(config.recovery_chunk_size)).await?;
    let Some(highest) = search.highest else {
        info!(log_id = %master.log_id, "log holds no records");
        return Ok(RecoveryOutcome::Empty { master, geometry });
    };
    debug!(
        highest = %highest.lsn,
        highest_completed = %search.highest_completed,
        candidates = search.found.len(),
        "head search complete"
    );

    let head = walk_to_head(device, &check, search.highest_completed).await?;
    let next_lsn = head.next_lsn();
    let mut stale_records: Vec<Lsn> = search
        .found
        .iter()
        .copied()
        .filter(|lsn| *lsn >= next_lsn)
        .collect();
    stale_records.sort_unstable();
    if !stale_records.is_empty() {
        warn!(
            head = %head.lsn,
            count = stale_records.len(),
            "valid records past the head were never made contiguous"
        );
    }

    let replay = replay_checkpoint(device, &check, &head).await?;
    let lowest_lsn = replay.checkpoint.log_lowest_lsn;
    let used = next_lsn.distance_from(lowest_lsn);
    if lowest_lsn > replay.checkpoint_lsn || used > geometry.lsn_space() {
        return Err(LogError::structural(format!(
            "log lowest {lowest_lsn} inconsistent with checkpoint {} and head {next_lsn}",
            replay.checkpoint_lsn
        )));
    }

    let state = RecoveredLogState {
        master,
        geometry,
        lowest_lsn,
        next_lsn,
        highest_completed_lsn: head.lsn,
        highest_checkpoint_lsn: replay.checkpoint_lsn,
        free_space: geometry.lsn_space() - used,
        streams: replay.streams.into_values().collect(),
        stale_records,
    };
    info!(
        log_id = %state.master.log_id,
        lowest = %state.lowest_lsn,
        next = %state.next_lsn,
        streams = state.streams.len(),
        "log recovered"
    );
    Ok(RecoveryOutcome::Recovered(state))
}

/// Follows records forward from `start` while they stay contiguous.
async fn walk_to_head(
    device: &dyn BlockDevice,
    check: &HeaderCheck<'_>,
    highest_completed: Lsn,
) -> LogResult<CommonHeader> {
    let start = if highest_completed.is_null() {
        Lsn::ZERO
    } else {
        highest_completed
    };
    let (mut head, _) = check.read_header(device, start).await?.ok_or_else(|| {
        LogError::structural(format!("completed record at {start} is unreadable"))
    })?;

    loop {
        let next = head.next_lsn();
        if next.distance_from(start) >= check.geometry.lsn_space() {
            break;
        }
        match check.read_header(device, next).await? {
            Some((header, _)) => head = header,
            None => break,
        }
    }
    Ok(head)
}

struct Replay {
    checkpoint_lsn: Lsn,
    checkpoint: PhysicalCheckpoint,
    streams: BTreeMap<StreamId, StreamExtent>,
}

/// Loads the physical checkpoint `head` points at and replays the records
/// between it and the head.
async fn replay_checkpoint(
    device: &dyn BlockDevice,
    check: &HeaderCheck<'_>,
    head: &CommonHeader,
) -> LogResult<Replay> {
    let mut cursor = if head.stream_id == StreamId::PHYSICAL_CHECKPOINT {
        head.lsn
    } else if head.last_checkpoint_lsn.is_null() {
        Lsn::ZERO
    } else {
        head.last_checkpoint_lsn
    };
    let mut replay: Option<Replay> = None;

    while cursor <= head.lsn {
        let (header, region) = check.read_header(device, cursor).await?.ok_or_else(|| {
            LogError::structural(format!("record at {cursor} below the head is unreadable"))
        })?;

        if header.stream_id == StreamId::PHYSICAL_CHECKPOINT {
            let checkpoint = PhysicalCheckpoint::decode(&region, header.metadata_size)?;
            debug!(lsn = %header.lsn, streams = checkpoint.streams.len(), "loaded physical checkpoint");
            let streams = checkpoint
                .streams
                .iter()
                .map(|extent| (extent.stream_id, *extent))
                .collect();
            replay = Some(Replay {
                checkpoint_lsn: header.lsn,
                checkpoint,
                streams,
            });
        } else {
            let Some(state) = replay.as_mut() else {
                return Err(LogError::structural(format!(
                    "record at {cursor} where a physical checkpoint was expected"
                )));
            };
            match state.streams.get_mut(&header.stream_id) {
                Some(extent) => extent.cover(header.lsn, header.next_lsn()),
                None => warn!(
                    lsn = %header.lsn,
                    stream = %header.stream_id,
                    "record for a stream unknown to the checkpoint"
                ),
            }
        }
        cursor = header.next_lsn();
    }

    replay.ok_or_else(|| LogError::structural("no physical checkpoint found"))
}
