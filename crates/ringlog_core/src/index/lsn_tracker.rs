//! Per-stream ledger of on-disk record locations.
//!
//! Entries are appended at the high end by the write pipeline, prepended at
//! the low end by the backward recovery walk, and removed only from either
//! end. LSNs strictly increase from the low end to the high end.

use crate::error::{LogError, LogResult};
use crate::format::segmented::{SegmentEntry, SegmentSummary, SegmentedBuffer};
use crate::types::Lsn;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

/// Location and size of one record on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LsnEntry {
    /// LSN of the record.
    pub lsn: Lsn,
    /// Size of the header and metadata region.
    pub header_and_metadata_size: u32,
    /// Size of the payload region.
    pub io_buffer_size: u32,
}

impl LsnEntry {
    /// Creates a new entry.
    #[must_use]
    pub const fn new(lsn: Lsn, header_and_metadata_size: u32, io_buffer_size: u32) -> Self {
        Self {
            lsn,
            header_and_metadata_size,
            io_buffer_size,
        }
    }

    /// Total bytes the record occupies in LSN space.
    #[must_use]
    pub const fn on_disk_size(&self) -> u64 {
        self.header_and_metadata_size as u64 + self.io_buffer_size as u64
    }
}

impl SegmentEntry for LsnEntry {
    const ENCODED_SIZE: usize = 16;

    fn encode_into(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.lsn.as_i64().to_le_bytes());
        out[8..12].copy_from_slice(&self.header_and_metadata_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.io_buffer_size.to_le_bytes());
    }

    fn decode_from(bytes: &[u8]) -> LogResult<Self> {
        if bytes.len() != Self::ENCODED_SIZE {
            return Err(LogError::structural("LSN entry has wrong length"));
        }
        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&bytes[0..8]);
        let mut header = [0u8; 4];
        header.copy_from_slice(&bytes[8..12]);
        let mut io = [0u8; 4];
        io.copy_from_slice(&bytes[12..16]);
        Ok(Self {
            lsn: Lsn::new(i64::from_le_bytes(lsn)),
            header_and_metadata_size: u32::from_le_bytes(header),
            io_buffer_size: u32::from_le_bytes(io),
        })
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    entries: VecDeque<LsnEntry>,
    total_on_disk_size: u64,
}

impl TrackerState {
    fn reserve(&mut self, additional: usize) -> LogResult<()> {
        self.entries
            .try_reserve(additional)
            .map_err(|_| LogError::insufficient_resources("LSN tracker entries"))
    }
}

/// Ordered LSN ledger for one stream.
///
/// All operations take the tracker's own lock and never perform I/O.
#[derive(Debug, Default)]
pub struct LsnExtentTracker {
    state: Mutex<TrackerState>,
}

impl LsnExtentTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record at the high end.
    ///
    /// # Errors
    ///
    /// - `InvariantViolation` if `lsn` is invalid or not above the current
    ///   highest
    /// - `InsufficientResources` if storage cannot grow
    pub fn add_higher_lsn_record(&self, lsn: Lsn, header_size: u32, io_size: u32) -> LogResult<()> {
        check_valid(lsn)?;
        let mut state = self.state.lock();
        if let Some(highest) = state.entries.back() {
            if lsn <= highest.lsn {
                return Err(LogError::invariant(format!(
                    "LSN tracker append of {lsn} not above highest {}",
                    highest.lsn
                )));
            }
        }
        state.reserve(1)?;
        let entry = LsnEntry::new(lsn, header_size, io_size);
        state.total_on_disk_size += entry.on_disk_size();
        state.entries.push_back(entry);
        Ok(())
    }

    /// Prepends a record at the low end. Used by the backward recovery walk.
    ///
    /// # Errors
    ///
    /// - `InvariantViolation` if `lsn` is invalid or not below the current
    ///   lowest
    /// - `InsufficientResources` if storage cannot grow
    pub fn add_lower_lsn_record(&self, lsn: Lsn, header_size: u32, io_size: u32) -> LogResult<()> {
        check_valid(lsn)?;
        let mut state = self.state.lock();
        if let Some(lowest) = state.entries.front() {
            if lsn >= lowest.lsn {
                return Err(LogError::invariant(format!(
                    "LSN tracker prepend of {lsn} not below lowest {}",
                    lowest.lsn
                )));
            }
        }
        state.reserve(1)?;
        let entry = LsnEntry::new(lsn, header_size, io_size);
        state.total_on_disk_size += entry.on_disk_size();
        state.entries.push_front(entry);
        Ok(())
    }

    /// Undoes the most recent high-end append.
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` if the tracker is empty.
    pub fn remove_highest_lsn_record(&self) -> LogResult<Lsn> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .pop_back()
            .ok_or_else(|| LogError::invariant("remove from empty LSN tracker"))?;
        state.total_on_disk_size -= entry.on_disk_size();
        Ok(entry.lsn)
    }

    /// Pre-reserves room so the next two high-end appends cannot fail for
    /// lack of memory.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientResources` if the reservation fails.
    pub fn guarantee_add_two_higher_records(&self) -> LogResult<()> {
        self.state.lock().reserve(2)
    }

    /// Pre-reserves room for `count` high-end appends.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientResources` if the reservation fails.
    pub fn guarantee_add_higher_records(&self, count: usize) -> LogResult<()> {
        self.state.lock().reserve(count)
    }

    /// Removes every entry with an LSN below `new_lowest_lsn`.
    ///
    /// Returns the number of entries removed.
    pub fn truncate(&self, new_lowest_lsn: Lsn) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        while let Some(lowest) = state.entries.front().copied() {
            if lowest.lsn >= new_lowest_lsn {
                break;
            }
            state.entries.pop_front();
            state.total_on_disk_size -= lowest.on_disk_size();
            removed += 1;
        }
        removed
    }

    /// Returns the entry at logical position `index` (0 = lowest LSN).
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if `index` is not below the entry count.
    pub fn query_record(&self, index: usize) -> LogResult<LsnEntry> {
        let state = self.state.lock();
        state.entries.get(index).copied().ok_or(LogError::OutOfRange {
            index,
            count: state.entries.len(),
        })
    }

    /// Returns the number of tracked records.
    #[must_use]
    pub fn query_number_of_records(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns the total bytes the tracked records occupy.
    #[must_use]
    pub fn query_total_on_disk_size(&self) -> u64 {
        self.state.lock().total_on_disk_size
    }

    /// Returns the lowest tracked LSN, or [`Lsn::NULL`] when empty.
    #[must_use]
    pub fn query_lowest_lsn(&self) -> Lsn {
        self.state
            .lock()
            .entries
            .front()
            .map_or(Lsn::NULL, |e| e.lsn)
    }

    /// Returns the highest tracked LSN, or [`Lsn::NULL`] when empty.
    #[must_use]
    pub fn query_highest_lsn(&self) -> Lsn {
        self.state
            .lock()
            .entries
            .back()
            .map_or(Lsn::NULL, |e| e.lsn)
    }

    /// Copies every entry in increasing LSN order.
    ///
    /// # Errors
    ///
    /// Returns `BufferTooSmall` with the needed count if `limit` is smaller
    /// than the number of entries.
    pub fn get_all_record_lsns(&self, limit: usize) -> LogResult<Vec<LsnEntry>> {
        let state = self.state.lock();
        let needed = state.entries.len();
        if limit < needed {
            return Err(LogError::BufferTooSmall { needed });
        }
        Ok(state.entries.iter().copied().collect())
    }

    /// Serializes every entry into `buffer`.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot fit in a segment.
    pub fn get_all_record_lsns_into_segmented_buffer(
        &self,
        buffer: &mut SegmentedBuffer,
    ) -> LogResult<SegmentSummary> {
        let state = self.state.lock();
        let mark = buffer.mark();
        for entry in &state.entries {
            buffer.write_entry(entry)?;
        }
        Ok(buffer.summarize_since(mark))
    }

    /// Returns the set of tracked LSNs.
    #[must_use]
    pub fn lsn_set(&self) -> HashSet<Lsn> {
        self.state.lock().entries.iter().map(|e| e.lsn).collect()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_on_disk_size = 0;
    }
}

fn check_valid(lsn: Lsn) -> LogResult<()> {
    if lsn.is_valid() {
        Ok(())
    } else {
        Err(LogError::invariant(format!("LSN tracker given invalid {lsn}")))
    }
}
