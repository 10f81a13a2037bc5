//! Per-stream ASN index.
//!
//! Maps each known Asn to its latest version, LSN and disposition, and
//! maintains the derived `lowest_lsn_of_higher_asns` bound that gates
//! truncation. For every entry E whose disposition is not `None`:
//!
//! ```text
//! E.lowest_lsn_of_higher_asns = min(E.lsn, N.lowest_lsn_of_higher_asns)
//! ```
//!
//! where N is the next higher-Asn entry whose disposition is not `None`.
//! Consequently the bound never decreases from the lowest Asn to the highest.
//! Removals never raise a bound, so entries below a removed record stay
//! conservatively protected until they are truncated themselves.

use crate::error::{LogError, LogResult};
use crate::format::segmented::{SegmentEntry, SegmentSummary, SegmentedBuffer};
use crate::types::{Asn, Disposition, Lsn, Version};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

/// One ASN index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsnEntry {
    /// Application sequence number.
    pub asn: Asn,
    /// Version of the latest write.
    pub version: Version,
    /// LSN of the latest write, or [`Lsn::NULL`] before one is assigned.
    pub lsn: Lsn,
    /// Payload size of the record, used to size reads.
    pub io_size_hint: u32,
    /// Lifecycle state.
    pub disposition: Disposition,
    /// Lowest LSN this entry or any higher Asn still needs on disk.
    pub lowest_lsn_of_higher_asns: Lsn,
}

impl AsnEntry {
    /// Creates an entry; the derived bound starts at `lsn`.
    #[must_use]
    pub const fn new(
        asn: Asn,
        version: Version,
        lsn: Lsn,
        io_size_hint: u32,
        disposition: Disposition,
    ) -> Self {
        Self {
            asn,
            version,
            lsn,
            io_size_hint,
            disposition,
            lowest_lsn_of_higher_asns: lsn,
        }
    }

    fn is_indexed_on_disk(&self) -> bool {
        self.disposition != Disposition::None
    }

    fn save(&self) -> SavedAsnState {
        SavedAsnState {
            version: self.version,
            lsn: self.lsn,
            io_size_hint: self.io_size_hint,
            disposition: self.disposition,
        }
    }
}

impl SegmentEntry for AsnEntry {
    const ENCODED_SIZE: usize = 32;

    fn encode_into(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.asn.as_u64().to_le_bytes());
        out[8..16].copy_from_slice(&self.version.to_le_bytes());
        out[16..24].copy_from_slice(&self.lsn.as_i64().to_le_bytes());
        out[24..28].copy_from_slice(&self.io_size_hint.to_le_bytes());
        out[28] = self.disposition.as_byte();
        out[29..32].fill(0);
    }

    fn decode_from(bytes: &[u8]) -> LogResult<Self> {
        if bytes.len() != Self::ENCODED_SIZE {
            return Err(LogError::structural("ASN entry has wrong length"));
        }
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let mut size = [0u8; 4];
        size.copy_from_slice(&bytes[24..28]);
        let disposition = Disposition::from_byte(bytes[28]).ok_or_else(|| {
            LogError::structural(format!("invalid disposition byte {}", bytes[28]))
        })?;
        Ok(Self::new(
            Asn::new(u64_at(0)),
            u64_at(8),
            Lsn::new(u64_at(16) as i64),
            u32::from_le_bytes(size),
            disposition,
        ))
    }
}

/// Snapshot of an entry before an update, used to roll it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedAsnState {
    /// Version before the update.
    pub version: Version,
    /// LSN before the update.
    pub lsn: Lsn,
    /// Size hint before the update.
    pub io_size_hint: u32,
    /// Disposition before the update.
    pub disposition: Disposition,
}

/// Result of [`AsnIndex::add_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOrUpdateResult {
    /// The entry as stored after the call.
    pub entry: AsnEntry,
    /// State before the call; `None` if the Asn was newly inserted.
    pub previous: Option<SavedAsnState>,
}

/// Ordered Asn map for one stream.
///
/// All operations take the index's own lock and never perform I/O.
#[derive(Debug, Default)]
pub struct AsnIndex {
    entries: Mutex<BTreeMap<Asn, AsnEntry>>,
}

/// Recomputes the bound of the entry at `asn` and lowers the bounds below it.
///
/// Bounds below are non-decreasing toward `asn`, so the backward walk stops at
/// the first entry already at or under the new value.
fn update_lowest_lsn_of_higher_asns(map: &mut BTreeMap<Asn, AsnEntry>, asn: Asn) {
    let next_bound = map
        .range((Excluded(asn), Unbounded))
        .map(|(_, e)| e)
        .find(|e| e.is_indexed_on_disk())
        .map(|e| e.lowest_lsn_of_higher_asns);

    let Some(entry) = map.get_mut(&asn) else {
        return;
    };
    if !entry.is_indexed_on_disk() {
        return;
    }
    let value = match next_bound {
        Some(bound) if bound <= entry.lsn => bound,
        _ => entry.lsn,
    };
    entry.lowest_lsn_of_higher_asns = value;

    for (_, lower) in map.range_mut(..asn).rev() {
        if !lower.is_indexed_on_disk() {
            continue;
        }
        if lower.lowest_lsn_of_higher_asns <= value {
            break;
        }
        lower.lowest_lsn_of_higher_asns = value;
    }
}

fn check_version(entry: &AsnEntry, for_version: Version) -> LogResult<()> {
    if entry.version != for_version {
        return Err(LogError::VersionConflict {
            asn: entry.asn,
            existing_version: entry.version,
        });
    }
    Ok(())
}

impl AsnIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new Asn or overwrites an older version of it.
    ///
    /// # Errors
    ///
    /// Returns `VersionConflict` carrying the existing version if it is
    /// greater than or equal to `entry.version`.
    pub fn add_or_update(&self, entry: AsnEntry) -> LogResult<AddOrUpdateResult> {
        let mut map = self.entries.lock();
        let mut stored = entry;
        stored.lowest_lsn_of_higher_asns = entry.lsn;

        let previous = match map.get_mut(&entry.asn) {
            Some(existing) => {
                if existing.version >= entry.version {
                    return Err(LogError::VersionConflict {
                        asn: entry.asn,
                        existing_version: existing.version,
                    });
                }
                let saved = existing.save();
                existing.version = entry.version;
                existing.lsn = entry.lsn;
                existing.io_size_hint = entry.io_size_hint;
                existing.disposition = entry.disposition;
                stored = *existing;
                Some(saved)
            }
            None => {
                map.insert(entry.asn, stored);
                None
            }
        };

        let needs_recompute = stored.is_indexed_on_disk()
            && previous.map_or(true, |p| {
                p.disposition == Disposition::None || stored.lsn < stored.lowest_lsn_of_higher_asns
            });
        if needs_recompute {
            update_lowest_lsn_of_higher_asns(&mut map, entry.asn);
        }
        let entry = map.get(&entry.asn).copied().unwrap_or(stored);
        Ok(AddOrUpdateResult { entry, previous })
    }

    /// Removes `asn` if its current version is `for_version`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the Asn is not indexed
    /// - `VersionConflict` if a different version is indexed
    pub fn try_remove(&self, asn: Asn, for_version: Version) -> LogResult<AsnEntry> {
        let mut map = self.entries.lock();
        let entry = map.get(&asn).ok_or(LogError::NotFound)?;
        check_version(entry, for_version)?;
        map.remove(&asn).ok_or(LogError::NotFound)
    }

    /// Removes a durable record on behalf of a delete.
    ///
    /// The removed bound is propagated to the nearest lower indexed entry.
    /// Returns the highest LSN that is reclaimable afterwards: one below the
    /// lowest remaining bound, or the removed record's LSN if no indexed
    /// entries remain.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the Asn is not indexed
    /// - `VersionConflict` if a different version is indexed
    /// - `RecordNotDurable` if the record is not yet persisted
    pub fn try_remove_for_delete(&self, asn: Asn, for_version: Version) -> LogResult<Lsn> {
        let mut map = self.entries.lock();
        let entry = map.get(&asn).ok_or(LogError::NotFound)?;
        check_version(entry, for_version)?;
        if entry.disposition != Disposition::Persisted {
            return Err(LogError::RecordNotDurable { asn });
        }
        let removed = map.remove(&asn).ok_or(LogError::NotFound)?;

        if let Some((_, lower)) = map
            .range_mut(..asn)
            .rev()
            .find(|(_, e)| e.is_indexed_on_disk())
        {
            if removed.lowest_lsn_of_higher_asns < lower.lowest_lsn_of_higher_asns {
                lower.lowest_lsn_of_higher_asns = removed.lowest_lsn_of_higher_asns;
            }
        }

        Ok(map
            .values()
            .find(|e| e.is_indexed_on_disk())
            .map_or(removed.lsn, |e| e.lowest_lsn_of_higher_asns.prev()))
    }

    /// Rolls `asn` back to `saved`, or removes it if `saved` is `None`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the Asn is not indexed
    /// - `VersionConflict` if the indexed version is no longer `for_version`
    pub fn restore(
        &self,
        asn: Asn,
        for_version: Version,
        saved: Option<SavedAsnState>,
    ) -> LogResult<()> {
        let mut map = self.entries.lock();
        let entry = map.get_mut(&asn).ok_or(LogError::NotFound)?;
        check_version(entry, for_version)?;
        match saved {
            None => {
                map.remove(&asn);
            }
            Some(state) => {
                entry.version = state.version;
                entry.lsn = state.lsn;
                entry.io_size_hint = state.io_size_hint;
                entry.disposition = state.disposition;
                update_lowest_lsn_of_higher_asns(&mut map, asn);
            }
        }
        Ok(())
    }

    /// Moves `asn` to `disposition`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the Asn is not indexed
    /// - `VersionConflict` if the indexed version is not `for_version`
    /// - `InvariantViolation` if the disposition would move backward
    pub fn update_disposition(
        &self,
        asn: Asn,
        for_version: Version,
        disposition: Disposition,
    ) -> LogResult<()> {
        let mut map = self.entries.lock();
        let entry = map.get_mut(&asn).ok_or(LogError::NotFound)?;
        check_version(entry, for_version)?;
        if disposition < entry.disposition {
            return Err(LogError::invariant(format!(
                "{asn} disposition moving back from {:?} to {disposition:?}",
                entry.disposition
            )));
        }
        let previous = entry.disposition;
        entry.disposition = disposition;
        if previous == Disposition::None && disposition != Disposition::None {
            update_lowest_lsn_of_higher_asns(&mut map, asn);
        }
        Ok(())
    }

    /// Assigns an LSN to `asn` and moves it to `disposition`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the Asn is not indexed
    /// - `VersionConflict` if the indexed version is not `for_version`
    pub fn update_lsn_and_disposition(
        &self,
        asn: Asn,
        for_version: Version,
        lsn: Lsn,
        disposition: Disposition,
    ) -> LogResult<()> {
        let mut map = self.entries.lock();
        let entry = map.get_mut(&asn).ok_or(LogError::NotFound)?;
        check_version(entry, for_version)?;
        let previous = entry.disposition;
        let lowered = lsn < entry.lowest_lsn_of_higher_asns;
        entry.lsn = lsn;
        entry.disposition = disposition;
        if disposition != Disposition::None && (previous == Disposition::None || lowered) {
            update_lowest_lsn_of_higher_asns(&mut map, asn);
        }
        Ok(())
    }

    /// Removes every entry with Asn at or below `up_to`.
    ///
    /// Returns the highest LSN that becomes reclaimable, or [`Lsn::NULL`] if
    /// nothing was removed and entries remain.
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` without removing anything if any entry in
    /// the range is not persisted.
    pub fn truncate(&self, up_to: Asn, highest_known_lsn: Lsn) -> LogResult<Lsn> {
        let mut map = self.entries.lock();
        if let Some(entry) = map
            .range(..=up_to)
            .map(|(_, e)| e)
            .find(|e| e.disposition != Disposition::Persisted)
        {
            return Err(LogError::invariant(format!(
                "truncating {} with disposition {:?}",
                entry.asn, entry.disposition
            )));
        }

        let mut truncatable = Lsn::NULL;
        while let Some(entry) = map.first_entry() {
            if *entry.key() > up_to {
                break;
            }
            truncatable = entry.remove().lowest_lsn_of_higher_asns.prev();
        }
        if map.is_empty() {
            truncatable = truncatable.max(highest_known_lsn);
        }
        Ok(truncatable)
    }

    /// Returns the lowest bound over all indexed entries, or
    /// `highest_known_lsn` if none are.
    #[must_use]
    pub fn lowest_lsn_of_higher_asns(&self, highest_known_lsn: Lsn) -> Lsn {
        self.entries
            .lock()
            .values()
            .filter(|e| e.is_indexed_on_disk())
            .map(|e| e.lowest_lsn_of_higher_asns)
            .min()
            .unwrap_or(highest_known_lsn)
    }

    /// Returns the entry for exactly `asn`.
    #[must_use]
    pub fn exact(&self, asn: Asn) -> Option<AsnEntry> {
        self.entries.lock().get(&asn).copied()
    }

    /// Returns the entry following the existing entry `asn`.
    #[must_use]
    pub fn next(&self, asn: Asn) -> Option<AsnEntry> {
        let map = self.entries.lock();
        if !map.contains_key(&asn) {
            return None;
        }
        map.range((Excluded(asn), Unbounded)).next().map(|(_, e)| *e)
    }

    /// Returns the entry preceding the existing entry `asn`.
    #[must_use]
    pub fn previous(&self, asn: Asn) -> Option<AsnEntry> {
        let map = self.entries.lock();
        if !map.contains_key(&asn) {
            return None;
        }
        map.range(..asn).next_back().map(|(_, e)| *e)
    }

    /// Returns the greatest entry at or below `asn`.
    #[must_use]
    pub fn containing(&self, asn: Asn) -> Option<AsnEntry> {
        self.entries
            .lock()
            .range(..=asn)
            .next_back()
            .map(|(_, e)| *e)
    }

    /// Returns the smallest entry strictly above `asn`.
    #[must_use]
    pub fn next_after(&self, asn: Asn) -> Option<AsnEntry> {
        self.entries
            .lock()
            .range((Excluded(asn), Unbounded))
            .next()
            .map(|(_, e)| *e)
    }

    /// Returns the greatest entry strictly below `asn`.
    #[must_use]
    pub fn previous_before(&self, asn: Asn) -> Option<AsnEntry> {
        self.entries
            .lock()
            .range(..asn)
            .next_back()
            .map(|(_, e)| *e)
    }

    /// Returns the smallest entry at or above `asn`.
    #[must_use]
    pub fn next_from_nearest(&self, asn: Asn) -> Option<AsnEntry> {
        self.entries.lock().range(asn..).next().map(|(_, e)| *e)
    }

    /// Serializes every pending or persisted entry into `buffer`.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot fit in a segment.
    pub fn get_all_entries_into_segmented_buffer(
        &self,
        buffer: &mut SegmentedBuffer,
    ) -> LogResult<SegmentSummary> {
        let map = self.entries.lock();
        let mark = buffer.mark();
        for entry in map.values().filter(|e| e.is_indexed_on_disk()) {
            buffer.write_entry(entry)?;
        }
        Ok(buffer.summarize_since(mark))
    }

    /// Returns the indexed version of `asn` if it is newer than `version`.
    #[must_use]
    pub fn check_for_records_with_higher_version(&self, asn: Asn, version: Version) -> Option<Version> {
        self.entries
            .lock()
            .range(..=asn)
            .next_back()
            .filter(|(key, e)| **key == asn && e.version > version)
            .map(|(_, e)| e.version)
    }

    /// Checks the bound invariant over the whole index.
    #[must_use]
    pub fn validate(&self) -> bool {
        let map = self.entries.lock();
        let mut previous = Lsn::NULL;
        for entry in map.values().filter(|e| e.is_indexed_on_disk()) {
            let bound = entry.lowest_lsn_of_higher_asns;
            if bound < previous || bound > entry.lsn {
                return false;
            }
            previous = bound;
        }
        true
    }

    /// Adds an entry found by the backward recovery walk.
    ///
    /// The walk meets newer versions first, so an existing entry is only
    /// replaced by a strictly newer version. Bounds are not maintained; call
    /// [`Self::recompute_all`] once the walk completes.
    ///
    /// Returns true if the entry was stored.
    pub fn insert_recovered(&self, entry: AsnEntry) -> bool {
        let mut map = self.entries.lock();
        match map.get_mut(&entry.asn) {
            Some(existing) if existing.version >= entry.version => false,
            Some(existing) => {
                *existing = entry;
                true
            }
            None => {
                map.insert(entry.asn, entry);
                true
            }
        }
    }

    /// Recomputes every bound from the highest Asn down.
    pub fn recompute_all(&self) {
        let mut map = self.entries.lock();
        let mut running: Option<Lsn> = None;
        for entry in map.values_mut().rev() {
            if !entry.is_indexed_on_disk() {
                continue;
            }
            let value = match running {
                Some(bound) if bound <= entry.lsn => bound,
                _ => entry.lsn,
            };
            entry.lowest_lsn_of_higher_asns = value;
            running = Some(value);
        }
    }

    /// Returns every entry in Asn order.
    #[must_use]
    pub fn entries(&self) -> Vec<AsnEntry> {
        self.entries.lock().values().copied().collect()
    }

    /// Returns the entries with Asn in `[low, high]`.
    #[must_use]
    pub fn range(&self, low: Asn, high: Asn) -> Vec<AsnEntry> {
        if low > high {
            return Vec::new();
        }
        self.entries
            .lock()
            .range(low..=high)
            .map(|(_, e)| *e)
            .collect()
    }

    /// Returns the first entry whose disposition is not persisted.
    #[must_use]
    pub fn lowest_not_persisted(&self) -> Option<AsnEntry> {
        self.entries
            .lock()
            .values()
            .find(|e| e.disposition != Disposition::Persisted)
            .copied()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns the lowest indexed Asn.
    #[must_use]
    pub fn lowest_asn(&self) -> Option<Asn> {
        self.entries.lock().keys().next().copied()
    }

    /// Returns the highest indexed Asn.
    #[must_use]
    pub fn highest_asn(&self) -> Option<Asn> {
        self.entries.lock().keys().next_back().copied()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::segmented::SegmentReader;
    use proptest::prelude::*;

    fn asn(v: u64) -> Asn {
        Asn::new(v)
    }

    fn lsn(v: i64) -> Lsn {
        Lsn::new(v)
    }

    /// Issues and persists a write through the same steps the pipeline uses.
    fn write(index: &AsnIndex, a: u64, version: Version, at: i64) {
        index
            .add_or_update(AsnEntry::new(asn(a), version, Lsn::NULL, 0, Disposition::None))
            .unwrap();
        index
            .update_lsn_and_disposition(asn(a), version, lsn(at), Disposition::Pending)
            .unwrap();
        index
            .update_disposition(asn(a), version, Disposition::Persisted)
            .unwrap();
    }

    #[test]
    fn out_of_order_asn_protects_higher_data() {
        let index = AsnIndex::new();
        write(&index, 10, 1, 100);
        write(&index, 5, 1, 101);

        assert_eq!(index.exact(asn(5)).unwrap().lowest_lsn_of_higher_asns, lsn(100));
        assert_eq!(index.exact(asn(10)).unwrap().lowest_lsn_of_higher_asns, lsn(100));
        assert!(index.validate());

        assert_eq!(index.truncate(asn(5), lsn(101)).unwrap(), lsn(99));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn truncate_refuses_non_persisted() {
        let index = AsnIndex::new();
        write(&index, 1, 1, 0);
        index
            .add_or_update(AsnEntry::new(asn(2), 1, lsn(4096), 0, Disposition::Pending))
            .unwrap();

        let err = index.truncate(asn(2), lsn(4096)).unwrap_err();
        assert!(matches!(err, LogError::InvariantViolation { .. }));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn truncate_to_empty_uses_highest_known() {
        let index = AsnIndex::new();
        write(&index, 1, 1, 0);
        write(&index, 2, 1, 4096);
        assert_eq!(index.truncate(asn(9), lsn(8192)).unwrap(), lsn(8192));
        assert!(index.is_empty());

        assert_eq!(index.truncate(asn(9), lsn(12288)).unwrap(), lsn(12288));
    }

    #[test]
    fn truncate_below_everything_removes_nothing() {
        let index = AsnIndex::new();
        write(&index, 5, 1, 0);
        assert_eq!(index.truncate(asn(4), lsn(0)).unwrap(), Lsn::NULL);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn version_collision_reports_existing() {
        let index = AsnIndex::new();
        write(&index, 3, 7, 0);
        let err = index
            .add_or_update(AsnEntry::new(asn(3), 7, Lsn::NULL, 0, Disposition::None))
            .unwrap_err();
        assert!(matches!(
            err,
            LogError::VersionConflict {
                existing_version: 7,
                ..
            }
        ));
        assert_eq!(index.check_for_records_with_higher_version(asn(3), 5), Some(7));
        assert_eq!(index.check_for_records_with_higher_version(asn(3), 7), None);
        assert_eq!(index.check_for_records_with_higher_version(asn(4), 1), None);
    }

    #[test]
    fn restore_rolls_back_update() {
        let index = AsnIndex::new();
        write(&index, 1, 1, 4096);

        let result = index
            .add_or_update(AsnEntry::new(asn(1), 2, Lsn::NULL, 0, Disposition::None))
            .unwrap();
        let saved = result.previous.unwrap();
        assert_eq!(saved.version, 1);
        index
            .update_lsn_and_disposition(asn(1), 2, lsn(8192), Disposition::Pending)
            .unwrap();

        index.restore(asn(1), 2, Some(saved)).unwrap();
        let entry = index.exact(asn(1)).unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.lsn, lsn(4096));
        assert_eq!(entry.disposition, Disposition::Persisted);
        assert!(index.validate());
    }

    #[test]
    fn restore_of_fresh_insert_removes_it() {
        let index = AsnIndex::new();
        let result = index
            .add_or_update(AsnEntry::new(asn(4), 1, Lsn::NULL, 0, Disposition::None))
            .unwrap();
        assert!(result.previous.is_none());

        assert!(matches!(
            index.restore(asn(4), 9, None),
            Err(LogError::VersionConflict { .. })
        ));
        index.restore(asn(4), 1, None).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn remove_for_delete_requires_persisted() {
        let index = AsnIndex::new();
        index
            .add_or_update(AsnEntry::new(asn(1), 1, lsn(0), 0, Disposition::Pending))
            .unwrap();
        assert!(matches!(
            index.try_remove_for_delete(asn(1), 1),
            Err(LogError::RecordNotDurable { .. })
        ));
        index
            .update_disposition(asn(1), 1, Disposition::Persisted)
            .unwrap();
        assert_eq!(index.try_remove_for_delete(asn(1), 1).unwrap(), lsn(0));
    }

    #[test]
    fn remove_for_delete_keeps_lower_protection() {
        let index = AsnIndex::new();
        write(&index, 10, 1, 100);
        write(&index, 5, 1, 200);
        write(&index, 20, 1, 300);

        let truncatable = index.try_remove_for_delete(asn(10), 1).unwrap();
        assert_eq!(truncatable, lsn(99));
        assert_eq!(index.exact(asn(5)).unwrap().lowest_lsn_of_higher_asns, lsn(100));
        assert!(index.validate());
    }

    #[test]
    fn try_remove_is_version_guarded() {
        let index = AsnIndex::new();
        write(&index, 1, 2, 0);
        assert!(index.try_remove(asn(1), 1).is_err());
        assert!(matches!(index.try_remove(asn(8), 1), Err(LogError::NotFound)));
        assert_eq!(index.try_remove(asn(1), 2).unwrap().asn, asn(1));
    }

    #[test]
    fn disposition_cannot_move_back() {
        let index = AsnIndex::new();
        write(&index, 1, 1, 0);
        assert!(matches!(
            index.update_disposition(asn(1), 1, Disposition::Pending),
            Err(LogError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn lookup_family() {
        let index = AsnIndex::new();
        for (a, at) in [(10, 0), (20, 4096), (30, 8192)] {
            write(&index, a, 1, at);
        }

        assert_eq!(index.exact(asn(20)).unwrap().asn, asn(20));
        assert!(index.exact(asn(15)).is_none());
        assert_eq!(index.next(asn(20)).unwrap().asn, asn(30));
        assert!(index.next(asn(15)).is_none());
        assert!(index.next(asn(30)).is_none());
        assert_eq!(index.previous(asn(20)).unwrap().asn, asn(10));
        assert!(index.previous(asn(10)).is_none());
        assert_eq!(index.containing(asn(25)).unwrap().asn, asn(20));
        assert_eq!(index.containing(asn(20)).unwrap().asn, asn(20));
        assert!(index.containing(asn(5)).is_none());
        assert_eq!(index.next_after(asn(20)).unwrap().asn, asn(30));
        assert_eq!(index.next_after(asn(15)).unwrap().asn, asn(20));
        assert_eq!(index.previous_before(asn(20)).unwrap().asn, asn(10));
        assert_eq!(index.next_from_nearest(asn(20)).unwrap().asn, asn(20));
        assert_eq!(index.next_from_nearest(asn(21)).unwrap().asn, asn(30));
        assert!(index.next_from_nearest(asn(31)).is_none());
    }

    #[test]
    fn none_entries_excluded_from_checkpoint() {
        let index = AsnIndex::new();
        write(&index, 1, 1, 0);
        index
            .add_or_update(AsnEntry::new(asn(2), 1, Lsn::NULL, 0, Disposition::None))
            .unwrap();

        let mut buffer = SegmentedBuffer::new(4096, 0, 64).unwrap();
        let summary = index.get_all_entries_into_segmented_buffer(&mut buffer).unwrap();
        assert_eq!(summary.total_entries, 1);
        assert_eq!(index.lowest_lsn_of_higher_asns(lsn(77)), lsn(0));
    }

    #[test]
    fn lowest_bound_of_empty_index_is_highest_known() {
        let index = AsnIndex::new();
        assert_eq!(index.lowest_lsn_of_higher_asns(lsn(4096)), lsn(4096));
    }

    #[test]
    fn recovered_entries_keep_newest_version() {
        let index = AsnIndex::new();
        assert!(index.insert_recovered(AsnEntry::new(asn(1), 3, lsn(8192), 0, Disposition::Persisted)));
        assert!(!index.insert_recovered(AsnEntry::new(asn(1), 2, lsn(4096), 0, Disposition::Persisted)));
        assert!(index.insert_recovered(AsnEntry::new(asn(0x10), 1, lsn(0), 0, Disposition::Persisted)));
        index.recompute_all();

        assert_eq!(index.exact(asn(1)).unwrap().version, 3);
        assert_eq!(index.exact(asn(1)).unwrap().lowest_lsn_of_higher_asns, lsn(0));
        assert!(index.validate());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write { asn: u64 },
        Issue { asn: u64 },
        Complete { asn: u64 },
        Fail { asn: u64 },
        Remove { asn: u64 },
        Delete { asn: u64 },
        Truncate { asn: u64 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let asn = 1u64..40;
        prop_oneof![
            4 => asn.clone().prop_map(|asn| Op::Write { asn }),
            3 => asn.clone().prop_map(|asn| Op::Issue { asn }),
            3 => asn.clone().prop_map(|asn| Op::Complete { asn }),
            1 => asn.clone().prop_map(|asn| Op::Fail { asn }),
            1 => asn.clone().prop_map(|asn| Op::Remove { asn }),
            1 => asn.clone().prop_map(|asn| Op::Delete { asn }),
            1 => asn.prop_map(|asn| Op::Truncate { asn }),
        ]
    }

    proptest! {
        #[test]
        fn bound_is_monotone_after_every_mutation(ops in prop::collection::vec(op_strategy(), 1..150)) {
            let index = AsnIndex::new();
            let mut next_lsn = 0i64;
            let mut next_version = 1u64;
            let mut saved: BTreeMap<u64, (Version, Option<SavedAsnState>)> = BTreeMap::new();

            for op in ops {
                match op {
                    Op::Write { asn: a } => {
                        let version = next_version;
                        next_version += 1;
                        if let Ok(result) = index.add_or_update(
                            AsnEntry::new(asn(a), version, Lsn::NULL, 0, Disposition::None),
                        ) {
                            saved.insert(a, (version, result.previous));
                        }
                    }
                    Op::Issue { asn: a } => {
                        if let Some(entry) = index.exact(asn(a)) {
                            if entry.disposition == Disposition::None {
                                index.update_lsn_and_disposition(
                                    asn(a), entry.version, lsn(next_lsn), Disposition::Pending,
                                ).unwrap();
                                next_lsn += 4096;
                            }
                        }
                    }
                    Op::Complete { asn: a } => {
                        if let Some(entry) = index.exact(asn(a)) {
                            if entry.disposition == Disposition::Pending {
                                index.update_disposition(asn(a), entry.version, Disposition::Persisted).unwrap();
                                saved.remove(&a);
                            }
                        }
                    }
                    Op::Fail { asn: a } => {
                        if let Some((version, state)) = saved.remove(&a) {
                            let _ = index.restore(asn(a), version, state);
                        }
                    }
                    Op::Remove { asn: a } => {
                        if let Some(entry) = index.exact(asn(a)) {
                            index.try_remove(asn(a), entry.version).unwrap();
                            saved.remove(&a);
                        }
                    }
                    Op::Delete { asn: a } => {
                        if let Some(entry) = index.exact(asn(a)) {
                            let _ = index.try_remove_for_delete(asn(a), entry.version);
                        }
                    }
                    Op::Truncate { asn: a } => {
                        let highest = lsn(next_lsn - 1);
                        if let Ok(truncatable) = index.truncate(asn(a), highest) {
                            for entry in index.entries() {
                                prop_assert!(entry.asn > asn(a));
                                if entry.disposition != Disposition::None {
                                    prop_assert!(truncatable < entry.lsn);
                                }
                            }
                        } else {
                            prop_assert!(index.lowest_not_persisted().is_some_and(|e| e.asn <= asn(a)));
                        }
                    }
                }
                prop_assert!(index.validate());
            }
        }

        #[test]
        fn segmented_round_trip(count in 0usize..150, per_segment in 1usize..24) {
            let index = AsnIndex::new();
            for i in 0..count {
                write(&index, (i as u64) * 3 + 1, 1, (count - i) as i64 * 4096);
            }
            let preamble = 40;
            let segment_size = preamble + per_segment * AsnEntry::ENCODED_SIZE;
            let mut buffer = SegmentedBuffer::new(segment_size, preamble, preamble).unwrap();
            let summary = index.get_all_entries_into_segmented_buffer(&mut buffer).unwrap();
            prop_assert_eq!(summary.total_entries, count);
            prop_assert_eq!(summary.first_segment_entries, count.min(per_segment));

            let mut reader = SegmentReader::new(buffer.as_bytes(), segment_size, preamble, preamble);
            let restored = AsnIndex::new();
            for _ in 0..count {
                restored.insert_recovered(reader.read_entry::<AsnEntry>().unwrap());
            }
            restored.recompute_all();
            prop_assert_eq!(restored.entries(), index.entries());
        }
    }
}
