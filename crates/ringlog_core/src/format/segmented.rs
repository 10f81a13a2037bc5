//! Segmented buffer layout.
//!
//! Checkpoint records are written as a run of fixed-size segments. Every
//! segment after the first starts with a caller-owned preamble (the record
//! header of that segment); the first segment starts at a caller-chosen
//! offset. Entries are fixed-size and never straddle a segment boundary:
//! when the next entry would not fit, the current segment is padded short
//! and the entry starts the next one.
//!
//! ```text
//! | first_offset | e0 | e1 | ... | pad || preamble | ek | ... | pad || preamble | ...
//! |<------------ segment_size ------>||<--------- segment_size ------>|
//! ```

use crate::error::{LogError, LogResult};

/// A fixed-size entry that can be laid out in a segmented buffer.
pub trait SegmentEntry: Sized {
    /// Encoded size in bytes.
    const ENCODED_SIZE: usize;

    /// Encodes the entry into exactly `ENCODED_SIZE` bytes.
    fn encode_into(&self, out: &mut [u8]);

    /// Decodes an entry from exactly `ENCODED_SIZE` bytes.
    ///
    /// # Errors
    ///
    /// Returns a structural fault if the bytes do not describe an entry.
    fn decode_from(bytes: &[u8]) -> LogResult<Self>;
}

/// Outcome of serializing one collection into a segmented buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentSummary {
    /// Entries written by the call.
    pub total_entries: usize,
    /// Entries written into the first segment the call touched.
    pub first_segment_entries: usize,
    /// Segments in the buffer after the call.
    pub segment_count: usize,
}

/// A growable buffer split into fixed-size segments.
#[derive(Debug, Clone)]
pub struct SegmentedBuffer {
    segment_size: usize,
    preamble_size: usize,
    data: Vec<u8>,
    segment_start: usize,
    entries_per_segment: Vec<usize>,
}

impl SegmentedBuffer {
    /// Creates a buffer whose first entry starts at `first_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the first offset or the preamble leaves no room
    /// in a segment.
    pub fn new(segment_size: usize, first_offset: usize, preamble_size: usize) -> LogResult<Self> {
        if first_offset > segment_size || preamble_size >= segment_size {
            return Err(LogError::invalid_argument(format!(
                "segment size {segment_size} too small for offset {first_offset} / preamble {preamble_size}"
            )));
        }
        Ok(Self {
            segment_size,
            preamble_size,
            data: vec![0u8; first_offset],
            segment_start: 0,
            entries_per_segment: vec![0],
        })
    }

    /// Appends one entry, starting a new segment if it would straddle.
    ///
    /// Returns the index of the segment the entry landed in.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry can never fit in a segment.
    pub fn write_entry<E: SegmentEntry>(&mut self, entry: &E) -> LogResult<usize> {
        let size = E::ENCODED_SIZE;
        if self.preamble_size + size > self.segment_size {
            return Err(LogError::invalid_argument(format!(
                "entry of {size} bytes cannot fit in a {} byte segment",
                self.segment_size
            )));
        }
        if self.used_in_segment() + size > self.segment_size {
            self.skip_to_segment_boundary();
        }

        let start = self.data.len();
        self.data.resize(start + size, 0);
        entry.encode_into(&mut self.data[start..start + size]);

        let segment = self.entries_per_segment.len() - 1;
        self.entries_per_segment[segment] += 1;
        Ok(segment)
    }

    /// Pads the current segment to its full size and opens the next one.
    pub fn skip_to_segment_boundary(&mut self) {
        let end = self.segment_start + self.segment_size;
        self.data.resize(end, 0);
        self.segment_start = end;
        self.data.resize(end + self.preamble_size, 0);
        self.entries_per_segment.push(0);
    }

    fn used_in_segment(&self) -> usize {
        self.data.len() - self.segment_start
    }

    /// Returns the configured segment size.
    #[must_use]
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Returns the number of segments, counting the open one.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.entries_per_segment.len()
    }

    /// Returns the number of entries written so far.
    #[must_use]
    pub fn total_entries(&self) -> usize {
        self.entries_per_segment.iter().sum()
    }

    /// Returns the number of entries in segment `index`.
    #[must_use]
    pub fn entries_in_segment(&self, index: usize) -> usize {
        self.entries_per_segment.get(index).copied().unwrap_or(0)
    }

    /// Returns the bytes of segment `index`; the final segment may be short.
    #[must_use]
    pub fn segment(&self, index: usize) -> &[u8] {
        let start = (index * self.segment_size).min(self.data.len());
        let end = ((index + 1) * self.segment_size).min(self.data.len());
        &self.data[start..end]
    }

    /// Returns the whole buffer.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Records the buffer position before a serializer call.
    pub(crate) fn mark(&self) -> SegmentMark {
        let segment = self.segment_count() - 1;
        SegmentMark {
            segment,
            entries_in_segment: self.entries_in_segment(segment),
            total_entries: self.total_entries(),
        }
    }

    /// Summarizes what was written since `mark`.
    pub(crate) fn summarize_since(&self, mark: SegmentMark) -> SegmentSummary {
        let total_entries = self.total_entries() - mark.total_entries;
        let grown = self.entries_in_segment(mark.segment) - mark.entries_in_segment;
        let first_segment_entries = if grown > 0 || total_entries == 0 {
            grown
        } else {
            self.entries_in_segment(mark.segment + 1)
        };
        SegmentSummary {
            total_entries,
            first_segment_entries,
            segment_count: self.segment_count(),
        }
    }
}

/// Buffer position captured by [`SegmentedBuffer::mark`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentMark {
    segment: usize,
    entries_in_segment: usize,
    total_entries: usize,
}

/// Reads entries back out of a segmented layout.
#[derive(Debug)]
pub struct SegmentReader<'a> {
    data: &'a [u8],
    segment_size: usize,
    preamble_size: usize,
    segment_start: usize,
    pos: usize,
}

impl<'a> SegmentReader<'a> {
    /// Creates a reader mirroring [`SegmentedBuffer::new`].
    #[must_use]
    pub fn new(data: &'a [u8], segment_size: usize, first_offset: usize, preamble_size: usize) -> Self {
        Self {
            data,
            segment_size,
            preamble_size,
            segment_start: 0,
            pos: first_offset,
        }
    }

    /// Reads the next entry, following the same boundary rule as the writer.
    ///
    /// # Errors
    ///
    /// Returns a structural fault if the layout ends early.
    pub fn read_entry<E: SegmentEntry>(&mut self) -> LogResult<E> {
        let size = E::ENCODED_SIZE;
        if self.pos - self.segment_start + size > self.segment_size {
            self.segment_start += self.segment_size;
            self.pos = self.segment_start + self.preamble_size;
        }
        if self.pos + size > self.data.len() {
            return Err(LogError::structural(format!(
                "segmented buffer ends at {} while reading entry at {}",
                self.data.len(),
                self.pos
            )));
        }
        let entry = E::decode_from(&self.data[self.pos..self.pos + size])?;
        self.pos += size;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Word(u64);

    impl SegmentEntry for Word {
        const ENCODED_SIZE: usize = 8;

        fn encode_into(&self, out: &mut [u8]) {
            out.copy_from_slice(&self.0.to_le_bytes());
        }

        fn decode_from(bytes: &[u8]) -> LogResult<Self> {
            let raw: [u8; 8] = bytes
                .try_into()
                .map_err(|_| LogError::structural("bad word"))?;
            Ok(Self(u64::from_le_bytes(raw)))
        }
    }

    #[test]
    fn entries_never_straddle() {
        // 4 byte first offset, 4 byte preamble, 20 byte segments: two words per segment.
        let mut buf = SegmentedBuffer::new(20, 4, 4).unwrap();
        for i in 0..5 {
            buf.write_entry(&Word(i)).unwrap();
        }
        assert_eq!(buf.segment_count(), 3);
        assert_eq!(buf.entries_in_segment(0), 2);
        assert_eq!(buf.entries_in_segment(1), 2);
        assert_eq!(buf.entries_in_segment(2), 1);
        assert_eq!(buf.segment(0).len(), 20);
        assert_eq!(buf.segment(2).len(), 12);

        let mut reader = SegmentReader::new(buf.as_bytes(), 20, 4, 4);
        for i in 0..5 {
            assert_eq!(reader.read_entry::<Word>().unwrap(), Word(i));
        }
        assert!(reader.read_entry::<Word>().is_err());
    }

    #[test]
    fn oversized_entry_rejected() {
        let mut buf = SegmentedBuffer::new(10, 0, 4).unwrap();
        assert!(buf.write_entry(&Word(1)).is_err());
    }

    #[test]
    fn invalid_geometry_rejected() {
        assert!(SegmentedBuffer::new(16, 17, 0).is_err());
        assert!(SegmentedBuffer::new(16, 0, 16).is_err());
    }

    #[test]
    fn skip_pads_current_segment() {
        let mut buf = SegmentedBuffer::new(32, 8, 8).unwrap();
        buf.write_entry(&Word(7)).unwrap();
        buf.skip_to_segment_boundary();
        assert_eq!(buf.as_bytes().len(), 40);
        assert_eq!(buf.write_entry(&Word(8)).unwrap(), 1);
    }
}
