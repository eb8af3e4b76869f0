//! BAM index (BAI) decoding and bin arithmetic.
//!
//! - [`BamIndex`] - lazily decodes one reference sequence at a time from a `.bai` file
//! - [`BamIndexData`] - the decoded bins and linear index of one reference sequence
//! - [`VirtualOffset`], [`Chunk`], [`FileSpan`] - BGZF byte ranges produced by the index
//!
//! Bins follow the 6-level binning scheme shared by BAM and CSI indices:
//! level 0 holds a single bin spanning 512 Mbp and every lower level splits
//! each bin of the level above into eight.

pub mod bai;
pub mod data;

pub use bai::BamIndex;
pub use data::{BamIndexData, LinearIndex};

use noodles::bgzf;
use std::collections::VecDeque;
use std::fmt;

/// Maximum number of bins in a BAI index, `(8^6 - 1) / 7 + 1`.
pub const MAX_BINS: u32 = 37450;

/// First bin number of each level.
pub const LEVEL_STARTS: [u32; 6] = [0, 1, 9, 73, 585, 4681];

/// Genomic span addressable by the level 0 bin.
pub const BIN_GENOMIC_SPAN: u32 = 512 * 1024 * 1024;

/// Each linear index entry covers `1 << LINEAR_INDEX_SHIFT` bases.
pub const LINEAR_INDEX_SHIFT: u32 = 14;

/// Rough inflation factor used to turn compressed block distances into bytes.
const AVERAGE_BAM_COMPRESSION_RATIO: i64 = 3;

pub fn num_index_levels() -> usize {
    LEVEL_STARTS.len()
}

/// First bin number of the finest level.
pub fn first_bin_in_lowest_level() -> u32 {
    LEVEL_STARTS[LEVEL_STARTS.len() - 1]
}

/// Number of bins in `level`.
pub fn level_size(level: usize) -> u32 {
    if level == LEVEL_STARTS.len() - 1 {
        MAX_BINS - LEVEL_STARTS[level] - 1
    } else {
        LEVEL_STARTS[level + 1] - LEVEL_STARTS[level]
    }
}

/// Greatest level whose first bin is not after `bin`.
pub fn level_for_bin(bin: u32) -> Option<usize> {
    if bin >= MAX_BINS {
        return None;
    }
    LEVEL_STARTS.iter().rposition(|&start| bin >= start)
}

/// First 1-based locus addressable by `bin`.
pub fn first_locus_in_bin(bin: u32) -> Option<u32> {
    let level = level_for_bin(bin)?;
    Some((bin - LEVEL_STARTS[level]) * (BIN_GENOMIC_SPAN / level_size(level)) + 1)
}

/// Last 1-based locus addressable by `bin`.
pub fn last_locus_in_bin(bin: u32) -> Option<u32> {
    let level = level_for_bin(bin)?;
    Some((bin - LEVEL_STARTS[level] + 1) * (BIN_GENOMIC_SPAN / level_size(level)))
}

/// A BGZF virtual file offset: compressed block address in the high 48 bits,
/// offset into the inflated block in the low 16 bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualOffset(u64);

impl VirtualOffset {
    pub const MAX: VirtualOffset = VirtualOffset(u64::MAX);

    pub fn new(compressed: u64, uncompressed: u16) -> Self {
        VirtualOffset((compressed << 16) | uncompressed as u64)
    }

    /// Address of the compressed block.
    pub fn compressed(self) -> u64 {
        self.0 >> 16
    }

    /// Offset into the inflated block.
    pub fn uncompressed(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for VirtualOffset {
    fn from(raw: u64) -> Self {
        VirtualOffset(raw)
    }
}

impl From<VirtualOffset> for u64 {
    fn from(offset: VirtualOffset) -> Self {
        offset.0
    }
}

impl From<bgzf::VirtualPosition> for VirtualOffset {
    fn from(position: bgzf::VirtualPosition) -> Self {
        VirtualOffset(u64::from(position))
    }
}

impl From<VirtualOffset> for bgzf::VirtualPosition {
    fn from(offset: VirtualOffset) -> Self {
        bgzf::VirtualPosition::from(offset.0)
    }
}

impl fmt::Display for VirtualOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.compressed(), self.uncompressed())
    }
}

/// Half-open range of virtual offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Chunk {
    pub start: VirtualOffset,
    pub end: VirtualOffset,
}

impl Chunk {
    pub fn new(start: impl Into<VirtualOffset>, end: impl Into<VirtualOffset>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn overlaps(&self, other: &Chunk) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True when one chunk ends exactly where the other starts.
    pub fn is_adjacent_to(&self, other: &Chunk) -> bool {
        self.end == other.start || other.end == self.start
    }

    /// Approximate number of inflated bytes covered.
    pub fn size(&self) -> u64 {
        let blocks = self.end.compressed() as i64 - self.start.compressed() as i64;
        let offsets = self.end.uncompressed() as i64 - self.start.uncompressed() as i64;
        (blocks * AVERAGE_BAM_COMPRESSION_RATIO + offsets).max(0) as u64
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// An ordered list of chunks within a single file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSpan {
    chunks: Vec<Chunk>,
}

impl FileSpan {
    /// Build a span from chunks, sorting and coalescing them.
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks: optimize_chunks(chunks),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap chunks that are already sorted and coalesced.
    pub(crate) fn from_coalesced(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }

    /// Span from `start` to the end of the file.
    pub fn to_end_of_file(start: VirtualOffset) -> Self {
        Self {
            chunks: vec![Chunk::new(start, VirtualOffset::MAX)],
        }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Merge two spans, coalescing overlapping and adjacent chunks.
    pub fn union(&self, other: &FileSpan) -> FileSpan {
        let mut chunks = self.chunks.clone();
        chunks.extend_from_slice(&other.chunks);
        FileSpan::new(chunks)
    }

    /// The parts of this span not covered by `other`.
    pub fn minus(&self, other: &FileSpan) -> FileSpan {
        let mut this_chunks: VecDeque<Chunk> = self.chunks.iter().copied().collect();
        let mut other_chunks: VecDeque<Chunk> = other.chunks.iter().copied().collect();
        let mut output = Vec::new();

        while let (Some(this), Some(other)) = (this_chunks.front().copied(), other_chunks.front().copied()) {
            if this.end <= other.start {
                output.push(this);
                this_chunks.pop_front();
                continue;
            }
            if other.end <= this.start {
                other_chunks.pop_front();
                continue;
            }

            this_chunks.pop_front();
            if this.start < other.start {
                output.push(Chunk::new(this.start, other.start));
            }
            if this.end > other.end {
                this_chunks.push_front(Chunk::new(other.end, this.end));
            }
        }
        output.extend(this_chunks);

        FileSpan { chunks: output }
    }

    /// Approximate number of inflated bytes covered.
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(Chunk::size).sum()
    }

    /// Smallest chunk containing the whole span.
    pub fn extent(&self) -> Option<Chunk> {
        match (self.chunks.first(), self.chunks.last()) {
            (Some(first), Some(last)) => Some(Chunk::new(first.start, last.end)),
            _ => None,
        }
    }
}

impl fmt::Display for FileSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chunks: Vec<String> = self.chunks.iter().map(Chunk::to_string).collect();
        write!(f, "[{}]", chunks.join(";"))
    }
}

fn optimize_chunks(mut chunks: Vec<Chunk>) -> Vec<Chunk> {
    chunks.sort();

    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if chunk.start == chunk.end {
            continue;
        }
        match merged.last_mut() {
            Some(last) if last.overlaps(&chunk) || last.is_adjacent_to(&chunk) => {
                last.end = last.end.max(chunk.end);
            }
            _ => merged.push(chunk),
        }
    }
    merged
}

/// One bin of a reference sequence's binning index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bin {
    pub reference_index: usize,
    pub number: u32,
    pub chunks: Vec<Chunk>,
}

impl Bin {
    pub fn new(reference_index: usize, number: u32, chunks: Vec<Chunk>) -> Self {
        Self {
            reference_index,
            number,
            chunks,
        }
    }

    pub fn level(&self) -> Option<usize> {
        level_for_bin(self.number)
    }

    pub fn first_locus(&self) -> Option<u32> {
        first_locus_in_bin(self.number)
    }

    pub fn last_locus(&self) -> Option<u32> {
        last_locus_in_bin(self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_arithmetic() {
        assert_eq!(level_for_bin(0), Some(0));
        assert_eq!(level_for_bin(8), Some(1));
        assert_eq!(level_for_bin(4680), Some(4));
        assert_eq!(level_for_bin(4681), Some(5));
        assert_eq!(level_for_bin(MAX_BINS), None);
        assert_eq!(level_size(5), 32768);
        assert_eq!(level_size(0), 1);
    }

    #[test]
    fn test_bin_loci() {
        assert_eq!(first_locus_in_bin(0), Some(1));
        assert_eq!(last_locus_in_bin(0), Some(BIN_GENOMIC_SPAN));
        assert_eq!(first_locus_in_bin(4681), Some(1));
        assert_eq!(last_locus_in_bin(4681), Some(16384));
        assert_eq!(first_locus_in_bin(4682), Some(16385));
        assert_eq!(first_locus_in_bin(585), Some(1));
        assert_eq!(last_locus_in_bin(585), Some(131072));
    }

    #[test]
    fn test_virtual_offset_parts() {
        let offset = VirtualOffset::new(1024, 512);
        assert_eq!(offset.compressed(), 1024);
        assert_eq!(offset.uncompressed(), 512);
        assert_eq!(VirtualOffset::from(offset.as_raw()), offset);
    }

    #[test]
    fn test_span_union_coalesces() {
        let a = FileSpan::new(vec![Chunk::new(VirtualOffset::new(0, 0), VirtualOffset::new(10, 0))]);
        let b = FileSpan::new(vec![
            Chunk::new(VirtualOffset::new(10, 0), VirtualOffset::new(20, 0)),
            Chunk::new(VirtualOffset::new(30, 0), VirtualOffset::new(40, 0)),
        ]);
        let union = a.union(&b);
        assert_eq!(
            union.chunks(),
            &[
                Chunk::new(VirtualOffset::new(0, 0), VirtualOffset::new(20, 0)),
                Chunk::new(VirtualOffset::new(30, 0), VirtualOffset::new(40, 0)),
            ]
        );
    }

    #[test]
    fn test_span_minus() {
        let this = FileSpan::new(vec![Chunk::new(VirtualOffset::new(0, 0), VirtualOffset::new(100, 0))]);
        let other = FileSpan::new(vec![Chunk::new(VirtualOffset::new(20, 0), VirtualOffset::new(30, 0))]);
        let diff = this.minus(&other);
        assert_eq!(
            diff.chunks(),
            &[
                Chunk::new(VirtualOffset::new(0, 0), VirtualOffset::new(20, 0)),
                Chunk::new(VirtualOffset::new(30, 0), VirtualOffset::new(100, 0)),
            ]
        );
        assert_eq!(this.minus(&this).size(), 0);
        assert_eq!(other.minus(&this).size(), 0);
    }

    #[test]
    fn test_chunk_size_uses_compression_ratio() {
        let chunk = Chunk::new(VirtualOffset::new(10, 5), VirtualOffset::new(20, 15));
        assert_eq!(chunk.size(), 10 * 3 + 10);
    }

    #[test]
    fn test_extent() {
        let span = FileSpan::new(vec![
            Chunk::new(VirtualOffset::new(30, 0), VirtualOffset::new(40, 0)),
            Chunk::new(VirtualOffset::new(0, 0), VirtualOffset::new(10, 0)),
        ]);
        assert_eq!(
            span.extent(),
            Some(Chunk::new(VirtualOffset::new(0, 0), VirtualOffset::new(40, 0)))
        );
        assert_eq!(FileSpan::empty().extent(), None);
    }
}
