use super::{
    BIN_GENOMIC_SPAN, Bin, Chunk, FileSpan, LEVEL_STARTS, LINEAR_INDEX_SHIFT, VirtualOffset,
    first_locus_in_bin, level_for_bin, level_size,
};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Per-16 kbp minimum offsets of one reference sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearIndex {
    reference_index: usize,
    start_bin: usize,
    entries: Vec<VirtualOffset>,
}

impl LinearIndex {
    pub fn new(reference_index: usize, start_bin: usize, entries: Vec<VirtualOffset>) -> Self {
        Self {
            reference_index,
            start_bin,
            entries,
        }
    }

    pub fn reference_index(&self) -> usize {
        self.reference_index
    }

    pub fn entries(&self) -> &[VirtualOffset] {
        &self.entries
    }

    /// Smallest offset at which a record overlapping `locus` can start.
    /// Zero when the locus is past the end of the index.
    pub fn minimum_offset(&self, locus: u32) -> VirtualOffset {
        let window = (locus.saturating_sub(1) >> LINEAR_INDEX_SHIFT) as usize;
        window
            .checked_sub(self.start_bin)
            .and_then(|i| self.entries.get(i))
            .copied()
            .unwrap_or_default()
    }
}

/// Decoded bin index and linear index of one reference sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BamIndexData {
    reference_index: usize,
    bins: BTreeMap<u32, Bin>,
    linear_index: LinearIndex,
}

impl BamIndexData {
    pub fn new(reference_index: usize, bins: BTreeMap<u32, Bin>, linear_index: LinearIndex) -> Self {
        Self {
            reference_index,
            bins,
            linear_index,
        }
    }

    pub fn reference_index(&self) -> usize {
        self.reference_index
    }

    pub fn bins(&self) -> &BTreeMap<u32, Bin> {
        &self.bins
    }

    pub fn bin(&self, number: u32) -> Option<&Bin> {
        self.bins.get(&number)
    }

    pub fn linear_index(&self) -> &LinearIndex {
        &self.linear_index
    }

    /// Coalesced chunks holding every record that may overlap `bin`.
    ///
    /// Records are assigned to the smallest bin containing them, so the
    /// ancestors of `bin` at each coarser level contribute chunks as well.
    /// Chunks ending before the linear index minimum for the bin's first
    /// locus cannot hold overlapping records and are dropped.
    pub fn span_overlapping(&self, bin: u32) -> Result<FileSpan> {
        let (Some(level), Some(first_locus)) = (level_for_bin(bin), first_locus_in_bin(bin)) else {
            return Err(Error::Internal(format!(
                "tried to resolve chunks for invalid bin {bin} on reference {}",
                self.reference_index
            )));
        };

        let mut chunks: Vec<Chunk> = Vec::new();
        if let Some(own) = self.bins.get(&bin) {
            chunks.extend_from_slice(&own.chunks);
        }
        for parent_level in (0..level).rev() {
            let bin_width = BIN_GENOMIC_SPAN / level_size(parent_level);
            let parent = (first_locus - 1) / bin_width + LEVEL_STARTS[parent_level];
            if let Some(parent) = self.bins.get(&parent) {
                chunks.extend_from_slice(&parent.chunks);
            }
        }

        // stable: equal starts stay in index order
        chunks.sort_by_key(|chunk| chunk.start);

        let minimum_offset = self.linear_index.minimum_offset(first_locus);

        let mut coalesced: Vec<Chunk> = Vec::new();
        for chunk in chunks {
            if chunk.end <= minimum_offset {
                continue;
            }
            match coalesced.last_mut() {
                Some(last) if chunk.start.compressed() <= last.end.compressed() => {
                    if chunk.end > last.end {
                        last.end = chunk.end;
                    }
                }
                _ => coalesced.push(chunk),
            }
        }

        Ok(FileSpan::from_coalesced(coalesced))
    }
}
