use super::{LocusShard, Shard};
use crate::interval::{GenomeLoc, GenomeLocSortedSet, SequenceDictionary};
use crate::schedule::FilePointer;
use crate::storage::DataSource;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::Arc;

/// Cuts regions into windows of at most `size` bases without consulting an
/// index. Used for locus traversals over unindexed inputs, where every shard
/// reads the whole file and relies on interval filtering.
#[derive(Debug, Clone)]
pub struct LocusShardStrategy {
    regions: VecDeque<GenomeLoc>,
    size: u32,
}

impl LocusShardStrategy {
    /// Windows over every contig of `dictionary`, in dictionary order.
    /// Empty contigs are skipped.
    pub fn linear(dictionary: &SequenceDictionary, size: u32) -> Result<Self> {
        let regions = GenomeLocSortedSet::from_dictionary(dictionary).iter().cloned().collect();
        Self::new(regions, size)
    }

    /// Windows over each interval of `intervals`. The unmapped region is
    /// emitted whole.
    pub fn over_intervals(intervals: &GenomeLocSortedSet, size: u32) -> Result<Self> {
        Self::new(intervals.iter().cloned().collect(), size)
    }

    fn new(mut regions: VecDeque<GenomeLoc>, size: u32) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidConfig("locus shard size must be at least 1".to_string()));
        }
        // zero-length contigs
        regions.retain(|r| r.is_unmapped() || r.is_whole_genome() || r.stop() >= r.start());
        Ok(Self { regions, size })
    }

    /// Turn each window into a locus shard spanning every reader in full.
    pub fn into_shards(self, source: Arc<DataSource>) -> impl Iterator<Item = Shard> {
        let merge_rule = source.config().merge_rule;
        self.map(move |window| {
            tracing::debug!("locus shard over {}", window);
            let pointer = FilePointer::monolithic(source.initial_reader_positions(), merge_rule, vec![window]);
            Shard::Locus(LocusShard::new(Arc::clone(&source), pointer))
        })
    }
}

impl Iterator for LocusShardStrategy {
    type Item = GenomeLoc;

    fn next(&mut self) -> Option<Self::Item> {
        let region = self.regions.pop_front()?;
        if region.is_unmapped() || region.is_whole_genome() {
            return Some(region);
        }

        let stop = region
            .start()
            .saturating_add(self.size - 1)
            .min(region.stop());
        if stop < region.stop() {
            self.regions.push_front(region.with_start(stop + 1));
        }
        Some(GenomeLoc::new_unchecked(region.contig(), region.contig_index(), region.start(), stop))
    }
}
