//! Picks the scheduler, sharder and balancer for a traversal and drives them.

use crate::config::TraversalKind;
use crate::interval::GenomeLocSortedSet;
use crate::schedule::{BamScheduler, IntervalSharder};
use crate::shard::{
    ActiveRegionShardBalancer, LocusShardBalancer, LocusShardStrategy, ReadShardBalancer, Shard,
};
use crate::storage::DataSource;
use crate::types::{ShardPlan, ShardSummary};
use crate::Result;
use std::sync::Arc;

pub type ShardIterator = Box<dyn Iterator<Item = Result<Shard>>>;

/// Parse interval strings against the source's dictionary. No strings means
/// no interval restriction.
pub fn parse_intervals(source: &DataSource, intervals: &[String]) -> Result<Option<GenomeLocSortedSet>> {
    if intervals.is_empty() {
        return Ok(None);
    }
    let locs = intervals
        .iter()
        .map(|text| source.parser().parse(text))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(GenomeLocSortedSet::new(locs, source.config().merge_rule)))
}

fn file_pointers(
    source: &DataSource,
    loci: Option<GenomeLocSortedSet>,
) -> Result<IntervalSharder<BamScheduler>> {
    match loci {
        Some(loci) => IntervalSharder::shard_over_intervals(source, loci, source.config().merge_rule),
        None if source.config().include_unmapped => IntervalSharder::shard_over_all_reads(source),
        None => IntervalSharder::shard_over_mapped_reads(source),
    }
}

fn locus_strategy(source: &DataSource, loci: Option<GenomeLocSortedSet>) -> Result<LocusShardStrategy> {
    let size = source.config().locus_shard_size;
    match loci {
        Some(loci) => LocusShardStrategy::over_intervals(&loci, size),
        None if source.config().include_unmapped => LocusShardStrategy::over_intervals(
            &GenomeLocSortedSet::from_dictionary(source.dictionary()).with_unmapped(),
            size,
        ),
        None => LocusShardStrategy::linear(source.dictionary(), size),
    }
}

/// Shards for the configured traversal over `loci`, or over the whole
/// dataset when `loci` is `None`.
pub fn shards(source: &Arc<DataSource>, loci: Option<GenomeLocSortedSet>) -> Result<ShardIterator> {
    let traversal = source.config().traversal;
    tracing::info!(
        "sharding {} inputs for {:?} traversal over {}",
        source.reader_ids().len(),
        traversal,
        loci.as_ref()
            .map(|l| format!("{} intervals", l.len()))
            .unwrap_or_else(|| "the whole dataset".to_string())
    );

    let shards: ShardIterator = match traversal {
        TraversalKind::Reads => Box::new(ReadShardBalancer::new(
            Arc::clone(source),
            file_pointers(source, loci)?,
        )),
        TraversalKind::Locus if source.has_index() => Box::new(LocusShardBalancer::new(
            Arc::clone(source),
            file_pointers(source, loci)?,
        )),
        TraversalKind::Locus | TraversalKind::LinearLocus => {
            Box::new(locus_strategy(source, loci)?.into_shards(Arc::clone(source)).map(Ok))
        }
        TraversalKind::ActiveRegion => Box::new(ActiveRegionShardBalancer::new(
            Arc::clone(source),
            file_pointers(source, loci)?,
        )),
    };
    Ok(shards)
}

/// Run the traversal's sharding to completion and summarise every shard.
pub fn plan(source: &Arc<DataSource>, intervals: &[String]) -> Result<ShardPlan> {
    let loci = parse_intervals(source, intervals)?;

    let mut summaries = Vec::new();
    for shard in shards(source, loci)? {
        let shard = shard?;
        summaries.push(ShardSummary::from(&shard));
        shard.close();
    }

    let traversal = source.config().traversal;
    Ok(ShardPlan {
        traversal,
        merge_rule: source.config().merge_rule,
        sort_order: source.sort_order(),
        inputs: source.reader_ids().iter().map(ToString::to_string).collect(),
        shards: summaries,
        metrics: (traversal == TraversalKind::Reads).then(|| source.cumulative_metrics()),
    })
}
