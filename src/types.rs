use crate::config::TraversalKind;
use crate::index::FileSpan;
use crate::interval::IntervalMergingRule;
use crate::metrics::ReadMetrics;
use crate::record::SortOrder;
use crate::shard::{Shard, ShardKind};
use serde::Serialize;

/// The shard plan printed by the CLI
#[derive(Debug, Serialize)]
pub struct ShardPlan {
    pub traversal: TraversalKind,
    #[serde(rename = "mergeRule")]
    pub merge_rule: IntervalMergingRule,
    #[serde(rename = "sortOrder")]
    pub sort_order: SortOrder,
    pub inputs: Vec<String>,
    pub shards: Vec<ShardSummary>,
    /// Only populated for read traversals, which decode the records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ReadMetrics>,
}

#[derive(Debug, Serialize)]
pub struct ShardSummary {
    pub kind: ShardKind,
    pub unmapped: bool,
    pub intervals: Vec<String>,
    #[serde(rename = "byteRanges")]
    pub byte_ranges: Vec<ByteRangeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reads: Option<usize>,
}

impl From<&Shard> for ShardSummary {
    fn from(shard: &Shard) -> Self {
        Self {
            kind: shard.kind(),
            unmapped: shard.is_unmapped(),
            intervals: shard.locations().iter().map(ToString::to_string).collect(),
            byte_ranges: shard
                .file_spans()
                .iter()
                .map(|(reader, span)| ByteRangeSummary::new(reader.to_string(), span))
                .collect(),
            reads: shard.reads().map(<[_]>::len),
        }
    }
}

/// Virtual offset ranges to read from one input, like the byte ranges of an
/// htsget ticket.
#[derive(Debug, Serialize)]
pub struct ByteRangeSummary {
    pub file: String,
    pub chunks: Vec<ChunkRange>,
}

impl ByteRangeSummary {
    pub fn new(file: String, span: &FileSpan) -> Self {
        Self {
            file,
            chunks: span
                .chunks()
                .iter()
                .map(|chunk| ChunkRange {
                    start: chunk.start.to_string(),
                    end: chunk.end.to_string(),
                })
                .collect(),
        }
    }
}

/// Half-open range of virtual offsets, each written `block:offset`.
#[derive(Debug, Serialize)]
pub struct ChunkRange {
    pub start: String,
    pub end: String,
}
