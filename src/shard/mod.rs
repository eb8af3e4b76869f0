//! Units of work handed to the traversal engine.
//!
//! A [`Shard`] is either a [`LocusShard`], whose records are pulled live from
//! the data source, or a [`ReadShard`], which buffers a bounded number of
//! records. Closing (dropping) a shard folds the metrics it gathered into the
//! data source's totals.

pub mod balancer;
pub mod strategy;

pub use balancer::{ActiveRegionShardBalancer, LocusShardBalancer, ReadShardBalancer};
pub use strategy::LocusShardStrategy;

use crate::Result;
use crate::index::FileSpan;
use crate::interval::GenomeLoc;
use crate::metrics::ReadMetrics;
use crate::pipeline::ReadStream;
use crate::record::{AlignmentRecord, SortOrder};
use crate::schedule::FilePointer;
use crate::storage::{DataSource, ReaderId};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardKind {
    Locus,
    Read,
}

pub enum Shard {
    Locus(LocusShard),
    Read(ReadShard),
}

impl Shard {
    pub fn kind(&self) -> ShardKind {
        match self {
            Shard::Locus(_) => ShardKind::Locus,
            Shard::Read(_) => ShardKind::Read,
        }
    }

    pub fn pointer(&self) -> &FilePointer {
        match self {
            Shard::Locus(shard) => &shard.pointer,
            Shard::Read(shard) => &shard.pointer,
        }
    }

    pub fn locations(&self) -> &[GenomeLoc] {
        self.pointer().locations()
    }

    pub fn file_spans(&self) -> &BTreeMap<ReaderId, FileSpan> {
        self.pointer().file_spans()
    }

    pub fn is_unmapped(&self) -> bool {
        self.pointer().is_region_unmapped()
    }

    /// Buffered reads; only read shards carry any.
    pub fn reads(&self) -> Option<&[AlignmentRecord]> {
        match self {
            Shard::Locus(_) => None,
            Shard::Read(shard) => Some(shard.reads()),
        }
    }

    pub fn metrics(&self) -> &ReadMetrics {
        match self {
            Shard::Locus(shard) => &shard.metrics,
            Shard::Read(shard) => &shard.metrics,
        }
    }

    /// Flush the shard's metrics into the data source.
    pub fn close(self) {
        drop(self);
    }
}

/// A set of intervals and the spans holding their reads.
pub struct LocusShard {
    source: Arc<DataSource>,
    pointer: FilePointer,
    metrics: ReadMetrics,
}

impl LocusShard {
    pub fn new(source: Arc<DataSource>, pointer: FilePointer) -> Self {
        Self {
            source,
            pointer,
            metrics: ReadMetrics::default(),
        }
    }

    pub fn pointer(&self) -> &FilePointer {
        &self.pointer
    }

    /// Stream the shard's records. Counters are added to the shard when the
    /// stream is dropped.
    pub fn records(&mut self) -> Result<LocusShardReads<'_>> {
        let stream = self.source.records(&self.pointer)?;
        Ok(LocusShardReads {
            metrics: &mut self.metrics,
            stream,
        })
    }
}

impl Drop for LocusShard {
    fn drop(&mut self) {
        self.source.incorporate_metrics(&self.metrics);
    }
}

/// Records of a [`LocusShard`].
pub struct LocusShardReads<'a> {
    metrics: &'a mut ReadMetrics,
    stream: ReadStream,
}

impl Iterator for LocusShardReads<'_> {
    type Item = Result<AlignmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.stream.next()
    }
}

impl Drop for LocusShardReads<'_> {
    fn drop(&mut self) {
        self.metrics.incorporate(&self.stream.take_metrics());
    }
}

/// A bounded buffer of reads from one contig (or from the unmapped region).
pub struct ReadShard {
    source: Arc<DataSource>,
    pointer: FilePointer,
    reads: Vec<AlignmentRecord>,
    max_reads: usize,
    metrics: ReadMetrics,
}

impl ReadShard {
    pub fn new(source: Arc<DataSource>, pointer: FilePointer, max_reads: usize) -> Self {
        Self {
            source,
            pointer,
            reads: Vec::new(),
            max_reads,
            metrics: ReadMetrics::default(),
        }
    }

    pub fn pointer(&self) -> &FilePointer {
        &self.pointer
    }

    pub fn max_reads(&self) -> usize {
        self.max_reads
    }

    pub fn reads(&self) -> &[AlignmentRecord] {
        &self.reads
    }

    /// Move the buffered reads out, leaving the shard empty.
    pub fn take_reads(&mut self) -> Vec<AlignmentRecord> {
        std::mem::take(&mut self.reads)
    }

    pub fn add_read(&mut self, read: AlignmentRecord) {
        self.reads.push(read);
    }

    pub fn is_buffer_empty(&self) -> bool {
        self.reads.is_empty()
    }

    pub fn is_buffer_full(&self) -> bool {
        self.reads.len() > self.max_reads
    }

    /// Pull reads from `stream` until the buffer is full or the next read is
    /// on another contig. Runs of reads at the same position (coordinate
    /// order) or with the same name (query name order) are never split.
    pub fn fill(&mut self, stream: &mut ReadStream, sort_order: SortOrder) -> Result<()> {
        let result = self.fill_from(stream, sort_order);
        self.metrics.incorporate(&stream.take_metrics());
        result
    }

    fn fill_from(&mut self, stream: &mut ReadStream, sort_order: SortOrder) -> Result<()> {
        while !self.is_buffer_full() {
            let same_contig = match stream.peek() {
                None => return Ok(()),
                Some(Err(_)) => true,
                Some(Ok(next)) => self
                    .reads
                    .last()
                    .is_none_or(|last| next.reference_index == last.reference_index),
            };
            if !same_contig {
                break;
            }
            if let Some(read) = stream.next().transpose()? {
                self.add_read(read);
            }
        }

        let Some(last) = self.reads.last().cloned() else {
            return Ok(());
        };
        loop {
            let continues_run = match stream.peek() {
                None => false,
                Some(Err(_)) => true,
                Some(Ok(next)) => match sort_order.effective() {
                    SortOrder::QueryName => next.name == last.name,
                    _ => {
                        next.reference_index == last.reference_index
                            && next.alignment_start == last.alignment_start
                    }
                },
            };
            if !continues_run {
                return Ok(());
            }
            if let Some(read) = stream.next().transpose()? {
                self.add_read(read);
            }
        }
    }
}

impl Drop for ReadShard {
    fn drop(&mut self) {
        self.source.incorporate_metrics(&self.metrics);
    }
}
