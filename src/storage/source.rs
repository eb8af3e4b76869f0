use super::local::LocalStorage;
use super::stream::BlockDrivenSource;
use super::{ReaderId, ReaderInfo, RecordIterator, RecordSource};
use crate::config::EngineConfig;
use crate::index::{BamIndex, VirtualOffset};
use crate::interval::{GenomeLocParser, SequenceDictionary};
use crate::metrics::ReadMetrics;
use crate::pipeline::{OverlapFilter, ReadPipeline, ReadStream};
use crate::record::{AlignmentRecord, SortOrder};
use crate::schedule::FilePointer;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// The set of input files being sharded.
///
/// Owns the merged sequence dictionary (the first reader's), the common sort
/// order, the record source used to decode spans, the read pipeline and the
/// metrics accumulated by closed shards.
pub struct DataSource {
    readers: Vec<ReaderInfo>,
    reader_ids: Vec<ReaderId>,
    parser: GenomeLocParser,
    sort_order: SortOrder,
    config: EngineConfig,
    source: Arc<dyn RecordSource>,
    pipeline: ReadPipeline,
    metrics: Mutex<ReadMetrics>,
}

impl DataSource {
    /// Open BAM files from disk. Records are decoded synchronously unless
    /// I/O threads are configured.
    pub fn open(paths: Vec<PathBuf>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let readers = paths
            .iter()
            .map(|path| LocalStorage::open_reader(path))
            .collect::<Result<Vec<_>>>()?;

        let source: Arc<dyn RecordSource> = if config.io_threads > 0 {
            Arc::new(BlockDrivenSource::new(config.io_threads, config.file_handles)?)
        } else {
            Arc::new(LocalStorage::new())
        };

        Self::with_record_source(readers, source, config)
    }

    /// Build over already opened readers.
    pub fn with_record_source(
        mut readers: Vec<ReaderInfo>,
        source: Arc<dyn RecordSource>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        readers.sort_by(|a, b| a.id.cmp(&b.id));

        let dictionary = readers
            .first()
            .map(|r| r.dictionary.clone())
            .unwrap_or_default();
        let sort_order = Self::common_sort_order(&readers)?;
        let pipeline = ReadPipeline::from_config(&config, sort_order);

        Ok(Self {
            reader_ids: readers.iter().map(|r| r.id.clone()).collect(),
            readers,
            parser: GenomeLocParser::new(dictionary),
            sort_order,
            config,
            source,
            pipeline,
            metrics: Mutex::new(ReadMetrics::default()),
        })
    }

    fn common_sort_order(readers: &[ReaderInfo]) -> Result<SortOrder> {
        let mut order = None;
        for reader in readers {
            let effective = reader.sort_order.effective();
            match order {
                None => order = Some(effective),
                Some(existing) if existing != effective => {
                    return Err(Error::InvalidInput(format!(
                        "inputs have mixed sort orders: {} is {:?}, expected {:?}",
                        reader.id, reader.sort_order, existing
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(order.unwrap_or(SortOrder::Coordinate))
    }

    /// Replace the read pipeline, e.g. to add filters or transformers.
    pub fn with_pipeline(mut self, pipeline: ReadPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Readers in identity order.
    pub fn reader_ids(&self) -> &[ReaderId] {
        &self.reader_ids
    }

    pub fn reader_info(&self, reader: &ReaderId) -> Option<&ReaderInfo> {
        self.readers.iter().find(|r| r.id == *reader)
    }

    pub fn dictionary(&self) -> &SequenceDictionary {
        self.parser.dictionary()
    }

    pub fn parser(&self) -> &GenomeLocParser {
        &self.parser
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// True when every reader has an index.
    pub fn has_index(&self) -> bool {
        !self.readers.is_empty() && self.readers.iter().all(|r| r.index_path.is_some())
    }

    /// Open the index of `reader`, if it has one. Each call returns an
    /// independent index reader.
    pub fn open_index(&self, reader: &ReaderId) -> Result<Option<BamIndex>> {
        let info = self
            .reader_info(reader)
            .ok_or_else(|| Error::Internal(format!("unknown reader {}", reader)))?;
        info.index_path
            .as_ref()
            .map(|path| BamIndex::open(path, self.dictionary()))
            .transpose()
    }

    /// Where the records of each reader begin.
    pub fn initial_reader_positions(&self) -> BTreeMap<ReaderId, VirtualOffset> {
        self.readers
            .iter()
            .map(|r| (r.id.clone(), r.header_end))
            .collect()
    }

    /// Records of every reader within the pointer's spans, merged in sort
    /// order, restricted to its intervals and passed through the pipeline.
    pub fn records(&self, pointer: &FilePointer) -> Result<ReadStream> {
        let mut streams = Vec::with_capacity(self.reader_ids.len());
        for reader in &self.reader_ids {
            let span = pointer.file_spans().get(reader).ok_or_else(|| {
                Error::Internal(format!("file pointer {} has no span for reader {}", pointer, reader))
            })?;
            streams.push(self.source.records(reader, span)?);
        }

        let merged: RecordIterator = Box::new(MergingIterator::new(streams, self.sort_order));
        let overlap = OverlapFilter::from_locations(pointer.locations(), pointer.is_region_unmapped());
        Ok(self.pipeline.apply(merged, overlap))
    }

    /// Fold the metrics of a closed shard into the running totals.
    pub fn incorporate_metrics(&self, metrics: &ReadMetrics) {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .incorporate(metrics);
    }

    pub fn cumulative_metrics(&self) -> ReadMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Merges per-reader record streams, each already in `order`. Ties go to the
/// earlier reader.
struct MergingIterator {
    sources: Vec<RecordIterator>,
    heads: Vec<Option<AlignmentRecord>>,
    order: SortOrder,
    primed: bool,
    pending_error: Option<Error>,
}

impl MergingIterator {
    fn new(sources: Vec<RecordIterator>, order: SortOrder) -> Self {
        let heads = sources.iter().map(|_| None).collect();
        Self {
            sources,
            heads,
            order,
            primed: false,
            pending_error: None,
        }
    }

    fn refill(&mut self, i: usize) -> Result<()> {
        self.heads[i] = self.sources[i].next().transpose()?;
        Ok(())
    }
}

impl Iterator for MergingIterator {
    type Item = Result<AlignmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }
        if !self.primed {
            self.primed = true;
            for i in 0..self.sources.len() {
                if let Err(e) = self.refill(i) {
                    return Some(Err(e));
                }
            }
        }

        let order = self.order;
        let (next, _) = self
            .heads
            .iter()
            .enumerate()
            .filter_map(|(i, head)| head.as_ref().map(|record| (i, record)))
            .min_by(|(_, a), (_, b)| order.compare(a, b))?;

        let record = self.heads[next].take();
        if let Err(e) = self.refill(next) {
            self.pending_error = Some(e);
        }
        record.map(Ok)
    }
}
