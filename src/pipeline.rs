//! Staged processing of the raw record stream.
//!
//! Stages run in a fixed order: interval overlap, formatting, filtering
//! (with per-filter counts), positional downsampling, order verification and
//! finally user supplied transformations.

use crate::config::EngineConfig;
use crate::interval::GenomeLoc;
use crate::metrics::ReadMetrics;
use crate::record::{AlignmentRecord, SortOrder};
use crate::storage::RecordIterator;
use crate::{Error, Result};
use std::cmp::Ordering;
use std::sync::Arc;

/// Predicate removing records from the stream.
pub trait ReadFilter: Send + Sync {
    /// Name under which removed records are counted.
    fn name(&self) -> &str;

    /// True if the record should be dropped.
    fn filter_out(&self, record: &AlignmentRecord) -> bool;
}

/// Final per-record rewrite.
pub trait ReadTransformer: Send + Sync {
    fn transform(&self, record: AlignmentRecord) -> AlignmentRecord;
}

impl<F> ReadTransformer for F
where
    F: Fn(AlignmentRecord) -> AlignmentRecord + Send + Sync,
{
    fn transform(&self, record: AlignmentRecord) -> AlignmentRecord {
        self(record)
    }
}

pub struct UnmappedReadFilter;

impl ReadFilter for UnmappedReadFilter {
    fn name(&self) -> &str {
        "UnmappedRead"
    }

    fn filter_out(&self, record: &AlignmentRecord) -> bool {
        record.is_unmapped()
    }
}

pub struct MappingQualityFilter {
    pub min_mapping_quality: u8,
}

impl ReadFilter for MappingQualityFilter {
    fn name(&self) -> &str {
        "MappingQuality"
    }

    fn filter_out(&self, record: &AlignmentRecord) -> bool {
        // 255 means unavailable
        match record.mapping_quality {
            Some(255) | None => false,
            Some(mq) => mq < self.min_mapping_quality,
        }
    }
}

pub struct DuplicateReadFilter;

impl ReadFilter for DuplicateReadFilter {
    fn name(&self) -> &str {
        "DuplicateRead"
    }

    fn filter_out(&self, record: &AlignmentRecord) -> bool {
        record.is_duplicate()
    }
}

/// Which records of the raw stream belong to the requested region.
#[derive(Debug, Clone, Default)]
pub enum OverlapFilter {
    /// Keep everything.
    #[default]
    None,
    /// Keep records overlapping any of these sorted, non-overlapping mapped
    /// intervals, plus records without a reference when requested.
    Intervals {
        locations: Vec<GenomeLoc>,
        include_unplaced: bool,
    },
    /// Keep only records without a reference.
    UnplacedOnly,
}

impl OverlapFilter {
    pub fn from_locations(locations: &[GenomeLoc], region_unmapped: bool) -> Self {
        if locations.is_empty() {
            OverlapFilter::None
        } else if region_unmapped {
            OverlapFilter::UnplacedOnly
        } else {
            OverlapFilter::Intervals {
                locations: locations.iter().filter(|l| !l.is_unmapped()).cloned().collect(),
                include_unplaced: locations.iter().any(GenomeLoc::is_unmapped),
            }
        }
    }

    fn keep(&self, record: &AlignmentRecord) -> bool {
        match self {
            OverlapFilter::None => true,
            OverlapFilter::UnplacedOnly => record.reference_index.is_none(),
            OverlapFilter::Intervals {
                locations,
                include_unplaced,
            } => {
                let (Some(reference), Some(start)) = (record.reference_index, record.alignment_start) else {
                    return *include_unplaced;
                };
                let end = record.alignment_end.unwrap_or(start).max(start);
                let i = locations.partition_point(|l| (l.contig_index(), l.stop()) < (reference, start));
                locations
                    .get(i)
                    .is_some_and(|l| l.contig_index() == reference && l.start() <= end)
            }
        }
    }
}

/// The configured stages, shared by every stream of a data source.
#[derive(Clone, Default)]
pub struct ReadPipeline {
    filters: Vec<Arc<dyn ReadFilter>>,
    downsample_to_coverage: Option<usize>,
    verify_order: Option<SortOrder>,
    transformers: Vec<Arc<dyn ReadTransformer>>,
}

impl ReadPipeline {
    pub fn from_config(config: &EngineConfig, sort_order: SortOrder) -> Self {
        let mut pipeline = ReadPipeline::default();
        if config.filter_unmapped {
            pipeline = pipeline.with_filter(Arc::new(UnmappedReadFilter));
        }
        if config.min_mapping_quality > 0 {
            pipeline = pipeline.with_filter(Arc::new(MappingQualityFilter {
                min_mapping_quality: config.min_mapping_quality,
            }));
        }
        if config.filter_duplicates {
            pipeline = pipeline.with_filter(Arc::new(DuplicateReadFilter));
        }
        pipeline.downsample_to_coverage = config.downsample_to_coverage;
        if config.verify_order {
            pipeline.verify_order = Some(sort_order.effective());
        }
        pipeline
    }

    pub fn with_filter(mut self, filter: Arc<dyn ReadFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn ReadTransformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    pub fn with_downsampling(mut self, coverage: Option<usize>) -> Self {
        self.downsample_to_coverage = coverage;
        self
    }

    pub fn with_order_verification(mut self, order: Option<SortOrder>) -> Self {
        self.verify_order = order;
        self
    }

    /// Run `records` through every stage.
    pub fn apply(&self, records: RecordIterator, overlap: OverlapFilter) -> ReadStream {
        ReadStream {
            inner: records,
            pipeline: self.clone(),
            overlap,
            downsample_position: None,
            downsample_count: 0,
            last_record: None,
            metrics: ReadMetrics::default(),
            peeked: None,
            failed: false,
        }
    }
}

/// A record stream with the pipeline applied. Counts what every stage does
/// until the metrics are taken.
pub struct ReadStream {
    inner: RecordIterator,
    pipeline: ReadPipeline,
    overlap: OverlapFilter,
    downsample_position: Option<(usize, u32)>,
    downsample_count: usize,
    last_record: Option<AlignmentRecord>,
    metrics: ReadMetrics,
    peeked: Option<Result<AlignmentRecord>>,
    failed: bool,
}

impl ReadStream {
    /// Counters accumulated since the last call.
    pub fn take_metrics(&mut self) -> ReadMetrics {
        std::mem::take(&mut self.metrics)
    }

    /// The next item, without consuming it.
    pub fn peek(&mut self) -> Option<&Result<AlignmentRecord>> {
        if self.peeked.is_none() {
            self.peeked = self.advance();
        }
        self.peeked.as_ref()
    }

    fn format(record: AlignmentRecord) -> AlignmentRecord {
        if record.reference_index.is_none() {
            AlignmentRecord {
                alignment_start: None,
                alignment_end: None,
                ..record
            }
        } else {
            record
        }
    }

    fn downsample(&mut self, record: &AlignmentRecord) -> bool {
        let Some(coverage) = self.pipeline.downsample_to_coverage else {
            return true;
        };
        let Some(reference) = record.reference_index else {
            return true;
        };
        let position = (reference, record.alignment_start.unwrap_or(0));
        if self.downsample_position != Some(position) {
            self.downsample_position = Some(position);
            self.downsample_count = 0;
        }
        self.downsample_count += 1;
        self.downsample_count <= coverage
    }

    fn verify(&mut self, record: &AlignmentRecord) -> Result<()> {
        let Some(order) = self.pipeline.verify_order else {
            return Ok(());
        };
        if let Some(last) = &self.last_record {
            if order.compare(last, record) == Ordering::Greater {
                return Err(Error::InvalidInput(format!(
                    "reads are not in {:?} order: {} at {:?}:{:?} follows {} at {:?}:{:?}",
                    order,
                    record.name,
                    record.reference_index,
                    record.alignment_start,
                    last.name,
                    last.reference_index,
                    last.alignment_start
                )));
            }
        }
        self.last_record = Some(record.clone());
        Ok(())
    }

    fn advance(&mut self) -> Option<Result<AlignmentRecord>> {
        if self.failed {
            return None;
        }
        'records: loop {
            let record = match self.inner.next()? {
                Ok(record) => record,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };

            if !self.overlap.keep(&record) {
                continue;
            }

            self.metrics.increment_reads_seen();
            let record = Self::format(record);

            for filter in &self.pipeline.filters {
                if filter.filter_out(&record) {
                    self.metrics.increment_filter(filter.name());
                    continue 'records;
                }
            }

            if !self.downsample(&record) {
                self.metrics.increment_downsampled();
                continue;
            }

            if let Err(e) = self.verify(&record) {
                self.failed = true;
                return Some(Err(e));
            }

            let record = self
                .pipeline
                .transformers
                .iter()
                .fold(record, |record, transformer| transformer.transform(record));

            self.metrics.increment_reads_passed();
            return Some(Ok(record));
        }
    }
}

impl Iterator for ReadStream {
    type Item = Result<AlignmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.peeked.take().or_else(|| self.advance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::{GenomeLocParser, SequenceDictionary};

    fn stream_of(records: Vec<AlignmentRecord>) -> RecordIterator {
        Box::new(records.into_iter().map(Ok))
    }

    fn read(name: &str, reference: usize, start: u32) -> AlignmentRecord {
        AlignmentRecord::new(name, Some(reference), Some(start))
    }

    #[test]
    fn test_filters_are_counted() {
        let mut unmapped = read("u", 0, 5);
        unmapped.flags = 0x4;
        let mut duplicate = read("d", 0, 6);
        duplicate.flags = 0x400;

        let pipeline = ReadPipeline::default()
            .with_filter(Arc::new(UnmappedReadFilter))
            .with_filter(Arc::new(DuplicateReadFilter));
        let mut stream = pipeline.apply(stream_of(vec![read("a", 0, 1), unmapped, duplicate]), OverlapFilter::None);

        let names: Vec<String> = stream.by_ref().map(|r| r.unwrap().name).collect();
        assert_eq!(names, vec!["a"]);

        let metrics = stream.take_metrics();
        assert_eq!(metrics.reads_seen, 3);
        assert_eq!(metrics.reads_passed, 1);
        assert_eq!(metrics.filtered["UnmappedRead"], 1);
        assert_eq!(metrics.filtered["DuplicateRead"], 1);
    }

    #[test]
    fn test_positional_downsampling_keeps_first_reads() {
        let records = vec![read("a", 0, 1), read("b", 0, 1), read("c", 0, 1), read("d", 0, 2)];
        let pipeline = ReadPipeline::default().with_downsampling(Some(2));
        let mut stream = pipeline.apply(stream_of(records), OverlapFilter::None);
        let names: Vec<String> = stream.by_ref().map(|r| r.unwrap().name).collect();
        assert_eq!(names, vec!["a", "b", "d"]);
        assert_eq!(stream.take_metrics().reads_downsampled, 1);
    }

    #[test]
    fn test_order_verification_fails_stream() {
        let records = vec![read("a", 0, 10), read("b", 0, 5), read("c", 0, 20)];
        let pipeline = ReadPipeline::default().with_order_verification(Some(SortOrder::Coordinate));
        let mut stream = pipeline.apply(stream_of(records), OverlapFilter::None);
        assert!(stream.next().unwrap().is_ok());
        assert!(matches!(stream.next(), Some(Err(Error::InvalidInput(_)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_overlap_filter_keeps_overlapping_reads() {
        let parser = GenomeLocParser::new(SequenceDictionary::new([("chr1", 1000), ("chr2", 1000)]));
        let locations = vec![parser.parse("chr1:100-200").unwrap(), parser.parse("chr1:500-600").unwrap()];

        let mut spanning = read("spanning", 0, 90);
        spanning.alignment_end = Some(110);
        let records = vec![
            read("before", 0, 50),
            spanning,
            read("inside", 0, 550),
            read("between", 0, 300),
            read("other", 1, 150),
        ];

        let stream = ReadPipeline::default().apply(
            stream_of(records),
            OverlapFilter::from_locations(&locations, false),
        );
        let names: Vec<String> = stream.map(|r| r.unwrap().name).collect();
        assert_eq!(names, vec!["spanning", "inside"]);
    }

    #[test]
    fn test_overlap_filter_with_unmapped_sentinel_keeps_unplaced_reads() {
        let parser = GenomeLocParser::new(SequenceDictionary::new([("chr1", 1000)]));
        let locations = vec![parser.parse("chr1:100-200").unwrap(), GenomeLoc::unmapped()];
        let records = vec![read("inside", 0, 150), read("outside", 0, 500), AlignmentRecord::new("unplaced", None, None)];

        let stream = ReadPipeline::default().apply(stream_of(records), OverlapFilter::from_locations(&locations, false));
        let names: Vec<String> = stream.map(|r| r.unwrap().name).collect();
        assert_eq!(names, vec!["inside", "unplaced"]);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut stream = ReadPipeline::default().apply(stream_of(vec![read("a", 0, 1), read("b", 0, 2)]), OverlapFilter::None);
        assert_eq!(stream.peek().unwrap().as_ref().unwrap().name, "a");
        assert_eq!(stream.next().unwrap().unwrap().name, "a");
        assert_eq!(stream.next().unwrap().unwrap().name, "b");
        assert!(stream.peek().is_none());
    }

    #[test]
    fn test_transformers_run_last() {
        let pipeline = ReadPipeline::default().with_transformer(Arc::new(|mut record: AlignmentRecord| {
            record.name.push_str("/1");
            record
        }));
        let mut stream = pipeline.apply(stream_of(vec![read("a", 0, 1)]), OverlapFilter::None);
        assert_eq!(stream.next().unwrap().unwrap().name, "a/1");
    }
}
