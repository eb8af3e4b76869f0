use super::{LocusShard, ReadShard, Shard};
use crate::pipeline::ReadStream;
use crate::schedule::FilePointer;
use crate::storage::DataSource;
use crate::{Error, Result};
use std::iter::Peekable;
use std::sync::Arc;

/// True when `next` belongs to the same contig group as `current`: both in
/// the unmapped region, or both mapped on the same contig.
fn same_contig(current: &FilePointer, next: &FilePointer) -> bool {
    match (current.is_region_unmapped(), next.is_region_unmapped()) {
        (true, true) => true,
        (false, false) => current.contig_index() == next.contig_index(),
        _ => false,
    }
}

/// Pull every pointer of the next contig group and union them.
fn next_contig_group<I>(pointers: &mut Peekable<I>) -> Option<Result<FilePointer>>
where
    I: Iterator<Item = Result<FilePointer>>,
{
    let first = match pointers.next()? {
        Ok(pointer) => pointer,
        Err(e) => return Some(Err(e)),
    };
    if first.is_monolithic() {
        return Some(Ok(first));
    }
    let mut group = vec![first];
    while let Some(next) = pointers.next_if(|next| {
        next.as_ref()
            .is_ok_and(|next| !next.is_monolithic() && same_contig(&group[0], next))
    }) {
        match next {
            Ok(pointer) => group.push(pointer),
            Err(e) => return Some(Err(e)),
        }
    }

    if group.len() == 1 {
        return group.pop().map(Ok);
    }
    Some(FilePointer::union(group))
}

/// One locus shard per file pointer.
pub struct LocusShardBalancer<I> {
    source: Arc<DataSource>,
    pointers: I,
}

impl<I> LocusShardBalancer<I>
where
    I: Iterator<Item = Result<FilePointer>>,
{
    pub fn new(source: Arc<DataSource>, pointers: I) -> Self {
        Self { source, pointers }
    }
}

impl<I> Iterator for LocusShardBalancer<I>
where
    I: Iterator<Item = Result<FilePointer>>,
{
    type Item = Result<Shard>;

    fn next(&mut self) -> Option<Self::Item> {
        let pointer = self.pointers.next()?;
        Some(pointer.map(|pointer| {
            tracing::debug!("locus shard {}", pointer);
            Shard::Locus(LocusShard::new(Arc::clone(&self.source), pointer))
        }))
    }
}

/// One locus shard per contig (or for the whole unmapped region), covering
/// every pointer on it.
pub struct ActiveRegionShardBalancer<I: Iterator<Item = Result<FilePointer>>> {
    source: Arc<DataSource>,
    pointers: Peekable<I>,
}

impl<I> ActiveRegionShardBalancer<I>
where
    I: Iterator<Item = Result<FilePointer>>,
{
    pub fn new(source: Arc<DataSource>, pointers: I) -> Self {
        Self {
            source,
            pointers: pointers.peekable(),
        }
    }
}

impl<I> Iterator for ActiveRegionShardBalancer<I>
where
    I: Iterator<Item = Result<FilePointer>>,
{
    type Item = Result<Shard>;

    fn next(&mut self) -> Option<Self::Item> {
        let pointer = next_contig_group(&mut self.pointers)?;
        Some(pointer.map(|pointer| {
            tracing::debug!("active region shard {}", pointer);
            Shard::Locus(LocusShard::new(Arc::clone(&self.source), pointer))
        }))
    }
}

struct ContigReads {
    pointer: FilePointer,
    stream: ReadStream,
}

/// Read shards filled from one persistent record stream per contig, so that
/// downsampling state carries across shard boundaries within a contig.
pub struct ReadShardBalancer<I: Iterator<Item = Result<FilePointer>>> {
    source: Arc<DataSource>,
    pointers: Peekable<I>,
    current: Option<ContigReads>,
    seen_monolithic: bool,
    done: bool,
}

impl<I> ReadShardBalancer<I>
where
    I: Iterator<Item = Result<FilePointer>>,
{
    pub fn new(source: Arc<DataSource>, pointers: I) -> Self {
        Self {
            source,
            pointers: pointers.peekable(),
            current: None,
            seen_monolithic: false,
            done: false,
        }
    }

    fn next_contig(&mut self) -> Option<Result<ContigReads>> {
        let pointer = match next_contig_group(&mut self.pointers)? {
            Ok(pointer) => pointer,
            Err(e) => return Some(Err(e)),
        };

        if self.seen_monolithic {
            return Some(Err(Error::Internal(
                "a monolithic file pointer must be the only file pointer".to_string(),
            )));
        }
        if pointer.is_monolithic() {
            self.seen_monolithic = true;
            if self.pointers.peek().is_some() {
                return Some(Err(Error::Internal(
                    "cannot have more than one monolithic file pointer".to_string(),
                )));
            }
        }

        tracing::debug!("opening read stream over {}", pointer);
        Some(self.source.records(&pointer).map(|stream| ContigReads { pointer, stream }))
    }

    fn fill_next(&mut self) -> Result<Option<ReadShard>> {
        loop {
            if let Some(contig) = self.current.as_mut() {
                let mut shard = ReadShard::new(
                    Arc::clone(&self.source),
                    contig.pointer.clone(),
                    self.source.config().read_buffer_size,
                );
                shard.fill(&mut contig.stream, self.source.sort_order())?;
                if !shard.is_buffer_empty() {
                    return Ok(Some(shard));
                }
                self.current = None;
            }

            match self.next_contig() {
                Some(contig) => self.current = Some(contig?),
                None => return Ok(None),
            }
        }
    }
}

impl<I> Iterator for ReadShardBalancer<I>
where
    I: Iterator<Item = Result<FilePointer>>,
{
    type Item = Result<Shard>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fill_next() {
            Ok(Some(shard)) => {
                tracing::debug!("read shard of {} reads", shard.reads().len());
                Some(Ok(Shard::Read(shard)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::shard::ShardKind;
    use crate::index::{Chunk, FileSpan, VirtualOffset};
    use crate::interval::{GenomeLoc, IntervalMergingRule, SequenceDictionary};
    use crate::record::{AlignmentRecord, SortOrder};
    use crate::storage::{ReaderId, ReaderInfo, RecordIterator, RecordSource};
    use std::collections::BTreeMap;

    struct MemorySource(Vec<AlignmentRecord>);

    impl RecordSource for MemorySource {
        fn records(&self, _reader: &ReaderId, _span: &FileSpan) -> Result<RecordIterator> {
            Ok(Box::new(self.0.clone().into_iter().map(Ok)))
        }
    }

    fn source(records: Vec<AlignmentRecord>, read_buffer_size: usize) -> Arc<DataSource> {
        sorted_source(records, read_buffer_size, SortOrder::Coordinate)
    }

    fn sorted_source(records: Vec<AlignmentRecord>, read_buffer_size: usize, sort_order: SortOrder) -> Arc<DataSource> {
        let info = ReaderInfo {
            id: ReaderId::new("sample.bam"),
            dictionary: SequenceDictionary::new([("chr1", 1000), ("chr2", 1000)]),
            sort_order,
            header_end: VirtualOffset::new(0, 100),
            index_path: None,
        };
        let config = EngineConfig {
            read_buffer_size,
            ..EngineConfig::default()
        };
        Arc::new(
            DataSource::with_record_source(vec![info], Arc::new(MemorySource(records)), config).unwrap(),
        )
    }

    fn pointer(location: GenomeLoc, block: u64) -> FilePointer {
        let spans = BTreeMap::from([(
            ReaderId::new("sample.bam"),
            FileSpan::new(vec![Chunk::new(block << 16, (block + 1) << 16)]),
        )]);
        FilePointer::with_spans(spans, IntervalMergingRule::All, vec![location]).unwrap()
    }

    fn loc(source: &DataSource, contig: &str, start: u32, stop: u32) -> GenomeLoc {
        source.parser().create_genome_loc(contig, start, stop).unwrap()
    }

    fn pointers(source: &DataSource) -> Vec<FilePointer> {
        vec![
            pointer(loc(source, "chr1", 1, 50), 1),
            pointer(loc(source, "chr1", 51, 100), 2),
            pointer(loc(source, "chr2", 1, 100), 3),
        ]
    }

    fn reads() -> Vec<AlignmentRecord> {
        vec![
            AlignmentRecord::new("r1", Some(0), Some(1)),
            AlignmentRecord::new("r2", Some(0), Some(2)),
            AlignmentRecord::new("r3", Some(0), Some(2)),
            AlignmentRecord::new("r4", Some(0), Some(2)),
            AlignmentRecord::new("r5", Some(0), Some(60)),
            AlignmentRecord::new("r6", Some(1), Some(5)),
        ]
    }

    #[test]
    fn test_locus_balancer_emits_one_shard_per_pointer() {
        let source = source(reads(), 10);
        let pointers = pointers(&source);
        let shards: Vec<Shard> = LocusShardBalancer::new(Arc::clone(&source), pointers.clone().into_iter().map(Ok))
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(shards.len(), 3);
        for (shard, expected) in shards.iter().zip(&pointers) {
            assert_eq!(shard.kind(), ShardKind::Locus);
            assert_eq!(shard.pointer(), expected);
            assert!(shard.reads().is_none());
        }
    }

    #[test]
    fn test_active_region_balancer_unions_per_contig() {
        let source = source(reads(), 10);
        let mut pointers = pointers(&source);
        pointers.push(pointer(GenomeLoc::unmapped(), 4));
        pointers.push(pointer(GenomeLoc::unmapped(), 5));

        let shards: Vec<Shard> = ActiveRegionShardBalancer::new(Arc::clone(&source), pointers.into_iter().map(Ok))
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].locations(), &[loc(&source, "chr1", 1, 100)]);
        assert_eq!(
            shards[0].file_spans()[&ReaderId::new("sample.bam")].chunks().len(),
            1,
            "adjacent chunks coalesce"
        );
        assert_eq!(shards[1].locations(), &[loc(&source, "chr2", 1, 100)]);
        assert!(shards[2].is_unmapped());
    }

    #[test]
    fn test_read_balancer_keeps_position_runs_together() {
        let source = source(reads(), 2);
        let shards: Vec<Shard> = ReadShardBalancer::new(Arc::clone(&source), pointers(&source).into_iter().map(Ok))
            .collect::<Result<_>>()
            .unwrap();

        let names: Vec<Vec<&str>> = shards
            .iter()
            .map(|shard| shard.reads().unwrap().iter().map(|r| r.name.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["r1", "r2", "r3", "r4"], vec!["r5"], vec!["r6"]]);
        assert!(shards.iter().all(|shard| shard.kind() == ShardKind::Read));
    }

    #[test]
    fn test_read_balancer_keeps_name_runs_together() {
        let records = vec![
            AlignmentRecord::new("a", Some(0), Some(5)),
            AlignmentRecord::new("a", Some(0), Some(50)),
            AlignmentRecord::new("b", Some(0), Some(10)),
            AlignmentRecord::new("b", Some(0), Some(12)),
            AlignmentRecord::new("b", Some(0), Some(90)),
            AlignmentRecord::new("c", Some(0), Some(20)),
        ];
        let source = sorted_source(records, 1, SortOrder::QueryName);
        let pointers = vec![pointer(loc(&source, "chr1", 1, 1000), 1)];
        let shards: Vec<Shard> = ReadShardBalancer::new(Arc::clone(&source), pointers.into_iter().map(Ok))
            .collect::<Result<_>>()
            .unwrap();

        let names: Vec<Vec<&str>> = shards
            .iter()
            .map(|shard| shard.reads().unwrap().iter().map(|r| r.name.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["a", "a"], vec!["b", "b", "b"], vec!["c"]]);
    }

    #[test]
    fn test_read_balancer_flushes_metrics_on_close() {
        let source = source(reads(), 100);
        for shard in ReadShardBalancer::new(Arc::clone(&source), pointers(&source).into_iter().map(Ok)) {
            shard.unwrap().close();
        }
        assert_eq!(source.cumulative_metrics().reads_passed, 6);
    }

    #[test]
    fn test_read_balancer_rejects_pointers_after_monolithic() {
        let source = source(reads(), 100);
        let monolithic = FilePointer::monolithic(
            source.initial_reader_positions(),
            IntervalMergingRule::All,
            Vec::new(),
        );
        let pointers = vec![monolithic.clone(), monolithic];
        let mut balancer = ReadShardBalancer::new(Arc::clone(&source), pointers.into_iter().map(Ok));

        assert!(matches!(balancer.next(), Some(Err(Error::Internal(_)))));
        assert!(balancer.next().is_none());
    }

    #[test]
    fn test_read_balancer_rejects_mapped_pointer_after_monolithic() {
        let source = source(reads(), 100);
        let monolithic = FilePointer::monolithic(
            source.initial_reader_positions(),
            IntervalMergingRule::All,
            vec![loc(&source, "chr1", 1, 1000)],
        );
        let pointers = vec![monolithic, pointer(loc(&source, "chr1", 1, 50), 1)];

        let result: Result<Vec<Shard>> =
            ReadShardBalancer::new(Arc::clone(&source), pointers.into_iter().map(Ok)).collect();
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[test]
    fn test_monolithic_pointer_is_never_grouped() {
        let source = source(reads(), 100);
        let monolithic = FilePointer::monolithic(
            source.initial_reader_positions(),
            IntervalMergingRule::All,
            vec![loc(&source, "chr1", 1, 1000)],
        );
        let mut pointers = vec![monolithic, pointer(loc(&source, "chr1", 1, 50), 1)]
            .into_iter()
            .map(Ok)
            .peekable();

        let first = next_contig_group(&mut pointers).unwrap().unwrap();
        assert!(first.is_monolithic());
        assert_eq!(first.locations().len(), 1);
        assert!(pointers.peek().is_some());
    }

    #[test]
    fn test_read_balancer_over_monolithic_pointer() {
        let source = source(reads(), 100);
        let monolithic = FilePointer::monolithic(
            source.initial_reader_positions(),
            IntervalMergingRule::All,
            Vec::new(),
        );
        let shards: Vec<Shard> = ReadShardBalancer::new(Arc::clone(&source), std::iter::once(Ok(monolithic)))
            .collect::<Result<_>>()
            .unwrap();

        // a shard never spans contigs
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].reads().unwrap().len(), 5);
        assert_eq!(shards[1].reads().unwrap().len(), 1);
    }
}
