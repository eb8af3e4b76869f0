//! Scheduling file pointers from synthetic BAM indices.

mod common;

use bamshard::config::EngineConfig;
use bamshard::index::{Chunk, VirtualOffset};
use bamshard::interval::{GenomeLoc, GenomeLocParser, GenomeLocSortedSet, IntervalMergingRule, SequenceDictionary};
use bamshard::schedule::{BamScheduler, FilePointer, IntervalSharder};
use bamshard::storage::{DataSource, ReaderId};
use bamshard::{Error, Result};
use common::{IndexedSequence, block, indexed_source};
use tempfile::TempDir;

/// chr1 has data in its first two 16 kb bins, chr2 in its first.
fn two_bin_index() -> Vec<IndexedSequence> {
    vec![
        (
            vec![(4681, vec![(block(1), block(2))]), (4682, vec![(block(2), block(3))])],
            vec![block(1), block(2)],
        ),
        (vec![(4681, vec![(block(3), block(4))])], vec![block(3)]),
    ]
}

/// chr1 has data only in its second 16 kb bin.
fn sparse_index() -> Vec<IndexedSequence> {
    vec![
        (vec![(4682, vec![(block(2), block(3))])], vec![block(2), block(2)]),
        (vec![], vec![]),
    ]
}

/// chr1 has data in bins 4681, 4682, 4683, 4685 and 4686, chr2 in 4681 and
/// 4682. Every bin holds one block of its own.
fn scattered_index() -> Vec<IndexedSequence> {
    vec![
        (
            vec![
                (4681, vec![(block(1), block(2))]),
                (4682, vec![(block(2), block(3))]),
                (4683, vec![(block(3), block(4))]),
                (4685, vec![(block(4), block(5))]),
                (4686, vec![(block(5), block(6))]),
            ],
            vec![block(1), block(2), block(3), block(4), block(4), block(5)],
        ),
        (
            vec![(4681, vec![(block(6), block(7))]), (4682, vec![(block(7), block(8))])],
            vec![block(6), block(7)],
        ),
    ]
}

fn loci(source: &DataSource, intervals: &[&str]) -> GenomeLocSortedSet {
    let locs = intervals.iter().map(|i| source.parser().parse(i).unwrap()).collect();
    GenomeLocSortedSet::new(locs, IntervalMergingRule::All)
}

fn schedule(source: &DataSource, intervals: &[&str]) -> Vec<FilePointer> {
    BamScheduler::over_intervals(source, IntervalMergingRule::All, loci(source, intervals))
        .unwrap()
        .collect::<Result<_>>()
        .unwrap()
}

fn locations(pointer: &FilePointer) -> Vec<String> {
    pointer.locations().iter().map(ToString::to_string).collect()
}

fn chunks(pointer: &FilePointer, dir: &TempDir, reader: &str) -> Vec<Chunk> {
    pointer.file_spans()[&ReaderId::new(dir.path().join(reader))].chunks().to_vec()
}

#[test]
fn test_interval_within_one_bin() {
    let dir = TempDir::new().unwrap();
    let index = two_bin_index();
    let source = indexed_source(&dir, &[("a.bam", Some(&index))], EngineConfig::default());

    let pointers = schedule(&source, &["chr1:100-200"]);
    assert_eq!(pointers.len(), 1);
    assert_eq!(locations(&pointers[0]), vec!["chr1:100-200"]);
    assert_eq!(chunks(&pointers[0], &dir, "a.bam"), vec![Chunk::new(block(1), block(2))]);
    assert!(!pointers[0].is_monolithic());
}

#[test]
fn test_loci_sharing_a_bin_share_a_pointer() {
    let dir = TempDir::new().unwrap();
    let index = two_bin_index();
    let source = indexed_source(&dir, &[("a.bam", Some(&index))], EngineConfig::default());

    let pointers = schedule(&source, &["chr1:100-200", "chr1:300-400"]);
    assert_eq!(pointers.len(), 1);
    assert_eq!(locations(&pointers[0]), vec!["chr1:100-200", "chr1:300-400"]);
}

#[test]
fn test_interval_is_split_at_bin_boundaries() {
    let dir = TempDir::new().unwrap();
    let index = two_bin_index();
    let source = indexed_source(&dir, &[("a.bam", Some(&index))], EngineConfig::default());

    let pointers = schedule(&source, &["chr1:100-20000"]);
    assert_eq!(pointers.len(), 2);
    assert_eq!(locations(&pointers[0]), vec!["chr1:100-16384"]);
    assert_eq!(locations(&pointers[1]), vec!["chr1:16385-20000"]);
    assert_eq!(chunks(&pointers[1], &dir, "a.bam"), vec![Chunk::new(block(2), block(3))]);

    // reading the second pointer's bytes would miss the first one's reads
    let sharded: Vec<FilePointer> =
        IntervalSharder::shard_over_intervals(&source, loci(&source, &["chr1:100-20000"]), IntervalMergingRule::All)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
    assert_eq!(sharded.len(), 2);
}

#[test]
fn test_uncovered_prefix_is_split_off_and_absorbed() {
    let dir = TempDir::new().unwrap();
    let index = sparse_index();
    let source = indexed_source(&dir, &[("a.bam", Some(&index))], EngineConfig::default());

    let pointers = schedule(&source, &["chr1:1-20000"]);
    assert_eq!(pointers.len(), 2);
    assert_eq!(locations(&pointers[0]), vec!["chr1:1-16384"]);
    assert!(chunks(&pointers[0], &dir, "a.bam").is_empty());
    assert_eq!(locations(&pointers[1]), vec!["chr1:16385-20000"]);

    let sharded: Vec<FilePointer> =
        IntervalSharder::shard_over_intervals(&source, loci(&source, &["chr1:1-20000"]), IntervalMergingRule::All)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
    assert_eq!(sharded.len(), 1);
    assert_eq!(locations(&sharded[0]), vec!["chr1:1-20000"]);
    assert_eq!(chunks(&sharded[0], &dir, "a.bam"), vec![Chunk::new(block(2), block(3))]);
}

#[test]
fn test_unmapped_pointer_starts_at_last_linear_bin() {
    let dir = TempDir::new().unwrap();
    let index = two_bin_index();
    let source = indexed_source(&dir, &[("a.bam", Some(&index))], EngineConfig::default());

    let pointers = schedule(&source, &["chr2:1-100", "unmapped"]);
    assert_eq!(pointers.len(), 2);
    assert!(!pointers[0].is_region_unmapped());

    let unmapped = &pointers[1];
    assert!(unmapped.is_region_unmapped());
    let span = chunks(unmapped, &dir, "a.bam");
    assert_eq!(span.len(), 1);
    assert_eq!(span[0].start, VirtualOffset::from(block(3)));
    assert_eq!(span[0].end, VirtualOffset::MAX);
}

#[test]
fn test_mapped_reads_cover_every_contig_for_every_reader() {
    let dir = TempDir::new().unwrap();
    let index = two_bin_index();
    let source = indexed_source(
        &dir,
        &[("b.bam", Some(&index)), ("a.bam", Some(&index))],
        EngineConfig::default(),
    );

    let pointers: Vec<FilePointer> = BamScheduler::over_mapped_reads(&source)
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    let all: Vec<Vec<String>> = pointers.iter().map(locations).collect();
    assert_eq!(
        all,
        vec![
            vec!["chr1:1-16384"],
            vec!["chr1:16385-32768"],
            vec!["chr1:32769-100000"],
            vec!["chr2:1-16384"],
            vec!["chr2:16385-100000"],
        ]
    );
    for pointer in &pointers {
        assert_eq!(pointer.file_spans().len(), 2);
    }
    assert_eq!(chunks(&pointers[3], &dir, "b.bam"), vec![Chunk::new(block(3), block(4))]);
}

#[test]
fn test_unindexed_reader_forces_monolithic_pointer() {
    let dir = TempDir::new().unwrap();
    let index = two_bin_index();
    let source = indexed_source(
        &dir,
        &[("a.bam", Some(&index)), ("b.bam", None)],
        EngineConfig::default(),
    );

    let pointers = schedule(&source, &["chr1:100-200", "chr2:1-50"]);
    assert_eq!(pointers.len(), 1);
    let pointer = &pointers[0];
    assert!(pointer.is_monolithic());
    assert_eq!(locations(pointer), vec!["chr1:100-200", "chr2:1-50"]);
    for reader in ["a.bam", "b.bam"] {
        assert_eq!(
            chunks(pointer, &dir, reader),
            vec![Chunk::new(VirtualOffset::new(0, 120), VirtualOffset::MAX)]
        );
    }
}

#[test]
fn test_all_reads_is_one_monolithic_pointer() {
    let dir = TempDir::new().unwrap();
    let index = two_bin_index();
    let source = indexed_source(&dir, &[("a.bam", Some(&index))], EngineConfig::default());

    let pointers: Vec<FilePointer> = BamScheduler::over_all_reads(&source)
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(pointers.len(), 1);
    assert!(pointers[0].is_monolithic());
    assert!(pointers[0].locations().is_empty());
}

#[test]
fn test_empty_interval_list_is_fatal() {
    let dir = TempDir::new().unwrap();
    let index = two_bin_index();
    let source = indexed_source(&dir, &[("a.bam", Some(&index))], EngineConfig::default());

    let result = BamScheduler::over_intervals(&source, IntervalMergingRule::All, GenomeLocSortedSet::default());
    let Err(err) = result else {
        panic!("expected an error");
    };
    assert!(matches!(err, Error::EmptyIntervals));
    assert!(err.to_string().contains("empty interval list"));
}

#[test]
fn test_unknown_contig_is_rejected_at_construction() {
    let dir = TempDir::new().unwrap();
    let index = two_bin_index();
    let source = indexed_source(&dir, &[("a.bam", Some(&index))], EngineConfig::default());

    let other = GenomeLocParser::new(SequenceDictionary::new([("chrX", 1000)]));
    let loci = GenomeLocSortedSet::new(vec![other.parse("chrX:1-10").unwrap()], IntervalMergingRule::All);

    let result = BamScheduler::over_intervals(&source, IntervalMergingRule::All, loci);
    assert!(matches!(result, Err(Error::ContigNotFound { .. })));
}

fn assert_covers(pointers: &[FilePointer], dir: &TempDir, intervals: &[GenomeLoc]) {
    // every bin overlapping the intervals, exactly once per reader
    let expected = vec![
        Chunk::new(block(1), block(2)),
        Chunk::new(block(2), block(3)),
        Chunk::new(block(3), block(4)),
        Chunk::new(block(4), block(5)),
        Chunk::new(block(6), block(7)),
    ];
    for reader in ["a.bam", "b.bam"] {
        let mut scheduled: Vec<Chunk> = pointers.iter().flat_map(|p| chunks(p, dir, reader)).collect();
        scheduled.sort_by_key(|chunk| chunk.start);
        assert_eq!(scheduled, expected, "chunks scheduled for {}", reader);
    }

    let requested: u64 = intervals.iter().map(GenomeLoc::size).sum();
    let located: u64 = pointers.iter().flat_map(|p| p.locations()).map(GenomeLoc::size).sum();
    assert_eq!(located, requested);
    for pair in pointers.windows(2) {
        let last = pair[0].locations().last().unwrap();
        let first = &pair[1].locations()[0];
        assert!(last.contig_index() < first.contig_index() || last.stop() < first.start());
    }
}

#[test]
fn test_pointers_cover_every_overlapping_bin_once() {
    let dir = TempDir::new().unwrap();
    let index = scattered_index();
    let source = indexed_source(
        &dir,
        &[("a.bam", Some(&index)), ("b.bam", Some(&index))],
        EngineConfig::default(),
    );
    let intervals = ["chr1:10000-20000", "chr1:40000-70000", "chr2:1-100"];
    let requested = loci(&source, &intervals);

    let pointers = schedule(&source, &intervals);
    assert_eq!(
        pointers.iter().map(locations).collect::<Vec<_>>(),
        vec![
            vec!["chr1:10000-16384"],
            vec!["chr1:16385-20000"],
            vec!["chr1:40000-49152"],
            vec!["chr1:49153-65536"],
            vec!["chr1:65537-70000"],
            vec!["chr2:1-100"],
        ]
    );
    assert_covers(&pointers, &dir, requested.as_slice());

    let sharded: Vec<FilePointer> =
        IntervalSharder::shard_over_intervals(&source, loci(&source, &intervals), IntervalMergingRule::All)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
    assert_eq!(sharded.len(), 5);
    assert_covers(&sharded, &dir, requested.as_slice());
}
