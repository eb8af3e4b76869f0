//! Shared fixtures: synthetic BAI files, small BAM files and in-memory
//! record sources.

#![allow(dead_code)]

use bamshard::config::EngineConfig;
use bamshard::index::{FileSpan, VirtualOffset};
use bamshard::interval::SequenceDictionary;
use bamshard::record::{AlignmentRecord, SortOrder};
use bamshard::storage::{DataSource, ReaderId, ReaderInfo, RecordIterator, RecordSource};
use bamshard::Result;
use noodles::bam;
use noodles::core::Position;
use noodles::sam;
use noodles::sam::alignment::io::Write as _;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record::cigar::{Op, op::Kind};
use noodles::sam::alignment::RecordBuf;
use noodles::sam::header::record::value::{Map, map::ReferenceSequence};
use std::fs::File;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const CONTIG_LENGTH: u32 = 100_000;

/// One reference sequence of a synthetic index: bins as
/// `(bin, [(chunk start, chunk end)])` and linear index entries.
pub type IndexedSequence = (Vec<(u32, Vec<(u64, u64)>)>, Vec<u64>);

pub fn dictionary() -> SequenceDictionary {
    SequenceDictionary::new([("chr1", CONTIG_LENGTH), ("chr2", CONTIG_LENGTH)])
}

/// Virtual offset at the start of compressed block `block`.
pub fn block(block: u64) -> u64 {
    block << 16
}

pub fn write_index(path: &Path, sequences: &[IndexedSequence]) {
    let mut bytes = b"BAI\x01".to_vec();
    bytes.extend((sequences.len() as i32).to_le_bytes());
    for (bins, linear) in sequences {
        bytes.extend((bins.len() as i32).to_le_bytes());
        for (number, chunks) in bins {
            bytes.extend(number.to_le_bytes());
            bytes.extend((chunks.len() as i32).to_le_bytes());
            for (start, end) in chunks {
                bytes.extend(start.to_le_bytes());
                bytes.extend(end.to_le_bytes());
            }
        }
        bytes.extend((linear.len() as i32).to_le_bytes());
        for entry in linear {
            bytes.extend(entry.to_le_bytes());
        }
    }
    std::fs::write(path, bytes).unwrap();
}

/// Records stored per reader; every span of a reader yields all of them.
pub struct MemorySource(pub Vec<(ReaderId, Vec<AlignmentRecord>)>);

impl RecordSource for MemorySource {
    fn records(&self, reader: &ReaderId, _span: &FileSpan) -> Result<RecordIterator> {
        let records = self
            .0
            .iter()
            .find(|(id, _)| id == reader)
            .map(|(_, records)| records.clone())
            .unwrap_or_default();
        Ok(Box::new(records.into_iter().map(Ok)))
    }
}

/// A data source over readers that exist only as index files in `dir`.
/// Readers given `None` have no index.
pub fn indexed_source(
    dir: &TempDir,
    readers: &[(&str, Option<&[IndexedSequence]>)],
    config: EngineConfig,
) -> Arc<DataSource> {
    let infos = readers
        .iter()
        .map(|(name, sequences)| {
            let path = dir.path().join(name);
            let index_path = sequences.map(|sequences| {
                let index_path = PathBuf::from(format!("{}.bai", path.display()));
                write_index(&index_path, sequences);
                index_path
            });
            ReaderInfo {
                id: ReaderId::new(path),
                dictionary: dictionary(),
                sort_order: SortOrder::Coordinate,
                header_end: VirtualOffset::new(0, 120),
                index_path,
            }
        })
        .collect();
    Arc::new(DataSource::with_record_source(infos, Arc::new(MemorySource(Vec::new())), config).unwrap())
}

/// A read to write into a test BAM: contig index and 1-based start, or
/// `None` for an unplaced, unmapped read.
pub type TestRead = Option<(usize, usize)>;

/// Write a small coordinate-sorted BAM over chr1 and chr2.
pub fn write_bam(path: &Path, reads: &[TestRead]) {
    let length = NonZeroUsize::new(CONTIG_LENGTH as usize).unwrap();
    let header = sam::Header::builder()
        .add_reference_sequence("chr1", Map::<ReferenceSequence>::new(length))
        .add_reference_sequence("chr2", Map::<ReferenceSequence>::new(length))
        .build();

    let mut writer = bam::io::Writer::new(File::create(path).unwrap());
    writer.write_header(&header).unwrap();

    for read in reads {
        let record = match read {
            Some((reference, start)) => RecordBuf::builder()
                .set_flags(Flags::empty())
                .set_reference_sequence_id(*reference)
                .set_alignment_start(Position::try_from(*start).unwrap())
                .set_cigar([Op::new(Kind::Match, 10)].into_iter().collect())
                .build(),
            None => RecordBuf::builder().set_flags(Flags::UNMAPPED).build(),
        };
        writer.write_alignment_record(&header, &record).unwrap();
    }
    writer.try_finish().unwrap();
}
