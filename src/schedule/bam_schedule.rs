use crate::index::{
    BamIndex, Chunk, FileSpan, MAX_BINS, first_bin_in_lowest_level, first_locus_in_bin,
    last_locus_in_bin,
};
use crate::interval::GenomeLoc;
use crate::storage::ReaderId;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};

const BIN_HEADER_SIZE: usize = 12;
const CHUNK_SIZE: usize = 16;

/// Byte ranges, per reader, for one lowest-level bin of the genome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BamScheduleEntry {
    pub start: u32,
    pub stop: u32,
    pub file_spans: BTreeMap<ReaderId, FileSpan>,
}

impl BamScheduleEntry {
    pub fn new(start: u32, stop: u32) -> Self {
        Self {
            start,
            stop,
            file_spans: BTreeMap::new(),
        }
    }

    pub fn add_file_span(&mut self, reader: ReaderId, span: FileSpan) {
        self.file_spans.insert(reader, span);
    }

    /// Absorb the spans of another entry. Both entries must cover disjoint readers.
    pub fn merge_into(&mut self, other: &BamScheduleEntry) -> Result<()> {
        for (reader, span) in &other.file_spans {
            if self.file_spans.insert(reader.clone(), span.clone()).is_some() {
                return Err(Error::Internal(format!(
                    "unable to handle overlaps when merging BAM schedule entries for {reader}"
                )));
            }
        }
        Ok(())
    }

    pub fn is_before(&self, locus: &GenomeLoc) -> bool {
        self.stop < locus.start()
    }

    pub fn overlaps(&self, locus: &GenomeLoc) -> bool {
        !(locus.stop() < self.start || locus.start() > self.stop)
    }
}

/// Schedule of overlapping bins for one contig, spilled to a scratch file.
///
/// For each reader, every lowest-level bin overlapping the requested
/// intervals is resolved against the index and written as a little-endian
/// record `{i32 start, i32 stop, i32 n, n * (i64 chunk start, i64 chunk end)}`.
/// Entries are then streamed back, merging readers by bin start. The scratch
/// file is unlinked on creation and disappears when the schedule is dropped.
pub struct BamSchedule {
    file: File,
    readers: Vec<ReaderId>,
    cursors: Vec<ScheduleCursor>,
    next_entry: Option<BamScheduleEntry>,
}

impl BamSchedule {
    pub fn new(
        indices: &mut BTreeMap<ReaderId, BamIndex>,
        reference_index: usize,
        intervals: &[GenomeLoc],
    ) -> Result<Self> {
        if intervals.is_empty() {
            return Err(Error::Internal(
                "tried to write schedule for empty interval list".to_string(),
            ));
        }

        let file = tempfile::tempfile().map_err(|e| {
            Error::InvalidConfig(format!(
                "unable to create a temporary BAM schedule file, check that the temp directory is writable: {e}"
            ))
        })?;
        let mut writer = BufWriter::new(file);
        let mut position = 0u64;

        let mut readers = Vec::with_capacity(indices.len());
        let mut cursors = Vec::with_capacity(indices.len());

        for (reader, index) in indices.iter_mut() {
            let data = index.read_reference_sequence(reference_index)?;
            let start_position = position;

            let mut bin = first_bin_in_lowest_level();
            let mut loci = intervals.iter();
            let mut current = loci.next();

            while let Some(locus) = current {
                if bin >= MAX_BINS {
                    break;
                }
                let (Some(bin_start), Some(bin_stop)) = (first_locus_in_bin(bin), last_locus_in_bin(bin)) else {
                    return Err(Error::Internal(format!("invalid lowest level bin {bin}")));
                };

                if bin_stop < locus.start() {
                    bin += 1;
                    continue;
                }
                if bin_start > locus.stop() {
                    current = loci.next();
                    continue;
                }

                let span = data.span_overlapping(bin)?;
                if !span.is_empty() {
                    position += write_entry(&mut writer, bin_start, bin_stop, span.chunks())?;
                }
                bin += 1;
            }

            tracing::trace!(
                "scheduled {} bytes of bins for {} on reference {}",
                position - start_position,
                reader,
                reference_index
            );

            readers.push(reader.clone());
            cursors.push(ScheduleCursor {
                reader: reader.clone(),
                position: start_position,
                stop: position,
                peeked: None,
            });
        }

        let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;

        let mut schedule = Self {
            file,
            readers,
            cursors,
            next_entry: None,
        };
        schedule.advance()?;
        Ok(schedule)
    }

    pub fn peek(&self) -> Option<&BamScheduleEntry> {
        self.next_entry.as_ref()
    }

    /// Take the current entry and load the following one.
    pub fn next_entry(&mut self) -> Result<Option<BamScheduleEntry>> {
        let current = self.next_entry.take();
        if current.is_some() {
            self.advance()?;
        }
        Ok(current)
    }

    fn advance(&mut self) -> Result<()> {
        self.next_entry = None;

        let mut selected: Vec<usize> = Vec::new();
        let mut current_start = u32::MAX;
        let mut current_stop = u32::MAX;

        for (i, cursor) in self.cursors.iter_mut().enumerate() {
            let Some(entry) = cursor.peek(&mut self.file)? else {
                continue;
            };
            if entry.start > current_start {
                continue;
            }
            if entry.start == current_start {
                selected.push(i);
                current_stop = current_stop.min(entry.stop);
                continue;
            }
            selected.clear();
            selected.push(i);
            current_start = entry.start;
            current_stop = entry.stop;
        }

        if selected.is_empty() {
            return Ok(());
        }

        let mut merged = BamScheduleEntry::new(current_start, current_stop);
        for &i in &selected {
            let cursor = &mut self.cursors[i];
            let Some(entry) = cursor.peeked.as_ref() else {
                continue;
            };
            merged.merge_into(entry)?;
            if entry.stop <= current_stop {
                cursor.peeked = None;
            }
        }
        for (i, reader) in self.readers.iter().enumerate() {
            if !selected.contains(&i) {
                merged.add_file_span(reader.clone(), FileSpan::empty());
            }
        }

        self.next_entry = Some(merged);
        Ok(())
    }
}

/// Read position of one reader's section of the scratch file.
struct ScheduleCursor {
    reader: ReaderId,
    position: u64,
    stop: u64,
    peeked: Option<BamScheduleEntry>,
}

impl ScheduleCursor {
    fn peek(&mut self, file: &mut File) -> Result<Option<&BamScheduleEntry>> {
        if self.peeked.is_none() && self.position < self.stop {
            self.peeked = Some(self.read_entry(file)?);
        }
        Ok(self.peeked.as_ref())
    }

    fn read_entry(&mut self, file: &mut File) -> Result<BamScheduleEntry> {
        file.seek(SeekFrom::Start(self.position))?;

        let mut header = [0u8; BIN_HEADER_SIZE];
        file.read_exact(&mut header).map_err(|e| {
            Error::Internal(format!(
                "unable to read a complete bin header from BAM schedule file for {}; the schedule file is likely incomplete or corrupt ({e})",
                self.reader
            ))
        })?;
        let start = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let stop = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let chunk_count = i32::from_le_bytes([header[8], header[9], header[10], header[11]]);

        let chunk_count = usize::try_from(chunk_count)
            .map_err(|_| Error::Internal(format!("negative chunk count {chunk_count} in BAM schedule file")))?;
        let mut data = vec![0u8; chunk_count * CHUNK_SIZE];
        file.read_exact(&mut data).map_err(|e| {
            Error::Internal(format!("unable to read all chunks from BAM schedule file for {}: {e}", self.reader))
        })?;

        let chunks = data
            .chunks_exact(CHUNK_SIZE)
            .map(|raw| {
                let (start, end) = raw.split_at(8);
                Chunk::new(
                    u64::from_le_bytes(start.try_into().unwrap_or_default()),
                    u64::from_le_bytes(end.try_into().unwrap_or_default()),
                )
            })
            .collect();

        self.position += (BIN_HEADER_SIZE + data.len()) as u64;

        let mut entry = BamScheduleEntry::new(start as u32, stop as u32);
        entry.add_file_span(self.reader.clone(), FileSpan::from_coalesced(chunks));
        Ok(entry)
    }
}

fn write_entry<W: Write>(writer: &mut W, start: u32, stop: u32, chunks: &[Chunk]) -> Result<u64> {
    writer.write_all(&(start as i32).to_le_bytes())?;
    writer.write_all(&(stop as i32).to_le_bytes())?;
    writer.write_all(&(chunks.len() as i32).to_le_bytes())?;
    for chunk in chunks {
        writer.write_all(&(chunk.start.as_raw() as i64).to_le_bytes())?;
        writer.write_all(&(chunk.end.as_raw() as i64).to_le_bytes())?;
    }
    Ok((BIN_HEADER_SIZE + chunks.len() * CHUNK_SIZE) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::VirtualOffset;
    use crate::interval::{GenomeLocParser, SequenceDictionary};

    fn chunk(s: u64, e: u64) -> Chunk {
        Chunk::new(VirtualOffset::new(s, 0), VirtualOffset::new(e, 0))
    }

    #[test]
    fn test_entry_overlap_tests() {
        let parser = GenomeLocParser::new(SequenceDictionary::new([("chr1", 100_000)]));
        let entry = BamScheduleEntry::new(16385, 32768);
        assert!(entry.is_before(&parser.parse("chr1:40000-50000").unwrap()));
        assert!(entry.overlaps(&parser.parse("chr1:30000-40000").unwrap()));
        assert!(!entry.overlaps(&parser.parse("chr1:1-16384").unwrap()));
    }

    #[test]
    fn test_merge_into_rejects_duplicate_readers() {
        let mut a = BamScheduleEntry::new(1, 16384);
        a.add_file_span(ReaderId::new("a.bam"), FileSpan::new(vec![chunk(1, 2)]));
        let mut b = BamScheduleEntry::new(1, 16384);
        b.add_file_span(ReaderId::new("b.bam"), FileSpan::new(vec![chunk(3, 4)]));

        a.merge_into(&b).unwrap();
        assert_eq!(a.file_spans.len(), 2);
        assert!(a.merge_into(&b).is_err());
    }

    #[test]
    fn test_entry_round_trips_through_scratch_file() {
        let mut file = tempfile::tempfile().unwrap();
        let written = write_entry(&mut file, 16385, 32768, &[chunk(10, 20), chunk(30, 40)]).unwrap();
        assert_eq!(written, 12 + 32);

        let mut cursor = ScheduleCursor {
            reader: ReaderId::new("a.bam"),
            position: 0,
            stop: written,
            peeked: None,
        };
        let entry = cursor.peek(&mut file).unwrap().cloned().unwrap();
        assert_eq!((entry.start, entry.stop), (16385, 32768));
        assert_eq!(entry.file_spans[&ReaderId::new("a.bam")].chunks(), &[chunk(10, 20), chunk(30, 40)]);
        assert_eq!(cursor.position, written);
    }
}
