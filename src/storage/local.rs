use super::{ReaderId, ReaderInfo, RecordIterator, RecordSource};
use crate::index::{Chunk, FileSpan, VirtualOffset};
use crate::interval::SequenceDictionary;
use crate::record::{AlignmentRecord, SortOrder};
use crate::{Error, Result};
use noodles::{bam, bgzf};
use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Input files on the local filesystem, read synchronously.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }

    /// Read the header of `path` and locate its index.
    pub fn open_reader(path: &Path) -> Result<ReaderInfo> {
        let file = File::open(path)?;

        // bam::io::Reader::new wraps the file in BGZF internally - don't double-wrap
        let mut reader = bam::io::Reader::new(file);
        let header = reader.read_header().map_err(|e| Error::MalformedBam {
            path: path.to_path_buf(),
            message: format!("failed to read BAM header: {}", e),
        })?;
        let header_end = VirtualOffset::from(reader.get_ref().virtual_position());

        let dictionary = SequenceDictionary::new(
            header
                .reference_sequences()
                .iter()
                .map(|(name, sequence)| (name.to_string(), sequence.length().get() as u32)),
        );

        let info = ReaderInfo {
            id: ReaderId::new(path),
            dictionary,
            sort_order: SortOrder::from_header(&header),
            header_end,
            index_path: Self::index_path(path),
        };
        tracing::info!(
            "opened {} ({} contigs, sort order {:?}, index {})",
            path.display(),
            info.dictionary.len(),
            info.sort_order,
            info.index_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        Ok(info)
    }

    /// Index beside the BAM file: appended (`x.bam.bai`) first, then replaced
    /// extension (`x.bai`).
    pub fn index_path(path: &Path) -> Option<PathBuf> {
        let appended_idx = PathBuf::from(format!("{}.bai", path.display()));
        if appended_idx.exists() {
            return Some(appended_idx);
        }

        let replaced_idx = path.with_extension("bai");
        if replaced_idx.exists() {
            return Some(replaced_idx);
        }

        None
    }
}

impl RecordSource for LocalStorage {
    fn records(&self, reader: &ReaderId, span: &FileSpan) -> Result<RecordIterator> {
        let file = File::open(reader.path())?;
        Ok(Box::new(ChunkRecordIterator {
            path: reader.path().to_path_buf(),
            reader: bam::io::Reader::new(file),
            record: bam::Record::default(),
            chunks: span.chunks().iter().copied().collect(),
            current_end: None,
        }))
    }
}

/// Seeks to each chunk in turn and decodes records until the chunk end.
struct ChunkRecordIterator {
    path: PathBuf,
    reader: bam::io::Reader<bgzf::Reader<File>>,
    record: bam::Record,
    chunks: VecDeque<Chunk>,
    current_end: Option<VirtualOffset>,
}

impl ChunkRecordIterator {
    fn fail(&mut self, message: String) -> Option<Result<AlignmentRecord>> {
        self.chunks.clear();
        self.current_end = None;
        Some(Err(Error::MalformedBam {
            path: self.path.clone(),
            message,
        }))
    }
}

impl Iterator for ChunkRecordIterator {
    type Item = Result<AlignmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(end) = self.current_end {
                let position = VirtualOffset::from(self.reader.get_ref().virtual_position());
                if position < end {
                    match self.reader.read_record(&mut self.record) {
                        Ok(0) => {}
                        Ok(_) => match AlignmentRecord::from_bam(&self.record, position) {
                            Ok(record) => return Some(Ok(record)),
                            Err(e) => return self.fail(format!("invalid record at {}: {}", position, e)),
                        },
                        Err(e) => return self.fail(format!("failed to read record at {}: {}", position, e)),
                    }
                }
                self.current_end = None;
            }

            let chunk = self.chunks.pop_front()?;
            if let Err(e) = self.reader.get_mut().seek(bgzf::VirtualPosition::from(chunk.start)) {
                return self.fail(format!("failed to seek to {}: {}", chunk.start, e));
            }
            self.current_end = Some(chunk.end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_index_path_prefers_appended_extension() {
        let dir = TempDir::new().unwrap();
        let bam = dir.path().join("sample.bam");
        std::fs::write(&bam, b"").unwrap();
        assert_eq!(LocalStorage::index_path(&bam), None);

        let replaced = dir.path().join("sample.bai");
        std::fs::write(&replaced, b"").unwrap();
        assert_eq!(LocalStorage::index_path(&bam), Some(replaced));

        let appended = dir.path().join("sample.bam.bai");
        std::fs::write(&appended, b"").unwrap();
        assert_eq!(LocalStorage::index_path(&bam), Some(appended));
    }

    #[test]
    fn test_open_reader_rejects_non_bam() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.bam");
        std::fs::write(&path, b"not a bam file").unwrap();
        assert!(LocalStorage::open_reader(&path).is_err());
    }
}
