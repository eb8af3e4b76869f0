use super::{Bin, BamIndexData, Chunk, LinearIndex, VirtualOffset};
use crate::interval::SequenceDictionary;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const BAM_INDEX_MAGIC: &[u8; 4] = b"BAI\x01";
const BUFFERED_STREAM_BUFFER_SIZE: usize = 8192;

/// Reader for a BAI file that decodes reference sequences on demand.
///
/// Sequences are variable length, so locating sequence `n` means walking
/// every sequence before it. The start offset of each sequence walked past is
/// cached so later lookups resume from the closest known position.
///
/// Not thread-safe: a `BamIndex` is owned by the single thread building a
/// schedule.
#[derive(Debug)]
pub struct BamIndex {
    path: PathBuf,
    sequence_count: usize,
    sequence_start_cache: Vec<Option<u64>>,
}

impl BamIndex {
    /// Open an index and validate its magic number.
    pub fn open(path: impl AsRef<Path>, dictionary: &SequenceDictionary) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut cursor = IndexCursor::open(&path)?;

        let magic = cursor.read_bytes::<4>()?;
        if &magic != BAM_INDEX_MAGIC {
            return Err(Error::malformed_index(
                &path,
                format!("invalid file header {:?}", String::from_utf8_lossy(&magic)),
            ));
        }

        let sequence_count = cursor.read_count()?;
        if sequence_count != dictionary.len() {
            tracing::warn!(
                "index {:?} covers {} sequences but the sequence dictionary has {}",
                path,
                sequence_count,
                dictionary.len()
            );
        }

        let mut sequence_start_cache = vec![None; sequence_count];
        if let Some(first) = sequence_start_cache.first_mut() {
            *first = Some(cursor.position);
        }

        tracing::debug!("opened index {:?} with {} sequences", path, sequence_count);

        Ok(Self {
            path,
            sequence_count,
            sequence_start_cache,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sequence_count(&self) -> usize {
        self.sequence_count
    }

    /// Decode the bins and linear index of one reference sequence.
    pub fn read_reference_sequence(&mut self, reference_index: usize) -> Result<BamIndexData> {
        if reference_index >= self.sequence_count {
            return Err(Error::Internal(format!(
                "invalid sequence number {} in index file {:?}",
                reference_index, self.path
            )));
        }

        let path = self.path.clone();
        let mut cursor = IndexCursor::open(&path)?;
        self.skip_to_sequence(&mut cursor, reference_index)?;

        let bin_count = cursor.read_count()?;
        let mut bins = BTreeMap::new();
        for _ in 0..bin_count {
            let number = cursor.read_u32()?;
            let chunk_count = cursor.read_count()?;
            let mut chunks = Vec::with_capacity(chunk_count);
            for _ in 0..chunk_count {
                let start = cursor.read_u64()?;
                let end = cursor.read_u64()?;
                chunks.push(Chunk::new(start, end));
            }
            bins.insert(number, Bin::new(reference_index, number, chunks));
        }

        let linear_count = cursor.read_count()?;
        let mut entries = Vec::with_capacity(linear_count);
        for _ in 0..linear_count {
            entries.push(VirtualOffset::from(cursor.read_u64()?));
        }

        Ok(BamIndexData::new(
            reference_index,
            bins,
            LinearIndex::new(reference_index, 0, entries),
        ))
    }

    /// Offset of the first record in the last linear bin of the last
    /// sequence with any linear entries. Unmapped reads without a position
    /// are written after this point.
    pub fn start_of_last_linear_bin(&self) -> Result<Option<VirtualOffset>> {
        let mut cursor = IndexCursor::open(&self.path)?;
        cursor.seek(4)?;

        let sequence_count = cursor.read_count()?;
        let mut last = None;
        for _ in 0..sequence_count {
            cursor.skip_bins()?;
            let linear_count = cursor.read_count()?;
            if linear_count > 0 {
                cursor.skip(8 * (linear_count as u64 - 1))?;
                last = Some(VirtualOffset::from(cursor.read_u64()?));
            }
        }
        Ok(last)
    }

    fn skip_to_sequence(&mut self, cursor: &mut IndexCursor, reference_index: usize) -> Result<()> {
        let mut sequence_index = reference_index;
        let start = loop {
            if let Some(start) = self.sequence_start_cache[sequence_index] {
                break start;
            }
            if sequence_index == 0 {
                return Err(Error::Internal(format!(
                    "missing start of first sequence in index file {:?}",
                    self.path
                )));
            }
            sequence_index -= 1;
        };

        cursor.seek(start)?;
        for i in sequence_index..reference_index {
            self.sequence_start_cache[i] = Some(cursor.position);
            cursor.skip_bins()?;
            let linear_count = cursor.read_count()?;
            cursor.skip(8 * linear_count as u64)?;
        }
        self.sequence_start_cache[reference_index] = Some(cursor.position);
        Ok(())
    }
}

/// Position-tracking reader that refuses to read past the end of the file.
struct IndexCursor<'a> {
    path: &'a Path,
    reader: BufReader<File>,
    position: u64,
    length: u64,
}

impl<'a> IndexCursor<'a> {
    fn open(path: &'a Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::malformed_index(path, format!("unable to open index file ({e})"))
        })?;
        let length = file.metadata()?.len();
        Ok(Self {
            path,
            reader: BufReader::with_capacity(BUFFERED_STREAM_BUFFER_SIZE, file),
            position: 0,
            length,
        })
    }

    fn ensure_available(&self, requested: u64) -> Result<()> {
        if requested > self.length.saturating_sub(self.position) {
            return Err(Error::malformed_index(
                self.path,
                format!(
                    "premature end-of-file while reading BAM index file (needed {} bytes at offset {})",
                    requested, self.position
                ),
            ));
        }
        Ok(())
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }

    fn skip(&mut self, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.ensure_available(count)?;
        self.reader.seek_relative(count as i64)?;
        self.position += count;
        Ok(())
    }

    fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure_available(N as u64)?;
        let mut buf = [0u8; N];
        self.reader.read_exact(&mut buf).map_err(|e| {
            Error::malformed_index(self.path, format!("premature end-of-file ({e})"))
        })?;
        self.position += N as u64;
        Ok(buf)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_bytes::<4>()?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_bytes::<8>()?))
    }

    /// Read a signed 32-bit element count.
    fn read_count(&mut self) -> Result<usize> {
        let count = i32::from_le_bytes(self.read_bytes::<4>()?);
        usize::try_from(count).map_err(|_| {
            Error::malformed_index(self.path, format!("negative element count {count} at offset {}", self.position - 4))
        })
    }

    fn skip_bins(&mut self) -> Result<()> {
        let bin_count = self.read_count()?;
        for _ in 0..bin_count {
            self.skip(4)?;
            let chunk_count = self.read_count()?;
            self.skip(16 * chunk_count as u64)?;
        }
        Ok(())
    }
}
