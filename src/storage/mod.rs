//! Access to the alignment files being sharded.
//!
//! A [`DataSource`] owns the set of input files, their merged sequence
//! dictionary and the [`RecordSource`] used to pull records out of the byte
//! ranges chosen by the scheduler. Two record sources are provided:
//!
//! - [`LocalStorage`] - seeks each chunk with a synchronous BGZF reader
//! - [`BlockDrivenSource`] - decodes from blocks inflated by background
//!   loader threads
//!
//! # Example
//!
//! ```no_run
//! use bamshard::config::EngineConfig;
//! use bamshard::storage::DataSource;
//! use std::path::PathBuf;
//!
//! let source = DataSource::open(vec![PathBuf::from("sample.bam")], EngineConfig::default())?;
//! println!("{} contigs", source.dictionary().len());
//! # Ok::<(), bamshard::Error>(())
//! ```

mod bgzf;
mod dispatcher;
mod handles;
mod local;
mod source;
mod stream;

pub use bgzf::{Block, read_block};
pub use dispatcher::BlockLoadingDispatcher;
pub use handles::{FileHandle, FileHandleCache};
pub use local::LocalStorage;
pub use source::DataSource;
pub use stream::{BlockDrivenSource, BlockInputStream};

use crate::Result;
use crate::index::{FileSpan, VirtualOffset};
use crate::interval::SequenceDictionary;
use crate::record::{AlignmentRecord, SortOrder};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of one input file. Readers are ordered by path, which fixes the
/// order of per-reader spans in every file pointer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReaderId(PathBuf);

impl ReaderId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// What the engine knows about an input file after reading its header.
#[derive(Debug, Clone)]
pub struct ReaderInfo {
    pub id: ReaderId,
    pub dictionary: SequenceDictionary,
    pub sort_order: SortOrder,
    /// Virtual offset of the first record.
    pub header_end: VirtualOffset,
    pub index_path: Option<PathBuf>,
}

/// Boxed stream of decoded records.
pub type RecordIterator = Box<dyn Iterator<Item = Result<AlignmentRecord>> + Send>;

/// Decodes the records stored in a span of one input file.
pub trait RecordSource: Send + Sync {
    fn records(&self, reader: &ReaderId, span: &FileSpan) -> Result<RecordIterator>;
}
