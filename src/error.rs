use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "malformed BAM index {path}: {message}. It's likely that this file is truncated or corrupt -- please try re-indexing the corresponding BAM file"
    )]
    MalformedIndex { path: PathBuf, message: String },

    #[error("malformed BGZF block in {source_name} at offset {offset}: {message}. Please regenerate the input file")]
    MalformedBlock {
        source_name: String,
        offset: u64,
        message: String,
    },

    #[error("malformed BAM file {path}: {message}")]
    MalformedBam { path: PathBuf, message: String },

    #[error("contig {contig} not present in sequence dictionary for merged BAM header: [{available}]")]
    ContigNotFound { contig: String, available: String },

    #[error("empty interval list: at least one interval is required")]
    EmptyIntervals,

    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("thread {thread}, block stream {stream}: unable to retrieve BAM data from disk: {message}")]
    AsyncIo {
        thread: String,
        stream: String,
        message: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable name for the error category, used in log output.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::MalformedIndex { .. } => "MalformedIndex",
            Error::MalformedBlock { .. } => "MalformedBlock",
            Error::MalformedBam { .. } => "MalformedBam",
            Error::ContigNotFound { .. } => "ContigNotFound",
            Error::EmptyIntervals => "EmptyIntervals",
            Error::InvalidInterval(_) => "InvalidInterval",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::InvalidInput(_) => "InvalidInput",
            Error::AsyncIo { .. } => "AsyncIoError",
            Error::Io(_) | Error::Internal(_) => "InternalError",
        }
    }

    /// True when the user can fix the failure (bad input, bad index, bad
    /// arguments); false for engine bugs and raw I/O failures.
    pub fn is_user_error(&self) -> bool {
        match self {
            Error::MalformedIndex { .. }
            | Error::MalformedBlock { .. }
            | Error::MalformedBam { .. }
            | Error::ContigNotFound { .. }
            | Error::EmptyIntervals
            | Error::InvalidInterval(_)
            | Error::InvalidConfig(_)
            | Error::InvalidInput(_) => true,
            Error::AsyncIo { .. } | Error::Io(_) | Error::Internal(_) => false,
        }
    }

    pub(crate) fn malformed_index(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::MalformedIndex {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => std::io::Error::other(other),
        }
    }
}

/// Recover a crate error that was tunnelled through `std::io::Error`, as
/// happens when a [`crate::storage::BlockInputStream`] is read through
/// `std::io::Read`.
pub(crate) fn from_io(err: std::io::Error) -> Error {
    if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
        match err.into_inner() {
            Some(inner) => match inner.downcast::<Error>() {
                Ok(e) => *e,
                Err(inner) => Error::Io(std::io::Error::other(inner)),
            },
            None => Error::Internal("io error without payload".to_string()),
        }
    } else {
        Error::Io(err)
    }
}
