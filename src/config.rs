use crate::interval::IntervalMergingRule;
use crate::{Error, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;

/// Records buffered per read shard.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 100_000;

/// Read shard buffer size used by older traversals.
pub const LEGACY_READ_BUFFER_SIZE: usize = 10_000;

/// Bases per shard for linear locus traversal.
pub const DEFAULT_LOCUS_SHARD_SIZE: u32 = 16_384;

/// How shards are cut for the downstream traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraversalKind {
    /// Bounded read buffers filled from one stream per contig.
    #[default]
    Reads,
    /// One shard per scheduled file pointer.
    Locus,
    /// One shard per contig.
    ActiveRegion,
    /// Fixed-size genomic windows, without consulting the index.
    LinearLocus,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "bamshard")]
#[command(about = "Plan shards over indexed BAM files")]
pub struct Config {
    /// BAM files to shard
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Intervals to restrict to (chr, chr:start-stop, chr:start+, unmapped)
    #[arg(short = 'L', long = "interval", env = "BAMSHARD_INTERVALS", value_delimiter = ',')]
    pub intervals: Vec<String>,

    /// Traversal the shards are cut for
    #[arg(long, env = "BAMSHARD_TRAVERSAL", value_enum, default_value = "reads")]
    pub traversal: TraversalKind,

    /// How abutting intervals are merged
    #[arg(long, env = "BAMSHARD_INTERVAL_MERGING", value_enum, default_value = "all")]
    pub interval_merging: IntervalMergingRule,

    /// Maximum records per read shard
    #[arg(long, env = "BAMSHARD_READ_BUFFER_SIZE", default_value = "100000")]
    pub read_buffer_size: usize,

    /// Background block loading threads (0 reads synchronously)
    #[arg(long, env = "BAMSHARD_IO_THREADS", default_value = "0")]
    pub io_threads: usize,

    /// Maximum open file handles shared by the block loaders
    #[arg(long, env = "BAMSHARD_FILE_HANDLES", default_value = "1")]
    pub file_handles: usize,

    /// Schedule reads without a reference after the mapped intervals
    #[arg(long, env = "BAMSHARD_INCLUDE_UNMAPPED")]
    pub include_unmapped: bool,

    /// Drop reads flagged unmapped
    #[arg(long, env = "BAMSHARD_FILTER_UNMAPPED")]
    pub filter_unmapped: bool,

    /// Drop reads below this mapping quality
    #[arg(long, env = "BAMSHARD_MIN_MAPPING_QUALITY", default_value = "0")]
    pub min_mapping_quality: u8,

    /// Drop reads flagged as duplicates
    #[arg(long, env = "BAMSHARD_FILTER_DUPLICATES")]
    pub filter_duplicates: bool,

    /// Keep at most this many reads starting at any one position
    #[arg(long, env = "BAMSHARD_DOWNSAMPLE_TO_COVERAGE")]
    pub downsample_to_coverage: Option<usize>,

    /// Fail when reads are out of order
    #[arg(long, env = "BAMSHARD_VERIFY_ORDER")]
    pub verify_order: bool,

    /// Bases per shard for linear locus traversal
    #[arg(long, env = "BAMSHARD_LOCUS_SHARD_SIZE", default_value = "16384")]
    pub locus_shard_size: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Pretty-print the JSON shard plan
    #[arg(long)]
    pub pretty: bool,
}

impl Config {
    /// Engine settings, validated.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let config = EngineConfig {
            read_buffer_size: self.read_buffer_size,
            io_threads: self.io_threads,
            file_handles: self.file_handles,
            merge_rule: self.interval_merging,
            traversal: self.traversal,
            include_unmapped: self.include_unmapped,
            filter_unmapped: self.filter_unmapped,
            min_mapping_quality: self.min_mapping_quality,
            filter_duplicates: self.filter_duplicates,
            downsample_to_coverage: self.downsample_to_coverage,
            verify_order: self.verify_order,
            locus_shard_size: self.locus_shard_size,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Settings threaded through the data source, scheduler and balancers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineConfig {
    pub read_buffer_size: usize,
    pub io_threads: usize,
    pub file_handles: usize,
    pub merge_rule: IntervalMergingRule,
    pub traversal: TraversalKind,
    pub include_unmapped: bool,
    pub filter_unmapped: bool,
    pub min_mapping_quality: u8,
    pub filter_duplicates: bool,
    pub downsample_to_coverage: Option<usize>,
    pub verify_order: bool,
    pub locus_shard_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            io_threads: 0,
            file_handles: 1,
            merge_rule: IntervalMergingRule::All,
            traversal: TraversalKind::Reads,
            include_unmapped: false,
            filter_unmapped: false,
            min_mapping_quality: 0,
            filter_duplicates: false,
            downsample_to_coverage: None,
            verify_order: false,
            locus_shard_size: DEFAULT_LOCUS_SHARD_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(Error::InvalidConfig("read buffer size must be at least 1".to_string()));
        }
        if self.file_handles == 0 {
            return Err(Error::InvalidConfig("at least one file handle is required".to_string()));
        }
        if self.downsample_to_coverage == Some(0) {
            return Err(Error::InvalidConfig("downsampling coverage must be at least 1".to_string()));
        }
        if self.locus_shard_size == 0 {
            return Err(Error::InvalidConfig("locus shard size must be at least 1".to_string()));
        }
        Ok(())
    }
}
