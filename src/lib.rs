pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod interval;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod schedule;
pub mod shard;
pub mod storage;
pub mod types;

pub use config::{Config, EngineConfig};
pub use error::{Error, Result};
