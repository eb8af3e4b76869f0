use serde::Serialize;
use std::collections::BTreeMap;

/// Counters describing the reads seen by a shard or a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadMetrics {
    /// Records pulled from the inputs, before any filtering.
    pub reads_seen: u64,
    /// Records handed to the consumer.
    pub reads_passed: u64,
    /// Records removed by positional downsampling.
    pub reads_downsampled: u64,
    /// Records removed per filter name.
    pub filtered: BTreeMap<String, u64>,
}

impl ReadMetrics {
    pub fn increment_reads_seen(&mut self) {
        self.reads_seen += 1;
    }

    pub fn increment_reads_passed(&mut self) {
        self.reads_passed += 1;
    }

    pub fn increment_downsampled(&mut self) {
        self.reads_downsampled += 1;
    }

    pub fn increment_filter(&mut self, name: &str) {
        *self.filtered.entry(name.to_string()).or_default() += 1;
    }

    pub fn total_filtered(&self) -> u64 {
        self.filtered.values().sum()
    }

    /// Fold another set of counters into this one.
    pub fn incorporate(&mut self, other: &ReadMetrics) {
        self.reads_seen += other.reads_seen;
        self.reads_passed += other.reads_passed;
        self.reads_downsampled += other.reads_downsampled;
        for (name, count) in &other.filtered {
            *self.filtered.entry(name.clone()).or_default() += count;
        }
    }
}
