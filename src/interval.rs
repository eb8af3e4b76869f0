//! Genomic intervals, sequence dictionaries and interval merging.
//!
//! A [`GenomeLoc`] is a 1-based, inclusive interval on a single contig of the
//! sequence dictionary, or one of two sentinels: [`GenomeLoc::unmapped`] (reads
//! placed on no contig, sorted after everything else) and
//! [`GenomeLoc::whole_genome`].

use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Contig index used by the unmapped sentinel. Sorts after every real contig.
pub const UNMAPPED_CONTIG_INDEX: usize = usize::MAX;

const WHOLE_GENOME_CONTIG_INDEX: usize = usize::MAX - 1;
const UNMAPPED_NAME: &str = "unmapped";
const WHOLE_GENOME_NAME: &str = "all";

/// A genomic interval. Ordered by contig index, then start, then stop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenomeLoc {
    contig_index: usize,
    start: u32,
    stop: u32,
    contig: String,
}

impl GenomeLoc {
    pub(crate) fn new_unchecked(contig: &str, contig_index: usize, start: u32, stop: u32) -> Self {
        Self {
            contig_index,
            start,
            stop,
            contig: contig.to_string(),
        }
    }

    /// The synthetic region holding reads that are not placed on any contig.
    pub fn unmapped() -> Self {
        Self::new_unchecked(UNMAPPED_NAME, UNMAPPED_CONTIG_INDEX, 0, 0)
    }

    /// Sentinel standing for every locus of every contig.
    pub fn whole_genome() -> Self {
        Self::new_unchecked(WHOLE_GENOME_NAME, WHOLE_GENOME_CONTIG_INDEX, 0, 0)
    }

    pub fn contig(&self) -> &str {
        &self.contig
    }

    pub fn contig_index(&self) -> usize {
        self.contig_index
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn stop(&self) -> u32 {
        self.stop
    }

    pub fn is_unmapped(&self) -> bool {
        self.contig_index == UNMAPPED_CONTIG_INDEX
    }

    pub fn is_whole_genome(&self) -> bool {
        self.contig_index == WHOLE_GENOME_CONTIG_INDEX
    }

    /// Number of bases covered; zero-length markers (`stop == start - 1`) have size 0.
    pub fn size(&self) -> u64 {
        (self.stop as u64 + 1).saturating_sub(self.start as u64)
    }

    pub fn on_same_contig(&self, other: &GenomeLoc) -> bool {
        self.contig_index == other.contig_index
    }

    pub fn overlaps(&self, other: &GenomeLoc) -> bool {
        if self.is_unmapped() || other.is_unmapped() {
            return self.is_unmapped() && other.is_unmapped();
        }
        self.on_same_contig(other) && self.start <= other.stop && other.start <= self.stop
    }

    /// True when `other` begins immediately after this interval ends, or vice versa.
    pub fn is_adjacent_to(&self, other: &GenomeLoc) -> bool {
        !self.is_unmapped()
            && self.on_same_contig(other)
            && (self.stop as u64 + 1 == other.start as u64 || other.stop as u64 + 1 == self.start as u64)
    }

    pub fn starts_before(&self, other: &GenomeLoc) -> bool {
        self.contig_index < other.contig_index
            || (self.contig_index == other.contig_index && self.start < other.start)
    }

    /// Intersection of two overlapping intervals.
    pub fn intersect(&self, other: &GenomeLoc) -> Result<GenomeLoc> {
        if !self.overlaps(other) {
            return Err(Error::Internal(format!(
                "{self} and {other} do not overlap; unable to intersect"
            )));
        }
        if self.is_unmapped() {
            return Ok(self.clone());
        }
        Ok(GenomeLoc::new_unchecked(
            &self.contig,
            self.contig_index,
            self.start.max(other.start),
            self.stop.min(other.stop),
        ))
    }

    /// Smallest interval spanning both; the two must overlap or be adjacent.
    pub fn merge(&self, other: &GenomeLoc) -> Result<GenomeLoc> {
        if !(self.overlaps(other) || self.is_adjacent_to(other)) {
            return Err(Error::Internal(format!(
                "{self} and {other} are neither overlapping nor adjacent; unable to merge"
            )));
        }
        if self.is_unmapped() {
            return Ok(self.clone());
        }
        Ok(GenomeLoc::new_unchecked(
            &self.contig,
            self.contig_index,
            self.start.min(other.start),
            self.stop.max(other.stop),
        ))
    }

    /// Split into `[start, split_point - 1]` and `[split_point, stop]`.
    pub fn split(&self, split_point: u32) -> Result<(GenomeLoc, GenomeLoc)> {
        if self.is_unmapped() || split_point <= self.start || split_point > self.stop {
            return Err(Error::Internal(format!(
                "unable to split {self} at position {split_point}"
            )));
        }
        Ok((
            GenomeLoc::new_unchecked(&self.contig, self.contig_index, self.start, split_point - 1),
            GenomeLoc::new_unchecked(&self.contig, self.contig_index, split_point, self.stop),
        ))
    }

    /// Copy of this interval with a new start.
    pub(crate) fn with_start(&self, start: u32) -> GenomeLoc {
        GenomeLoc::new_unchecked(&self.contig, self.contig_index, start, self.stop)
    }
}

impl fmt::Display for GenomeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unmapped() || self.is_whole_genome() {
            write!(f, "{}", self.contig)
        } else {
            write!(f, "{}:{}-{}", self.contig, self.start, self.stop)
        }
    }
}

/// How adjacent intervals are merged when sorting an interval list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntervalMergingRule {
    /// Merge overlapping and abutting intervals.
    #[default]
    All,
    /// Merge only intervals that share at least one base.
    OverlappingOnly,
}

/// Sort intervals and merge them according to `rule`.
pub fn sort_and_merge(mut intervals: Vec<GenomeLoc>, rule: IntervalMergingRule) -> Vec<GenomeLoc> {
    intervals.sort();

    let mut merged: Vec<GenomeLoc> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last)
                if last.overlaps(&interval)
                    || (rule == IntervalMergingRule::All && last.is_adjacent_to(&interval)) =>
            {
                if !last.is_unmapped() {
                    last.stop = last.stop.max(interval.stop);
                }
            }
            _ => merged.push(interval),
        }
    }
    merged
}

/// One contig of a sequence dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub name: String,
    pub length: u32,
}

/// Ordered contig names and lengths, as declared by an alignment file header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceDictionary {
    sequences: Vec<SequenceRecord>,
    by_name: HashMap<String, usize>,
}

impl SequenceDictionary {
    pub fn new<I, S>(sequences: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let sequences: Vec<SequenceRecord> = sequences
            .into_iter()
            .map(|(name, length)| SequenceRecord {
                name: name.into(),
                length,
            })
            .collect();
        let by_name = sequences
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        Self { sequences, by_name }
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SequenceRecord> {
        self.sequences.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SequenceRecord> {
        self.sequences.iter()
    }

    /// Human readable listing used in contig mismatch errors.
    pub fn pretty_print(&self) -> String {
        self.sequences
            .iter()
            .map(|s| format!("{}/{}", s.name, s.length))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Creates validated [`GenomeLoc`]s against a sequence dictionary.
#[derive(Debug, Clone)]
pub struct GenomeLocParser {
    dictionary: Arc<SequenceDictionary>,
}

impl GenomeLocParser {
    pub fn new(dictionary: SequenceDictionary) -> Self {
        Self {
            dictionary: Arc::new(dictionary),
        }
    }

    pub fn dictionary(&self) -> &SequenceDictionary {
        &self.dictionary
    }

    pub fn contig_index(&self, contig: &str) -> Result<usize> {
        self.dictionary
            .index_of(contig)
            .ok_or_else(|| Error::ContigNotFound {
                contig: contig.to_string(),
                available: self.dictionary.pretty_print(),
            })
    }

    /// Create an interval, validating contig and bounds.
    pub fn create_genome_loc(&self, contig: &str, start: u32, stop: u32) -> Result<GenomeLoc> {
        let index = self.contig_index(contig)?;
        let length = self.dictionary.sequences[index].length;

        if start == 0 {
            return Err(Error::InvalidInterval(format!(
                "{contig}:{start}-{stop}: start must be at least 1"
            )));
        }
        if (start as u64) > stop as u64 + 1 {
            return Err(Error::InvalidInterval(format!(
                "{contig}:{start}-{stop}: start is after stop"
            )));
        }
        if stop > length {
            return Err(Error::InvalidInterval(format!(
                "{contig}:{start}-{stop}: stop is past the end of the contig (length {length})"
            )));
        }

        Ok(GenomeLoc::new_unchecked(contig, index, start, stop))
    }

    /// Interval spanning an entire contig.
    pub fn contig_loc(&self, index: usize) -> Result<GenomeLoc> {
        let record = self.dictionary.get(index).ok_or_else(|| {
            Error::Internal(format!("contig index {index} outside sequence dictionary"))
        })?;
        Ok(GenomeLoc::new_unchecked(&record.name, index, 1, record.length))
    }

    /// Parse `contig`, `contig:pos`, `contig:start-stop`, `contig:start+`
    /// or `unmapped`. Thousands separators are accepted in positions.
    pub fn parse(&self, text: &str) -> Result<GenomeLoc> {
        let text = text.trim();
        if text.eq_ignore_ascii_case(UNMAPPED_NAME) {
            return Ok(GenomeLoc::unmapped());
        }

        // Contig names may themselves contain ':'.
        if let Some(index) = self.dictionary.index_of(text) {
            return self.contig_loc(index);
        }

        let (contig, range) = text
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidInterval(format!("unknown contig or bad interval: {text}")))?;
        let length = self
            .dictionary
            .get(self.contig_index(contig)?)
            .map(|s| s.length)
            .unwrap_or(0);

        let parse_pos = |s: &str| -> Result<u32> {
            s.replace(',', "")
                .parse::<u32>()
                .map_err(|e| Error::InvalidInterval(format!("{text}: bad position '{s}': {e}")))
        };

        let (start, stop) = if let Some(start) = range.strip_suffix('+') {
            (parse_pos(start)?, length)
        } else if let Some((start, stop)) = range.split_once('-') {
            (parse_pos(start)?, parse_pos(stop)?)
        } else {
            let pos = parse_pos(range)?;
            (pos, pos)
        };

        self.create_genome_loc(contig, start, stop)
    }
}

/// A sorted, merged list of intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenomeLocSortedSet {
    intervals: Vec<GenomeLoc>,
}

impl GenomeLocSortedSet {
    pub fn new(intervals: Vec<GenomeLoc>, rule: IntervalMergingRule) -> Self {
        Self {
            intervals: sort_and_merge(intervals, rule),
        }
    }

    /// Every contig of the dictionary, in dictionary order.
    pub fn from_dictionary(dictionary: &SequenceDictionary) -> Self {
        let intervals = dictionary
            .iter()
            .enumerate()
            .map(|(i, s)| GenomeLoc::new_unchecked(&s.name, i, 1, s.length))
            .collect();
        Self { intervals }
    }

    /// Append the unmapped sentinel, if not already present.
    pub fn with_unmapped(mut self) -> Self {
        if !self.contains_unmapped() {
            self.intervals.push(GenomeLoc::unmapped());
        }
        self
    }

    pub fn contains_unmapped(&self) -> bool {
        self.intervals.last().is_some_and(GenomeLoc::is_unmapped)
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GenomeLoc> {
        self.intervals.iter()
    }

    pub fn as_slice(&self) -> &[GenomeLoc] {
        &self.intervals
    }

    /// Total number of mapped bases covered.
    pub fn covered_size(&self) -> u64 {
        self.intervals
            .iter()
            .filter(|l| !l.is_unmapped())
            .map(GenomeLoc::size)
            .sum()
    }
}

impl<'a> IntoIterator for &'a GenomeLocSortedSet {
    type Item = &'a GenomeLoc;
    type IntoIter = std::slice::Iter<'a, GenomeLoc>;

    fn into_iter(self) -> Self::IntoIter {
        self.intervals.iter()
    }
}
