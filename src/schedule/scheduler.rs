use super::bam_schedule::{BamSchedule, BamScheduleEntry};
use super::file_pointer::FilePointer;
use crate::index::{BamIndex, FileSpan, VirtualOffset};
use crate::interval::{GenomeLoc, GenomeLocSortedSet, IntervalMergingRule, SequenceDictionary};
use crate::storage::{DataSource, ReaderId};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::iter::Peekable;

/// Largest prefix split off an interval that starts before the first
/// indexed bin overlapping it.
const MAX_UNCOVERED_SPLIT: u32 = 16384;

enum State {
    PerBinWalk,
    Monolithic(Option<FilePointer>),
    Done,
}

/// Walks a sorted interval set against the index of every reader and yields
/// the file pointers covering it.
///
/// When no reader has an index, a single monolithic pointer covering every
/// file from the end of its header is produced instead.
pub struct BamScheduler {
    merge_rule: IntervalMergingRule,
    reader_ids: Vec<ReaderId>,
    dictionary: SequenceDictionary,
    initial_positions: BTreeMap<ReaderId, VirtualOffset>,
    indices: BTreeMap<ReaderId, BamIndex>,
    loci: Vec<GenomeLoc>,
    locus_iter: Peekable<std::vec::IntoIter<GenomeLoc>>,
    current_locus: Option<GenomeLoc>,
    schedule: Option<BamSchedule>,
    last_reference_loaded: Option<usize>,
    state: State,
}

impl BamScheduler {
    /// Every contig of the merged sequence dictionary.
    pub fn over_mapped_reads(source: &DataSource) -> Result<Self> {
        let loci = GenomeLocSortedSet::from_dictionary(source.dictionary());
        Self::new(source, IntervalMergingRule::All, Some(loci))
    }

    /// Every read in every file, mapped or not, as one monolithic pointer.
    pub fn over_all_reads(source: &DataSource) -> Result<Self> {
        Self::new(source, IntervalMergingRule::All, None)
    }

    /// The given intervals. The set must not be empty.
    pub fn over_intervals(
        source: &DataSource,
        merge_rule: IntervalMergingRule,
        loci: GenomeLocSortedSet,
    ) -> Result<Self> {
        if loci.is_empty() {
            return Err(Error::EmptyIntervals);
        }
        Self::new(source, merge_rule, Some(loci))
    }

    fn new(
        source: &DataSource,
        merge_rule: IntervalMergingRule,
        loci: Option<GenomeLocSortedSet>,
    ) -> Result<Self> {
        let dictionary = source.dictionary().clone();

        if let Some(loci) = &loci {
            for locus in loci.iter().filter(|l| !l.is_unmapped()) {
                if dictionary.index_of(locus.contig()).is_none() {
                    return Err(Error::ContigNotFound {
                        contig: locus.contig().to_string(),
                        available: dictionary.pretty_print(),
                    });
                }
            }
        }

        let mut indices = BTreeMap::new();
        let mut unindexed = Vec::new();
        for reader in source.reader_ids() {
            match source.open_index(reader)? {
                Some(index) => {
                    indices.insert(reader.clone(), index);
                }
                None => unindexed.push(reader.clone()),
            }
        }
        if !indices.is_empty() && !unindexed.is_empty() {
            tracing::warn!(
                "no index found for {} of {} inputs; scheduling the whole fileset as a single monolithic pointer",
                unindexed.len(),
                source.reader_ids().len()
            );
            indices.clear();
        }

        let initial_positions = source.initial_reader_positions();
        let all_reads = loci.is_none();
        let loci_list: Vec<GenomeLoc> = loci.map(|l| l.as_slice().to_vec()).unwrap_or_default();

        let state = if source.reader_ids().is_empty() {
            State::Done
        } else if all_reads || indices.is_empty() {
            let pointer = FilePointer::monolithic(
                initial_positions.iter().map(|(r, p)| (r.clone(), *p)),
                merge_rule,
                loci_list.clone(),
            );
            State::Monolithic(Some(pointer))
        } else {
            State::PerBinWalk
        };

        let per_bin_loci = match state {
            State::PerBinWalk => loci_list.clone(),
            _ => Vec::new(),
        };
        let mut locus_iter = per_bin_loci.into_iter().peekable();
        let current_locus = locus_iter.next();

        Ok(Self {
            merge_rule,
            reader_ids: source.reader_ids().to_vec(),
            dictionary,
            initial_positions,
            indices,
            loci: loci_list,
            locus_iter,
            current_locus,
            schedule: None,
            last_reference_loaded: None,
            state,
        })
    }

    pub fn merge_rule(&self) -> IntervalMergingRule {
        self.merge_rule
    }

    /// Requested intervals, sorted and merged.
    pub fn loci(&self) -> &[GenomeLoc] {
        &self.loci
    }

    fn empty_spans(&self, pointer: &mut FilePointer) {
        for reader in self.indices.keys() {
            pointer.add_file_span(reader.clone(), FileSpan::empty());
        }
    }

    fn unmapped_pointer(&self) -> Result<FilePointer> {
        let mut pointer = FilePointer::with_locations(self.merge_rule, vec![GenomeLoc::unmapped()])?;
        for reader in &self.reader_ids {
            let last_linear = match self.indices.get(reader) {
                Some(index) => index.start_of_last_linear_bin()?,
                None => None,
            };
            let start = last_linear
                .or_else(|| self.initial_positions.get(reader).copied())
                .unwrap_or_default();
            pointer.add_file_span(reader.clone(), FileSpan::to_end_of_file(start));
        }
        Ok(pointer)
    }

    fn advance(&mut self) -> Result<Option<FilePointer>> {
        let Some(locus) = self.current_locus.take() else {
            return Ok(None);
        };

        if locus.is_unmapped() {
            return self.unmapped_pointer().map(Some);
        }

        let mut pointer = FilePointer::new(self.merge_rule);

        let Some(entry) = self.next_overlapping_entry(&locus)? else {
            self.empty_spans(&mut pointer);
            pointer.add_location(locus)?;
            self.current_locus = self.locus_iter.next();
            return Ok(Some(pointer));
        };

        let covered = GenomeLoc::new_unchecked(
            locus.contig(),
            locus.contig_index(),
            entry.start.max(1),
            entry.stop,
        );

        if locus.starts_before(&covered) {
            let split_point = (covered.start() - locus.start()).min(MAX_UNCOVERED_SPLIT) + locus.start();
            let (prefix, rest) = locus.split(split_point)?;
            self.empty_spans(&mut pointer);
            pointer.add_location(prefix)?;
            self.current_locus = Some(rest);
            return Ok(Some(pointer));
        }

        for (reader, span) in entry.file_spans {
            pointer.add_file_span(reader, span);
        }
        pointer.add_location(locus.intersect(&covered)?)?;

        let mut current = locus;
        while let Some(next) = self.locus_iter.next_if(|l| l.overlaps(&covered)) {
            pointer.add_location(next.intersect(&covered)?)?;
            current = next;
        }

        self.current_locus = if covered.stop() < current.stop() {
            Some(current.with_start(covered.stop() + 1))
        } else {
            self.locus_iter.next()
        };

        Ok(Some(pointer))
    }

    fn next_overlapping_entry(&mut self, locus: &GenomeLoc) -> Result<Option<BamScheduleEntry>> {
        let reference_index =
            self.dictionary
                .index_of(locus.contig())
                .ok_or_else(|| Error::ContigNotFound {
                    contig: locus.contig().to_string(),
                    available: self.dictionary.pretty_print(),
                })?;

        if self.last_reference_loaded != Some(reference_index) {
            self.schedule = None;
            self.last_reference_loaded = Some(reference_index);

            let loci_in_contig: Vec<GenomeLoc> = self
                .loci
                .iter()
                .filter(|l| !l.is_unmapped() && self.dictionary.index_of(l.contig()) == Some(reference_index))
                .cloned()
                .collect();

            tracing::debug!(
                "building schedule for {} over {} intervals",
                locus.contig(),
                loci_in_contig.len()
            );
            self.schedule = Some(BamSchedule::new(&mut self.indices, reference_index, &loci_in_contig)?);
        }

        let Some(schedule) = self.schedule.as_mut() else {
            return Ok(None);
        };
        while schedule.peek().is_some_and(|e| e.is_before(locus)) {
            schedule.next_entry()?;
        }
        Ok(schedule.peek().filter(|e| e.overlaps(locus)).cloned())
    }
}

impl Iterator for BamScheduler {
    type Item = Result<FilePointer>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.state {
            State::Done => None,
            State::Monolithic(pointer) => {
                let pointer = pointer.take();
                self.state = State::Done;
                pointer.map(Ok)
            }
            State::PerBinWalk => match self.advance() {
                Ok(Some(pointer)) => {
                    tracing::debug!("scheduled {}", pointer);
                    Some(Ok(pointer))
                }
                Ok(None) => {
                    self.state = State::Done;
                    None
                }
                Err(e) => {
                    self.state = State::Done;
                    Some(Err(e))
                }
            },
        }
    }
}
