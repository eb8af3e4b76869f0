use crate::index::{FileSpan, VirtualOffset};
use crate::interval::{GenomeLoc, IntervalMergingRule, sort_and_merge};
use crate::storage::ReaderId;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// A set of genomic intervals together with the byte ranges, per input
/// file, holding the reads that overlap them.
///
/// A pointer never mixes mapped intervals with the unmapped region, and a
/// non-monolithic pointer only holds intervals from a single contig.
/// Monolithic pointers stand for the entire dataset and are exempt from both
/// rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePointer {
    file_spans: BTreeMap<ReaderId, FileSpan>,
    locations: Vec<GenomeLoc>,
    merge_rule: IntervalMergingRule,
    is_region_unmapped: bool,
    is_monolithic: bool,
    contig_index: Option<usize>,
}

impl FilePointer {
    pub fn new(merge_rule: IntervalMergingRule) -> Self {
        Self {
            file_spans: BTreeMap::new(),
            locations: Vec::new(),
            merge_rule,
            is_region_unmapped: false,
            is_monolithic: false,
            contig_index: None,
        }
    }

    pub fn with_locations(merge_rule: IntervalMergingRule, locations: Vec<GenomeLoc>) -> Result<Self> {
        let mut pointer = Self::new(merge_rule);
        for location in locations {
            pointer.add_location(location)?;
        }
        Ok(pointer)
    }

    pub fn with_spans(
        file_spans: BTreeMap<ReaderId, FileSpan>,
        merge_rule: IntervalMergingRule,
        locations: Vec<GenomeLoc>,
    ) -> Result<Self> {
        let mut pointer = Self::with_locations(merge_rule, locations)?;
        pointer.file_spans = file_spans;
        Ok(pointer)
    }

    /// The single pointer used when the inputs cannot be scheduled from an
    /// index: every reader from `starts` to the end of the file, carrying
    /// every requested interval.
    pub fn monolithic(
        starts: impl IntoIterator<Item = (ReaderId, VirtualOffset)>,
        merge_rule: IntervalMergingRule,
        locations: Vec<GenomeLoc>,
    ) -> Self {
        let file_spans = starts
            .into_iter()
            .map(|(reader, start)| (reader, FileSpan::to_end_of_file(start)))
            .collect();
        let contig_index = locations.first().map(GenomeLoc::contig_index);
        Self {
            file_spans,
            locations,
            merge_rule,
            is_region_unmapped: false,
            is_monolithic: true,
            contig_index,
        }
    }

    fn validate_location(&self, location: &GenomeLoc) -> Result<()> {
        if self.is_monolithic {
            return Ok(());
        }
        if !self.locations.is_empty() && self.is_region_unmapped != location.is_unmapped() {
            return Err(Error::Internal(
                "file pointers cannot be mixed mapped/unmapped".to_string(),
            ));
        }
        if !location.is_unmapped() && self.contig_index.is_some_and(|c| c != location.contig_index()) {
            return Err(Error::Internal(
                "non-monolithic file pointers must contain intervals from at most one contig".to_string(),
            ));
        }
        Ok(())
    }

    pub fn add_location(&mut self, location: GenomeLoc) -> Result<()> {
        self.validate_location(&location)?;
        if self.locations.is_empty() {
            self.is_region_unmapped = location.is_unmapped();
        }
        if self.contig_index.is_none() {
            self.contig_index = Some(location.contig_index());
        }
        self.locations.push(location);
        Ok(())
    }

    pub fn add_file_span(&mut self, reader: ReaderId, span: FileSpan) {
        self.file_spans.insert(reader, span);
    }

    pub fn file_spans(&self) -> &BTreeMap<ReaderId, FileSpan> {
        &self.file_spans
    }

    pub fn locations(&self) -> &[GenomeLoc] {
        &self.locations
    }

    /// Contig of the first location, if any.
    pub fn contig_index(&self) -> Option<usize> {
        self.contig_index
    }

    pub fn merge_rule(&self) -> IntervalMergingRule {
        self.merge_rule
    }

    pub fn is_region_unmapped(&self) -> bool {
        self.is_region_unmapped
    }

    pub fn is_monolithic(&self) -> bool {
        self.is_monolithic
    }

    /// Approximate inflated size of every span.
    pub fn size(&self) -> u64 {
        self.file_spans.values().map(FileSpan::size).sum()
    }

    /// Bytes this pointer would add on top of `other`. Readers before the
    /// last reader of this pointer that appear in only one of the two
    /// contribute their whole span; readers of `other` past that point are
    /// not counted.
    pub fn minus(&self, other: &FilePointer) -> u64 {
        let mut other_iter = other.file_spans.iter().peekable();
        let mut difference = 0u64;

        for (this_id, this_span) in &self.file_spans {
            while let Some((_, other_span)) = other_iter.next_if(|(other_id, _)| *other_id < this_id) {
                difference += other_span.size();
            }
            difference += match other_iter.next_if(|(other_id, _)| *other_id == this_id) {
                Some((_, other_span)) => this_span.minus(other_span).size(),
                None => this_span.size(),
            };
        }
        difference
    }

    /// Pairwise union of locations and spans.
    pub fn combine(&self, other: &FilePointer) -> Result<FilePointer> {
        let mut locations = self.locations.clone();
        locations.extend(other.locations.iter().cloned());

        let mut combined = FilePointer::with_locations(self.merge_rule, sort_and_merge(locations, self.merge_rule))?;
        for (reader, span) in &self.file_spans {
            combined.file_spans.insert(reader.clone(), span.clone());
        }
        for (reader, span) in &other.file_spans {
            let merged = match combined.file_spans.get(reader) {
                Some(existing) => existing.union(span),
                None => span.clone(),
            };
            combined.file_spans.insert(reader.clone(), merged);
        }
        Ok(combined)
    }

    /// Union of many pointers in one pass. All inputs must share a merge rule.
    pub fn union(pointers: Vec<FilePointer>) -> Result<FilePointer> {
        let Some(first) = pointers.first() else {
            return Ok(FilePointer::new(IntervalMergingRule::All));
        };
        let merge_rule = first.merge_rule;
        let is_monolithic = pointers.iter().all(FilePointer::is_monolithic);

        let mut locations = Vec::new();
        let mut chunks: BTreeMap<ReaderId, Vec<_>> = BTreeMap::new();
        for pointer in pointers {
            if pointer.merge_rule != merge_rule {
                return Err(Error::Internal(
                    "all file pointers in a union must use the same interval merging rule".to_string(),
                ));
            }
            locations.extend(pointer.locations);
            for (reader, span) in pointer.file_spans {
                chunks.entry(reader).or_default().extend(span.into_chunks());
            }
        }

        let file_spans = chunks
            .into_iter()
            .map(|(reader, chunks)| (reader, FileSpan::new(chunks)))
            .collect();
        let locations = sort_and_merge(locations, merge_rule);

        if is_monolithic {
            let mut pointer = FilePointer::new(merge_rule);
            pointer.is_monolithic = true;
            pointer.contig_index = locations.first().map(GenomeLoc::contig_index);
            pointer.locations = locations;
            pointer.file_spans = file_spans;
            return Ok(pointer);
        }
        FilePointer::with_spans(file_spans, merge_rule, locations)
    }

    /// True if, for any reader in both pointers, the extents of their spans overlap.
    pub fn has_file_spans_overlapping_with(&self, other: &FilePointer) -> bool {
        self.file_spans.iter().any(|(reader, span)| {
            let Some(other_span) = other.file_spans.get(reader) else {
                return false;
            };
            match (span.extent(), other_span.extent()) {
                (Some(a), Some(b)) => a.overlaps(&b),
                _ => false,
            }
        })
    }
}

impl fmt::Display for FilePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let locations: Vec<String> = self.locations.iter().map(GenomeLoc::to_string).collect();
        write!(f, "FilePointer {{ locations = {{{}}}", locations.join(";"))?;
        for (reader, span) in &self.file_spans {
            write!(f, ", {reader} = {span}")?;
        }
        write!(f, " }}")
    }
}
