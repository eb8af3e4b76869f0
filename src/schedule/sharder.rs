use super::file_pointer::FilePointer;
use super::scheduler::BamScheduler;
use crate::Result;
use crate::interval::{GenomeLocSortedSet, IntervalMergingRule};
use crate::storage::DataSource;
use std::iter::Peekable;

/// Coalesces consecutive file pointers on the same contig (or both in the
/// unmapped region) whenever merging them would not read any extra bytes.
pub struct IntervalSharder<I: Iterator<Item = Result<FilePointer>>> {
    inner: Peekable<I>,
}

impl IntervalSharder<BamScheduler> {
    pub fn shard_over_intervals(
        source: &DataSource,
        loci: GenomeLocSortedSet,
        merge_rule: IntervalMergingRule,
    ) -> Result<Self> {
        Ok(Self::new(BamScheduler::over_intervals(source, merge_rule, loci)?))
    }

    pub fn shard_over_mapped_reads(source: &DataSource) -> Result<Self> {
        Ok(Self::new(BamScheduler::over_mapped_reads(source)?))
    }

    pub fn shard_over_all_reads(source: &DataSource) -> Result<Self> {
        Ok(Self::new(BamScheduler::over_all_reads(source)?))
    }
}

impl<I: Iterator<Item = Result<FilePointer>>> IntervalSharder<I> {
    pub fn new(pointers: I) -> Self {
        Self {
            inner: pointers.peekable(),
        }
    }

    fn can_absorb(current: &FilePointer, next: &FilePointer) -> bool {
        current.is_region_unmapped() == next.is_region_unmapped()
            && (current.contig_index() == next.contig_index() || current.is_region_unmapped())
            && current.minus(next) == 0
    }
}

impl<I: Iterator<Item = Result<FilePointer>>> Iterator for IntervalSharder<I> {
    type Item = Result<FilePointer>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut current = match self.inner.next()? {
            Ok(pointer) => pointer,
            Err(e) => return Some(Err(e)),
        };

        while let Some(Ok(next)) = self.inner.peek() {
            if !Self::can_absorb(&current, next) {
                break;
            }
            let Some(Ok(next)) = self.inner.next() else {
                break;
            };
            current = match current.combine(&next) {
                Ok(combined) => combined,
                Err(e) => return Some(Err(e)),
            };
        }

        Some(Ok(current))
    }
}
