//! Scheduling of genomic intervals onto file byte ranges.
//!
//! - [`BamScheduler`] - walks intervals against each input's index and yields [`FilePointer`]s
//! - [`BamSchedule`] - per-contig bin schedule spilled to a scratch file
//! - [`IntervalSharder`] - coalesces consecutive pointers that add no extra bytes

mod bam_schedule;
mod file_pointer;
mod scheduler;
mod sharder;

pub use bam_schedule::{BamSchedule, BamScheduleEntry};
pub use file_pointer::FilePointer;
pub use scheduler::BamScheduler;
pub use sharder::IntervalSharder;
