use crate::index::VirtualOffset;
use noodles::bam;
use noodles::sam;
use noodles::sam::header::record::value::map::header::tag as header_tag;
use std::cmp::Ordering;
use std::io;

const FLAG_UNMAPPED: u16 = 0x4;
const FLAG_DUPLICATE: u16 = 0x400;

/// The fields of an alignment record the sharding engine looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentRecord {
    pub name: String,
    pub flags: u16,
    pub reference_index: Option<usize>,
    /// 1-based leftmost aligned position.
    pub alignment_start: Option<u32>,
    /// 1-based inclusive rightmost aligned position.
    pub alignment_end: Option<u32>,
    pub mapping_quality: Option<u8>,
    /// Where the record was read from.
    pub virtual_offset: VirtualOffset,
}

impl AlignmentRecord {
    pub fn new(name: impl Into<String>, reference_index: Option<usize>, alignment_start: Option<u32>) -> Self {
        Self {
            name: name.into(),
            flags: 0,
            reference_index,
            alignment_start,
            alignment_end: alignment_start,
            mapping_quality: None,
            virtual_offset: VirtualOffset::default(),
        }
    }

    /// Decode from a BAM record read at `virtual_offset`.
    pub fn from_bam(record: &bam::Record, virtual_offset: VirtualOffset) -> io::Result<Self> {
        let name = record
            .name()
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .unwrap_or_default();
        let reference_index = record.reference_sequence_id().transpose()?;
        let alignment_start = record
            .alignment_start()
            .transpose()?
            .map(|position| usize::from(position) as u32);
        let alignment_end = sam::alignment::Record::alignment_end(record)
            .transpose()?
            .map(|position| usize::from(position) as u32);

        Ok(Self {
            name,
            flags: record.flags().bits(),
            reference_index,
            alignment_start,
            alignment_end: alignment_end.or(alignment_start),
            mapping_quality: record.mapping_quality().map(|mq| mq.get()),
            virtual_offset,
        })
    }

    pub fn is_unmapped(&self) -> bool {
        self.flags & FLAG_UNMAPPED != 0
    }

    pub fn is_duplicate(&self) -> bool {
        self.flags & FLAG_DUPLICATE != 0
    }

    /// Position key for coordinate order; records with no reference sort last.
    pub fn coordinate_key(&self) -> (usize, u32) {
        (
            self.reference_index.unwrap_or(usize::MAX),
            self.alignment_start.unwrap_or(0),
        )
    }
}

/// Sort order declared in the `@HD SO:` header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Unknown,
    Unsorted,
    Coordinate,
    #[serde(rename = "queryname")]
    QueryName,
}

impl SortOrder {
    pub fn from_tag(value: &[u8]) -> Self {
        match value {
            b"coordinate" => SortOrder::Coordinate,
            b"queryname" => SortOrder::QueryName,
            b"unsorted" => SortOrder::Unsorted,
            _ => SortOrder::Unknown,
        }
    }

    /// The sort order of the header's `@HD` record.
    pub fn from_header(header: &sam::Header) -> Self {
        header
            .header()
            .and_then(|hd| hd.other_fields().get(&header_tag::SORT_ORDER))
            .map(|value| SortOrder::from_tag(value.as_slice()))
            .unwrap_or_default()
    }

    /// Unsorted and unknown inputs are processed as if coordinate sorted.
    pub fn effective(self) -> Self {
        match self {
            SortOrder::QueryName => SortOrder::QueryName,
            _ => SortOrder::Coordinate,
        }
    }

    /// Compare two records under this order.
    pub fn compare(self, a: &AlignmentRecord, b: &AlignmentRecord) -> Ordering {
        match self.effective() {
            SortOrder::QueryName => a.name.cmp(&b.name),
            _ => a.coordinate_key().cmp(&b.coordinate_key()),
        }
    }
}
