use crate::{Error, Result};
use bytes::Bytes;
use flate2::read::DeflateDecoder;
use std::io::{self, Read, Seek, SeekFrom};

/// Length of the fixed BGZF block header, including the `BC` subfield.
pub const BGZF_HEADER_LEN: usize = 18;

const GZIP_ID1: u8 = 31;
const GZIP_ID2: u8 = 139;
const CM_DEFLATE: u8 = 8;
const FLG_FEXTRA: u8 = 4;
const TRAILER_LEN: usize = 8;

/// One inflated BGZF block.
#[derive(Debug, Clone)]
pub struct Block {
    /// File offset of the block header.
    pub address: u64,
    /// Size of the block on disk.
    pub compressed_size: u64,
    pub data: Bytes,
}

impl Block {
    /// File offset of the block that follows this one.
    pub fn next_address(&self) -> u64 {
        self.address + self.compressed_size
    }
}

/// Validate a block header and return the total block size.
pub fn parse_header(source_name: &str, address: u64, header: &[u8; BGZF_HEADER_LEN]) -> Result<usize> {
    let malformed = |message: &str| Error::MalformedBlock {
        source_name: source_name.to_string(),
        offset: address,
        message: message.to_string(),
    };

    if header[0] != GZIP_ID1 || header[1] != GZIP_ID2 {
        return Err(malformed("invalid gzip magic"));
    }
    if header[2] != CM_DEFLATE {
        return Err(malformed("unsupported compression method"));
    }
    if header[3] != FLG_FEXTRA {
        return Err(malformed("missing extra field"));
    }
    if header[12] != b'B' || header[13] != b'C' {
        return Err(malformed("missing BC subfield"));
    }
    if u16::from_le_bytes([header[14], header[15]]) != 2 {
        return Err(malformed("invalid BC subfield length"));
    }

    let block_size = usize::from(u16::from_le_bytes([header[16], header[17]])) + 1;
    if block_size < BGZF_HEADER_LEN + TRAILER_LEN {
        return Err(malformed("block size smaller than its header"));
    }
    Ok(block_size)
}

/// Read and inflate the block starting at `address`. Returns `None` at end
/// of file.
pub fn read_block<R: Read + Seek>(reader: &mut R, source_name: &str, address: u64) -> Result<Option<Block>> {
    reader.seek(SeekFrom::Start(address))?;

    let mut header = [0u8; BGZF_HEADER_LEN];
    let mut filled = 0;
    while filled < BGZF_HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(Error::MalformedBlock {
                    source_name: source_name.to_string(),
                    offset: address,
                    message: "truncated block header".to_string(),
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let block_size = parse_header(source_name, address, &header)?;
    let mut rest = vec![0u8; block_size - BGZF_HEADER_LEN];
    reader.read_exact(&mut rest).map_err(|e| Error::MalformedBlock {
        source_name: source_name.to_string(),
        offset: address,
        message: format!("truncated block: {e}"),
    })?;

    let (payload, trailer) = rest.split_at(rest.len() - TRAILER_LEN);
    let expected_len = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]) as usize;

    let mut data = Vec::with_capacity(expected_len);
    DeflateDecoder::new(payload)
        .read_to_end(&mut data)
        .map_err(|e| Error::MalformedBlock {
            source_name: source_name.to_string(),
            offset: address,
            message: format!("unable to inflate block: {e}"),
        })?;
    if data.len() != expected_len {
        return Err(Error::MalformedBlock {
            source_name: source_name.to_string(),
            offset: address,
            message: format!("inflated {} bytes, header declares {}", data.len(), expected_len),
        });
    }

    Ok(Some(Block {
        address,
        compressed_size: block_size as u64,
        data: Bytes::from(data),
    }))
}
