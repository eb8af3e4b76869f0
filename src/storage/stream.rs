use super::bgzf::{self, Block};
use super::dispatcher::{BlockLoadingDispatcher, LoadQueue};
use super::handles::FileHandleCache;
use super::{RecordIterator, RecordSource, ReaderId};
use crate::index::{Chunk, FileSpan, VirtualOffset};
use crate::record::AlignmentRecord;
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use noodles::bam;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

/// Bytes buffered per stream before loaders wait for the consumer.
const BUFFER_CAPACITY: usize = 128 * 1024;

/// The chunks of a span still to be delivered.
#[derive(Debug)]
struct AccessPlan {
    chunks: VecDeque<Chunk>,
    next_block: Option<u64>,
    length: u64,
}

impl AccessPlan {
    fn new(span: &FileSpan, length: u64) -> Self {
        let chunks: VecDeque<Chunk> = span.chunks().iter().copied().collect();
        let next_block = chunks
            .front()
            .map(|c| c.start.compressed())
            .filter(|address| *address < length);
        Self {
            chunks,
            next_block,
            length,
        }
    }

    fn is_exhausted(&self) -> bool {
        self.next_block.is_none()
    }

    fn finish(&mut self) {
        self.chunks.clear();
        self.next_block = None;
    }

    /// Byte ranges of `block` covered by the plan. Advances the plan past the
    /// block.
    fn take_block(&mut self, block: &Block) -> Vec<(usize, usize)> {
        let len = block.data.len();
        let block_start = VirtualOffset::new(block.address, 0);
        let block_end = VirtualOffset::new(block.next_address(), 0);

        let mut ranges = Vec::new();
        for chunk in &self.chunks {
            if chunk.start.compressed() > block.address {
                break;
            }
            if chunk.end <= block_start {
                continue;
            }
            let from = if chunk.start.compressed() == block.address {
                usize::from(chunk.start.uncompressed()).min(len)
            } else {
                0
            };
            let to = if chunk.end.compressed() == block.address {
                usize::from(chunk.end.uncompressed()).min(len)
            } else {
                len
            };
            if from < to {
                ranges.push((from, to));
            }
        }

        while self.chunks.front().is_some_and(|c| c.end <= block_end) {
            self.chunks.pop_front();
        }
        self.next_block = self
            .chunks
            .front()
            .map(|c| c.start.compressed().max(block.next_address()))
            .filter(|address| *address < self.length);

        ranges
    }
}

/// Buffered bytes that came from one contiguous range of one block.
#[derive(Debug)]
struct Segment {
    position: VirtualOffset,
    len: usize,
    end: VirtualOffset,
}

struct StreamState {
    plan: AccessPlan,
    buffer: BytesMut,
    segments: VecDeque<Segment>,
    end_position: VirtualOffset,
    load_pending: bool,
    /// Thread name and message of a failed load.
    error: Option<(String, String)>,
    closed: bool,
}

impl StreamState {
    fn has_room_for(&self, incoming: usize) -> bool {
        self.buffer.is_empty() || self.buffer.len() + incoming <= BUFFER_CAPACITY
    }

    fn append_block(&mut self, block: &Block) {
        let len = block.data.len();
        for (from, to) in self.plan.take_block(block) {
            self.buffer.extend_from_slice(&block.data[from..to]);
            let end = if to == len {
                VirtualOffset::new(block.next_address(), 0)
            } else {
                VirtualOffset::new(block.address, to as u16)
            };
            self.segments.push_back(Segment {
                position: VirtualOffset::new(block.address, from as u16),
                len: to - from,
                end,
            });
        }
    }

    fn consume(&mut self, mut n: usize) {
        self.buffer.advance(n);
        while n > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if n >= front.len {
                n -= front.len;
                self.end_position = front.end;
                self.segments.pop_front();
            } else {
                front.len -= n;
                let offset = usize::from(front.position.uncompressed()) + n;
                front.position = VirtualOffset::new(front.position.compressed(), offset as u16);
                n = 0;
            }
        }
    }

    fn virtual_position(&self) -> VirtualOffset {
        self.segments
            .front()
            .map(|s| s.position)
            .unwrap_or(self.end_position)
    }
}

/// State shared between a [`BlockInputStream`] and the loader threads.
pub(crate) struct StreamShared {
    reader: ReaderId,
    state: Mutex<StreamState>,
    changed: Condvar,
}

impl StreamShared {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_block_at(&self, handles: &FileHandleCache, address: u64) -> Result<Option<Block>> {
        let mut handle = handles.claim(&self.reader)?;
        let block = bgzf::read_block(handle.file_mut(), &self.reader.to_string(), address);
        handles.release(handle)?;
        block
    }

    /// Load the next block of the access plan and copy the planned ranges
    /// into the buffer. Runs on a loader thread.
    pub(crate) fn load_next_block(&self, handles: &FileHandleCache) {
        let address = {
            let mut state = self.lock();
            match state.plan.next_block {
                Some(address) if !state.closed => address,
                _ => {
                    state.load_pending = false;
                    self.changed.notify_all();
                    return;
                }
            }
        };

        let loaded = self.read_block_at(handles, address);

        let mut state = self.lock();
        match loaded {
            Ok(Some(block)) => {
                while !state.closed && !state.has_room_for(block.data.len()) {
                    state = self.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                if !state.closed {
                    state.append_block(&block);
                }
            }
            Ok(None) => state.plan.finish(),
            Err(e) => {
                let thread = thread::current().name().unwrap_or("unnamed").to_string();
                tracing::warn!("thread {} failed to load block {} of {}: {}", thread, address, self.reader, e);
                state.error = Some((thread, e.to_string()));
            }
        }
        state.load_pending = false;
        self.changed.notify_all();
    }
}

/// Uncompressed bytes of a file span, inflated ahead of the consumer by the
/// block loading threads.
///
/// Reads block while the buffer is empty and more blocks are planned. A
/// failed load is reported on every subsequent read as [`Error::AsyncIo`],
/// tunnelled through `std::io::Error`.
pub struct BlockInputStream {
    shared: Arc<StreamShared>,
    queue: Arc<LoadQueue>,
}

impl BlockInputStream {
    pub(crate) fn new(reader: ReaderId, length: u64, span: &FileSpan, queue: Arc<LoadQueue>) -> Self {
        let plan = AccessPlan::new(span, length);
        let end_position = span.chunks().first().map(|c| c.start).unwrap_or_default();
        let shared = Arc::new(StreamShared {
            reader,
            state: Mutex::new(StreamState {
                plan,
                buffer: BytesMut::with_capacity(BUFFER_CAPACITY),
                segments: VecDeque::new(),
                end_position,
                load_pending: false,
                error: None,
                closed: false,
            }),
            changed: Condvar::new(),
        });
        Self { shared, queue }
    }

    pub fn reader(&self) -> &ReaderId {
        &self.shared.reader
    }

    /// Virtual offset of the next byte to be read.
    pub fn virtual_position(&self) -> VirtualOffset {
        self.shared.lock().virtual_position()
    }

    /// True once every planned byte has been delivered.
    pub fn eof(&self) -> bool {
        let state = self.shared.lock();
        state.buffer.is_empty() && state.plan.is_exhausted() && !state.load_pending
    }

    fn request_load(&self, state: &mut StreamState) -> Result<()> {
        if !state.load_pending && !state.plan.is_exhausted() && state.buffer.len() < BUFFER_CAPACITY / 2 {
            state.load_pending = true;
            if let Err(e) = self.queue.push(Arc::clone(&self.shared)) {
                state.load_pending = false;
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Read for BlockInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.shared.lock();
        loop {
            if let Some((thread, message)) = &state.error {
                return Err(Error::AsyncIo {
                    thread: thread.clone(),
                    stream: self.shared.reader.to_string(),
                    message: message.clone(),
                }
                .into());
            }

            if !state.buffer.is_empty() {
                let n = buf.len().min(state.buffer.len());
                buf[..n].copy_from_slice(&state.buffer[..n]);
                state.consume(n);
                self.request_load(&mut state)?;
                self.shared.changed.notify_all();
                return Ok(n);
            }

            if state.plan.is_exhausted() && !state.load_pending {
                return Ok(0);
            }

            self.request_load(&mut state)?;
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for BlockInputStream {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.closed = true;
        self.shared.changed.notify_all();
    }
}

/// Record source decoding BAM records from [`BlockInputStream`]s.
pub struct BlockDrivenSource {
    dispatcher: BlockLoadingDispatcher,
}

impl BlockDrivenSource {
    pub fn new(io_threads: usize, file_handles: usize) -> Result<Self> {
        Ok(Self {
            dispatcher: BlockLoadingDispatcher::new(io_threads, file_handles)?,
        })
    }

    pub fn dispatcher(&self) -> &BlockLoadingDispatcher {
        &self.dispatcher
    }
}

impl RecordSource for BlockDrivenSource {
    fn records(&self, reader: &ReaderId, span: &FileSpan) -> Result<RecordIterator> {
        let stream = self.dispatcher.open_stream(reader, span)?;
        tracing::debug!("opened block stream over {} for {}", span, reader);
        Ok(Box::new(BlockRecordIterator {
            reader: bam::io::Reader::from(stream),
            record: bam::Record::default(),
            done: false,
        }))
    }
}

struct BlockRecordIterator {
    reader: bam::io::Reader<BlockInputStream>,
    record: bam::Record,
    done: bool,
}

impl Iterator for BlockRecordIterator {
    type Item = Result<AlignmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let position = self.reader.get_ref().virtual_position();
        let decoded = self
            .reader
            .read_record(&mut self.record)
            .and_then(|n| match n {
                0 => Ok(None),
                _ => AlignmentRecord::from_bam(&self.record, position).map(Some),
            });

        match decoded {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                let err = match crate::error::from_io(e) {
                    Error::Io(e) => Error::MalformedBam {
                        path: self.reader.get_ref().reader().path().to_path_buf(),
                        message: e.to_string(),
                    },
                    other => other,
                };
                Some(Err(err))
            }
        }
    }
}
