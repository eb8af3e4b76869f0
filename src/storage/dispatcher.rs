use super::handles::FileHandleCache;
use super::stream::{BlockInputStream, StreamShared};
use super::ReaderId;
use crate::index::FileSpan;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Arc<StreamShared>>,
    shutdown: bool,
}

/// FIFO of streams waiting for their next block.
#[derive(Default)]
pub(crate) struct LoadQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl LoadQueue {
    pub(crate) fn push(&self, stream: Arc<StreamShared>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.shutdown {
            return Err(Error::Internal("block loader has been shut down".to_string()));
        }
        state.pending.push_back(stream);
        self.ready.notify_one();
        Ok(())
    }

    /// Next request, or `None` once shut down and drained.
    fn pop(&self) -> Option<Arc<StreamShared>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(stream) = state.pending.pop_front() {
                return Some(stream);
            }
            if state.shutdown {
                return None;
            }
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.shutdown = true;
        self.ready.notify_all();
    }
}

/// Fixed pool of threads loading BGZF blocks on behalf of block streams.
pub struct BlockLoadingDispatcher {
    queue: Arc<LoadQueue>,
    handles: Arc<FileHandleCache>,
    workers: Vec<JoinHandle<()>>,
}

impl BlockLoadingDispatcher {
    pub fn new(io_threads: usize, file_handles: usize) -> Result<Self> {
        if io_threads == 0 {
            return Err(Error::InvalidConfig(
                "block loading needs at least one I/O thread".to_string(),
            ));
        }

        let queue = Arc::new(LoadQueue::default());
        let handles = Arc::new(FileHandleCache::new(file_handles));
        let mut workers = Vec::with_capacity(io_threads);

        for i in 0..io_threads {
            let worker_queue = Arc::clone(&queue);
            let handles = Arc::clone(&handles);
            let worker = thread::Builder::new()
                .name(format!("bamshard-io-{i}"))
                .spawn(move || {
                    while let Some(stream) = worker_queue.pop() {
                        stream.load_next_block(&handles);
                    }
                });
            match worker {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    queue.shutdown();
                    return Err(e.into());
                }
            }
        }

        tracing::info!(
            "started {} block loading threads sharing {} file handles",
            io_threads,
            handles.capacity()
        );
        Ok(Self {
            queue,
            handles,
            workers,
        })
    }

    pub fn io_threads(&self) -> usize {
        self.workers.len()
    }

    pub fn file_handles(&self) -> &FileHandleCache {
        &self.handles
    }

    /// Open a stream delivering the uncompressed bytes of `span`.
    pub fn open_stream(&self, reader: &ReaderId, span: &FileSpan) -> Result<BlockInputStream> {
        let length = std::fs::metadata(reader.path())?.len();
        Ok(BlockInputStream::new(
            reader.clone(),
            length,
            span,
            Arc::clone(&self.queue),
        ))
    }
}

impl Drop for BlockLoadingDispatcher {
    fn drop(&mut self) {
        self.queue.shutdown();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("block loading thread panicked");
            }
        }
    }
}
