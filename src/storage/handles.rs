use super::ReaderId;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Cache key. The generation keeps two handles on the same file apart.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HandleKey {
    reader: ReaderId,
    generation: u64,
}

/// An open file claimed from a [`FileHandleCache`].
#[derive(Debug)]
pub struct FileHandle {
    key: HandleKey,
    file: File,
}

impl FileHandle {
    pub fn reader(&self) -> &ReaderId {
        &self.key.reader
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

#[derive(Default)]
struct CacheState {
    /// Least recently released first.
    idle: VecDeque<FileHandle>,
    in_use: usize,
    next_generation: u64,
}

/// Bounds the number of files held open by the block loaders.
///
/// A claim reuses an idle handle on the same file when there is one, opens a
/// new file while under capacity, evicts the least recently used idle handle
/// when at capacity, and otherwise waits for a release.
pub struct FileHandleCache {
    capacity: usize,
    state: Mutex<CacheState>,
    released: Condvar,
}

impl FileHandleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
            released: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Handles currently open, idle or claimed.
    pub fn open_handles(&self) -> Result<usize> {
        let state = self.lock()?;
        Ok(state.idle.len() + state.in_use)
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("file handle cache lock poisoned".to_string()))
    }

    pub fn claim(&self, reader: &ReaderId) -> Result<FileHandle> {
        let mut state = self.lock()?;
        loop {
            if let Some(i) = state.idle.iter().position(|h| h.key.reader == *reader) {
                if let Some(handle) = state.idle.remove(i) {
                    state.in_use += 1;
                    return Ok(handle);
                }
            }

            if state.idle.len() + state.in_use < self.capacity {
                let generation = state.next_generation;
                state.next_generation += 1;
                let file = File::open(reader.path())?;
                state.in_use += 1;
                return Ok(FileHandle {
                    key: HandleKey {
                        reader: reader.clone(),
                        generation,
                    },
                    file,
                });
            }

            if let Some(evicted) = state.idle.pop_front() {
                tracing::debug!(
                    "closing file handle {}#{} to make room for {}",
                    evicted.key.reader,
                    evicted.key.generation,
                    reader
                );
                continue;
            }

            state = self
                .released
                .wait(state)
                .map_err(|_| Error::Internal("file handle cache lock poisoned".to_string()))?;
        }
    }

    pub fn release(&self, handle: FileHandle) -> Result<()> {
        let mut state = self.lock()?;
        state.in_use = state.in_use.saturating_sub(1);
        state.idle.push_back(handle);
        self.released.notify_all();
        Ok(())
    }
}
