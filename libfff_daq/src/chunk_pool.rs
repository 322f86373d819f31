use bit_set::BitSet;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

struct PoolState {
    free: Vec<(usize, Vec<u8>)>,
    pinned: BitSet,
    high_water: usize,
    stopped: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    released: Condvar,
    chunk_capacity: usize,
    n_buffers: usize,
}

impl PoolInner {
    fn release(&self, slot: usize, buffer: Vec<u8>) {
        let mut state = self.state.lock();
        state.pinned.remove(slot);
        state.free.push((slot, buffer));
        drop(state);
        self.released.notify_one();
    }
}

/// A fixed set of reusable chunk buffers.
///
/// Exactly `n_buffers` buffers are allocated up front and never more, so there can
/// never be more chunks in flight than the pool holds. A buffer comes back to the
/// pool when the Chunk owning it is dropped.
#[derive(Clone)]
pub struct ChunkPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPool")
            .field("n_buffers", &self.inner.n_buffers)
            .field("chunk_capacity", &self.inner.chunk_capacity)
            .field("pinned", &self.pinned())
            .finish()
    }
}

impl ChunkPool {
    /// Callers validate that neither argument is zero
    pub fn new(n_buffers: usize, chunk_capacity: usize) -> Self {
        let free = (0..n_buffers)
            .map(|slot| (slot, vec![0u8; chunk_capacity]))
            .collect();
        log::info!(
            "Allocated {n_buffers} chunk buffers of {} ({} total)",
            human_bytes::human_bytes(chunk_capacity as f64),
            human_bytes::human_bytes((chunk_capacity * n_buffers) as f64)
        );
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    free,
                    pinned: BitSet::with_capacity(n_buffers),
                    high_water: 0,
                    stopped: false,
                }),
                released: Condvar::new(),
                chunk_capacity,
                n_buffers,
            }),
        }
    }

    /// Take a free buffer, waiting for one to be released if all are pinned.
    ///
    /// Returns None once the pool has been stopped.
    pub fn acquire(&self) -> Option<Chunk> {
        let mut state = self.inner.state.lock();
        loop {
            if state.stopped {
                return None;
            }
            if let Some((slot, buffer)) = state.free.pop() {
                state.pinned.insert(slot);
                state.high_water = state.high_water.max(state.pinned.len());
                return Some(Chunk {
                    slot,
                    buffer,
                    len: 0,
                    pool: Arc::clone(&self.inner),
                });
            }
            self.inner.released.wait(&mut state);
        }
    }

    /// Take a free buffer only if one is available right now
    pub fn try_acquire(&self) -> Option<Chunk> {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return None;
        }
        let (slot, buffer) = state.free.pop()?;
        state.pinned.insert(slot);
        state.high_water = state.high_water.max(state.pinned.len());
        Some(Chunk {
            slot,
            buffer,
            len: 0,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Wake every waiter; all further acquires return None
    pub fn stop(&self) {
        self.inner.state.lock().stopped = true;
        self.inner.released.notify_all();
    }

    pub fn pinned(&self) -> usize {
        self.inner.state.lock().pinned.len()
    }

    /// The most buffers that were ever pinned at once
    pub fn high_water(&self) -> usize {
        self.inner.state.lock().high_water
    }

    pub fn n_buffers(&self) -> usize {
        self.inner.n_buffers
    }

    pub fn chunk_capacity(&self) -> usize {
        self.inner.chunk_capacity
    }
}

/// One pool buffer and the number of valid bytes in it.
pub struct Chunk {
    slot: usize,
    buffer: Vec<u8>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("slot", &self.slot)
            .field("len", &self.len)
            .finish()
    }
}

impl Chunk {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// The unfilled tail of the buffer
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.len..]
    }

    /// Mark `n` more bytes of the spare tail as valid
    pub fn advance(&mut self, n: usize) {
        self.len = (self.len + n).min(self.buffer.len());
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        self.pool
            .release(self.slot, std::mem::take(&mut self.buffer));
    }
}
