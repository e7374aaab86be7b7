//! Reusable response body buffers.
//!
//! A [`PooledBuffer`] goes back to its pool when dropped, so every exit path
//! of the processing stage releases the body without an explicit call.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_buffers: usize,
    reused: AtomicUsize,
    allocated: AtomicUsize,
}

impl BufferPool {
    /// `buffer_size` is the largest capacity a returned buffer may have and
    /// still be kept; `max_buffers` bounds the number of idle buffers.
    pub fn new(buffer_size: usize, max_buffers: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::new()),
            buffer_size,
            max_buffers,
            reused: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        })
    }

    /// Takes an idle buffer (or allocates one) with room for at least
    /// `capacity_hint` bytes, capped at the pool's buffer size.
    pub fn acquire(self: &Arc<Self>, capacity_hint: usize) -> PooledBuffer {
        let reserve = capacity_hint.min(self.buffer_size);
        let idle = self
            .buffers
            .lock()
            .map(|mut buffers| buffers.pop())
            .unwrap_or(None);

        let mut data = match idle {
            Some(buffer) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        };
        data.reserve(reserve);

        PooledBuffer {
            data,
            pool: Some(Arc::clone(self)),
        }
    }

    fn release(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() > self.buffer_size {
            return;
        }

        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < self.max_buffers {
                buffer.clear();
                buffers.push(buffer);
            }
        }
    }

    pub fn get_stats(&self) -> BufferStats {
        let available_buffers = self.buffers.lock().map(|b| b.len()).unwrap_or(0);
        BufferStats {
            available_buffers,
            max_buffers: self.max_buffers,
            buffer_size: self.buffer_size,
            reused: self.reused.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferStats {
    pub available_buffers: usize,
    pub max_buffers: usize,
    pub buffer_size: usize,
    pub reused: usize,
    pub allocated: usize,
}

/// A byte buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Option<Arc<BufferPool>>,
}

impl PooledBuffer {
    /// Wraps bytes that belong to no pool; dropping simply frees them.
    pub fn detached(data: Vec<u8>) -> Self {
        Self { data, pool: None }
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("max_buffers", &self.max_buffers)
            .finish()
    }
}
