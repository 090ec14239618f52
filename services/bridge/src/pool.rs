//! Reusable copy buffers.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Size of every pooled buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Buffers kept around once returned; extra ones are freed.
const MAX_IDLE: usize = 1024;

/// A shared free list of fixed-size byte buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                size,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Take a buffer, allocating when the free list is empty. It goes back to
    /// the pool when the guard drops.
    pub fn get(&self) -> PooledBuffer {
        let buf = self
            .inner
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| vec![0u8; self.inner.size].into_boxed_slice());
        PooledBuffer {
            buf: Some(buf),
            pool: self.inner.clone(),
        }
    }

    /// Buffers currently waiting for reuse.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(buf) = self.buf.take() else {
            return;
        };
        if let Ok(mut free) = self.pool.free.lock() {
            if free.len() < MAX_IDLE {
                free.push(buf);
            }
        }
    }
}
