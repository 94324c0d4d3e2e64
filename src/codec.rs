//! Reusable scratch buffers for packet marshalling.
//!
//! The association marshals every outbound packet into a buffer taken from
//! its own [`BufferPool`]; the [`PooledBuf`] guard hands the buffer back
//! when it goes out of scope.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;

/// Default capacity of a fresh buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1500;

/// Default number of idle buffers retained.
pub const DEFAULT_MAX_IDLE: usize = 64;

/// A pool of reusable [`BytesMut`] buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    idle: Arc<Mutex<Vec<BytesMut>>>,
    capacity: usize,
    max_idle: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_IDLE)
    }
}

impl BufferPool {
    /// Create a pool handing out buffers of at least `capacity` bytes and
    /// keeping at most `max_idle` of them around.
    pub fn new(capacity: usize, max_idle: usize) -> Self {
        Self {
            idle: Arc::new(Mutex::new(Vec::with_capacity(max_idle))),
            capacity,
            max_idle,
        }
    }

    /// Take an empty buffer from the pool, allocating if none is idle.
    pub fn acquire(&self) -> PooledBuf {
        let recycled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let buf = recycled.unwrap_or_else(|| BytesMut::with_capacity(self.capacity));
        PooledBuf {
            buf,
            pool: self.clone(),
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

/// A buffer borrowed from a [`BufferPool`], returned on drop.
#[derive(Debug)]
pub struct PooledBuf {
    buf: BytesMut,
    pool: BufferPool,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_buffer_is_recycled() {
        let pool = BufferPool::new(64, 4);
        {
            let mut buf = pool.acquire();
            buf.put_slice(b"scratch");
            assert_eq!(&buf[..], b"scratch");
        }
        assert_eq!(pool.idle_count(), 1);

        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 7);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_idle_limit() {
        let pool = BufferPool::new(16, 2);
        let bufs: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(bufs);
        assert_eq!(pool.idle_count(), 2);
    }
}
