//! Recyclable byte buffers for the datagram hot path
//!
//! Broadcasting segments ~50 times a second to every listener would churn
//! the allocator; the pool keeps a stack of fixed-size buffers and hands
//! out owning guards that push themselves back on drop.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

struct PoolShared {
    buffer_size: usize,
    max_pool_size: usize,
    stack: Mutex<Vec<Vec<u8>>>,
}

/// Thread-safe pool of fixed-capacity byte buffers
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, initial_capacity: usize, max_pool_size: usize) -> Self {
        let mut stack = Vec::with_capacity(initial_capacity);
        for _ in 0..initial_capacity {
            stack.push(vec![0u8; buffer_size]);
        }
        Self {
            shared: Arc::new(PoolShared {
                buffer_size,
                max_pool_size,
                stack: Mutex::new(stack),
            }),
        }
    }

    /// Pop a buffer from the pool, or allocate a fresh one if it is empty.
    /// The buffer returns to the pool when the guard drops.
    pub fn acquire(&self) -> PooledBuffer {
        let recycled = self.shared.stack.lock().unwrap().pop();
        let data = recycled.unwrap_or_else(|| vec![0u8; self.shared.buffer_size]);
        PooledBuffer {
            data: Some(data),
            shared: self.shared.clone(),
        }
    }

    /// Number of buffers currently resting in the pool
    pub fn pool_size(&self) -> usize {
        self.shared.stack.lock().unwrap().len()
    }
}

/// Owning guard over a pooled buffer; derefs to the underlying `Vec<u8>`
pub struct PooledBuffer {
    data: Option<Vec<u8>>,
    shared: Arc<PoolShared>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.data.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.data.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(mut data) = self.data.take() else {
            return;
        };
        let mut stack = self.shared.stack.lock().unwrap();
        if stack.len() < self.shared.max_pool_size {
            data.clear();
            data.resize(self.shared.buffer_size, 0);
            stack.push(data);
        }
        // a full pool lets the buffer free itself
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_recycle() {
        let pool = BufferPool::new(64, 2, 4);
        assert_eq!(pool.pool_size(), 2);

        let buffer = pool.acquire();
        assert_eq!(buffer.len(), 64);
        assert_eq!(pool.pool_size(), 1);

        drop(buffer);
        assert_eq!(pool.pool_size(), 2);
    }

    #[test]
    fn test_buffer_reset_on_return() {
        let pool = BufferPool::new(16, 1, 4);

        let mut buffer = pool.acquire();
        buffer.clear();
        buffer.extend_from_slice(&[0xAB; 7]);
        assert_eq!(buffer.len(), 7);
        drop(buffer);

        let buffer = pool.acquire();
        assert_eq!(buffer.len(), 16);
        assert!(buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pool_size_bounded() {
        let pool = BufferPool::new(8, 0, 2);

        let buffers: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        assert_eq!(pool.pool_size(), 0);
        drop(buffers);
        assert_eq!(pool.pool_size(), 2);
    }

    #[test]
    fn test_repeated_cycles_keep_capacity() {
        let pool = BufferPool::new(32, 1, 8);
        for _ in 0..100 {
            let buffer = pool.acquire();
            assert_eq!(buffer.len(), 32);
        }
        assert!(pool.pool_size() <= 8);
    }
}
