use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Capacity of a freshly allocated buffer: enough for the largest reply
/// frame (domain form with a 255 byte name)
pub const DEFAULT_BUFFER_CAPACITY: usize = 262;

/// Buffers kept for reuse; anything returned past this is freed
pub const DEFAULT_MAX_RETAINED: usize = 64;

/// BufferPool hands out reusable byte buffers. Each acquisition is exclusive
/// and goes back to the pool when its guard is dropped.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_capacity: usize,
    max_retained: usize,
}

impl BufferPool {
    /// new creates an empty pool
    pub fn new(buffer_capacity: usize, max_retained: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            buffer_capacity,
            max_retained,
        }
    }

    /// get takes a buffer out of the pool (or allocates one), reset to empty
    pub fn get(&self) -> PooledBuffer<'_> {
        let reused = match self.buffers.lock() {
            Ok(mut buffers) => buffers.pop(),
            Err(_) => None,
        };

        let mut buf = reused.unwrap_or_else(|| Vec::with_capacity(self.buffer_capacity));
        buf.clear();

        PooledBuffer { buf, pool: self }
    }

    /// available returns the number of idle buffers held by the pool
    pub fn available(&self) -> usize {
        self.buffers.lock().map(|buffers| buffers.len()).unwrap_or(0)
    }

    fn put(&self, buf: Vec<u8>) {
        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < self.max_retained {
                buffers.push(buf);
            }
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_RETAINED)
    }
}

/// PooledBuffer is a buffer on loan from a BufferPool
pub struct PooledBuffer<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
