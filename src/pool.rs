//! Reusable I/O buffers shared by every connection.
//!
//! A buffer is taken for one read or one write, then cleared and handed back.
//! The free list is bounded: releasing into a full pool drops the buffer, and
//! buffers that were resized or issued under an older
//! [`BufferPool::set_buffer_size`] are never mixed back in.

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::mux_trace;

/// How far a pooled buffer may outgrow the configured size and still be kept.
pub const MAX_GROWTH: usize = 2;

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    data: BytesMut,
    size: usize,
}

impl PooledBuffer {
    /// The configured pool size this buffer was issued under.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn into_inner(self) -> BytesMut {
        self.data
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

pub struct BufferPool {
    buffer_size: AtomicUsize,
    free: ArrayQueue<PooledBuffer>,
}

impl BufferPool {
    /// `capacity` bounds how many idle buffers are kept, not how many may be in use.
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        Self {
            buffer_size: AtomicUsize::new(buffer_size),
            free: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size.load(Ordering::Acquire)
    }

    /// Buffers of the previous size are discarded as they come back.
    pub fn set_buffer_size(&self, size: usize) {
        self.buffer_size.store(size, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn acquire(&self) -> PooledBuffer {
        let size = self.buffer_size();
        while let Some(buf) = self.free.pop() {
            if buf.size == size {
                return buf;
            }
            mux_trace!("Dropping stale pooled buffer ({} B, pool is {} B)", buf.size, size);
        }
        PooledBuffer { data: BytesMut::with_capacity(size), size }
    }

    /// Returns `true` when the buffer went back on the free list.
    ///
    /// Buffers that grew past [`MAX_GROWTH`] times the configured size for a
    /// large frame are dropped, so idle memory stays bounded by
    /// `capacity * size * MAX_GROWTH`.
    pub fn release(&self, mut buf: PooledBuffer) -> bool {
        let size = self.buffer_size();
        let held = buf.data.capacity();
        if buf.size != size || held < size || held > size.saturating_mul(MAX_GROWTH) {
            mux_trace!("Dropping pooled buffer ({} B capacity, pool is {} B)", held, size);
            return false;
        }
        buf.data.clear();
        self.free.push(buf).is_ok()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BUFFER_SIZE, crate::config::DEFAULT_POOL_CAPACITY)
    }
}
