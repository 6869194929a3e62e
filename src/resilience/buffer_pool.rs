//! # BufferPool
//!
//! ## Responsibility
//! Hand out preallocated byte buffers for request payloads so the worker does
//! not allocate a fresh multi-megabyte buffer per call.
//!
//! ## Guarantees
//! - Scoped: a [`PooledBuffer`] returns itself to the pool on drop, on every
//!   exit path including errors and unwinding
//! - Clean: a released buffer is emptied before the next acquirer sees it
//! - Non-blocking: exhaustion never waits; it hands out an unpooled buffer and
//!   bumps a counter
//! - Grow-only resize: a smaller count is ignored; buffers are never reclaimed
//!
//! ## NOT Responsible For
//! - Enforcing payload limits (callers validate sizes before copying in)
//! - Zeroing memory (buffers are truncated, not wiped)

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::BufferPoolSection;
use crate::metrics;

#[derive(Debug)]
enum Slot {
    Free(Vec<u8>),
    InUse,
}

#[derive(Debug)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

#[derive(Debug)]
struct PoolInner {
    name: String,
    buffer_size: usize,
    slots: Mutex<Slots>,
    total_acquired: AtomicU64,
    total_fallbacks: AtomicU64,
}

impl PoolInner {
    fn release(&self, index: usize, mut buf: Vec<u8>) {
        buf.clear();
        if buf.capacity() > self.buffer_size {
            buf.shrink_to(self.buffer_size);
        }
        let mut slots = self.slots.lock();
        slots.slots[index] = Slot::Free(buf);
        slots.free.push(index);
    }
}

/// Fixed set of reusable byte buffers plus a free-list of indices.
///
/// Cheap to clone; clones share the same buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

/// Point-in-time statistics of a [`BufferPool`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferPoolSnapshot {
    /// Pool name.
    pub name: String,
    /// Number of pooled buffers.
    pub pool_size: usize,
    /// Pooled buffers ready to hand out.
    pub available: usize,
    /// Pooled buffers currently held by callers.
    pub in_use: usize,
    /// Acquisitions since creation, pooled or not.
    pub total_acquired: u64,
    /// Acquisitions served by an unpooled buffer.
    pub total_fallbacks: u64,
    /// `total_fallbacks / total_acquired`, `0.0` before the first acquisition.
    pub fallback_rate: f64,
    /// Capacity of each pooled buffer.
    pub buffer_size_bytes: usize,
}

impl BufferPool {
    /// Preallocate `pool_size` buffers of `buffer_size` bytes each.
    pub fn new(name: impl Into<String>, buffer_size: usize, pool_size: usize) -> Self {
        let name = name.into();
        let slots = (0..pool_size)
            .map(|_| Slot::Free(Vec::with_capacity(buffer_size)))
            .collect();
        // Pop order hands out index 0 first.
        let free = (0..pool_size).rev().collect();
        info!(pool = %name, buffer_size, pool_size, "buffer pool created");
        Self {
            inner: Arc::new(PoolInner {
                name,
                buffer_size,
                slots: Mutex::new(Slots { slots, free }),
                total_acquired: AtomicU64::new(0),
                total_fallbacks: AtomicU64::new(0),
            }),
        }
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Capacity of each pooled buffer.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Take a buffer, falling back to a fresh unpooled one when exhausted.
    pub fn acquire(&self) -> PooledBuffer {
        self.inner.total_acquired.fetch_add(1, Ordering::Relaxed);

        let taken = {
            let mut slots = self.inner.slots.lock();
            slots.free.pop().and_then(|index| {
                match std::mem::replace(&mut slots.slots[index], Slot::InUse) {
                    Slot::Free(buf) => Some((index, buf)),
                    other => {
                        // Free-list and slot state disagree; leave the slot as it was.
                        slots.slots[index] = other;
                        None
                    }
                }
            })
        };

        match taken {
            Some((index, buf)) => PooledBuffer {
                buf,
                pos: 0,
                home: Some((Arc::clone(&self.inner), index)),
            },
            None => {
                self.inner.total_fallbacks.fetch_add(1, Ordering::Relaxed);
                metrics::inc_pool_fallback(&self.inner.name);
                debug!(pool = %self.inner.name, "pool exhausted, using unpooled buffer");
                PooledBuffer {
                    buf: Vec::with_capacity(self.inner.buffer_size),
                    pos: 0,
                    home: None,
                }
            }
        }
    }

    /// Grow the pool to `new_count` buffers.
    ///
    /// The pool only grows. A count at or below the current size is ignored;
    /// buffers are never taken back from the pool or from their holders.
    pub fn resize(&self, new_count: usize) {
        let mut slots = self.inner.slots.lock();
        let old = slots.slots.len();
        if new_count <= old {
            debug!(
                pool = %self.inner.name,
                current = old,
                requested = new_count,
                "buffer pool resize ignored (pool only grows)"
            );
            return;
        }
        for index in old..new_count {
            slots
                .slots
                .push(Slot::Free(Vec::with_capacity(self.inner.buffer_size)));
            slots.free.push(index);
        }
        info!(pool = %self.inner.name, from = old, to = new_count, "buffer pool resized");
    }

    /// Point-in-time statistics.
    pub fn snapshot(&self) -> BufferPoolSnapshot {
        let (pool_size, available, in_use) = {
            let slots = self.inner.slots.lock();
            let in_use = slots
                .slots
                .iter()
                .filter(|s| matches!(s, Slot::InUse))
                .count();
            (slots.slots.len(), slots.free.len(), in_use)
        };
        let total_acquired = self.inner.total_acquired.load(Ordering::Relaxed);
        let total_fallbacks = self.inner.total_fallbacks.load(Ordering::Relaxed);
        let fallback_rate = if total_acquired == 0 {
            0.0
        } else {
            total_fallbacks as f64 / total_acquired as f64
        };
        BufferPoolSnapshot {
            name: self.inner.name.clone(),
            pool_size,
            available,
            in_use,
            total_acquired,
            total_fallbacks,
            fallback_rate,
            buffer_size_bytes: self.inner.buffer_size,
        }
    }
}

/// Exclusively owned buffer handed out by [`BufferPool::acquire`].
///
/// Behaves like an in-memory cursor: [`Write`] appends, [`Read`] consumes
/// from the current read position, [`PooledBuffer::rewind`] starts over.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pos: usize,
    home: Option<(Arc<PoolInner>, usize)>,
}

impl PooledBuffer {
    /// Reset the read position to the start.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Written contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Allocated capacity.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Whether this buffer came from the pool (as opposed to a fallback).
    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }

    /// Drop the contents and reset the read position.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Write for PooledBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for PooledBuffer {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let remaining = self.buf.get(self.pos..).unwrap_or_default();
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some((pool, index)) = self.home.take() {
            pool.release(index, std::mem::take(&mut self.buf));
        }
    }
}

/// The worker's named pools, constructed once and injected.
#[derive(Debug, Clone)]
pub struct BufferPools {
    /// Image payloads (detection, OCR, VQA).
    pub image: BufferPool,
    /// Audio payloads (transcription).
    pub audio: BufferPool,
}

impl BufferPools {
    /// Build both pools from the `[buffer_pool]` section. A disabled section
    /// yields empty pools, so every acquisition is unpooled.
    pub fn from_section(section: &BufferPoolSection) -> Self {
        let (image_count, audio_count) = if section.enabled {
            (section.image_pool_size, section.audio_pool_size)
        } else {
            (0, 0)
        };
        Self {
            image: BufferPool::new("image", section.image_buffer_bytes, image_count),
            audio: BufferPool::new("audio", section.audio_buffer_bytes, audio_count),
        }
    }

    /// Snapshots of both pools.
    pub fn snapshots(&self) -> Vec<BufferPoolSnapshot> {
        vec![self.image.snapshot(), self.audio.snapshot()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release_reuses_buffer() {
        let pool = BufferPool::new("t", 64, 2);
        {
            let mut buf = pool.acquire();
            assert!(buf.is_pooled());
            buf.write_all(b"hello").expect("test: write");
            assert_eq!(pool.snapshot().in_use, 1);
            assert_eq!(pool.snapshot().available, 1);
        }
        let snap = pool.snapshot();
        assert_eq!(snap.in_use, 0);
        assert_eq!(snap.available, 2);

        let buf = pool.acquire();
        assert!(buf.is_empty(), "released buffer must be empty for the next acquirer");
        assert!(buf.capacity() >= 64);
    }

    #[test]
    fn test_exhaustion_falls_back_to_unpooled() {
        let pool = BufferPool::new("t", 16, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        let mut c = pool.acquire();
        assert!(a.is_pooled() && b.is_pooled());
        assert!(!c.is_pooled());
        c.write_all(b"still usable").expect("test: write");
        assert_eq!(c.as_slice(), b"still usable");

        let snap = pool.snapshot();
        assert_eq!(snap.total_acquired, 3);
        assert_eq!(snap.total_fallbacks, 1);
        assert!((snap.fallback_rate - 1.0 / 3.0).abs() < 1e-9);

        drop(c);
        // Overflow buffer is discarded, not added to the pool.
        assert_eq!(pool.snapshot().available, 0);
        drop(a);
        drop(b);
        assert_eq!(pool.snapshot().available, 2);
    }

    #[test]
    fn test_cursor_read_write_rewind() {
        let pool = BufferPool::new("t", 32, 1);
        let mut buf = pool.acquire();
        buf.write_all(b"abcdef").expect("test: write");

        let mut first = [0u8; 4];
        buf.read_exact(&mut first).expect("test: read");
        assert_eq!(&first, b"abcd");

        let mut rest = Vec::new();
        buf.read_to_end(&mut rest).expect("test: read rest");
        assert_eq!(rest, b"ef");

        buf.rewind();
        let mut all = Vec::new();
        buf.read_to_end(&mut all).expect("test: read all");
        assert_eq!(all, b"abcdef");
    }

    #[test]
    fn test_release_on_panic_path() {
        let pool = BufferPool::new("t", 8, 1);
        let cloned = pool.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _buf = cloned.acquire();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(pool.snapshot().available, 1);
    }

    #[test]
    fn test_resize_grow_adds_buffers() {
        let pool = BufferPool::new("t", 8, 1);
        pool.resize(3);
        let snap = pool.snapshot();
        assert_eq!(snap.pool_size, 3);
        assert_eq!(snap.available, 3);
        let held: Vec<_> = (0..3).map(|_| pool.acquire()).collect();
        assert!(held.iter().all(PooledBuffer::is_pooled));
    }

    #[test]
    fn test_resize_smaller_count_is_ignored() {
        let pool = BufferPool::new("t", 8, 3);
        let a = pool.acquire();
        pool.resize(1);

        let snap = pool.snapshot();
        assert_eq!(snap.pool_size, 3);
        assert_eq!(snap.in_use, 1);
        assert_eq!(snap.available, 2, "idle buffers stay pooled");

        drop(a);
        let snap = pool.snapshot();
        assert_eq!((snap.pool_size, snap.available), (3, 3));
        let held: Vec<_> = (0..3).map(|_| pool.acquire()).collect();
        assert!(held.iter().all(PooledBuffer::is_pooled));
    }

    #[test]
    fn test_concurrent_acquire_beyond_pool_size() {
        let pool = BufferPool::new("t", 64, 4);
        let barrier = Arc::new(std::sync::Barrier::new(16));
        let threads: Vec<_> = (0..16u8)
            .map(|i| {
                let pool = pool.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let pattern = vec![i; 48];
                    barrier.wait();
                    let mut buf = pool.acquire();
                    assert!(buf.is_empty());
                    buf.write_all(&pattern).expect("test: write");
                    std::thread::yield_now();
                    let mut back = Vec::new();
                    buf.read_to_end(&mut back).expect("test: read");
                    assert_eq!(back, pattern, "thread {i} saw another thread's bytes");
                })
            })
            .collect();
        for t in threads {
            t.join().expect("test: thread");
        }

        let snap = pool.snapshot();
        assert_eq!(snap.available, 4);
        assert_eq!(snap.in_use, 0);
        assert_eq!(snap.total_acquired, 16);
    }

    #[test]
    fn test_pools_from_disabled_section_are_unpooled() {
        let section = BufferPoolSection {
            enabled: false,
            ..BufferPoolSection::default()
        };
        let pools = BufferPools::from_section(&section);
        assert!(!pools.image.acquire().is_pooled());
        assert_eq!(pools.snapshots().len(), 2);
    }

    #[test]
    fn test_oversized_write_shrinks_back_on_release() {
        let pool = BufferPool::new("t", 16, 1);
        {
            let mut buf = pool.acquire();
            buf.write_all(&[7u8; 1024]).expect("test: write");
        }
        let buf = pool.acquire();
        assert!(buf.is_pooled());
        assert!(buf.capacity() < 1024);
    }
}
