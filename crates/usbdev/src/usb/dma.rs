//! DMA-capable transfer buffers
//!
//! Outbound data is staged in a [`DmaBuffer`] taken from the transport's
//! [`DmaPool`]. A buffer is freed by dropping it, so ownership alone decides
//! who frees it and when. The pool keeps counters so the exactly-once rule is
//! observable.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::trace;

/// Allocation counters of a [`DmaPool`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaStats {
    /// Buffers handed out since the pool was created
    pub allocations: u64,
    /// Buffers returned since the pool was created
    pub frees: u64,
    /// Bytes currently held by live buffers
    pub outstanding_bytes: usize,
}

impl DmaStats {
    /// Buffers allocated and not yet freed
    ///
    /// The counters are sampled one after the other, so a snapshot taken
    /// during a concurrent allocate and free may show more frees.
    pub fn live(&self) -> u64 {
        self.allocations.saturating_sub(self.frees)
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    limit: Option<usize>,
    outstanding: AtomicUsize,
    allocations: AtomicU64,
    frees: AtomicU64,
}

/// Source of DMA-capable buffers for one transport
#[derive(Debug, Clone, Default)]
pub struct DmaPool {
    inner: Arc<PoolInner>,
}

impl DmaPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool that refuses to hold more than `limit` bytes at once
    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                limit: Some(limit),
                ..PoolInner::default()
            }),
        }
    }

    /// Allocate a zeroed buffer of `size` bytes
    ///
    /// Returns `None` when the pool limit would be exceeded or the allocator
    /// cannot satisfy the request.
    pub fn allocate(&self, size: usize) -> Option<DmaBuffer> {
        self.reserve(size)?;

        let mut data = Vec::new();
        if data.try_reserve_exact(size).is_err() {
            self.inner.outstanding.fetch_sub(size, Ordering::AcqRel);
            return None;
        }
        data.resize(size, 0);

        self.inner.allocations.fetch_add(1, Ordering::AcqRel);
        trace!("DMA buffer allocated: {} bytes", size);

        Some(DmaBuffer {
            data: data.into_boxed_slice(),
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn stats(&self) -> DmaStats {
        DmaStats {
            allocations: self.inner.allocations.load(Ordering::Acquire),
            frees: self.inner.frees.load(Ordering::Acquire),
            outstanding_bytes: self.inner.outstanding.load(Ordering::Acquire),
        }
    }

    fn reserve(&self, size: usize) -> Option<()> {
        let limit = match self.inner.limit {
            Some(limit) => limit,
            None => {
                self.inner.outstanding.fetch_add(size, Ordering::AcqRel);
                return Some(());
            }
        };

        self.inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(size).filter(|total| *total <= limit)
            })
            .ok()
            .map(|_| ())
    }
}

/// A buffer owned by exactly one party at a time; dropping it frees it
#[derive(Debug)]
pub struct DmaBuffer {
    data: Box<[u8]>,
    pool: Arc<PoolInner>,
}

impl DmaBuffer {
    /// Return the buffer to its pool
    pub fn free(self) {
        drop(self);
    }
}

impl Deref for DmaBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for DmaBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.pool
            .outstanding
            .fetch_sub(self.data.len(), Ordering::AcqRel);
        self.pool.frees.fetch_add(1, Ordering::AcqRel);
        trace!("DMA buffer freed: {} bytes", self.data.len());
    }
}
