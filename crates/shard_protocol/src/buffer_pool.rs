//! Fixed-size byte buffer recycling.
//!
//! Every receive, coalesced send and compiled packet needs a scratch buffer.
//! Allocating those per operation across thousands of long-lived connections
//! produces a steady stream of short-lived heap allocations, so the network
//! core draws them from named [`BufferPool`]s instead.
//!
//! # Ownership
//!
//! [`BufferPool::acquire`] hands out a [`PooledBuffer`] guard. Dropping the
//! guard returns the buffer to the pool it came from, so a buffer is returned
//! exactly once on every exit path, including error paths and task
//! cancellation.
//!
//! # Growth
//!
//! A pool never fails and never shrinks. When the free list is empty the pool
//! allocates another `initial_capacity` buffers and records a miss, which is
//! exposed through [`PoolStats`] for capacity planning.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A named pool of equally sized byte buffers.
///
/// The free list is guarded by a single lock that is only held for a push or
/// a pop, which keeps the pool safe to share between every connection task.
pub struct BufferPool {
    name: String,
    buffer_size: usize,
    initial_capacity: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    current_capacity: AtomicUsize,
    misses: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Point-in-time counters for a [`BufferPool`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Pool name as given at construction
    pub name: String,
    /// Buffers currently sitting in the free list
    pub free_count: usize,
    /// Number of buffers allocated up front
    pub initial_capacity: usize,
    /// Total number of pooled buffers ever allocated
    pub current_capacity: usize,
    /// Size in bytes of every pooled buffer
    pub buffer_size: usize,
    /// Number of times the pool was empty on acquire
    pub misses: u64,
    /// Pooled buffers currently checked out
    pub in_use: u64,
}

impl BufferPool {
    /// Creates a pool and pre-allocates `initial_capacity` buffers of
    /// `buffer_size` bytes each.
    pub fn new(name: impl Into<String>, initial_capacity: usize, buffer_size: usize) -> Arc<Self> {
        let buffer_size = buffer_size.max(1);
        let free = (0..initial_capacity)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();

        Arc::new(Self {
            name: name.into(),
            buffer_size,
            initial_capacity,
            free: Mutex::new(free),
            current_capacity: AtomicUsize::new(initial_capacity),
            misses: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        })
    }

    /// Takes a buffer from the pool, growing the pool when it is exhausted.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let popped = self.free.lock().pop();
        let data = match popped {
            Some(data) => data,
            None => self.grow(),
        };

        self.acquired.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            data: Some(data),
            pool: Some(self.clone()),
        }
    }

    /// Takes a buffer able to hold at least `len` bytes.
    ///
    /// Requests larger than the pool's buffer size get a dedicated allocation
    /// that is freed on drop instead of being pooled.
    pub fn acquire_sized(self: &Arc<Self>, len: usize) -> PooledBuffer {
        if len <= self.buffer_size {
            self.acquire()
        } else {
            PooledBuffer::unpooled(len)
        }
    }

    fn grow(&self) -> Box<[u8]> {
        let batch = self.initial_capacity.max(1);
        self.misses.fetch_add(1, Ordering::Relaxed);
        let capacity = self.current_capacity.fetch_add(batch, Ordering::Relaxed) + batch;
        debug!(
            pool = %self.name,
            capacity,
            "🪣 Buffer pool exhausted, growing by {} buffers",
            batch
        );

        let mut fresh: Vec<Box<[u8]>> = (0..batch)
            .map(|_| vec![0u8; self.buffer_size].into_boxed_slice())
            .collect();
        let data = fresh
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());
        if !fresh.is_empty() {
            self.free.lock().extend(fresh);
        }
        data
    }

    fn release(&self, data: Box<[u8]>) {
        self.released.fetch_add(1, Ordering::Relaxed);
        if data.len() == self.buffer_size {
            self.free.lock().push(data);
        }
    }

    /// Name given to the pool at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of every pooled buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently available without growing.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Total number of pooled buffers ever allocated.
    pub fn current_capacity(&self) -> usize {
        self.current_capacity.load(Ordering::Relaxed)
    }

    /// Number of acquires that found the pool empty.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Total buffers handed out since construction.
    pub fn total_acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Total buffers given back since construction.
    pub fn total_released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        let acquired = self.total_acquired();
        let released = self.total_released();
        PoolStats {
            name: self.name.clone(),
            free_count: self.free_count(),
            initial_capacity: self.initial_capacity,
            current_capacity: self.current_capacity(),
            buffer_size: self.buffer_size,
            misses: self.misses(),
            in_use: acquired.saturating_sub(released),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.name)
            .field("buffer_size", &self.buffer_size)
            .field("current_capacity", &self.current_capacity())
            .field("misses", &self.misses())
            .finish()
    }
}

/// A buffer checked out of a [`BufferPool`].
///
/// Dereferences to the full buffer slice. The buffer goes back to its pool
/// when the guard is dropped.
pub struct PooledBuffer {
    data: Option<Box<[u8]>>,
    pool: Option<Arc<BufferPool>>,
}

impl PooledBuffer {
    /// A zeroed buffer that does not belong to any pool.
    pub fn unpooled(len: usize) -> Self {
        Self {
            data: Some(vec![0u8; len].into_boxed_slice()),
            pool: None,
        }
    }

    /// Whether dropping this buffer returns it to a pool.
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Capacity of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let (Some(data), Some(pool)) = (self.data.take(), self.pool.take()) {
            pool.release(data);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.capacity())
            .field("pool", &self.pool.as_ref().map(|p| p.name()))
            .finish()
    }
}

/// Explicitly constructed registry of the pools owned by one server.
///
/// Pools are registered here so operators can read all of their counters in
/// one place; there is no process-wide pool list.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: Mutex<Vec<Arc<BufferPool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pool and registers it.
    pub fn create(
        &self,
        name: impl Into<String>,
        initial_capacity: usize,
        buffer_size: usize,
    ) -> Arc<BufferPool> {
        let pool = BufferPool::new(name, initial_capacity, buffer_size);
        self.pools.lock().push(pool.clone());
        pool
    }

    /// Looks a registered pool up by name.
    pub fn get(&self, name: &str) -> Option<Arc<BufferPool>> {
        self.pools.lock().iter().find(|p| p.name() == name).cloned()
    }

    /// Counters of every registered pool, in registration order.
    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.lock().iter().map(|p| p.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_return() {
        let pool = BufferPool::new("test", 4, 64);
        assert_eq!(pool.free_count(), 4);

        let buffer = pool.acquire();
        assert_eq!(buffer.len(), 64);
        assert!(buffer.is_pooled());
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.stats().in_use, 1);

        drop(buffer);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.misses(), 0);
    }

    #[test]
    fn test_pool_grows_on_miss() {
        let pool = BufferPool::new("grow", 2, 16);
        let held: Vec<_> = (0..3).map(|_| pool.acquire()).collect();

        assert_eq!(pool.misses(), 1);
        assert_eq!(pool.current_capacity(), 4);
        assert_eq!(pool.free_count(), 1);

        drop(held);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.total_acquired(), pool.total_released());
    }

    #[test]
    fn test_oversized_request_is_not_pooled() {
        let pool = BufferPool::new("sized", 1, 32);
        let big = pool.acquire_sized(100);
        assert!(!big.is_pooled());
        assert_eq!(big.len(), 100);
        drop(big);

        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.total_acquired(), 0);

        let small = pool.acquire_sized(10);
        assert!(small.is_pooled());
        assert_eq!(small.len(), 32);
    }

    #[test]
    fn test_buffers_are_reused() {
        let pool = BufferPool::new("reuse", 1, 8);
        {
            let mut buffer = pool.acquire();
            buffer[0] = 0xAB;
        }
        let buffer = pool.acquire();
        assert_eq!(buffer[0], 0xAB);
        assert_eq!(pool.misses(), 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = BufferPool::new("threads", 8, 128);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut buffer = pool.acquire();
                        buffer[0] = 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker thread panicked");
        }

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.free_count, stats.current_capacity);
        assert_eq!(pool.total_acquired(), 8000);
    }

    #[test]
    fn test_registry_reports_all_pools() {
        let registry = PoolRegistry::new();
        registry.create("Receive", 2, 2048);
        registry.create("Coalesced", 4, 512);

        let stats = registry.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "Receive");
        assert_eq!(stats[1].buffer_size, 512);
        assert!(registry.get("Coalesced").is_some());
        assert!(registry.get("Missing").is_none());
    }
}
