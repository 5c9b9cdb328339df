//! Outbound coalescing.
//!
//! Most packets in this protocol are a few dozen bytes. Handing each of them
//! to the socket separately would cost one write per packet, so outgoing bytes
//! are packed into fixed-size [`Gram`]s first and whole grams are written.
//!
//! # In-flight ownership
//!
//! At most one gram per connection is being written at any time. The queue
//! hands that gram to the caller by value when it becomes sendable and takes
//! it back through [`SendQueue::dequeue`] once the write completes, so the
//! bytes being written are never shared with the queue while its lock is
//! released.
//!
//! # Backpressure
//!
//! Pending bytes (the in-flight gram, every full gram waiting behind it and
//! the partially filled gram) are capped. A write that would cross the cap is
//! rejected whole with [`SendQueueError::CapacityExceeded`]; the connection
//! owning the queue is expected to be torn down.

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::error::SendQueueError;
use std::collections::VecDeque;
use std::sync::Arc;

/// Default size of one coalescing gram.
pub const DEFAULT_COALESCE_BUFFER_SIZE: usize = 512;

/// Default cap on bytes pending for one connection.
pub const DEFAULT_PENDING_CAP: usize = 0x20_0000;

/// A fixed-capacity outbound buffer segment.
#[derive(Debug)]
pub struct Gram {
    buffer: PooledBuffer,
    length: usize,
}

impl Gram {
    fn acquire(pool: &Arc<BufferPool>) -> Self {
        Self {
            buffer: pool.acquire(),
            length: 0,
        }
    }

    /// Copies as much of `data` as fits and returns the number of bytes taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let count = self.available().min(data.len());
        self.buffer[self.length..self.length + count].copy_from_slice(&data[..count]);
        self.length += count;
        count
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn available(&self) -> usize {
        self.buffer.len() - self.length
    }

    pub fn is_full(&self) -> bool {
        self.length == self.buffer.len()
    }

    /// The written portion of the gram.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.length]
    }
}

/// Per-connection chain of grams waiting to be written.
#[derive(Debug)]
pub struct SendQueue {
    pool: Arc<BufferPool>,
    pending_cap: usize,
    /// A gram currently owned by the writer
    in_flight: Option<usize>,
    /// Full grams queued behind the in-flight one
    pending: VecDeque<Gram>,
    /// The gram currently being filled
    buffered: Option<Gram>,
}

impl SendQueue {
    /// Creates an empty queue drawing grams from `pool`.
    pub fn new(pool: Arc<BufferPool>, pending_cap: usize) -> Self {
        Self {
            pool,
            pending_cap,
            in_flight: None,
            pending: VecDeque::new(),
            buffered: None,
        }
    }

    /// Bytes counted against the pending cap.
    ///
    /// Full grams count at their capacity, the partial gram at its length.
    pub fn pending_bytes(&self) -> usize {
        let gram_size = self.pool.buffer_size();
        self.in_flight.unwrap_or(0)
            + self.pending.len() * gram_size
            + self.buffered.as_ref().map_or(0, Gram::len)
    }

    pub fn pending_cap(&self) -> usize {
        self.pending_cap
    }

    /// Whether nothing is in flight, pending or buffered.
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty() && self.buffered.is_none()
    }

    /// Whether only a partial gram is waiting, with nothing being written.
    pub fn is_flush_ready(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty() && self.buffered.is_some()
    }

    /// Whether the writer currently owns a gram.
    ///
    /// Stays true across [`SendQueue::clear`] until that gram is handed back
    /// through [`SendQueue::dequeue`].
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Copies `data` into the gram chain.
    ///
    /// Returns the gram the caller must start writing when nothing was in
    /// flight and a gram filled up during this call.
    pub fn enqueue(&mut self, data: &[u8]) -> Result<Option<Gram>, SendQueueError> {
        let pending = self.pending_bytes();
        if pending + data.len() > self.pending_cap {
            return Err(SendQueueError::CapacityExceeded {
                pending,
                requested: data.len(),
                cap: self.pending_cap,
            });
        }

        let mut ready = None;
        let mut rest = data;
        while !rest.is_empty() {
            let gram = self
                .buffered
                .get_or_insert_with(|| Gram::acquire(&self.pool));
            let written = gram.write(rest);
            rest = &rest[written..];

            if gram.is_full() {
                if let Some(full) = self.buffered.take() {
                    if self.in_flight.is_none() && self.pending.is_empty() {
                        self.in_flight = Some(full.capacity());
                        ready = Some(full);
                    } else {
                        self.pending.push_back(full);
                    }
                }
            }
        }

        Ok(ready)
    }

    /// Releases a fully written gram and returns the next one to write.
    ///
    /// The returned gram is in flight. `None` means nothing full is waiting;
    /// the caller may still promote a partial gram with
    /// [`SendQueue::check_flush_ready`].
    pub fn dequeue(&mut self, sent: Gram) -> Option<Gram> {
        drop(sent);
        self.in_flight = None;

        let next = self.pending.pop_front()?;
        self.in_flight = Some(next.capacity());
        Some(next)
    }

    /// Promotes the partial gram to in flight when nothing else is queued.
    pub fn check_flush_ready(&mut self) -> Option<Gram> {
        if !self.is_flush_ready() {
            return None;
        }
        let gram = self.buffered.take()?;
        self.in_flight = Some(gram.len());
        Some(gram)
    }

    /// Drops everything queued, returning the grams to the pool.
    ///
    /// The in-flight gram is not touched: the writer owns it, it still counts
    /// in [`SendQueue::pending_bytes`], and no other gram is handed out until
    /// it comes back through [`SendQueue::dequeue`].
    pub fn clear(&mut self) {
        self.pending.clear();
        self.buffered = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(gram_size: usize, cap: usize) -> (Arc<BufferPool>, SendQueue) {
        let pool = BufferPool::new("Coalesced", 4, gram_size);
        let queue = SendQueue::new(pool.clone(), cap);
        (pool, queue)
    }

    #[test]
    fn test_small_writes_coalesce() {
        let (_pool, mut queue) = queue(16, 1024);
        assert!(queue.enqueue(&[1; 5]).unwrap().is_none());
        assert!(queue.enqueue(&[2; 5]).unwrap().is_none());
        assert!(queue.is_flush_ready());

        let gram = queue.check_flush_ready().expect("partial gram");
        assert_eq!(gram.as_bytes(), &[1, 1, 1, 1, 1, 2, 2, 2, 2, 2]);
        assert!(!queue.is_flush_ready());
        assert!(queue.dequeue(gram).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_gram_is_returned_for_sending() {
        let (_pool, mut queue) = queue(8, 1024);
        let ready = queue.enqueue(&[9; 20]).unwrap().expect("first gram ready");
        assert_eq!(ready.len(), 8);
        assert!(queue.has_in_flight());

        // Second full gram waits behind the in-flight one.
        let next = queue.dequeue(ready).expect("second gram");
        assert_eq!(next.as_bytes(), &[9; 8]);
        assert!(queue.dequeue(next).is_none());

        let tail = queue.check_flush_ready().expect("tail gram");
        assert_eq!(tail.len(), 4);
    }

    #[test]
    fn test_no_gram_returned_while_in_flight() {
        let (_pool, mut queue) = queue(4, 1024);
        let first = queue.enqueue(&[1; 4]).unwrap();
        assert!(first.is_some());
        assert!(queue.enqueue(&[2; 4]).unwrap().is_none());
        assert!(!queue.is_flush_ready());
    }

    #[test]
    fn test_fifo_order_across_grams() {
        let (_pool, mut queue) = queue(4, 1024);
        let data: Vec<u8> = (0..30).collect();
        let mut sent = Vec::new();

        let mut gram = queue.enqueue(&data).unwrap();
        loop {
            match gram {
                Some(g) => {
                    sent.extend_from_slice(g.as_bytes());
                    gram = queue.dequeue(g).or_else(|| queue.check_flush_ready());
                }
                None => break,
            }
        }
        assert_eq!(sent, data);
    }

    #[test]
    fn test_capacity_exceeded_once_at_crossing_call() {
        let (_pool, mut queue) = queue(16, 100);
        let mut failures = 0;
        let mut crossing_call = None;
        let mut total = 0usize;

        for call in 0..20 {
            match queue.enqueue(&[0; 7]) {
                Ok(_) => total += 7,
                Err(SendQueueError::CapacityExceeded { pending, requested, cap }) => {
                    failures += 1;
                    crossing_call.get_or_insert(call);
                    assert_eq!(requested, 7);
                    assert_eq!(cap, 100);
                    assert!(pending + requested > cap);
                    break;
                }
            }
        }

        assert_eq!(failures, 1);
        assert_eq!(crossing_call, Some(total / 7));
        assert!(total <= 100);
        assert!(total + 7 > 100);
    }

    #[test]
    fn test_under_cap_never_fails() {
        let (_pool, mut queue) = queue(32, 4096);
        let mut in_flight = None;
        for _ in 0..100 {
            let ready = queue.enqueue(&[1; 40]).expect("under the cap");
            if ready.is_some() {
                in_flight = ready;
            }
        }
        assert!(in_flight.is_some());
        assert!(queue.pending_bytes() <= 4096);
    }

    #[test]
    fn test_rejected_write_leaves_queue_untouched() {
        let (_pool, mut queue) = queue(16, 32);
        queue.enqueue(&[1; 10]).unwrap();
        let before = queue.pending_bytes();
        assert!(queue.enqueue(&[2; 30]).is_err());
        assert_eq!(queue.pending_bytes(), before);
    }

    #[test]
    fn test_gram_pool_conservation() {
        let (pool, mut queue) = queue(8, 10_000);

        let mut gram = None;
        for i in 0..50u8 {
            if let Some(g) = queue.enqueue(&[i; 13]).unwrap() {
                gram = Some(g);
            }
            if i % 3 == 0 {
                if let Some(g) = gram.take() {
                    gram = queue.dequeue(g).or_else(|| queue.check_flush_ready());
                }
            }
        }
        while let Some(g) = gram.take() {
            gram = queue.dequeue(g).or_else(|| queue.check_flush_ready());
        }

        assert!(queue.is_empty());
        assert_eq!(pool.total_acquired(), pool.total_released());
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_clear_returns_grams() {
        let (pool, mut queue) = queue(8, 10_000);
        let in_flight = queue.enqueue(&[0; 50]).unwrap();
        queue.clear();
        drop(in_flight);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_clear_keeps_writer_gram_until_dequeued() {
        let (pool, mut queue) = queue(8, 10_000);
        let in_flight = queue.enqueue(&[1; 20]).unwrap().expect("full gram");
        queue.clear();

        assert!(queue.has_in_flight());
        assert!(!queue.is_empty());
        assert_eq!(queue.pending_bytes(), 8);

        assert!(queue.enqueue(&[2; 8]).unwrap().is_none());
        assert!(queue.check_flush_ready().is_none());

        let next = queue.dequeue(in_flight).expect("queued after clear");
        assert_eq!(next.as_bytes(), &[2; 8]);
        assert!(queue.dequeue(next).is_none());
        assert!(!queue.has_in_flight());
        assert!(queue.is_empty());
        assert_eq!(pool.stats().in_use, 0);
    }
}
