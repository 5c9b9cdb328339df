//! Growable ring buffer for undecoded inbound bytes.
//!
//! A socket read is never assumed to line up with packet boundaries. Each
//! connection appends whatever it reads to its [`ByteQueue`], and the message
//! pump peeks the opcode and declared length, waits until a whole packet is
//! buffered, then dequeues exactly one packet's worth.

/// Backing store sizes are rounded up to this alignment when growing.
const GROWTH_ALIGNMENT: usize = 2048;

/// Default initial capacity for a connection's inbound queue.
pub const DEFAULT_CAPACITY: usize = 2048;

/// Returned by [`ByteQueue::peek_packet_id`] when nothing is buffered.
pub const NO_PACKET_ID: u8 = 0xFF;

/// FIFO byte queue over a circular array.
///
/// `head` is the index of the oldest byte and `tail` the index one past the
/// newest, both modulo the backing length. When the queue drains completely
/// both reset to zero.
#[derive(Debug, Clone)]
pub struct ByteQueue {
    buffer: Vec<u8>,
    head: usize,
    tail: usize,
    size: usize,
}

impl Default for ByteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity.max(1)],
            head: 0,
            tail: 0,
            size: 0,
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Length of the backing array.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Drops all buffered bytes, keeping the backing array.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.size = 0;
    }

    /// First buffered byte, or [`NO_PACKET_ID`] when empty.
    pub fn peek_packet_id(&self) -> u8 {
        if self.size >= 1 {
            self.buffer[self.head]
        } else {
            NO_PACKET_ID
        }
    }

    /// Big-endian value of the second and third buffered bytes, or 0 when
    /// fewer than three bytes are buffered.
    pub fn peek_packet_length(&self) -> u16 {
        if self.size >= 3 {
            let cap = self.buffer.len();
            let hi = self.buffer[(self.head + 1) % cap] as u16;
            let lo = self.buffer[(self.head + 2) % cap] as u16;
            (hi << 8) | lo
        } else {
            0
        }
    }

    fn set_capacity(&mut self, capacity: usize) {
        let mut grown = vec![0u8; capacity];
        if self.size > 0 {
            self.copy_out(&mut grown[..self.size]);
        }
        self.head = 0;
        self.tail = self.size;
        self.buffer = grown;
    }

    /// Copies the oldest `dest.len()` bytes into `dest` without consuming.
    fn copy_out(&self, dest: &mut [u8]) {
        let count = dest.len();
        let right = self.buffer.len() - self.head;
        if right >= count {
            dest.copy_from_slice(&self.buffer[self.head..self.head + count]);
        } else {
            dest[..right].copy_from_slice(&self.buffer[self.head..]);
            dest[right..].copy_from_slice(&self.buffer[..count - right]);
        }
    }

    /// Appends `data`, growing the backing array when it would overflow.
    pub fn enqueue(&mut self, data: &[u8]) {
        let count = data.len();
        if count == 0 {
            return;
        }

        let needed = self.size + count;
        if needed > self.buffer.len() {
            let aligned = (needed + GROWTH_ALIGNMENT - 1) & !(GROWTH_ALIGNMENT - 1);
            self.set_capacity(aligned);
        }

        let cap = self.buffer.len();
        let right = cap - self.tail;
        if right >= count {
            self.buffer[self.tail..self.tail + count].copy_from_slice(data);
        } else {
            self.buffer[self.tail..].copy_from_slice(&data[..right]);
            self.buffer[..count - right].copy_from_slice(&data[right..]);
        }

        self.tail = (self.tail + count) % cap;
        self.size += count;
    }

    /// Removes up to `dest.len()` bytes into `dest` and returns how many were
    /// removed.
    pub fn dequeue(&mut self, dest: &mut [u8]) -> usize {
        let count = dest.len().min(self.size);
        if count == 0 {
            return 0;
        }

        self.copy_out(&mut dest[..count]);
        self.head = (self.head + count) % self.buffer.len();
        self.size -= count;

        if self.size == 0 {
            self.head = 0;
            self.tail = 0;
        }

        count
    }

    /// Drops up to `count` bytes from the front and returns how many were
    /// dropped.
    pub fn skip(&mut self, count: usize) -> usize {
        let count = count.min(self.size);
        if count == 0 {
            return 0;
        }
        self.head = (self.head + count) % self.buffer.len();
        self.size -= count;
        if self.size == 0 {
            self.head = 0;
            self.tail = 0;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn lcg_next(state: &mut u64) -> u32 {
        *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        (*state >> 32) as u32
    }

    #[test]
    fn test_empty_queue_sentinels() {
        let queue = ByteQueue::new();
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.peek_packet_id(), NO_PACKET_ID);
        assert_eq!(queue.peek_packet_length(), 0);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut queue = ByteQueue::new();
        queue.enqueue(&[0xAE, 0x01, 0x02]);
        assert_eq!(queue.peek_packet_id(), 0xAE);
        assert_eq!(queue.peek_packet_length(), 0x0102);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_packet_length_needs_three_bytes() {
        let mut queue = ByteQueue::new();
        queue.enqueue(&[0x1C, 0x00]);
        assert_eq!(queue.peek_packet_id(), 0x1C);
        assert_eq!(queue.peek_packet_length(), 0);
    }

    #[test]
    fn test_partial_dequeue_returns_available() {
        let mut queue = ByteQueue::new();
        queue.enqueue(&[1, 2, 3]);
        let mut dest = [0u8; 8];
        assert_eq!(queue.dequeue(&mut dest), 3);
        assert_eq!(&dest[..3], &[1, 2, 3]);
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(&mut dest), 0);
    }

    #[test]
    fn test_indices_reset_after_drain() {
        let mut queue = ByteQueue::with_capacity(8);
        queue.enqueue(&[1, 2, 3, 4, 5]);
        let mut dest = [0u8; 5];
        queue.dequeue(&mut dest);
        assert_eq!(queue.head, 0);
        assert_eq!(queue.tail, 0);
    }

    #[test]
    fn test_growth_is_aligned() {
        let mut queue = ByteQueue::with_capacity(16);
        queue.enqueue(&[7u8; 100]);
        assert_eq!(queue.capacity(), 2048);
        queue.enqueue(&vec![9u8; 2000]);
        assert_eq!(queue.capacity(), 4096);
        assert_eq!(queue.len(), 2100);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut queue = ByteQueue::new();
        queue.enqueue(&vec![0u8; 5000]);
        let capacity = queue.capacity();
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), capacity);
        assert_eq!(queue.peek_packet_id(), NO_PACKET_ID);
    }

    #[test]
    fn test_wraparound_matches_linear_model() {
        let mut queue = ByteQueue::with_capacity(16);
        let mut model: VecDeque<u8> = VecDeque::new();
        let mut next = 0u8;

        // Fill close to capacity, drain partially, then write across the wrap point.
        for chunk in [14usize, 0, 10, 0, 9, 0] {
            if chunk > 0 {
                let data: Vec<u8> = (0..chunk).map(|_| { next = next.wrapping_add(1); next }).collect();
                queue.enqueue(&data);
                model.extend(&data);
            } else {
                let mut dest = [0u8; 11];
                let taken = queue.dequeue(&mut dest);
                let expected: Vec<u8> = model.drain(..taken).collect();
                assert_eq!(&dest[..taken], expected.as_slice());
            }
            assert_eq!(queue.len(), model.len());
        }

        let mut rest = vec![0u8; model.len()];
        assert_eq!(queue.dequeue(&mut rest), model.len());
        assert_eq!(rest, model.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_growth_while_wrapped_preserves_order() {
        let mut queue = ByteQueue::with_capacity(8);
        queue.enqueue(&[1, 2, 3, 4, 5, 6]);
        let mut dest = [0u8; 4];
        queue.dequeue(&mut dest);
        queue.enqueue(&[7, 8, 9, 10]);
        // Wrapped now: force a regrow.
        queue.enqueue(&[11, 12, 13, 14, 15]);

        let mut out = vec![0u8; queue.len()];
        queue.dequeue(&mut out);
        assert_eq!(out, vec![5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn test_random_round_trip() {
        let mut state = 0x5EED_u64;
        let mut queue = ByteQueue::with_capacity(32);
        let mut model: VecDeque<u8> = VecDeque::new();
        let mut bytes_in = 0usize;
        let mut bytes_out = 0usize;

        for _ in 0..2000 {
            if lcg_next(&mut state) % 2 == 0 {
                let len = (lcg_next(&mut state) % 97) as usize;
                let data: Vec<u8> = (0..len).map(|_| lcg_next(&mut state) as u8).collect();
                queue.enqueue(&data);
                model.extend(&data);
                bytes_in += len;
            } else {
                let len = (lcg_next(&mut state) % 113) as usize;
                let mut dest = vec![0u8; len];
                let taken = queue.dequeue(&mut dest);
                let expected: Vec<u8> = model.drain(..taken).collect();
                assert_eq!(&dest[..taken], expected.as_slice());
                bytes_out += taken;
            }
            assert_eq!(queue.len(), bytes_in - bytes_out);
        }

        let mut rest = vec![0u8; queue.len()];
        queue.dequeue(&mut rest);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.peek_packet_id(), NO_PACKET_ID);
        assert_eq!(queue.peek_packet_length(), 0);
    }

    #[test]
    fn test_skip_discards_front() {
        let mut queue = ByteQueue::new();
        queue.enqueue(&[1, 2, 3, 4]);
        assert_eq!(queue.skip(2), 2);
        assert_eq!(queue.peek_packet_id(), 3);
        assert_eq!(queue.skip(10), 2);
        assert!(queue.is_empty());
    }
}
