//! Lock-free single-producer/single-consumer byte ring buffer.
//!
//! Modelled after the boost spsc_queue design: storage holds one byte more
//! than the capacity so that a full buffer can be told apart from an empty
//! one, and the two indices live on separate cache lines. Writes publish
//! with release ordering, reads acquire.
//!
//! The contiguous-array accessors (`first_read_array`/`first_write_array`
//! plus their `commit_*` counterparts) expose the largest slice that can be
//! consumed or filled without wrapping, so the transport can hand the ring
//! directly to socket reads and writes.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

pub struct LockFreeRingBuffer {
    write_idx: CachePadded<AtomicUsize>,
    read_idx: CachePadded<AtomicUsize>,
    capacity: usize,
    data: Box<[UnsafeCell<u8>]>,
}

// SAFETY: the SPSC protocol guarantees that the producer only touches the
// region [write_idx, read_idx) and the consumer only [read_idx, write_idx),
// with the index stores ordering the hand-over. Exactly one producer and one
// consumer may use the buffer at a time.
unsafe impl Send for LockFreeRingBuffer {}
unsafe impl Sync for LockFreeRingBuffer {}

impl LockFreeRingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        let data = (0..capacity + 1)
            .map(|_| UnsafeCell::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            write_idx: CachePadded::new(AtomicUsize::new(0)),
            read_idx: CachePadded::new(AtomicUsize::new(0)),
            capacity,
            data,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn storage_len(&self) -> usize {
        self.capacity + 1
    }

    fn avail_for_read(&self, wi: usize, ri: usize) -> usize {
        if wi >= ri {
            wi - ri
        } else {
            wi + self.storage_len() - ri
        }
    }

    fn avail_for_write(&self, wi: usize, ri: usize) -> usize {
        let n = ri.wrapping_sub(wi).wrapping_sub(1);
        if wi >= ri {
            n.wrapping_add(self.storage_len())
        } else {
            n
        }
    }

    fn next_index(&self, idx: usize) -> usize {
        let idx = idx + 1;
        if idx >= self.storage_len() {
            idx - self.storage_len()
        } else {
            idx
        }
    }

    unsafe fn slot(&self, idx: usize) -> *mut u8 {
        self.data[idx].get()
    }

    pub fn empty(&self) -> bool {
        let wi = self.write_idx.load(Ordering::Relaxed);
        let ri = self.read_idx.load(Ordering::Relaxed);
        wi == ri
    }

    pub fn full(&self) -> bool {
        let wi = self.write_idx.load(Ordering::Relaxed);
        let ri = self.read_idx.load(Ordering::Acquire);
        self.avail_for_write(wi, ri) == 0
    }

    /// First readable byte. Must not be called on an empty buffer.
    pub fn front(&self) -> u8 {
        debug_assert!(!self.empty());
        let ri = self.read_idx.load(Ordering::Relaxed);
        unsafe { *self.slot(ri) }
    }

    /// Drops the first readable byte. Must not be called on an empty buffer.
    pub fn pop(&self) {
        debug_assert!(!self.empty());
        let ri = self.read_idx.load(Ordering::Relaxed);
        self.read_idx.store(self.next_index(ri), Ordering::Release);
    }

    /// Consumes bytes one at a time until `f` returns true or the readable
    /// region is exhausted.
    pub fn pop_until<F: FnMut(u8) -> bool>(&self, mut f: F) {
        let wi = self.write_idx.load(Ordering::Acquire);
        let mut ri = self.read_idx.load(Ordering::Relaxed);

        while self.avail_for_read(wi, ri) > 0 {
            let byte = unsafe { *self.slot(ri) };
            ri = self.next_index(ri);
            if f(byte) {
                break;
            }
        }

        self.read_idx.store(ri, Ordering::Release);
    }

    pub fn available_for_read(&self) -> usize {
        let wi = self.write_idx.load(Ordering::Acquire);
        let ri = self.read_idx.load(Ordering::Relaxed);
        self.avail_for_read(wi, ri)
    }

    pub fn available_for_write(&self) -> usize {
        let wi = self.write_idx.load(Ordering::Relaxed);
        let ri = self.read_idx.load(Ordering::Acquire);
        self.avail_for_write(wi, ri)
    }

    /// Copies up to `buffer.len()` readable bytes out; returns how many.
    pub fn read(&self, buffer: &mut [u8]) -> usize {
        let wi = self.write_idx.load(Ordering::Acquire);
        let ri = self.read_idx.load(Ordering::Relaxed);

        let n = buffer.len().min(self.avail_for_read(wi, ri));
        if n == 0 {
            return 0;
        }

        let mut idx = ri;
        for slot in buffer.iter_mut().take(n) {
            *slot = unsafe { *self.slot(idx) };
            idx = self.next_index(idx);
        }

        self.read_idx.store(idx, Ordering::Release);
        n
    }

    /// Drops up to `max_size` readable bytes; returns how many were dropped.
    pub fn discard(&self, max_size: usize) -> usize {
        let wi = self.write_idx.load(Ordering::Acquire);
        let ri = self.read_idx.load(Ordering::Relaxed);

        let n = max_size.min(self.avail_for_read(wi, ri));
        let mut new_ri = ri + n;
        if new_ri >= self.storage_len() {
            new_ri -= self.storage_len();
        }

        self.read_idx.store(new_ri, Ordering::Release);
        n
    }

    /// Copies up to `data.len()` bytes in; returns how many fit.
    pub fn write(&self, data: &[u8]) -> usize {
        let wi = self.write_idx.load(Ordering::Relaxed);
        let ri = self.read_idx.load(Ordering::Acquire);

        let n = data.len().min(self.avail_for_write(wi, ri));
        if n == 0 {
            return 0;
        }

        let mut idx = wi;
        for &byte in data.iter().take(n) {
            unsafe { *self.slot(idx) = byte };
            idx = self.next_index(idx);
        }

        self.write_idx.store(idx, Ordering::Release);
        n
    }

    /// Largest contiguous readable slice (no wrap-around).
    ///
    /// The slice stays valid until the consumer advances the read index; the
    /// producer never writes into it.
    pub fn first_read_array(&self) -> &[u8] {
        let wi = self.write_idx.load(Ordering::Acquire);
        let ri = self.read_idx.load(Ordering::Relaxed);

        let len = if wi < ri { self.storage_len() - ri } else { wi - ri };

        // SAFETY: [ri, ri + len) is owned by the consumer under the SPSC
        // protocol and contiguous within the storage.
        unsafe { std::slice::from_raw_parts(self.slot(ri).cast_const(), len) }
    }

    /// Advances the read index by `n`, which must not exceed the length
    /// reported by [`Self::first_read_array`].
    pub fn commit_first_read_array(&self, n: usize) {
        debug_assert!(n <= self.first_read_array().len());

        let mut ri = self.read_idx.load(Ordering::Relaxed) + n;
        if ri >= self.storage_len() {
            ri -= self.storage_len();
        }

        self.read_idx.store(ri, Ordering::Release);
    }

    /// Largest contiguous writable slice (no wrap-around).
    ///
    /// The slice stays valid until the producer advances the write index; the
    /// consumer never reads from it.
    #[allow(clippy::mut_from_ref)]
    pub fn first_write_array(&self) -> &mut [u8] {
        let wi = self.write_idx.load(Ordering::Relaxed);
        let ri = self.read_idx.load(Ordering::Acquire);

        let len = if wi < ri {
            ri - wi - 1
        } else {
            self.storage_len() - wi - usize::from(ri == 0)
        };

        // SAFETY: [wi, wi + len) is owned by the producer under the SPSC
        // protocol and contiguous within the storage.
        unsafe { std::slice::from_raw_parts_mut(self.slot(wi), len) }
    }

    /// Advances the write index by `n`, which must not exceed the length
    /// reported by [`Self::first_write_array`].
    pub fn commit_first_write_array(&self, n: usize) {
        debug_assert!(n <= self.first_write_array().len());

        let mut wi = self.write_idx.load(Ordering::Relaxed) + n;
        if wi >= self.storage_len() {
            wi -= self.storage_len();
        }

        self.write_idx.store(wi, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let rb = LockFreeRingBuffer::new(8);
        assert!(rb.empty());
        assert!(!rb.full());
        assert_eq!(rb.available_for_read(), 0);
        assert_eq!(rb.available_for_write(), 8);
    }

    #[test]
    fn read_preserves_write_order() {
        let rb = LockFreeRingBuffer::new(16);
        assert_eq!(rb.write(b"hello world"), 11);

        let mut buf = [0u8; 16];
        let n = rb.read(&mut buf);
        assert_eq!(&buf[..n], b"hello world");
        assert!(rb.empty());
    }

    #[test]
    fn write_stops_at_capacity() {
        let rb = LockFreeRingBuffer::new(4);
        assert_eq!(rb.write(b"abcdef"), 4);
        assert!(rb.full());
        assert_eq!(rb.write(b"x"), 0);

        let mut buf = [0u8; 8];
        assert_eq!(rb.read(&mut buf), 4);
        assert_eq!(&buf[..4], b"abcd");
    }

    #[test]
    fn wrap_around() {
        let rb = LockFreeRingBuffer::new(4);
        let mut buf = [0u8; 8];

        for round in 0u8..10 {
            let data = [round, round.wrapping_add(1), round.wrapping_add(2)];
            assert_eq!(rb.write(&data), 3);
            assert_eq!(rb.read(&mut buf), 3);
            assert_eq!(&buf[..3], &data);
        }
    }

    #[test]
    fn available_counts_sum_to_capacity() {
        let rb = LockFreeRingBuffer::new(10);
        rb.write(b"abc");
        let mut buf = [0u8; 1];
        rb.read(&mut buf);

        for step in 0..20 {
            rb.write(&[step as u8]);
            assert_eq!(rb.available_for_read() + rb.available_for_write(), 10);
            rb.read(&mut buf);
            assert_eq!(rb.available_for_read() + rb.available_for_write(), 10);
        }
    }

    #[test]
    fn front_and_pop() {
        let rb = LockFreeRingBuffer::new(4);
        rb.write(b"xy");
        assert_eq!(rb.front(), b'x');
        rb.pop();
        assert_eq!(rb.front(), b'y');
        rb.pop();
        assert!(rb.empty());
    }

    #[test]
    fn pop_until_stops_at_predicate() {
        let rb = LockFreeRingBuffer::new(8);
        rb.write(&[1, 2, 3, 4, 5]);

        let mut seen = Vec::new();
        rb.pop_until(|b| {
            seen.push(b);
            b == 3
        });

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(rb.available_for_read(), 2);
        assert_eq!(rb.front(), 4);
    }

    #[test]
    fn first_arrays_are_contiguous_and_committable() {
        let rb = LockFreeRingBuffer::new(6);

        let wa = rb.first_write_array();
        assert_eq!(wa.len(), 6);
        wa[..4].copy_from_slice(b"abcd");
        rb.commit_first_write_array(4);

        let ra = rb.first_read_array();
        assert_eq!(ra, b"abcd");
        rb.commit_first_read_array(2);

        let ra = rb.first_read_array();
        assert_eq!(ra, b"cd");

        // Writable region now wraps; the first array ends at the storage end.
        let wa = rb.first_write_array();
        assert_eq!(wa.len(), 3);
    }

    #[test]
    fn discard_drops_bytes_in_order() {
        let rb = LockFreeRingBuffer::new(8);
        rb.write(b"abcdef");
        assert_eq!(rb.discard(2), 2);

        let mut buf = [0u8; 8];
        let n = rb.read(&mut buf);
        assert_eq!(&buf[..n], b"cdef");
        assert_eq!(rb.discard(1), 0);
    }

    #[test]
    fn concurrent_producer_consumer() {
        use std::sync::Arc;

        let rb = Arc::new(LockFreeRingBuffer::new(64));
        let total = 100_000usize;

        let producer = {
            let rb = Arc::clone(&rb);
            std::thread::spawn(move || {
                let mut next = 0usize;
                while next < total {
                    if rb.write(&[next as u8]) == 1 {
                        next += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0usize;
        let mut buf = [0u8; 32];
        while expected < total {
            let n = rb.read(&mut buf);
            for &byte in &buf[..n] {
                assert_eq!(byte, expected as u8);
                expected += 1;
            }
            if n == 0 {
                std::thread::yield_now();
            }
        }

        producer.join().unwrap();
    }
}
