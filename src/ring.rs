// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 adsrs-core contributors
//
// Single-producer single-consumer byte ring sized for notification bursts.
// Adapted from `circ.rs`'s cursor discipline (producer only advances a
// write cursor, consumer only advances a read cursor, both atomic),
// generalized from a 256-slot element array to a plain contiguous byte
// ring, since this only needs bytes in/bytes out, not fixed-size elements —
// the dispatcher worker parses variable-length notification frames out of
// it itself.
//
// The buffer storage is wrapped in an `UnsafeCell` so the producer and
// consumer sides can both take `&self`, with no lock between the reader
// thread and the dispatcher worker. Soundness rests entirely on the SPSC
// discipline: only the `AmsConnection` reader thread may call the
// write-side methods, only the owning dispatcher worker may call the
// read-side methods, and the two halves never touch the same byte range
// (enforced by the atomic cursors, exactly as in the circular buffer this
// is adapted from).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A fixed-capacity SPSC byte ring.
pub struct RingBuffer {
    buf: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    write_cursor: AtomicUsize,
    read_cursor: AtomicUsize,
}

// SAFETY: the only shared mutable state is `buf`, and access to it is
// partitioned by the atomic cursors into a single-producer/single-consumer
// discipline enforced by callers (see module doc comment).
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be nonzero");
        Self {
            buf: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
            write_cursor: AtomicUsize::new(0),
            read_cursor: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently occupied (written but not yet read).
    pub fn bytes_used(&self) -> usize {
        let w = self.write_cursor.load(Ordering::Acquire);
        let r = self.read_cursor.load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    /// Bytes free for the producer to write without overtaking the consumer.
    pub fn bytes_free(&self) -> usize {
        self.capacity - self.bytes_used()
    }

    /// The largest contiguous writable span starting at the current write
    /// cursor, without wrapping past the end of the backing array. The
    /// producer may need to call this (and `advance_write`) twice to write
    /// a chunk that straddles the wrap point.
    ///
    /// Caller contract: only the single producer thread may call this.
    fn write_chunk(&self) -> &mut [u8] {
        let w = self.write_cursor.load(Ordering::Relaxed);
        let r = self.read_cursor.load(Ordering::Acquire);
        let used = w.wrapping_sub(r);
        let free = self.capacity - used;
        let widx = w % self.capacity;
        let contiguous = free.min(self.capacity - widx);
        // SAFETY: partitioned from the consumer's readable range by the
        // cursors; only the producer thread reaches this method.
        unsafe {
            let ptr = (*self.buf.get()).as_mut_ptr();
            std::slice::from_raw_parts_mut(ptr.add(widx), contiguous)
        }
    }

    /// Advance the write cursor by `n` bytes after filling `n` bytes of the
    /// slice returned by `write_chunk`.
    fn advance_write(&self, n: usize) {
        self.write_cursor.fetch_add(n, Ordering::Release);
    }

    /// The largest contiguous readable span starting at the current read
    /// cursor, without wrapping.
    ///
    /// Caller contract: only the single consumer thread may call this.
    fn read_chunk(&self) -> &[u8] {
        let w = self.write_cursor.load(Ordering::Acquire);
        let r = self.read_cursor.load(Ordering::Relaxed);
        let used = w.wrapping_sub(r);
        let ridx = r % self.capacity;
        let contiguous = used.min(self.capacity - ridx);
        // SAFETY: partitioned from the producer's writable range by the
        // cursors; only the consumer thread reaches this method.
        unsafe {
            let ptr = (*self.buf.get()).as_ptr();
            std::slice::from_raw_parts(ptr.add(ridx), contiguous)
        }
    }

    /// Advance the read cursor by `n` bytes after consuming `n` bytes of the
    /// slice returned by `read_chunk`.
    fn advance_read(&self, n: usize) {
        self.read_cursor.fetch_add(n, Ordering::Release);
    }

    /// Copy `data` into the ring across as many contiguous pieces as needed.
    /// Caller must have already checked `bytes_free() >= data.len()`. Only
    /// the producer thread may call this.
    pub fn write_all(&self, mut data: &[u8]) {
        while !data.is_empty() {
            let chunk = self.write_chunk();
            let n = chunk.len().min(data.len());
            chunk[..n].copy_from_slice(&data[..n]);
            self.advance_write(n);
            data = &data[n..];
        }
    }

    /// Drain and discard `n` bytes — used when a notification is dropped
    /// for overflow, or a malformed frame's advertised length must be
    /// skipped. Only the consumer thread may call this.
    pub fn drain(&self, mut n: usize) {
        while n > 0 {
            let chunk_len = self.read_chunk().len();
            if chunk_len == 0 {
                break;
            }
            let take = chunk_len.min(n);
            self.advance_read(take);
            n -= take;
        }
    }

    /// Stream exactly `n` bytes into the ring by repeatedly calling
    /// `read_exact` against successive contiguous write spans, used by the
    /// `AmsConnection` reader thread to copy socket bytes straight into a
    /// dispatcher's ring without an intermediate allocation. Caller must
    /// have already checked `bytes_free() >= n`. Only the producer thread
    /// may call this.
    pub fn fill_from<F>(&self, mut read_exact: F, mut n: usize) -> std::io::Result<()>
    where
        F: FnMut(&mut [u8]) -> std::io::Result<()>,
    {
        while n > 0 {
            let chunk = self.write_chunk();
            let take = chunk.len().min(n);
            read_exact(&mut chunk[..take])?;
            self.advance_write(take);
            n -= take;
        }
        Ok(())
    }

    /// Copy up to `buf.len()` consumed bytes out of the ring, returning the
    /// number of bytes copied. Used by the dispatcher worker to materialize
    /// a contiguous notification-frame buffer from the ring for parsing.
    /// Only the consumer thread may call this.
    pub fn read_into(&self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let chunk = self.read_chunk();
            if chunk.is_empty() {
                break;
            }
            let n = chunk.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&chunk[..n]);
            self.advance_read(n);
            copied += n;
        }
        copied
    }
}
