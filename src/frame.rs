// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 adsrs-core contributors
//
// Owned, prepend-oriented byte buffer for protocol framing.
// Adapted from `IpcBuffer`'s (buffer.rs) ownership model — a thin wrapper
// around a byte vector — generalized to a windowed prepend/append/limit
// discipline: headers are built outermost-last by prepending at the
// *current* start of the window, so the AoE header goes on before the
// AmsTcp header, in the same buffer, with no extra copy.

use crate::error::BufferTooSmall;

/// An owned byte buffer with capacity `C`, a window `[start, end)`, and
/// prepend/append/limit operations for building wire frames outermost-last.
///
/// Invariant: `0 <= start <= end <= capacity`.
pub struct Frame {
    data: Vec<u8>,
    start: usize,
    end: usize,
}

impl Frame {
    /// Create a frame with `capacity` bytes of backing storage and
    /// `header_room` bytes reserved at the front for subsequent `prepend`
    /// calls. The window starts empty, positioned after the reserved room.
    pub fn with_capacity(capacity: usize, header_room: usize) -> Self {
        assert!(header_room <= capacity, "header_room exceeds capacity");
        Self {
            data: vec![0u8; capacity],
            start: header_room,
            end: header_room,
        }
    }

    /// A frame sized for exactly one AmsTcpHeader + one AoEHeader of
    /// prepend room plus `payload_len` bytes of append room — the common
    /// case for building one outgoing request.
    pub fn for_request(payload_len: usize) -> Self {
        use crate::wire::{AMS_TCP_HEADER_LEN, AOE_HEADER_LEN};
        let header_room = AMS_TCP_HEADER_LEN + AOE_HEADER_LEN;
        Self::with_capacity(header_room + payload_len, header_room)
    }

    /// Number of bytes currently in the window.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Total backing capacity.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The current window as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Append `bytes` at the end of the window, growing the backing vector
    /// if `end + bytes.len()` exceeds capacity.
    pub fn append(&mut self, bytes: &[u8]) {
        let needed_end = self.end + bytes.len();
        if needed_end > self.data.len() {
            self.data.resize(needed_end, 0);
        }
        self.data[self.end..needed_end].copy_from_slice(bytes);
        self.end = needed_end;
    }

    /// Prepend `bytes` at `start - bytes.len()`, moving `start` left.
    /// Fails with [`BufferTooSmall`] if there isn't enough room before `start`.
    pub fn prepend(&mut self, bytes: &[u8]) -> Result<(), BufferTooSmall> {
        if bytes.len() > self.start {
            return Err(BufferTooSmall {
                requested: bytes.len(),
                available: self.start,
            });
        }
        let new_start = self.start - bytes.len();
        self.data[new_start..self.start].copy_from_slice(bytes);
        self.start = new_start;
        Ok(())
    }

    /// Prepend a fixed-size little-endian value `v` (e.g. a wire header
    /// already serialized to its byte array by the caller).
    pub fn prepend_bytes<const N: usize>(&mut self, v: [u8; N]) -> Result<(), BufferTooSmall> {
        self.prepend(&v)
    }

    /// Set `end := start + n`. Used after a raw read fills the buffer past
    /// `start` and the caller knows exactly how many bytes are valid.
    pub fn limit(&mut self, n: usize) {
        let new_end = self.start + n;
        assert!(new_end <= self.data.len(), "limit exceeds capacity");
        self.end = new_end;
    }

    /// Logically empty the buffer without shrinking capacity: `end := start`.
    pub fn clear(&mut self) {
        self.end = self.start;
    }

    /// Reset the window to the full backing capacity, `start = end = 0`
    /// then grown to capacity via `limit` — used when a slot's frame is
    /// reused as a raw read target.
    pub fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Mutable access to the tail of the backing storage starting at
    /// `start`, sized to the full remaining capacity — for reading raw
    /// bytes directly off the socket into the buffer before calling
    /// [`Frame::limit`].
    pub fn spare_capacity_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.start..]
    }
}
