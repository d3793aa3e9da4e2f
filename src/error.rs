// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 adsrs-core contributors
//
// Error kinds for the connection multiplexer and notification subsystem.
// Port of the error taxonomy used throughout the ADS reference client:
// transport failures, per-port contention, timeouts, and the "drain and
// continue" class of malformed-frame conditions the reader thread absorbs.

use std::fmt;
use std::io;

/// Errors surfaced by [`crate::connection::AmsConnection`] and the types it owns.
#[derive(thiserror::Error, Debug)]
pub enum AdsError {
    /// The socket read or write failed, or EOF was observed during an active wait.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The local port already has an outstanding request in flight.
    #[error("local port {local_port} is busy")]
    BusyPort {
        /// The local port that was already reserved.
        local_port: u16,
    },

    /// The caller-supplied wait timeout elapsed before a reply arrived.
    #[error("timed out waiting for reply")]
    TimedOut,

    /// A frame's header was too short or carried an unrecognized `cmdId`.
    /// The reader thread drains the advertised bytes and continues.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A notification frame exceeded the dispatcher ring's free space and was dropped.
    #[error("notification buffer overflow: needed {needed} bytes, {free} free")]
    BufferOverflow {
        /// Bytes the notification frame required.
        needed: usize,
        /// Bytes actually free in the ring at the time.
        free: usize,
    },

    /// A reply's `invokeId` did not match the slot it targeted.
    /// The reader thread logs and drains; this variant exists for unit tests
    /// that want to assert on the condition directly.
    #[error("invoke id mismatch: expected {expected}, got {got}")]
    InvokeIdMismatch {
        /// The invoke id the slot was reserved with.
        expected: u32,
        /// The invoke id carried by the frame that was rejected.
        got: u32,
    },

    /// No local port was available to lease (Router surface only).
    #[error("no free local port in range")]
    NoFreePort,

    /// The connection has already been torn down.
    #[error("connection closed")]
    Closed,
}

/// A `BufferTooSmall` condition from [`crate::frame::Frame`] prepend/append
/// operations. Kept as a distinct, smaller type since it's a pure capacity
/// check with no I/O involved — callers that want it folded into [`AdsError`]
/// can rely on the `From` impl below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTooSmall {
    /// Bytes requested.
    pub requested: usize,
    /// Bytes available.
    pub available: usize,
}

impl fmt::Display for BufferTooSmall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buffer too small: requested {} bytes, {} available",
            self.requested, self.available
        )
    }
}

impl std::error::Error for BufferTooSmall {}

impl From<BufferTooSmall> for AdsError {
    fn from(e: BufferTooSmall) -> Self {
        AdsError::MalformedFrame(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AdsError>;
