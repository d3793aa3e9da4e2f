// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 adsrs-core contributors
//
// Per-local-port reservation + condvar rendezvous. Adapted from `Waiter`
// (waiter.rs): an `AtomicBool` quit flag plus a `Mutex`/`Condvar` pair
// implementing `wait_if(pred, timeout) -> bool`. Specialized here to the
// single predicate this needs ("invokeId == 0") and to carry the reply
// `Frame` out of the wait instead of a named OS primitive — this runtime has
// no shared memory and no cross-process lifecycle to manage.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::frame::Frame;

/// Per-local-port rendezvous object. Exactly one exists per local port in
/// `[PORT_BASE, PORT_BASE + N)` and is never created or destroyed after the
/// owning `AmsConnection` is constructed — only its `invoke_id` field
/// transitions free (`0`) to reserved and back.
pub struct ResponseSlot {
    invoke_id: AtomicU32,
    closed: AtomicBool,
    inner: Mutex<Frame>,
    cv: Condvar,
}

/// Outcome of a completed wait.
#[derive(Debug)]
pub enum WaitOutcome {
    /// A reply was matched and the frame was delivered (possibly empty, for
    /// the unrecognized-but-matched cmdId case).
    Delivered(Frame),
    /// The wait timed out. The slot has already been released.
    TimedOut,
    /// The connection was torn down while the caller was waiting
    /// (every waiting slot is broadcast-released on shutdown).
    ConnectionClosed,
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self {
            invoke_id: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            inner: Mutex::new(Frame::with_capacity(0, 0)),
            cv: Condvar::new(),
        }
    }

    /// Atomic compare-and-exchange from free (`0`) to `id`. Returns `false`
    /// if the slot was already reserved — the caller sees `BusyPort`.
    /// `id` must be nonzero (zero means "slot free").
    pub fn reserve(&self, id: u32) -> bool {
        debug_assert_ne!(id, 0, "invoke id 0 is reserved for 'slot free'");
        self.invoke_id
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release an outstanding reservation without delivering a reply —
    /// used when a partial write fails after reservation, and on timeout.
    pub fn release(&self) {
        let mut frame = self.inner.lock().unwrap();
        frame.clear();
        self.invoke_id.store(0, Ordering::Release);
    }

    /// Deliver `frame` as the reply for the currently reserved invoke id,
    /// free the slot, and wake the waiter. Called from the reader thread
    /// once a matching reply has been copied in.
    pub fn deliver(&self, frame: Frame) {
        {
            let mut guard = self.inner.lock().unwrap();
            *guard = frame;
            self.invoke_id.store(0, Ordering::Release);
        }
        self.cv.notify_one();
    }

    /// Wake every waiter without delivering a frame — used on connection
    /// teardown so no caller is stranded waiting on a socket that will never
    /// answer again. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.invoke_id.store(0, Ordering::Release);
        self.cv.notify_all();
    }

    /// The invoke id currently reserved on this slot, or `0` if free.
    pub fn current_invoke_id(&self) -> u32 {
        self.invoke_id.load(Ordering::Acquire)
    }

    /// Block until the reservation for `id` clears (a reply was delivered,
    /// the slot was force-released, or `close` was called) or `timeout`
    /// elapses. On timeout the slot is released so the port isn't stranded.
    pub fn wait(&self, id: u32, timeout: Duration) -> WaitOutcome {
        let guard = self.inner.lock().unwrap();
        let (mut guard, result) = self
            .cv
            .wait_timeout_while(guard, timeout, |_| {
                self.current_invoke_id() == id && !self.closed.load(Ordering::Acquire)
            })
            .unwrap();

        if self.closed.load(Ordering::Acquire) {
            return WaitOutcome::ConnectionClosed;
        }

        if self.current_invoke_id() == id {
            debug_assert!(result.timed_out());
            drop(guard);
            self.release();
            return WaitOutcome::TimedOut;
        }

        let frame = std::mem::replace(&mut *guard, Frame::with_capacity(0, 0));
        WaitOutcome::Delivered(frame)
    }
}

impl Default for ResponseSlot {
    fn default() -> Self {
        Self::new()
    }
}
