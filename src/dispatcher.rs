// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 adsrs-core contributors
//
// Per-(localPort, remoteAddr) worker thread draining a ring of
// DEVICE_NOTIFICATION payloads to user callbacks. Adapted from
// `proto/service_registry.rs`'s table shape (a mutex-guarded map keyed by an
// identity, with insert/erase), generalized from named shared-memory service
// entries to in-process subscription callbacks, plus `waiter.rs`'s
// `Waiter`-style cv signaling, used here to wake the worker rather than a
// caller thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::ring::RingBuffer;
use crate::wire::AmsAddr;

/// A registered notification callback. `callback` runs synchronously on the
/// dispatcher worker thread for every sample carrying this `hNotify`.
pub struct Subscription {
    pub hnotify: u32,
    pub length: u32,
    callback: Box<dyn Fn(u32, &[u8]) + Send + 'static>,
}

impl Subscription {
    pub fn new(hnotify: u32, length: u32, callback: impl Fn(u32, &[u8]) + Send + 'static) -> Self {
        Self {
            hnotify,
            length,
            callback: Box::new(callback),
        }
    }
}

struct Shared {
    subscriptions: Mutex<HashMap<u32, Subscription>>,
    signal: Mutex<bool>,
    cv: Condvar,
    stop: AtomicBool,
    ring: RingBuffer,
}

/// Worker thread draining a ring into user callbacks for one
/// `(localPort, remoteAddr)` virtual connection. Created lazily on first
/// subscription; destroyed only when the owning `AmsConnection` is
/// destroyed — removing the last subscription does NOT tear this down, it
/// stays warm for further subscriptions.
pub struct NotificationDispatcher {
    pub local_port: u16,
    pub remote_addr: AmsAddr,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl NotificationDispatcher {
    pub fn new(local_port: u16, remote_addr: AmsAddr, ring_capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            subscriptions: Mutex::new(HashMap::new()),
            signal: Mutex::new(false),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
            ring: RingBuffer::new(ring_capacity),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || run(worker_shared));

        Self {
            local_port,
            remote_addr,
            shared,
            worker: Some(worker),
        }
    }

    /// Register a subscription.
    pub fn emplace(&self, sub: Subscription) {
        self.shared
            .subscriptions
            .lock()
            .unwrap()
            .insert(sub.hnotify, sub);
    }

    /// Remove a subscription. Idempotent.
    pub fn erase(&self, hnotify: u32) {
        self.shared.subscriptions.lock().unwrap().remove(&hnotify);
    }

    /// The ring this dispatcher's owning `AmsConnection` reader thread
    /// streams notification bytes into.
    pub fn ring(&self) -> &RingBuffer {
        &self.shared.ring
    }

    /// Signal the worker that new bytes have arrived in the ring.
    pub fn notify(&self) {
        let mut flag = self.shared.signal.lock().unwrap();
        *flag = true;
        self.shared.cv.notify_one();
    }

    /// Signal the worker to exit via a terminal flag and condvar wake, then
    /// join it. Called when the owning `AmsConnection` is destroyed.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        {
            let mut flag = self.shared.signal.lock().unwrap();
            *flag = true;
        }
        self.shared.cv.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

/// Worker body: waits on the condvar, drains whole notification frames out
/// of the ring, and invokes callbacks synchronously in the exact byte order
/// they arrived.
fn run(shared: Arc<Shared>) {
    // Frames are assembled here across wakeups since one ring drain may not
    // align on a frame boundary if multiple notifications were coalesced,
    // or if the reader thread's write and this wakeup race.
    let mut scratch: Vec<u8> = Vec::new();
    let mut pull_buf = [0u8; 4096];

    loop {
        {
            let mut flag = shared.signal.lock().unwrap();
            while !*flag && !shared.stop.load(Ordering::Acquire) {
                flag = shared.cv.wait(flag).unwrap();
            }
            *flag = false;
        }

        if shared.stop.load(Ordering::Acquire) && shared.ring.bytes_used() == 0 {
            break;
        }

        loop {
            let n = shared.ring.read_into(&mut pull_buf);
            if n == 0 {
                break;
            }
            scratch.extend_from_slice(&pull_buf[..n]);
        }

        while let Some(consumed) = try_parse_frame(&scratch, &shared) {
            scratch.drain(0..consumed);
        }

        if shared.stop.load(Ordering::Acquire) && shared.ring.bytes_used() == 0 {
            break;
        }
    }
}

/// Try to parse one complete device-notification payload from the front of
/// `scratch`. Layout:
/// `length: u32; stamps: u32; stamps * { timestamp: u64; samples: u32;
/// samples * { hNotify: u32; size: u32; payload[size] } }`.
///
/// Returns the number of bytes consumed from `scratch` if a complete frame
/// was present (and dispatches its samples to callbacks), or `None` if more
/// bytes are needed.
fn try_parse_frame(scratch: &[u8], shared: &Shared) -> Option<usize> {
    if scratch.len() < 4 {
        return None;
    }
    let length = u32::from_le_bytes(scratch[0..4].try_into().unwrap()) as usize;
    let total = 4 + length;
    if scratch.len() < total {
        return None;
    }

    let body = &scratch[4..total];
    if let Err(e) = parse_and_dispatch(body, shared) {
        warn!("malformed notification frame, dropping: {e}");
    }
    Some(total)
}

fn parse_and_dispatch(body: &[u8], shared: &Shared) -> Result<(), String> {
    let mut pos = 0usize;
    let stamps = read_u32(body, &mut pos)?;

    for _ in 0..stamps {
        let _timestamp = read_u64(body, &mut pos)?;
        let samples = read_u32(body, &mut pos)?;
        for _ in 0..samples {
            let hnotify = read_u32(body, &mut pos)?;
            let size = read_u32(body, &mut pos)? as usize;
            if pos + size > body.len() {
                return Err(format!(
                    "sample payload size {size} exceeds remaining frame bytes"
                ));
            }
            let payload = &body[pos..pos + size];
            pos += size;

            let table = shared.subscriptions.lock().unwrap();
            match table.get(&hnotify) {
                Some(sub) => (sub.callback)(hnotify, payload),
                None => debug!("no subscription for hNotify {hnotify}, sample dropped"),
            }
        }
    }
    Ok(())
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, String> {
    if *pos + 4 > buf.len() {
        return Err("truncated u32 field".to_string());
    }
    let v = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64, String> {
    if *pos + 8 > buf.len() {
        return Err("truncated u64 field".to_string());
    }
    let v = u64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::AmsNetId;
    use std::sync::mpsc;
    use std::time::Duration;

    fn addr() -> AmsAddr {
        AmsAddr::new(AmsNetId::new(192, 168, 0, 1, 1, 1), 851)
    }

    fn build_notification(samples: &[(u32, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes()); // stamps
        body.extend_from_slice(&0u64.to_le_bytes()); // timestamp
        body.extend_from_slice(&(samples.len() as u32).to_le_bytes());
        for (hnotify, payload) in samples {
            body.extend_from_slice(&hnotify.to_le_bytes());
            body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            body.extend_from_slice(payload);
        }
        let mut frame = Vec::new();
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn delivers_sample_to_matching_subscription() {
        let dispatcher = NotificationDispatcher::new(30000, addr(), 4096);
        let (tx, rx) = mpsc::channel();
        dispatcher.emplace(Subscription::new(0x42, 2, move |_h, payload| {
            tx.send(payload.to_vec()).unwrap();
        }));

        let frame = build_notification(&[(0x42, &[0xAA, 0xBB])]);
        dispatcher.ring().write_all(&frame);
        dispatcher.notify();

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, vec![0xAA, 0xBB]);
    }

    #[test]
    fn unknown_hnotify_is_dropped_not_fatal() {
        let dispatcher = NotificationDispatcher::new(30000, addr(), 4096);
        let (tx, rx) = mpsc::channel();
        dispatcher.emplace(Subscription::new(1, 1, move |_h, payload| {
            tx.send(payload.to_vec()).unwrap();
        }));

        let frame = build_notification(&[(999, &[0x01]), (1, &[0x02])]);
        dispatcher.ring().write_all(&frame);
        dispatcher.notify();

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, vec![0x02]);
    }

    #[test]
    fn erase_stops_delivery_but_dispatcher_stays_warm() {
        let dispatcher = NotificationDispatcher::new(30000, addr(), 4096);
        let (tx, rx) = mpsc::channel();
        dispatcher.emplace(Subscription::new(7, 1, move |_h, payload| {
            tx.send(payload.to_vec()).unwrap();
        }));
        dispatcher.erase(7);

        let frame = build_notification(&[(7, &[0xFF])]);
        dispatcher.ring().write_all(&frame);
        dispatcher.notify();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        // re-subscribing on the same warm dispatcher still works.
        let (tx2, rx2) = mpsc::channel();
        dispatcher.emplace(Subscription::new(7, 1, move |_h, payload| {
            tx2.send(payload.to_vec()).unwrap();
        }));
        let frame = build_notification(&[(7, &[0x11])]);
        dispatcher.ring().write_all(&frame);
        dispatcher.notify();
        let received = rx2.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, vec![0x11]);
    }
}
