// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 adsrs-core contributors
//
// One TCP socket multiplexing many logical request/reply exchanges and
// notification streams to a single ADS device. Adapted from
// `service_registry.rs`'s table-of-identities shape for the dispatcher
// table, combined with a blocking reader-thread style: one dedicated OS
// thread parked in blocking reads, matching replies and notifications
// against in-process state rather than a userspace scheduler.

use std::collections::HashMap;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::config::{ConnectionConfig, ADS_TCP_PORT, PORT_BASE, PORT_END};
use crate::dispatcher::{NotificationDispatcher, Subscription};
use crate::error::{AdsError, Result};
use crate::frame::Frame;
use crate::slot::{ResponseSlot, WaitOutcome};
use crate::socket::AdsSocket;
use crate::wire::{AmsAddr, AmsTcpHeader, AoEHeader, CommandId, AOE_HEADER_LEN};

fn slot_index(local_port: u16) -> Option<usize> {
    if (PORT_BASE..=PORT_END).contains(&local_port) {
        Some((local_port - PORT_BASE) as usize)
    } else {
        None
    }
}

struct Inner {
    dest_ip: IpAddr,
    write_socket: Mutex<AdsSocket>,
    slots: Vec<ResponseSlot>,
    dispatchers: Mutex<HashMap<(u16, AmsAddr), Arc<NotificationDispatcher>>>,
    invoke_counter: AtomicU32,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    config: ConnectionConfig,
}

/// One TCP connection to one ADS device, carrying both request/reply traffic
/// and device notifications over a single socket. Construction opens the
/// socket and spawns the reader thread; the connection stays live until
/// [`AmsConnection::shutdown`] is called or the last clone is dropped.
#[derive(Clone)]
pub struct AmsConnection {
    inner: Arc<Inner>,
}

/// A non-owning reference to an [`AmsConnection`] that does not keep its
/// socket, reader thread, or dispatcher table alive. [`WeakAmsConnection::upgrade`]
/// returns `None` once the last strong `AmsConnection` has been dropped (e.g.
/// after [`crate::router::Router::shutdown`]) — the shape
/// [`crate::notify_handle::NotificationHandle`] needs so a handle that outlives
/// its connection becomes a no-op instead of resurrecting one.
#[derive(Clone)]
pub struct WeakAmsConnection {
    inner: Weak<Inner>,
}

impl WeakAmsConnection {
    /// Upgrade to a strong [`AmsConnection`] if it still exists.
    pub fn upgrade(&self) -> Option<AmsConnection> {
        self.inner.upgrade().map(|inner| AmsConnection { inner })
    }
}

impl AmsConnection {
    /// Connect to the ADS TCP endpoint at `dest_ip` and start the reader
    /// thread. `dest_ip` is the remote device's IP; the well-known ADS TCP
    /// port (48898) is always used.
    pub fn connect(dest_ip: IpAddr, config: ConnectionConfig) -> Result<Self> {
        let addr = SocketAddr::new(dest_ip, ADS_TCP_PORT);
        let socket = AdsSocket::connect(addr, config.connect_timeout, config.nodelay)?;
        let reader_socket = socket.try_clone()?;

        let slot_count = (PORT_END - PORT_BASE + 1) as usize;
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, ResponseSlot::new);

        let inner = Arc::new(Inner {
            dest_ip,
            write_socket: Mutex::new(socket),
            slots,
            dispatchers: Mutex::new(HashMap::new()),
            invoke_counter: AtomicU32::new(1),
            reader_handle: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        });

        let reader_inner = Arc::clone(&inner);
        let handle = thread::spawn(move || reader_loop(reader_inner, reader_socket));
        *inner.reader_handle.lock().unwrap() = Some(handle);

        Ok(Self { inner })
    }

    pub fn dest_ip(&self) -> IpAddr {
        self.inner.dest_ip
    }

    /// Obtain a non-owning [`WeakAmsConnection`] — holding one does not keep
    /// this connection's socket, reader thread, or dispatcher table alive.
    pub fn downgrade(&self) -> WeakAmsConnection {
        WeakAmsConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Reserve a slot, serialize `frame` behind an AoE header and AmsTcp
    /// header, and write it to the socket in one call. `frame` must have at
    /// least `AMS_TCP_HEADER_LEN + AOE_HEADER_LEN` bytes of prepend room —
    /// [`Frame::for_request`] sizes this correctly. Returns the invoke id the
    /// caller should later pass to [`AmsConnection::wait_reply`].
    pub fn write(
        &self,
        mut frame: Frame,
        dest: AmsAddr,
        src: AmsAddr,
        cmd_id: CommandId,
    ) -> Result<u32> {
        let idx = slot_index(src.port).expect("src.port outside the leased local-port range");

        if self.inner.closed.load(Ordering::Acquire) {
            return Err(AdsError::Closed);
        }

        let invoke_id = self.next_invoke_id();
        let payload_len = frame.len();

        let aoe = AoEHeader {
            target: dest,
            source: src,
            cmd_id: cmd_id.as_u16(),
            state_flags: 0x0004,
            length: payload_len as u32,
            error_code: 0,
            invoke_id,
        };
        frame.prepend_bytes(aoe.to_bytes())?;
        let tcp = AmsTcpHeader::new((AOE_HEADER_LEN + payload_len) as u32);
        frame.prepend_bytes(tcp.to_bytes())?;

        let slot = &self.inner.slots[idx];
        if !slot.reserve(invoke_id) {
            return Err(AdsError::BusyPort {
                local_port: src.port,
            });
        }

        let mut socket = self.inner.write_socket.lock().unwrap();
        if let Err(e) = socket.write_all(frame.as_bytes()) {
            drop(socket);
            slot.release();
            return Err(AdsError::Transport(e));
        }

        Ok(invoke_id)
    }

    /// Block until the reply for `invoke_id` on `local_port` arrives, the
    /// wait times out, or the connection is torn down.
    pub fn wait_reply(&self, local_port: u16, invoke_id: u32, timeout: Duration) -> Result<Frame> {
        let idx = slot_index(local_port).expect("local_port outside the leased range");
        match self.inner.slots[idx].wait(invoke_id, timeout) {
            WaitOutcome::Delivered(frame) => Ok(frame),
            WaitOutcome::TimedOut => Err(AdsError::TimedOut),
            WaitOutcome::ConnectionClosed => Err(AdsError::Closed),
        }
    }

    /// `write` followed by `wait_reply` on the invoke id it returned — the
    /// common case for request/reply operations that don't need the two
    /// phases split across threads.
    pub fn request(
        &self,
        frame: Frame,
        dest: AmsAddr,
        src: AmsAddr,
        cmd_id: CommandId,
        timeout: Duration,
    ) -> Result<Frame> {
        let invoke_id = self.write(frame, dest, src, cmd_id)?;
        self.wait_reply(src.port, invoke_id, timeout)
    }

    /// Get or lazily create the dispatcher for `(local_port, remote_addr)`.
    /// Always takes the table lock, even when the entry already exists —
    /// the single-path lookup avoids a second, racy unlocked check.
    pub fn dispatcher_for(&self, local_port: u16, remote_addr: AmsAddr) -> Arc<NotificationDispatcher> {
        let mut table = self.inner.dispatchers.lock().unwrap();
        Arc::clone(table.entry((local_port, remote_addr)).or_insert_with(|| {
            Arc::new(NotificationDispatcher::new(
                local_port,
                remote_addr,
                self.inner.config.ring_capacity,
            ))
        }))
    }

    /// Register a callback for a notification handle already granted by the
    /// device (via an `ADD_DEVICE_NOTIFICATION` reply). Creates the
    /// dispatcher for this `(local_port, remote_addr)` pair if it doesn't
    /// exist yet.
    pub fn create_notify_mapping(
        &self,
        local_port: u16,
        remote_addr: AmsAddr,
        hnotify: u32,
        length: u32,
        callback: impl Fn(u32, &[u8]) + Send + 'static,
    ) -> Arc<NotificationDispatcher> {
        let dispatcher = self.dispatcher_for(local_port, remote_addr);
        dispatcher.emplace(Subscription::new(hnotify, length, callback));
        dispatcher
    }

    /// Look up an existing dispatcher without creating one.
    pub fn find_dispatcher(
        &self,
        local_port: u16,
        remote_addr: AmsAddr,
    ) -> Option<Arc<NotificationDispatcher>> {
        self.inner
            .dispatchers
            .lock()
            .unwrap()
            .get(&(local_port, remote_addr))
            .cloned()
    }

    /// Send `DEL_DEVICE_NOTIFICATION` for `hnotify` and, on success, remove
    /// the local subscription from its dispatcher. The dispatcher itself
    /// stays warm.
    pub fn delete_notification(
        &self,
        remote_addr: AmsAddr,
        src: AmsAddr,
        hnotify: u32,
        timeout: Duration,
    ) -> Result<()> {
        let mut frame = Frame::for_request(4);
        frame.append(&hnotify.to_le_bytes());
        self.request(
            frame,
            remote_addr,
            src,
            CommandId::DeleteDeviceNotification,
            timeout,
        )?;
        if let Some(dispatcher) = self.find_dispatcher(src.port, remote_addr) {
            dispatcher.erase(hnotify);
        }
        Ok(())
    }

    /// Tear down the connection: half-close the socket so the reader thread
    /// observes EOF, join it, shut down every dispatcher worker, and release
    /// every waiting `ResponseSlot` so no caller is stranded. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self
            .inner
            .write_socket
            .lock()
            .unwrap()
            .shutdown(Shutdown::Both);

        if let Some(handle) = self.inner.reader_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        for slot in &self.inner.slots {
            slot.close();
        }

        let mut table = self.inner.dispatchers.lock().unwrap();
        for (_, dispatcher) in table.drain() {
            match Arc::try_unwrap(dispatcher) {
                Ok(mut dispatcher) => dispatcher.shutdown(),
                Err(dispatcher) => {
                    // A NotificationHandle still holds a clone (narrow race
                    // against a concurrent lookup); its own Drop will join
                    // the worker once that last reference is released.
                    debug!(
                        "dispatcher for {:?} still referenced at shutdown, deferring join",
                        (dispatcher.local_port, dispatcher.remote_addr)
                    );
                }
            }
        }
    }

    fn next_invoke_id(&self) -> u32 {
        loop {
            let id = self.inner.invoke_counter.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The reader thread itself holds a clone of this Arc for its whole
        // lifetime, so Inner can only reach refcount zero after the reader
        // has already returned (or never started). That means this can run
        // on the reader thread's own stack as its last `inner` clone goes
        // out of scope — never join the reader handle here, only the
        // explicit shutdown() path (called from another thread) does that.
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.write_socket.lock().unwrap().shutdown(Shutdown::Both);
            for slot in &self.slots {
                slot.close();
            }
        }
    }
}

fn reader_loop(inner: Arc<Inner>, mut socket: AdsSocket) {
    loop {
        match read_one_frame(&inner, &mut socket) {
            Ok(()) => continue,
            Err(()) => break,
        }
    }
    debug!("reader thread exiting for {}", inner.dest_ip);
}

/// Read and dispatch exactly one wire frame. Returns `Err(())` when the
/// socket is no longer usable (EOF or I/O error) and the reader thread
/// should terminate; `Ok(())` otherwise, including every "drain and
/// continue" malformed-frame case.
fn read_one_frame(inner: &Arc<Inner>, socket: &mut AdsSocket) -> std::result::Result<(), ()> {
    let mut tcp_buf = [0u8; crate::wire::AMS_TCP_HEADER_LEN];
    socket.read_exact(&mut tcp_buf).map_err(|_| ())?;
    let tcp_header = AmsTcpHeader::from_bytes(tcp_buf);
    let total_len = tcp_header.length as usize;

    if total_len < AOE_HEADER_LEN {
        warn!("frame length {total_len} smaller than an AoE header, draining");
        drain_socket(socket, total_len).map_err(|_| ())?;
        return Ok(());
    }

    let mut aoe_buf = [0u8; AOE_HEADER_LEN];
    socket.read_exact(&mut aoe_buf).map_err(|_| ())?;
    let aoe = AoEHeader::from_bytes(aoe_buf);
    let payload_len = total_len - AOE_HEADER_LEN;

    if aoe.cmd_id == CommandId::DeviceNotification.as_u16() {
        return receive_notification(inner, socket, &aoe, payload_len);
    }

    let idx = match slot_index(aoe.target.port) {
        Some(i) => i,
        None => {
            warn!(
                "reply targeted local port {} outside the leased range, draining",
                aoe.target.port
            );
            drain_socket(socket, payload_len).map_err(|_| ())?;
            return Ok(());
        }
    };
    let slot = &inner.slots[idx];

    if slot.current_invoke_id() != aoe.invoke_id {
        warn!(
            "invoke id mismatch on port {}: slot holds {}, frame carried {}",
            aoe.target.port,
            slot.current_invoke_id(),
            aoe.invoke_id
        );
        drain_socket(socket, payload_len).map_err(|_| ())?;
        return Ok(());
    }

    match CommandId::from_u16(aoe.cmd_id) {
        Some(cmd) if cmd.is_reply_opcode() => {
            let mut frame = Frame::with_capacity(payload_len, 0);
            socket
                .read_exact(&mut frame.spare_capacity_mut()[..payload_len])
                .map_err(|_| ())?;
            frame.limit(payload_len);
            slot.deliver(frame);
        }
        _ => {
            warn!(
                "unrecognized cmdId {} on a matched reply slot, delivering empty frame",
                aoe.cmd_id
            );
            drain_socket(socket, payload_len).map_err(|_| ())?;
            slot.deliver(Frame::with_capacity(0, 0));
        }
    }
    Ok(())
}

fn receive_notification(
    inner: &Arc<Inner>,
    socket: &mut AdsSocket,
    aoe: &AoEHeader,
    payload_len: usize,
) -> std::result::Result<(), ()> {
    let key = (aoe.target.port, aoe.source);
    let dispatcher = inner.dispatchers.lock().unwrap().get(&key).cloned();

    let dispatcher = match dispatcher {
        Some(d) => d,
        None => {
            debug!("no dispatcher registered for {key:?}, dropping notification");
            return drain_socket(socket, payload_len).map_err(|_| ());
        }
    };

    let ring = dispatcher.ring();
    if ring.bytes_free() < payload_len {
        warn!(
            "notification ring overflow for {key:?}: needed {payload_len}, {} free",
            ring.bytes_free()
        );
        return drain_socket(socket, payload_len).map_err(|_| ());
    }

    ring.fill_from(|buf| socket.read_exact(buf), payload_len)
        .map_err(|_| ())?;
    dispatcher.notify();
    Ok(())
}

fn drain_socket(socket: &mut AdsSocket, mut n: usize) -> std::io::Result<()> {
    let mut scratch = [0u8; 1024];
    while n > 0 {
        let take = n.min(scratch.len());
        socket.read_exact(&mut scratch[..take])?;
        n -= take;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::AmsNetId;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn local_addr(port: u16) -> AmsAddr {
        AmsAddr::new(AmsNetId::new(127, 0, 0, 1, 1, 1), port)
    }

    fn remote_addr() -> AmsAddr {
        AmsAddr::new(AmsNetId::new(192, 168, 0, 10, 1, 1), 851)
    }

    /// Spins up a listener that accepts one connection, reads one full
    /// request frame, and hands it to `respond` to build a reply.
    fn mock_device(respond: impl FnOnce(AoEHeader, Vec<u8>) -> (AoEHeader, Vec<u8>) + Send + 'static) -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut tcp_buf = [0u8; crate::wire::AMS_TCP_HEADER_LEN];
            stream.read_exact(&mut tcp_buf).unwrap();
            let tcp_header = AmsTcpHeader::from_bytes(tcp_buf);
            let mut aoe_buf = [0u8; AOE_HEADER_LEN];
            stream.read_exact(&mut aoe_buf).unwrap();
            let aoe = AoEHeader::from_bytes(aoe_buf);
            let payload_len = tcp_header.length as usize - AOE_HEADER_LEN;
            let mut payload = vec![0u8; payload_len];
            stream.read_exact(&mut payload).unwrap();

            let (reply_header, reply_payload) = respond(aoe, payload);
            let tcp = AmsTcpHeader::new((AOE_HEADER_LEN + reply_payload.len()) as u32);
            stream.write_all(&tcp.to_bytes()).unwrap();
            stream.write_all(&reply_header.to_bytes()).unwrap();
            stream.write_all(&reply_payload).unwrap();
            stream.flush().unwrap();
        });
        (addr, handle)
    }

    #[test]
    fn request_reply_round_trip() {
        let (addr, server) = mock_device(|req, _payload| {
            let reply = AoEHeader {
                target: req.source,
                source: req.target,
                cmd_id: CommandId::ReadState.as_u16(),
                state_flags: 0x0005,
                length: 4,
                error_code: 0,
                invoke_id: req.invoke_id,
            };
            (reply, vec![5, 0, 0, 0])
        });

        let conn = AmsConnection::connect(addr.ip(), ConnectionConfig::default()).unwrap();
        let src = local_addr(PORT_BASE);
        let frame = Frame::for_request(0);
        let reply = conn
            .request(frame, remote_addr(), src, CommandId::ReadState, Duration::from_secs(2))
            .unwrap();
        assert_eq!(reply.as_bytes(), &[5, 0, 0, 0]);

        conn.shutdown();
        server.join().unwrap();
    }

    #[test]
    fn busy_port_rejects_second_writer_before_first_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // Never respond — the slot stays reserved for the duration of the test.
        let _server = thread::spawn(move || {
            let _stream = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(5));
        });

        let conn = AmsConnection::connect(addr.ip(), ConnectionConfig::default()).unwrap();
        let src = local_addr(PORT_BASE + 1);

        let invoke_id = conn
            .write(Frame::for_request(0), remote_addr(), src, CommandId::ReadState)
            .unwrap();
        let err = conn
            .write(Frame::for_request(0), remote_addr(), src, CommandId::ReadState)
            .unwrap_err();
        assert!(matches!(err, AdsError::BusyPort { local_port } if local_port == src.port));

        let _ = invoke_id;
        conn.shutdown();
    }

    #[test]
    fn shutdown_releases_pending_waiters() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        let _server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            tx.send(()).unwrap();
            // Hold the connection open without replying.
            thread::sleep(Duration::from_secs(5));
            drop(stream);
        });
        rx.recv().unwrap();

        let conn = AmsConnection::connect(addr.ip(), ConnectionConfig::default()).unwrap();
        let src = local_addr(PORT_BASE + 2);
        let invoke_id = conn
            .write(Frame::for_request(0), remote_addr(), src, CommandId::ReadState)
            .unwrap();

        let waiter_conn = conn.clone();
        let waiter = thread::spawn(move || waiter_conn.wait_reply(src.port, invoke_id, Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(50));
        conn.shutdown();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(AdsError::Closed)));
    }
}
