// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 adsrs-core contributors
//
// RAII deregistration for a single notification subscription. Adapted from
// `condition.rs`'s wait-object pattern, here triggered by drop instead of a
// wait/wake pair — the shape that matters is holding a weak, non-owning
// reference back to shared state so a handle dropped after its connection
// is gone is a no-op rather than a dangling access.

use std::time::Duration;

use log::{debug, warn};

use crate::connection::WeakAmsConnection;
use crate::wire::AmsAddr;

/// Owns one `hNotify` registration. Dropping it sends
/// `DEL_DEVICE_NOTIFICATION` best-effort and removes the local callback.
/// Deregistration errors are logged, never propagated — there is no caller
/// left to hand them to once a value is being dropped.
///
/// Holds a [`WeakAmsConnection`] rather than a strong reference or a router
/// lookup key: this must never keep a torn-down `AmsConnection` alive, and
/// must never resurrect one either. If the connection is already gone by the
/// time this handle deregisters, that's a no-op, not a fresh reconnect.
pub struct NotificationHandle {
    connection: WeakAmsConnection,
    remote_addr: AmsAddr,
    src: AmsAddr,
    hnotify: u32,
    timeout: Duration,
    deleted: bool,
}

impl NotificationHandle {
    pub fn new(
        connection: WeakAmsConnection,
        remote_addr: AmsAddr,
        src: AmsAddr,
        hnotify: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            connection,
            remote_addr,
            src,
            hnotify,
            timeout,
            deleted: false,
        }
    }

    pub fn hnotify(&self) -> u32 {
        self.hnotify
    }

    /// Deregister now instead of waiting for drop. Calling this more than
    /// once, or after drop, is a no-op — at most one
    /// `DEL_DEVICE_NOTIFICATION` is ever sent per handle. Also a no-op if
    /// the owning connection has already been torn down: this never
    /// re-establishes a connection just to deregister from it.
    pub fn delete(&mut self) {
        if self.deleted {
            return;
        }
        self.deleted = true;

        let Some(conn) = self.connection.upgrade() else {
            debug!(
                "connection already torn down, skipping deregister of hNotify {}",
                self.hnotify
            );
            return;
        };
        if let Err(e) = conn.delete_notification(self.remote_addr, self.src, self.hnotify, self.timeout) {
            warn!("deregistering hNotify {} failed: {e}", self.hnotify);
        }
    }
}

impl Drop for NotificationHandle {
    fn drop(&mut self) {
        self.delete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::router::Router;
    use crate::wire::{AmsNetId, CommandId};
    use std::io::{Read, Write};
    use std::net::{IpAddr, TcpListener};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn addr(port: u16) -> AmsAddr {
        AmsAddr::new(AmsNetId::new(127, 0, 0, 1, 1, 1), port)
    }

    /// A mock device that counts how many DEL_DEVICE_NOTIFICATION requests
    /// it receives and replies to each one immediately.
    fn mock_device_counting_deletes(count: Arc<AtomicUsize>) -> (IpAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            ready_tx.send(()).unwrap();
            loop {
                let mut tcp_buf = [0u8; crate::wire::AMS_TCP_HEADER_LEN];
                if stream.read_exact(&mut tcp_buf).is_err() {
                    break;
                }
                let tcp_header = crate::wire::AmsTcpHeader::from_bytes(tcp_buf);
                let mut aoe_buf = [0u8; crate::wire::AOE_HEADER_LEN];
                stream.read_exact(&mut aoe_buf).unwrap();
                let aoe = crate::wire::AoEHeader::from_bytes(aoe_buf);
                let payload_len = tcp_header.length as usize - crate::wire::AOE_HEADER_LEN;
                let mut payload = vec![0u8; payload_len];
                stream.read_exact(&mut payload).unwrap();

                if aoe.cmd_id == CommandId::DeleteDeviceNotification.as_u16() {
                    count.fetch_add(1, Ordering::SeqCst);
                }

                let reply = crate::wire::AoEHeader {
                    target: aoe.source,
                    source: aoe.target,
                    cmd_id: aoe.cmd_id,
                    state_flags: 0x0005,
                    length: 0,
                    error_code: 0,
                    invoke_id: aoe.invoke_id,
                };
                let tcp = crate::wire::AmsTcpHeader::new(crate::wire::AOE_HEADER_LEN as u32);
                stream.write_all(&tcp.to_bytes()).unwrap();
                stream.write_all(&reply.to_bytes()).unwrap();
                stream.flush().unwrap();
            }
        });
        ready_rx.recv().unwrap();
        (addr.ip(), handle)
    }

    #[test]
    fn dropping_twice_sends_at_most_one_delete() {
        let delete_count = Arc::new(AtomicUsize::new(0));
        let (dest_ip, server) = mock_device_counting_deletes(Arc::clone(&delete_count));

        let router = Router::new(ConnectionConfig::default());
        let conn = router.get_connection(dest_ip).unwrap();

        let mut handle = NotificationHandle::new(
            conn.downgrade(),
            addr(851),
            addr(30000),
            0x42,
            Duration::from_secs(2),
        );

        handle.delete();
        handle.delete();
        drop(handle);

        assert_eq!(delete_count.load(Ordering::SeqCst), 1);

        router.shutdown();
        let _ = server; // the mock device thread exits once the socket closes
    }

    #[test]
    fn delete_is_a_no_op_once_the_connection_is_torn_down() {
        let delete_count = Arc::new(AtomicUsize::new(0));
        let (dest_ip, server) = mock_device_counting_deletes(Arc::clone(&delete_count));

        let router = Router::new(ConnectionConfig::default());
        let conn = router.get_connection(dest_ip).unwrap();
        let weak_conn = conn.downgrade();

        // Drop every strong reference and tear the connection down, the way
        // `Router::shutdown` leaves the router alive but its connections gone.
        router.shutdown();
        drop(conn);

        let mut handle =
            NotificationHandle::new(weak_conn, addr(851), addr(30000), 0x42, Duration::from_secs(2));
        handle.delete();
        drop(handle);

        // No DEL_DEVICE_NOTIFICATION was sent — deregistering never resurrects
        // a torn-down connection.
        assert_eq!(delete_count.load(Ordering::SeqCst), 0);

        let _ = server;
    }
}
