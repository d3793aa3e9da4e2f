// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 adsrs-core contributors
//
// Process-wide table of AmsConnection keyed by destination IP, plus the
// local-port lease pool every caller draws from before issuing requests.
// Adapted from `service_registry.rs` (a mutex-guarded map from identity to
// shared state, with get-or-insert semantics), generalized from named
// shared-memory services to live TCP connections.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::config::{ConnectionConfig, PORT_BASE, PORT_END};
use crate::connection::AmsConnection;
use crate::error::{AdsError, Result};

/// Leases local AMS ports out of `[PORT_BASE, PORT_END]` to callers that
/// need one to register a `ResponseSlot` or notification dispatcher against.
pub struct PortPool {
    free: Mutex<Vec<u16>>,
}

impl PortPool {
    pub fn new() -> Self {
        let free = (PORT_BASE..=PORT_END).rev().collect();
        Self {
            free: Mutex::new(free),
        }
    }

    /// Lease the next free port, or [`AdsError::NoFreePort`] if the range is
    /// exhausted.
    pub fn alloc_port(&self) -> Result<u16> {
        self.free
            .lock()
            .unwrap()
            .pop()
            .ok_or(AdsError::NoFreePort)
    }

    /// Return a leased port to the pool. Double-freeing a port is a caller
    /// bug but is tolerated here (the port just becomes available twice,
    /// which only risks a future double-lease the caller itself caused).
    pub fn free_port(&self, port: u16) {
        self.free.lock().unwrap().push(port);
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns one [`AmsConnection`] per distinct destination IP and the shared
/// [`PortPool`] every connection's callers lease local ports from.
pub struct Router {
    connections: Mutex<HashMap<IpAddr, AmsConnection>>,
    ports: PortPool,
    config: ConnectionConfig,
}

impl Router {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            ports: PortPool::new(),
            config,
        }
    }

    /// Get the existing connection to `dest_ip`, or open one.
    pub fn get_connection(&self, dest_ip: IpAddr) -> Result<AmsConnection> {
        let mut table = self.connections.lock().unwrap();
        if let Some(conn) = table.get(&dest_ip) {
            return Ok(conn.clone());
        }
        let conn = AmsConnection::connect(dest_ip, self.config.clone())?;
        table.insert(dest_ip, conn.clone());
        Ok(conn)
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    /// Tear down every owned connection. Intended for orderly process exit
    /// or test cleanup — leaves the `Router` empty but reusable.
    pub fn shutdown(&self) {
        let mut table = self.connections.lock().unwrap();
        for (_, conn) in table.drain() {
            conn.shutdown();
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn port_pool_hands_out_distinct_ports_within_range() {
        let pool = PortPool::new();
        let a = pool.alloc_port().unwrap();
        let b = pool.alloc_port().unwrap();
        assert_ne!(a, b);
        assert!((PORT_BASE..=PORT_END).contains(&a));
        assert!((PORT_BASE..=PORT_END).contains(&b));
    }

    #[test]
    fn port_pool_recycles_freed_ports() {
        let pool = PortPool::new();
        let total = pool.available();
        let a = pool.alloc_port().unwrap();
        assert_eq!(pool.available(), total - 1);
        pool.free_port(a);
        assert_eq!(pool.available(), total);
    }

    #[test]
    fn port_pool_exhaustion_returns_no_free_port() {
        let pool = PortPool::new();
        while pool.alloc_port().is_ok() {}
        assert!(matches!(pool.alloc_port(), Err(AdsError::NoFreePort)));
    }

    #[test]
    fn get_connection_reuses_existing_entry_for_same_ip() {
        use std::net::TcpListener;
        use std::sync::mpsc;
        use std::thread;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (accept_count_tx, accept_count_rx) = mpsc::channel();
        thread::spawn(move || {
            let mut accepted = 0;
            // Only one connect is expected; accept it and then stop, so a
            // stray second connect attempt would hang instead of silently
            // succeeding.
            if listener.accept().is_ok() {
                accepted += 1;
            }
            accept_count_tx.send(accepted).unwrap();
        });

        let router = Router::new(ConnectionConfig::default());
        let first = router.get_connection(addr.ip()).unwrap();
        let second = router.get_connection(addr.ip()).unwrap();
        assert_eq!(first.dest_ip(), second.dest_ip());

        let accepted = accept_count_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(accepted, 1);

        router.shutdown();
    }
}
