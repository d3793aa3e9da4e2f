// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 adsrs-core contributors
//
// Plain configuration struct for a connection. No config-file crate and no
// environment variables are read here — this layer needs neither. Mirrors
// the rest of this crate's preference for plain, directly-constructed
// config structs over a builder-macro crate.

use std::time::Duration;

/// The local AMS port range the [`crate::router::Router`] leases from.
pub const PORT_BASE: u16 = 30000;
/// Inclusive upper bound of the local port range.
pub const PORT_END: u16 = 30999;

/// Default size in bytes of each [`crate::dispatcher::NotificationDispatcher`]'s ring.
pub const DEFAULT_RING_CAPACITY: usize = 16 * 1024;

/// TCP port every ADS device listens on.
pub const ADS_TCP_PORT: u16 = 48898;

/// Tunables for one [`crate::connection::AmsConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for the initial TCP connect.
    pub connect_timeout: Duration,
    /// Default timeout applied to `write`'s implicit wait when the caller
    /// doesn't supply one explicitly.
    pub default_request_timeout: Duration,
    /// Byte capacity of each dispatcher's ring buffer.
    pub ring_capacity: usize,
    /// Whether to set `TCP_NODELAY` on connect. ADS routers are sensitive to
    /// Nagle-induced latency on small request/reply frames.
    pub nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            default_request_timeout: Duration::from_secs(5),
            ring_capacity: DEFAULT_RING_CAPACITY,
            nodelay: true,
        }
    }
}
