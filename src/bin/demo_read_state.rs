// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 adsrs-core contributors
//
// Minimal end-to-end example: open a connection, issue one READ_STATE
// request, print the reply. Run against a real ADS device or the mock
// listener used by the integration tests.
//
// Usage: demo_read_state <device-ip> <local-net-id> <remote-net-id>
// e.g.:  demo_read_state 192.168.0.10 192.168.0.50.1.1 192.168.0.10.1.1

use std::net::IpAddr;
use std::time::Duration;

use adsrs_core::config::PORT_BASE;
use adsrs_core::frame::Frame;
use adsrs_core::wire::{split_device_state, AmsAddr, AmsNetId, CommandId};
use adsrs_core::{AmsConnection, ConnectionConfig};

fn parse_net_id(s: &str) -> AmsNetId {
    let parts: Vec<u8> = s.split('.').map(|p| p.parse().expect("bad net id octet")).collect();
    assert_eq!(parts.len(), 6, "net id must have 6 octets");
    AmsNetId::new(parts[0], parts[1], parts[2], parts[3], parts[4], parts[5])
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let device_ip: IpAddr = args
        .next()
        .expect("usage: demo_read_state <device-ip> <local-net-id> <remote-net-id>")
        .parse()
        .expect("invalid device ip");
    let local_net_id = parse_net_id(&args.next().expect("missing local net id"));
    let remote_net_id = parse_net_id(&args.next().expect("missing remote net id"));

    let conn = AmsConnection::connect(device_ip, ConnectionConfig::default()).expect("connect failed");

    let src = AmsAddr::new(local_net_id, PORT_BASE);
    let dest = AmsAddr::new(remote_net_id, 10000);

    let reply = conn
        .request(
            Frame::for_request(0),
            dest,
            src,
            CommandId::ReadState,
            Duration::from_secs(5),
        )
        .expect("read_state failed");

    match split_device_state(reply.as_bytes()) {
        Some((ads_state, device_state)) => {
            log::info!("adsState={ads_state} deviceState={device_state}");
        }
        None => log::warn!("unexpected READ_STATE payload length: {}", reply.len()),
    }

    conn.shutdown();
}
