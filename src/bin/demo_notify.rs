// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 adsrs-core contributors
//
// End-to-end example: register a device notification, print every sample
// that arrives for a few seconds, then deregister cleanly.
//
// Usage: demo_notify <device-ip> <local-net-id> <remote-net-id> <index-group> <index-offset>

use std::net::IpAddr;
use std::time::Duration;

use adsrs_core::config::PORT_BASE;
use adsrs_core::frame::Frame;
use adsrs_core::wire::{AmsAddr, AmsNetId, CommandId};
use adsrs_core::{AmsConnection, ConnectionConfig};

const ADD_NOTIFICATION_PAYLOAD_LEN: usize = 40;
const TRANS_MODE_ON_CHANGE: u32 = 4;

fn parse_net_id(s: &str) -> AmsNetId {
    let parts: Vec<u8> = s.split('.').map(|p| p.parse().expect("bad net id octet")).collect();
    assert_eq!(parts.len(), 6, "net id must have 6 octets");
    AmsNetId::new(parts[0], parts[1], parts[2], parts[3], parts[4], parts[5])
}

fn build_add_notification_request(index_group: u32, index_offset: u32, length: u32) -> Frame {
    let mut frame = Frame::for_request(ADD_NOTIFICATION_PAYLOAD_LEN);
    frame.append(&index_group.to_le_bytes());
    frame.append(&index_offset.to_le_bytes());
    frame.append(&length.to_le_bytes());
    frame.append(&TRANS_MODE_ON_CHANGE.to_le_bytes());
    frame.append(&0u32.to_le_bytes()); // max_delay: send immediately
    frame.append(&10u32.to_le_bytes()); // cycle_time: 10ms
    frame.append(&[0u8; 16]); // reserved
    frame
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let usage = "usage: demo_notify <device-ip> <local-net-id> <remote-net-id> <index-group> <index-offset>";
    let device_ip: IpAddr = args.next().expect(usage).parse().expect("invalid device ip");
    let local_net_id = parse_net_id(&args.next().expect(usage));
    let remote_net_id = parse_net_id(&args.next().expect(usage));
    let index_group: u32 = args.next().expect(usage).parse().expect("bad index group");
    let index_offset: u32 = args.next().expect(usage).parse().expect("bad index offset");

    let conn = AmsConnection::connect(device_ip, ConnectionConfig::default()).expect("connect failed");

    let src = AmsAddr::new(local_net_id, PORT_BASE);
    let dest = AmsAddr::new(remote_net_id, 10000);
    let sample_len = 4u32;

    let request = build_add_notification_request(index_group, index_offset, sample_len);
    let reply = conn
        .request(
            request,
            dest,
            src,
            CommandId::AddDeviceNotification,
            Duration::from_secs(5),
        )
        .expect("add_device_notification failed");

    let bytes = reply.as_bytes();
    assert!(bytes.len() >= 8, "unexpected add-notification reply length");
    let result = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let hnotify = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if result != 0 {
        log::error!("device rejected notification registration: result code {result}");
        conn.shutdown();
        return;
    }
    log::info!("registered notification handle {hnotify}");

    conn.create_notify_mapping(src.port, dest, hnotify, sample_len, move |h, payload| {
        log::info!("notification {h}: {payload:?}");
    });

    std::thread::sleep(Duration::from_secs(10));

    conn.delete_notification(dest, src, hnotify, Duration::from_secs(5))
        .expect("delete_notification failed");
    conn.shutdown();
}
