//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod common;

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Bytes;
use const_addrs::ip4;
use fabric_controller::packet::{ArpOp, ArpPacket, FrameMeta, Payload};
use fabric_controller::policy::Action;
use fabric_controller::tasks::messages::input::TimerMsg;
use fabric_controller::tasks::messages::output::SouthboundMsg;

use crate::common::*;

const HOST_A: &str = "02:00:00:00:00:0a";
const HOST_B: &str = "02:00:00:00:00:0b";
const HOST_C: &str = "02:00:00:00:00:0c";

const RETRIES: &str = r#"
[resolver]
timeout_ms = 1000
max_retries = 2
"#;

fn routed_frame(dst: Ipv4Addr) -> FrameMeta {
    FrameMeta::new(R, 1, mac(HOST_A), mac(ROUTER_MAC1))
        .with_ipv4(ip4!("10.0.1.2"), dst)
}

fn arp_reply(sender: Ipv4Addr) -> FrameMeta {
    arp_reply_from(HOST_B, sender)
}

fn arp_reply_from(host: &str, sender: Ipv4Addr) -> FrameMeta {
    FrameMeta::new(R, 2, mac(host), mac(ROUTER_MAC2)).with_arp(
        ArpOp::Reply,
        sender,
        ip4!("10.0.2.1"),
    )
}

fn arp_request_out(target: Ipv4Addr) -> SouthboundMsg {
    SouthboundMsg::PacketOut {
        switch: R,
        payload: Payload::arp_request(
            mac(ROUTER_MAC2),
            ip4!("10.0.2.1"),
            target,
        ),
        actions: vec![Action::Output(2)],
    }
}

fn routed_out(payload: &'static str) -> SouthboundMsg {
    SouthboundMsg::PacketOut {
        switch: R,
        payload: Payload::Frame(Bytes::from_static(payload.as_bytes())),
        actions: vec![
            Action::SetEthSrc(mac(ROUTER_MAC2)),
            Action::SetEthDst(mac(HOST_B)),
            Action::Output(2),
        ],
    }
}

fn arp_requests(messages: &[SouthboundMsg]) -> usize {
    messages
        .iter()
        .filter(|msg| {
            matches!(
                msg,
                SouthboundMsg::PacketOut {
                    payload: Payload::Arp { .. },
                    ..
                }
            )
        })
        .count()
}

#[tokio::test]
async fn queued_packets_released_in_order() {
    let mut master = connected_master(ROUTED);
    let target = ip4!("10.0.2.5");

    for payload in ["p1", "p2", "p3"] {
        master.process_event(packet_in(routed_frame(target), payload));
    }
    assert_eq!(master.southbound.take(), vec![arp_request_out(target)]);
    assert_eq!(master.resolver.pending(&target).unwrap().queue.len(), 3);

    master.process_event(packet_in(arp_reply(target), "reply"));
    assert_eq!(
        master.southbound.take(),
        vec![routed_out("p1"), routed_out("p2"), routed_out("p3")]
    );
    assert!(!master.resolver.is_pending(&target));
    assert_eq!(master.nib.mac_for_ip(&target), Some(mac(HOST_B)));

    // Resolved destinations are forwarded right away.
    master.process_event(packet_in(routed_frame(target), "p4"));
    assert_eq!(master.southbound.take(), vec![routed_out("p4")]);
    assert_eq!(master.resolver.pending_count(), 0);
}

#[tokio::test]
async fn unrelated_reply_ignored() {
    let mut master = connected_master(ROUTED);
    let target = ip4!("10.0.2.5");
    master.process_event(packet_in(routed_frame(target), "p1"));
    master.southbound.take();

    assert!(!master.record_resolution_reply(&arp_reply(ip4!("10.0.2.9"))));
    assert!(master.southbound.take().is_empty());
    assert!(master.resolver.is_pending(&target));
    assert_eq!(master.nib.mac_for_ip(&ip4!("10.0.2.9")), None);

    assert!(master.record_resolution_reply(&arp_reply(target)));
    assert_eq!(master.southbound.take(), vec![routed_out("p1")]);
}

#[tokio::test]
async fn destination_outside_subnets_dropped() {
    let mut master = connected_master(ROUTED);
    master.process_event(packet_in(routed_frame(ip4!("192.0.2.1")), "p1"));
    assert!(master.southbound.take().is_empty());
    assert_eq!(master.resolver.pending_count(), 0);
}

#[tokio::test]
async fn known_destination_forwarded() {
    let mut master = connected_master(ROUTED);
    master.learn(mac(HOST_B), S2, 1, Some(ip4!("10.0.2.5")));

    master.process_event(packet_in(routed_frame(ip4!("10.0.2.5")), "p1"));
    assert_eq!(master.southbound.take(), vec![routed_out("p1")]);
    assert_eq!(master.resolver.pending_count(), 0);
}

#[tokio::test]
async fn gateway_answers_arp() {
    let mut master = connected_master(ROUTED);

    let request = FrameMeta::new(R, 1, mac(HOST_A), mac("ff:ff:ff:ff:ff:ff"))
        .with_arp(ArpOp::Request, ip4!("10.0.1.2"), ip4!("10.0.1.1"));
    master.process_event(packet_in(request, "who-has"));
    assert_eq!(
        master.southbound.take(),
        vec![SouthboundMsg::PacketOut {
            switch: R,
            payload: Payload::Arp {
                eth_src: mac(ROUTER_MAC1),
                eth_dst: mac(HOST_A),
                packet: ArpPacket {
                    op: ArpOp::Reply,
                    sender_mac: mac(ROUTER_MAC1),
                    sender_ip: ip4!("10.0.1.1"),
                    target_mac: mac(HOST_A),
                    target_ip: ip4!("10.0.1.2"),
                },
            },
            actions: vec![Action::Output(1)],
        }]
    );

    // Requests for other addresses are left to their owners.
    let request = FrameMeta::new(R, 1, mac(HOST_A), mac("ff:ff:ff:ff:ff:ff"))
        .with_arp(ArpOp::Request, ip4!("10.0.1.2"), ip4!("10.0.1.9"));
    master.process_event(packet_in(request, "who-has"));
    assert!(master.southbound.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_waits_forever() {
    let mut master = connected_master(ROUTED);
    let target = ip4!("10.0.2.5");

    let events = vec![packet_in(routed_frame(target), "p1")];
    run_for(&mut master, events, Duration::from_secs(60)).await;

    assert_eq!(arp_requests(&master.southbound.messages), 1);
    assert!(master.resolver.is_pending(&target));
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_retried_then_abandoned() {
    let cfg = format!("{ROUTED}{RETRIES}");
    let mut master = connected_master(&cfg);
    let target = ip4!("10.0.2.5");

    let events = vec![packet_in(routed_frame(target), "p1")];
    run_for(&mut master, events, Duration::from_millis(2500)).await;
    assert_eq!(arp_requests(&master.southbound.messages), 3);
    assert_eq!(master.resolver.pending(&target).unwrap().retries, 2);

    run_for(&mut master, vec![], Duration::from_secs(5)).await;
    assert_eq!(arp_requests(&master.southbound.messages), 3);
    assert!(!master.resolver.is_pending(&target));

    // A late reply finds nothing to release.
    assert!(!master.record_resolution_reply(&arp_reply(target)));
}

#[tokio::test(start_paused = true)]
async fn stale_timeout_ignored() {
    let cfg = format!("{ROUTED}{RETRIES}");
    let mut master = connected_master(&cfg);
    let target = ip4!("10.0.2.5");

    master.process_event(packet_in(routed_frame(target), "p1"));
    let first = master.resolver.pending(&target).unwrap().generation;
    master.process_event(packet_in(arp_reply(target), "reply"));
    master.unlearn(&mac(HOST_B));

    // A new request for the same target.
    master.process_event(packet_in(routed_frame(target), "p2"));
    let second = master.resolver.pending(&target).unwrap().generation;
    assert_ne!(first, second);
    master.southbound.take();

    // The timeout armed for the first request fires late.
    master.process_timer(TimerMsg::ResolutionTimeout {
        target,
        generation: first,
    });
    assert!(master.southbound.take().is_empty());
    assert_eq!(master.resolver.pending(&target).unwrap().retries, 0);

    master.process_timer(TimerMsg::ResolutionTimeout {
        target,
        generation: second,
    });
    assert_eq!(master.southbound.take(), vec![arp_request_out(target)]);
    assert_eq!(master.resolver.pending(&target).unwrap().retries, 1);
}

#[tokio::test]
async fn router_port_down_forgets_resolved_hosts() {
    let mut master = connected_master(ROUTED);
    let targets = [(HOST_B, ip4!("10.0.2.2")), (HOST_C, ip4!("10.0.2.3"))];

    for (host, target) in targets {
        master.process_event(packet_in(routed_frame(target), "p1"));
        master.process_event(packet_in(arp_reply_from(host, target), "r"));
        assert_eq!(master.nib.mac_for_ip(&target), Some(mac(host)));
    }
    assert_eq!(master.nib.bindings_at(R, 2).count(), 2);

    master.port_down(R, 2);
    assert_eq!(master.nib.bindings_at(R, 2).count(), 0);
    for (_, target) in targets {
        assert_eq!(master.nib.mac_for_ip(&target), None);
    }
}
