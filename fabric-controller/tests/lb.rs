//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod common;

use std::net::Ipv4Addr;

use bytes::Bytes;
use const_addrs::ip4;
use fabric_controller::Master;
use fabric_controller::error::{ConfigError, Error};
use fabric_controller::lb::BackendAllocator;
use fabric_controller::packet::{ArpOp, FrameMeta, Payload};
use fabric_controller::policy::Action;
use fabric_controller::tasks::messages::output::SouthboundMsg;
use fabric_controller::test::stub::Collector;

use crate::common::*;

const CLIENT: &str = "02:00:00:00:00:0a";
const BACKEND: &str = "02:00:00:00:00:0b";
const FRONTEND: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 100);

fn lb_config() -> String {
    format!("{ROUTED}{LOAD_BALANCER}")
}

fn client_frame(src: Ipv4Addr) -> FrameMeta {
    FrameMeta::new(R, 1, mac(CLIENT), mac(ROUTER_MAC1))
        .with_ipv4(src, FRONTEND)
}

fn backend_frame(src: Ipv4Addr, dst: Ipv4Addr) -> FrameMeta {
    FrameMeta::new(R, 2, mac(BACKEND), mac(ROUTER_MAC2)).with_ipv4(src, dst)
}

fn frame_out(payload: &'static str, actions: Vec<Action>) -> SouthboundMsg {
    SouthboundMsg::PacketOut {
        switch: R,
        payload: Payload::Frame(Bytes::from_static(payload.as_bytes())),
        actions,
    }
}

fn to_backend(backend: Ipv4Addr) -> Vec<Action> {
    vec![
        Action::SetIp4Dst(backend),
        Action::SetEthSrc(mac(ROUTER_MAC2)),
        Action::SetEthDst(mac(BACKEND)),
        Action::Output(2),
    ]
}

fn to_client() -> Vec<Action> {
    vec![
        Action::SetIp4Src(FRONTEND),
        Action::SetEthSrc(mac(ROUTER_MAC1)),
        Action::SetEthDst(mac(CLIENT)),
        Action::Output(1),
    ]
}

#[test]
fn round_robin_assignment() {
    let mut allocator = BackendAllocator::new(vec!["b1", "b2"]).unwrap();
    assert_eq!(allocator.allocate(&"c1"), ("b1", true));
    assert_eq!(allocator.allocate(&"c2"), ("b2", true));
    assert_eq!(allocator.allocate(&"c3"), ("b1", true));
    assert_eq!(allocator.allocate(&"c2"), ("b2", false));
    assert_eq!(allocator.get(&"c3"), Some(&"b1"));
    assert_eq!(allocator.get(&"c4"), None);
    assert_eq!(allocator.assignments().count(), 3);
}

#[test]
fn empty_pool_rejected() {
    assert!(matches!(
        BackendAllocator::<u32, u32>::new(vec![]),
        Err(ConfigError::EmptyBackendPool)
    ));
}

#[test]
fn invalid_configurations() {
    let invalid = [
        r#"
        [load_balancer]
        frontend = "10.0.1.100"
        backends = []
        "#,
        r#"
        [load_balancer]
        frontend = "192.0.2.1"
        backends = ["10.0.2.2"]
        "#,
        r#"
        [load_balancer]
        frontend = "10.0.1.100"
        backends = ["10.0.2.2", "10.0.2.2"]
        "#,
        r#"
        [load_balancer]
        frontend = "10.0.1.100"
        backends = ["10.0.2.2", "198.51.100.1"]
        "#,
    ];
    for lb in invalid {
        let cfg = config(&format!("{ROUTED}{lb}"));
        let result = Master::new(&cfg, Collector::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    // No router to host the front-end.
    let cfg = config(&format!("{SCENARIO}{LOAD_BALANCER}"));
    assert!(matches!(
        Master::new(&cfg, Collector::default()),
        Err(Error::Config(ConfigError::NoSubnetForAddress(_)))
    ));
}

#[tokio::test]
async fn sticky_round_robin() {
    let mut master = master(&lb_config());
    assert_eq!(
        master.allocate_backend(ip4!("10.0.1.2")),
        Some(ip4!("10.0.2.2"))
    );
    assert!(master.is_dirty());
    master.clear_dirty();

    assert_eq!(
        master.allocate_backend(ip4!("10.0.1.3")),
        Some(ip4!("10.0.2.3"))
    );
    assert_eq!(
        master.allocate_backend(ip4!("10.0.1.4")),
        Some(ip4!("10.0.2.2"))
    );
    master.clear_dirty();

    // Existing assignments don't change anything.
    assert_eq!(
        master.allocate_backend(ip4!("10.0.1.3")),
        Some(ip4!("10.0.2.3"))
    );
    assert!(!master.is_dirty());

    let mut plain = common::master(ROUTED);
    assert_eq!(plain.allocate_backend(ip4!("10.0.1.2")), None);
}

#[tokio::test]
async fn backends_resolved_when_router_connects() {
    let mut master = master(&lb_config());
    master.process_event(switch_up(R, &[1, 2]));

    let targets = master
        .southbound
        .take()
        .into_iter()
        .filter_map(|msg| match msg {
            SouthboundMsg::PacketOut {
                payload: Payload::Arp { packet, .. },
                actions,
                ..
            } => Some((packet.target_ip, actions)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        targets,
        vec![
            (ip4!("10.0.2.2"), vec![Action::Output(2)]),
            (ip4!("10.0.2.3"), vec![Action::Output(2)]),
        ]
    );
    assert!(master.resolver.is_pending(&ip4!("10.0.2.2")));
    assert!(master.resolver.is_pending(&ip4!("10.0.2.3")));
}

#[tokio::test]
async fn client_traffic_rewritten() {
    let mut master = connected_master(&lb_config());
    let client = ip4!("10.0.1.2");
    let backend = ip4!("10.0.2.2");

    // The backend is still being resolved: the request waits for it.
    master.process_event(packet_in(client_frame(client), "req1"));
    assert!(master.southbound.take().is_empty());
    assert_eq!(master.resolver.pending(&backend).unwrap().queue.len(), 1);

    let reply = FrameMeta::new(R, 2, mac(BACKEND), mac(ROUTER_MAC2))
        .with_arp(ArpOp::Reply, backend, ip4!("10.0.2.1"));
    master.process_event(packet_in(reply, "reply"));
    assert_eq!(
        master.southbound.take(),
        vec![frame_out("req1", to_backend(backend))]
    );

    master.process_event(packet_in(client_frame(client), "req2"));
    assert_eq!(
        master.southbound.take(),
        vec![frame_out("req2", to_backend(backend))]
    );

    // Responses are sent back on behalf of the front-end.
    master.learn(mac(CLIENT), S1, 1, Some(client));
    master.process_event(packet_in(backend_frame(backend, client), "resp"));
    assert_eq!(master.southbound.take(), vec![frame_out("resp", to_client())]);
}

#[tokio::test]
async fn response_to_unknown_client_resolved() {
    let mut master = connected_master(&lb_config());
    let client = ip4!("10.0.1.2");
    let backend = ip4!("10.0.2.3");

    master.process_event(packet_in(backend_frame(backend, client), "resp"));
    assert_eq!(
        master.southbound.take(),
        vec![SouthboundMsg::PacketOut {
            switch: R,
            payload: Payload::arp_request(
                mac(ROUTER_MAC1),
                ip4!("10.0.1.1"),
                client,
            ),
            actions: vec![Action::Output(1)],
        }]
    );

    let reply = FrameMeta::new(R, 1, mac(CLIENT), mac(ROUTER_MAC1))
        .with_arp(ArpOp::Reply, client, ip4!("10.0.1.1"));
    master.process_event(packet_in(reply, "reply"));
    assert_eq!(master.southbound.take(), vec![frame_out("resp", to_client())]);
}

#[tokio::test]
async fn policy_rules_precede_routing() {
    let mut master = connected_master(&lb_config());
    let client = ip4!("10.0.1.2");
    let backend = ip4!("10.0.2.2");

    // Assigned, but the backend MAC is unknown yet.
    master.allocate_backend(client);
    let policy = master.synthesize_policy();
    let frame = client_frame(client);
    assert_eq!(policy.evaluate(&frame), vec![Action::Escalate]);

    let reply = FrameMeta::new(R, 2, mac(BACKEND), mac(ROUTER_MAC2))
        .with_arp(ArpOp::Reply, backend, ip4!("10.0.2.1"));
    master.record_resolution_reply(&reply);
    master.learn(mac(CLIENT), S1, 1, Some(client));
    let policy = master.synthesize_policy();

    assert_eq!(policy.evaluate(&frame), to_backend(backend));
    assert_eq!(
        policy.evaluate(&backend_frame(backend, client)),
        to_client()
    );

    // Unassigned clients and unpaired backend traffic go to the controller.
    let frame = client_frame(ip4!("10.0.1.3"));
    assert_eq!(policy.evaluate(&frame), vec![Action::Escalate]);
    let frame = backend_frame(ip4!("10.0.2.3"), client);
    assert_eq!(policy.evaluate(&frame), vec![Action::Escalate]);

    // Plain routed traffic to a backend is untouched.
    let frame = FrameMeta::new(R, 1, mac(CLIENT), mac(ROUTER_MAC1))
        .with_ipv4(ip4!("10.0.1.3"), backend);
    assert_eq!(
        policy.evaluate(&frame),
        vec![
            Action::SetEthSrc(mac(ROUTER_MAC2)),
            Action::SetEthDst(mac(BACKEND)),
            Action::Output(2),
        ]
    );
}
