//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use fabric_controller::Master;
use fabric_controller::config::ControllerCfg;
use fabric_controller::packet::FrameMeta;
use fabric_controller::tasks::messages::input::SouthboundEvent;
use fabric_controller::test::setup;
use fabric_controller::test::stub::Collector;
use fabric_utils::mac_addr::MacAddr;
use fabric_utils::{PortId, SwitchId};
use tokio::sync::mpsc;

// Edge switch E (host port 1, uplink 2) linked to switch C (port 1).
pub const E: SwitchId = 1;
pub const C: SwitchId = 2;
pub const SCENARIO: &str = r#"
[[topology.switches]]
id = 1
ports = [1, 2]

[[topology.switches]]
id = 2
ports = [1]

[[topology.links]]
switch_a = 1
port_a = 2
switch_b = 2
port_b = 1
"#;

// Two edge switches, each serving one subnet through the router.
//
//   hosts 1,2 -- [S1] 3 ---- 1 [R] 2 ---- 3 [S2] -- hosts 1,2
//   10.0.1.0/24                                  10.0.2.0/24
pub const S1: SwitchId = 1;
pub const S2: SwitchId = 2;
pub const R: SwitchId = 10;
pub const ROUTER_MAC1: &str = "02:00:00:00:00:01";
pub const ROUTER_MAC2: &str = "02:00:00:00:00:02";
pub const ROUTED: &str = r#"
[[topology.switches]]
id = 1
ports = [1, 2, 3]

[[topology.switches]]
id = 2
ports = [1, 2, 3]

[[topology.switches]]
id = 10
ports = [1, 2]

[[topology.links]]
switch_a = 1
port_a = 3
switch_b = 10
port_b = 1

[[topology.links]]
switch_a = 2
port_a = 3
switch_b = 10
port_b = 2

[router]
switch = 10

[[router.subnets]]
network = "10.0.1.0/24"
router_port = 1
router_mac = "02:00:00:00:00:01"
gateway = "10.0.1.1"

[[router.subnets]]
network = "10.0.2.0/24"
router_port = 2
router_mac = "02:00:00:00:00:02"
gateway = "10.0.2.1"
"#;

pub const LOAD_BALANCER: &str = r#"
[load_balancer]
frontend = "10.0.1.100"
backends = ["10.0.2.2", "10.0.2.3"]
"#;

pub fn config(toml_str: &str) -> ControllerCfg {
    toml::from_str(toml_str).unwrap()
}

pub fn master(toml_str: &str) -> Master<Collector> {
    setup();
    Master::new(&config(toml_str), Collector::default()).unwrap()
}

// Master with every declared port of every switch up, and the resulting
// southbound output discarded.
pub fn connected_master(toml_str: &str) -> Master<Collector> {
    let mut master = master(toml_str);
    let switches = master
        .nib
        .topology()
        .switches()
        .map(|switch| (switch.id, switch.ports.clone()))
        .collect::<Vec<_>>();
    for (switch, ports) in switches {
        master.process_event(SouthboundEvent::SwitchUp { switch, ports });
    }
    master.southbound.take();
    master
}

pub fn mac(addr: &str) -> MacAddr {
    addr.parse().unwrap()
}

pub fn packet_in(frame: FrameMeta, payload: &'static str) -> SouthboundEvent {
    SouthboundEvent::PacketIn {
        frame,
        payload: Bytes::from_static(payload.as_bytes()),
    }
}

pub fn switch_up(switch: SwitchId, ports: &[PortId]) -> SouthboundEvent {
    SouthboundEvent::SwitchUp {
        switch,
        ports: ports.iter().copied().collect(),
    }
}

// Runs the controller main loop for `duration`, feeding it `events` first.
// Meant for tests running with paused time.
pub async fn run_for(
    master: &mut Master<Collector>,
    events: Vec<SouthboundEvent>,
    duration: Duration,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    for event in events {
        event_tx.send(event).unwrap();
    }
    let _ = tokio::time::timeout(duration, master.run(event_rx)).await;
}
