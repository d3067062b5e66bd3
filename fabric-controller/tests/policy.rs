//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod common;

use std::collections::BTreeSet;

use const_addrs::ip4;
use fabric_controller::nib::{Nib, RouterInfo};
use fabric_controller::packet::{ArpOp, FrameMeta};
use fabric_controller::policy::{self, Action, Pred, Test};
use fabric_controller::test::setup;
use fabric_controller::topology::Topology;
use fabric_utils::PortId;
use maplit::btreeset;

use crate::common::*;

const HOST_A: &str = "02:00:00:00:00:0a";
const HOST_B: &str = "02:00:00:00:00:0b";
const HOST_C: &str = "02:00:00:00:00:0c";

const TRIANGLE: &str = r#"
[[topology.switches]]
id = 1
ports = [1]

[[topology.switches]]
id = 2
ports = [1]

[[topology.switches]]
id = 3
ports = [1]

[[topology.links]]
switch_a = 1
port_a = 2
switch_b = 2
port_b = 2

[[topology.links]]
switch_a = 2
port_a = 3
switch_b = 3
port_b = 2

[[topology.links]]
switch_a = 1
port_a = 3
switch_b = 3
port_b = 3
"#;

fn connected_nib(toml_str: &str) -> Nib {
    setup();
    let cfg = config(toml_str);
    let router = cfg.router.as_ref().map(|router| router.switch);
    let topology = Topology::new(&cfg.topology, router).unwrap();
    let router = cfg
        .router
        .as_ref()
        .map(|router| RouterInfo::new(router, &topology).unwrap());
    let mut nib = Nib::new(topology, router);
    let switches = nib
        .topology()
        .switches()
        .map(|switch| (switch.id, switch.ports.clone()))
        .collect::<Vec<_>>();
    for (switch, ports) in switches {
        nib.switch_up(switch, ports);
    }
    nib
}

fn output_ports(actions: &[Action]) -> BTreeSet<PortId> {
    let mut ports = BTreeSet::new();
    for action in actions {
        if let Some(port) = action.as_output() {
            ports.insert(*port);
        }
        if let Some(flood) = action.as_flood() {
            ports.extend(flood);
        }
    }
    ports
}

#[test]
fn edge_forwarding() {
    let mut nib = connected_nib(SCENARIO);
    nib.learn(mac(HOST_A), E, 1, None);
    let policy = policy::synthesize(&nib);

    // Known destination arriving over the uplink.
    let frame = FrameMeta::new(E, 2, mac(HOST_B), mac(HOST_A));
    assert_eq!(policy.evaluate(&frame), vec![Action::Output(1)]);

    // Known source toward an unknown destination.
    let frame = FrameMeta::new(E, 1, mac(HOST_A), mac(HOST_B));
    assert_eq!(policy.evaluate(&frame), vec![Action::Flood(btreeset![2])]);

    // Unknown source on an access port.
    let frame = FrameMeta::new(E, 1, mac(HOST_B), mac(HOST_A));
    assert_eq!(policy.evaluate(&frame), vec![Action::Escalate]);

    // The other end of the link forwards toward the host too.
    let frame = FrameMeta::new(C, 1, mac(HOST_B), mac(HOST_A));
    assert_eq!(policy.evaluate(&frame), vec![Action::Output(1)]);
}

#[test]
fn unknown_switch_escalates() {
    let nib = connected_nib(SCENARIO);
    let policy = policy::synthesize(&nib);
    let frame = FrameMeta::new(42, 1, mac(HOST_A), mac(HOST_B));
    assert_eq!(policy.evaluate(&frame), vec![Action::Escalate]);
}

#[test]
fn disconnected_switch_floods_nowhere() {
    let mut nib = connected_nib(SCENARIO);
    nib.learn(mac(HOST_A), E, 1, None);
    nib.switch_down(C);
    let policy = policy::synthesize(&nib);

    assert!(policy.get(C).unwrap().rules.iter().all(|rule| {
        !rule.actions.iter().any(Action::is_flood)
    }));
}

#[test]
fn pruned_links_never_carry_traffic() {
    let mut nib = connected_nib(TRIANGLE);
    nib.learn(mac(HOST_A), 1, 1, None);
    nib.learn(mac(HOST_B), 2, 1, None);
    nib.learn(mac(HOST_C), 3, 1, None);
    let policy = policy::synthesize(&nib);

    for switch in nib.topology().switches() {
        let rules = &policy.get(switch.id).unwrap().rules;
        for rule in rules {
            let ports = output_ports(&rule.actions);
            assert!(
                ports.is_disjoint(&switch.blocked_ports),
                "switch {} sends out of a blocked port: {:?}",
                switch.id,
                rule.actions
            );
        }
    }

    // Host B sits on switch 2, whose link to switch 3 is pruned: switch 3
    // reaches it through switch 1.
    let frame = FrameMeta::new(3, 1, mac(HOST_C), mac(HOST_B));
    assert_eq!(policy.evaluate(&frame), vec![Action::Output(3)]);
    let frame = FrameMeta::new(1, 3, mac(HOST_C), mac(HOST_B));
    assert_eq!(policy.evaluate(&frame), vec![Action::Output(2)]);
}

#[test]
fn learning_order_irrelevant() {
    let mut first = connected_nib(TRIANGLE);
    first.learn(mac(HOST_A), 1, 1, Some(ip4!("10.0.0.1")));
    first.learn(mac(HOST_B), 2, 1, Some(ip4!("10.0.0.2")));

    let mut second = connected_nib(TRIANGLE);
    second.learn(mac(HOST_B), 2, 1, Some(ip4!("10.0.0.2")));
    second.learn(mac(HOST_A), 1, 1, Some(ip4!("10.0.0.1")));

    assert_eq!(policy::synthesize(&first), policy::synthesize(&second));
    assert_eq!(policy::synthesize(&first), policy::synthesize(&first));
}

#[test]
fn router_rules() {
    let mut nib = connected_nib(ROUTED);
    nib.learn(mac(HOST_B), S2, 1, Some(ip4!("10.0.2.5")));
    let policy = policy::synthesize(&nib);

    let arp = FrameMeta::new(R, 1, mac(HOST_A), mac(ROUTER_MAC1)).with_arp(
        ArpOp::Request,
        ip4!("10.0.1.2"),
        ip4!("10.0.1.1"),
    );
    assert_eq!(policy.evaluate(&arp), vec![Action::Escalate]);

    let resolved = FrameMeta::new(R, 1, mac(HOST_A), mac(ROUTER_MAC1))
        .with_ipv4(ip4!("10.0.1.2"), ip4!("10.0.2.5"));
    assert_eq!(
        policy.evaluate(&resolved),
        vec![
            Action::SetEthSrc(mac(ROUTER_MAC2)),
            Action::SetEthDst(mac(HOST_B)),
            Action::Output(2),
        ]
    );

    let unresolved = FrameMeta::new(R, 1, mac(HOST_A), mac(ROUTER_MAC1))
        .with_ipv4(ip4!("10.0.1.2"), ip4!("10.0.2.6"));
    assert_eq!(policy.evaluate(&unresolved), vec![Action::Escalate]);

    let offnet = FrameMeta::new(R, 1, mac(HOST_A), mac(ROUTER_MAC1))
        .with_ipv4(ip4!("10.0.1.2"), ip4!("192.0.2.1"));
    assert_eq!(policy.evaluate(&offnet), vec![Action::Escalate]);
}

#[test]
fn flattened_rules_keep_order() {
    let mut nib = connected_nib(SCENARIO);
    nib.learn(mac(HOST_A), E, 1, None);
    let policy = policy::synthesize(&nib);
    let rules = policy.flatten();
    assert_eq!(rules.len(), policy.rule_count());

    // Evaluating the flattened table gives the same answer as the per-switch
    // policy.
    let frame = FrameMeta::new(E, 2, mac(HOST_B), mac(HOST_A));
    let actions = rules
        .iter()
        .find(|rule| rule.pred.matches(&frame))
        .map(|rule| rule.actions.clone());
    assert_eq!(actions, Some(policy.evaluate(&frame)));
    assert!(matches!(
        &rules[0].pred,
        Pred::And(preds) if preds[0] == Pred::test(Test::Switch(E))
    ));
}
