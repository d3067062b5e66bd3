//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Declarative forwarding policy and its synthesis from the NIB.
//!
//! A [`Policy`] holds one ordered rule list per switch. Rules are evaluated
//! first-match: more specific rules always precede the flood and escalate
//! fallbacks. Synthesis is a pure function of the NIB, so identical NIB
//! contents always yield structurally identical policies.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use derive_new::new;
use enum_as_inner::EnumAsInner;
use fabric_utils::mac_addr::MacAddr;
use fabric_utils::{PortId, SwitchId};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::nib::Nib;
use crate::packet::{ETHTYPE_ARP, ETHTYPE_IPV4, FrameMeta};
use crate::topology::{Role, SwitchTopo};

// Header field test.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Test {
    Switch(SwitchId),
    InPort(PortId),
    EthSrc(MacAddr),
    EthDst(MacAddr),
    EthType(u16),
    Vlan(u16),
    Ip4Src(Ipv4Network),
    Ip4Dst(Ipv4Network),
    IpProto(u8),
    TcpSrc(u16),
    TcpDst(u16),
}

// Boolean combination of field tests.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pred {
    True,
    Test(Test),
    And(Vec<Pred>),
    Or(Vec<Pred>),
    Not(Box<Pred>),
}

#[derive(Clone, Debug, EnumAsInner, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    SetEthSrc(MacAddr),
    SetEthDst(MacAddr),
    SetVlan(u16),
    SetIp4Src(Ipv4Addr),
    SetIp4Dst(Ipv4Addr),
    SetTcpSrc(u16),
    SetTcpDst(u16),
    // Output on a single physical port.
    Output(PortId),
    // Output on every port of the set.
    Flood(BTreeSet<PortId>),
    // Send to the controller.
    Escalate,
}

// An empty action list drops the frame.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct Rule {
    pub pred: Pred,
    pub actions: Vec<Action>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct SwitchPolicy {
    pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Policy {
    pub switches: BTreeMap<SwitchId, SwitchPolicy>,
}

// ===== impl Test =====

impl Test {
    pub fn ip4_src_host(addr: Ipv4Addr) -> Test {
        Test::Ip4Src(host_network(addr))
    }

    pub fn ip4_dst_host(addr: Ipv4Addr) -> Test {
        Test::Ip4Dst(host_network(addr))
    }

    pub fn matches(&self, frame: &FrameMeta) -> bool {
        match self {
            Test::Switch(switch) => frame.switch == *switch,
            Test::InPort(port) => frame.port == *port,
            Test::EthSrc(mac) => frame.eth_src == *mac,
            Test::EthDst(mac) => frame.eth_dst == *mac,
            Test::EthType(eth_type) => frame.eth_type == *eth_type,
            Test::Vlan(vlan) => frame.vlan == Some(*vlan),
            Test::Ip4Src(network) => {
                frame.ip4_src.is_some_and(|addr| network.contains(addr))
            }
            Test::Ip4Dst(network) => {
                frame.ip4_dst.is_some_and(|addr| network.contains(addr))
            }
            Test::IpProto(proto) => frame.ip_proto == Some(*proto),
            Test::TcpSrc(port) => frame.tcp_src == Some(*port),
            Test::TcpDst(port) => frame.tcp_dst == Some(*port),
        }
    }
}

// ===== impl Pred =====

impl Pred {
    pub fn test(test: Test) -> Pred {
        Pred::Test(test)
    }

    // Disjunction of the given tests. Empty input yields a predicate that
    // matches nothing.
    pub fn any_of<I>(tests: I) -> Pred
    where
        I: IntoIterator<Item = Test>,
    {
        Pred::Or(tests.into_iter().map(Pred::Test).collect())
    }

    pub fn and(self, other: Pred) -> Pred {
        match (self, other) {
            (Pred::True, pred) | (pred, Pred::True) => pred,
            (Pred::And(mut preds), pred) => {
                preds.push(pred);
                Pred::And(preds)
            }
            (lhs, rhs) => Pred::And(vec![lhs, rhs]),
        }
    }

    pub fn or(self, other: Pred) -> Pred {
        match (self, other) {
            (Pred::Or(mut preds), pred) => {
                preds.push(pred);
                Pred::Or(preds)
            }
            (lhs, rhs) => Pred::Or(vec![lhs, rhs]),
        }
    }

    pub fn matches(&self, frame: &FrameMeta) -> bool {
        match self {
            Pred::True => true,
            Pred::Test(test) => test.matches(frame),
            Pred::And(preds) => preds.iter().all(|pred| pred.matches(frame)),
            Pred::Or(preds) => preds.iter().any(|pred| pred.matches(frame)),
            Pred::Not(pred) => !pred.matches(frame),
        }
    }
}

impl std::ops::Not for Pred {
    type Output = Pred;

    fn not(self) -> Pred {
        match self {
            Pred::Not(pred) => *pred,
            pred => Pred::Not(Box::new(pred)),
        }
    }
}

// ===== impl SwitchPolicy =====

impl SwitchPolicy {
    // Returns the actions of the first matching rule. Frames matching no
    // rule are escalated.
    pub fn evaluate(&self, frame: &FrameMeta) -> Vec<Action> {
        self.rules
            .iter()
            .find(|rule| rule.pred.matches(frame))
            .map(|rule| rule.actions.clone())
            .unwrap_or_else(|| vec![Action::Escalate])
    }

    fn push(&mut self, pred: Pred, actions: Vec<Action>) {
        self.rules.push(Rule::new(pred, actions));
    }
}

// ===== impl Policy =====

impl Policy {
    pub fn get(&self, switch: SwitchId) -> Option<&SwitchPolicy> {
        self.switches.get(&switch)
    }

    pub fn get_mut(&mut self, switch: SwitchId) -> Option<&mut SwitchPolicy> {
        self.switches.get_mut(&switch)
    }

    pub fn evaluate(&self, frame: &FrameMeta) -> Vec<Action> {
        match self.switches.get(&frame.switch) {
            Some(policy) => policy.evaluate(frame),
            None => vec![Action::Escalate],
        }
    }

    pub fn rule_count(&self) -> usize {
        self.switches.values().map(|policy| policy.rules.len()).sum()
    }

    // Single rule list with every predicate qualified by its switch, for
    // southbound runtimes that expect one global table.
    pub fn flatten(&self) -> Vec<Rule> {
        self.switches
            .iter()
            .flat_map(|(switch, policy)| {
                policy.rules.iter().map(|rule| {
                    Rule::new(
                        Pred::test(Test::Switch(*switch))
                            .and(rule.pred.clone()),
                        rule.actions.clone(),
                    )
                })
            })
            .collect()
    }
}

// ===== global functions =====

/// Synthesizes the forwarding policy for every switch in the topology.
pub fn synthesize(nib: &Nib) -> Policy {
    let switches = nib
        .topology()
        .switches()
        .map(|switch| {
            let policy = match switch.role {
                Role::Edge => edge_policy(nib, switch),
                Role::Core => core_policy(nib, switch),
                Role::Router => router_policy(nib, switch),
            };
            (switch.id, policy)
        })
        .collect();

    Policy { switches }
}

// Edge switch: hosts hang off access ports, the rest of the network sits
// behind a single uplink.
fn edge_policy(nib: &Nib, switch: &SwitchTopo) -> SwitchPolicy {
    let mut policy = SwitchPolicy::default();
    let learned = nib.bindings_on_switch(switch.id).map(|b| b.mac);

    // Unknown sources not arriving over the uplink go to the controller so
    // that they can be learned.
    let mut unknown_src = !Pred::any_of(learned.map(Test::EthSrc));
    if let Some(uplink) = switch.uplink {
        unknown_src = unknown_src.and(!Pred::test(Test::InPort(uplink)));
    }
    policy.push(unknown_src, vec![Action::Escalate]);

    push_forwarding_rules(nib, switch, &mut policy);
    push_flood_rules(nib, switch, &mut policy);
    policy.push(Pred::True, vec![Action::Escalate]);
    policy
}

// Core switch: forward known destinations along the spanning tree.
fn core_policy(nib: &Nib, switch: &SwitchTopo) -> SwitchPolicy {
    let mut policy = SwitchPolicy::default();

    // Hosts attached directly to a core switch are learned like on an edge
    // switch.
    let host_ports: BTreeSet<PortId> = nib
        .enabled_ports(switch.id)
        .into_iter()
        .filter(|port| !switch.is_link_port(*port))
        .collect();
    if !host_ports.is_empty() {
        let learned = nib.bindings_on_switch(switch.id).map(|b| b.mac);
        let pred = (!Pred::any_of(learned.map(Test::EthSrc)))
            .and(Pred::any_of(host_ports.iter().copied().map(Test::InPort)));
        policy.push(pred, vec![Action::Escalate]);
    }

    push_forwarding_rules(nib, switch, &mut policy);
    push_flood_rules(nib, switch, &mut policy);
    policy.push(Pred::True, vec![Action::Escalate]);
    policy
}

// Router: rewrite and forward IPv4 traffic to hosts with a known MAC; ARP
// and unresolved destinations go to the controller.
fn router_policy(nib: &Nib, switch: &SwitchTopo) -> SwitchPolicy {
    let mut policy = SwitchPolicy::default();
    let Some(router) = nib.router().filter(|router| router.switch == switch.id)
    else {
        policy.push(Pred::True, vec![Action::Escalate]);
        return policy;
    };

    policy.push(
        Pred::test(Test::EthType(ETHTYPE_ARP)),
        vec![Action::Escalate],
    );

    let resolved: BTreeMap<Ipv4Addr, MacAddr> = nib
        .bindings()
        .filter_map(|binding| Some((binding.ip?, binding.mac)))
        .collect();
    for (addr, mac) in resolved {
        let Some(subnet) = router.subnet_for(addr) else {
            continue;
        };
        policy.push(
            Pred::test(Test::EthType(ETHTYPE_IPV4))
                .and(Pred::test(Test::ip4_dst_host(addr))),
            subnet.rewrite_actions(mac),
        );
    }

    for subnet in &router.subnets {
        policy.push(
            Pred::test(Test::EthType(ETHTYPE_IPV4))
                .and(Pred::test(Test::Ip4Dst(subnet.network))),
            vec![Action::Escalate],
        );
    }

    policy.push(Pred::True, vec![Action::Escalate]);
    policy
}

// One rule per learned host reachable from this switch.
fn push_forwarding_rules(
    nib: &Nib,
    switch: &SwitchTopo,
    policy: &mut SwitchPolicy,
) {
    for binding in nib.bindings() {
        if let Some(port) = binding.next_hops.get(&switch.id) {
            policy.push(
                Pred::test(Test::EthDst(binding.mac)),
                vec![Action::Output(*port)],
            );
        }
    }
}

// One flood rule per enabled ingress port.
fn push_flood_rules(nib: &Nib, switch: &SwitchTopo, policy: &mut SwitchPolicy) {
    for in_port in nib.enabled_ports(switch.id) {
        let ports = nib.flood_ports(switch.id, in_port);
        let actions = if ports.is_empty() {
            vec![]
        } else {
            vec![Action::Flood(ports)]
        };
        policy.push(Pred::test(Test::InPort(in_port)), actions);
    }
}

pub(crate) fn host_network(addr: Ipv4Addr) -> Ipv4Network {
    Ipv4Network::from(addr)
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> FrameMeta {
        FrameMeta::new(
            1,
            3,
            MacAddr::new([0x02, 0, 0, 0, 0, 0x0a]),
            MacAddr::new([0x02, 0, 0, 0, 0, 0x0b]),
        )
        .with_ipv4(Ipv4Addr::new(10, 0, 1, 2), Ipv4Addr::new(10, 0, 2, 2))
    }

    #[test]
    fn empty_disjunction_matches_nothing() {
        assert!(!Pred::any_of(std::iter::empty()).matches(&frame()));
        assert!((!Pred::any_of(std::iter::empty())).matches(&frame()));
    }

    #[test]
    fn conjunction_with_true() {
        let pred = Pred::True.and(Pred::test(Test::InPort(3)));
        assert_eq!(pred, Pred::test(Test::InPort(3)));
        assert_eq!(!!pred.clone(), pred);
    }

    #[test]
    fn subnet_tests() {
        let frame = frame();
        let subnet = "10.0.2.0/24".parse().unwrap();
        assert!(Test::Ip4Dst(subnet).matches(&frame));
        assert!(!Test::Ip4Src(subnet).matches(&frame));
        assert!(Test::ip4_dst_host(Ipv4Addr::new(10, 0, 2, 2)).matches(&frame));
        assert!(!Test::TcpDst(80).matches(&frame));
    }

    #[test]
    fn first_match_wins() {
        let mut policy = SwitchPolicy::default();
        policy.push(Pred::test(Test::InPort(3)), vec![Action::Output(1)]);
        policy.push(Pred::True, vec![Action::Output(2)]);
        assert_eq!(policy.evaluate(&frame()), vec![Action::Output(1)]);

        let other = FrameMeta { port: 4, ..frame() };
        assert_eq!(policy.evaluate(&other), vec![Action::Output(2)]);
    }

    #[test]
    fn unmatched_frames_escalate() {
        let policy = Policy::default();
        assert_eq!(policy.evaluate(&frame()), vec![Action::Escalate]);
        assert_eq!(
            SwitchPolicy::default().evaluate(&frame()),
            vec![Action::Escalate]
        );
    }

    #[test]
    fn flatten_qualifies_switch() {
        let mut policy = Policy::default();
        let mut switch_policy = SwitchPolicy::default();
        switch_policy.push(Pred::True, vec![Action::Escalate]);
        policy.switches.insert(7, switch_policy);

        let rules = policy.flatten();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].pred, Pred::test(Test::Switch(7)));
    }
}
