//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Port address translation.
//!
//! The NAT switch hides its inside hosts behind a single public address.
//! The first packet of every outgoing TCP flow is escalated, and the flow
//! gets a public port of its own together with the translation of its
//! return traffic. Once the next policy update is pushed, both directions
//! are rewritten by the switch itself.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use fabric_utils::mac_addr::MacAddr;
use fabric_utils::{PortId, SwitchId};

use crate::config::NatCfg;
use crate::debug::{Debug, DropReason};
use crate::error::{ConfigError, Error};
use crate::nib::Nib;
use crate::packet::{ETHTYPE_IPV4, FrameMeta, IPPROTO_TCP, Payload};
use crate::policy::{Action, Policy, Pred, Rule, SwitchPolicy, Test};
use crate::southbound::{self, Southbound};
use crate::topology::Topology;

#[derive(Debug)]
pub struct Nat {
    pub switch: SwitchId,
    pub outside_port: PortId,
    pub public_ip: Ipv4Addr,
    pub public_mac: MacAddr,
    flows: BTreeMap<Flow, Translation>,
    // Where inside hosts were seen, for the return path.
    inside: BTreeMap<Ipv4Addr, InsideHost>,
    free_ports: BTreeSet<u16>,
    port_range: RangeInclusive<u16>,
}

// TCP flow as seen by the NAT switch, before any rewrite.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Flow {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    // Inside host to the outside: the source is rewritten.
    Outgoing,
    // Return traffic: the destination is rewritten.
    Incoming,
}

#[derive(Clone, Debug)]
pub struct Translation {
    pub direction: Direction,
    pub addr: Ipv4Addr,
    pub port: u16,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug)]
struct InsideHost {
    port: PortId,
    mac: MacAddr,
}

// ===== impl Nat =====

impl Nat {
    pub fn new(cfg: &NatCfg, topology: &Topology) -> Result<Nat, ConfigError> {
        let switch = topology
            .switch(cfg.switch)
            .ok_or(ConfigError::UnknownNatSwitch(cfg.switch))?;
        if !switch.ports.contains(&cfg.outside_port) {
            return Err(ConfigError::NatPortUnknown(
                cfg.switch,
                cfg.outside_port,
            ));
        }

        let port_range = cfg.port_min..=cfg.port_max;
        Ok(Nat {
            switch: cfg.switch,
            outside_port: cfg.outside_port,
            public_ip: cfg.public_ip,
            public_mac: cfg.public_mac,
            flows: Default::default(),
            inside: Default::default(),
            free_ports: port_range.clone().collect(),
            port_range,
        })
    }

    // Records an outgoing flow entering on `in_port`. Returns false if
    // nothing was learned: known flows, traffic from the outside and flows
    // left without a public port.
    pub fn learn(
        &mut self,
        nib: &mut Nib,
        in_port: PortId,
        src_mac: MacAddr,
        flow: Flow,
    ) -> bool {
        if self.flows.contains_key(&flow) || in_port == self.outside_port {
            return false;
        }
        let Some(public_port) = self.free_ports.pop_first() else {
            Error::NatPortsExhausted {
                src: flow.src_ip,
                port: flow.src_port,
            }
            .log();
            return false;
        };

        self.inside.entry(flow.src_ip).or_insert(InsideHost {
            port: in_port,
            mac: src_mac,
        });

        let created_at = Utc::now();
        let outgoing = Translation {
            direction: Direction::Outgoing,
            addr: self.public_ip,
            port: public_port,
            created_at,
        };
        let reverse = Flow {
            src_ip: flow.dst_ip,
            src_port: flow.dst_port,
            dst_ip: self.public_ip,
            dst_port: public_port,
        };
        let incoming = Translation {
            direction: Direction::Incoming,
            addr: flow.src_ip,
            port: flow.src_port,
            created_at,
        };
        Debug::NatFlowLearn(&flow, &outgoing).log();
        self.flows.insert(flow, outgoing);
        self.flows.insert(reverse, incoming);
        nib.set_dirty();
        true
    }

    pub fn translation(&self, flow: &Flow) -> Option<&Translation> {
        self.flows.get(flow)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    // Rewrite applied to packets of a known flow.
    pub fn rewrite_actions(&self, flow: &Flow) -> Option<Vec<Action>> {
        let translation = self.flows.get(flow)?;
        match translation.direction {
            Direction::Outgoing => Some(vec![
                Action::SetIp4Src(translation.addr),
                Action::SetTcpSrc(translation.port),
                Action::SetEthSrc(self.public_mac),
                Action::Output(self.outside_port),
            ]),
            Direction::Incoming => {
                let host = self.inside.get(&translation.addr)?;
                Some(vec![
                    Action::SetIp4Dst(translation.addr),
                    Action::SetTcpDst(translation.port),
                    Action::SetEthDst(host.mac),
                    Action::Output(host.port),
                ])
            }
        }
    }

    // Handles a packet-in from the NAT switch. Only TCP over IPv4 is
    // translated, everything else is dropped.
    pub fn process_packet(
        &mut self,
        nib: &mut Nib,
        southbound: &mut impl Southbound,
        frame: &FrameMeta,
        payload: Bytes,
    ) {
        if !frame.is_tcp() {
            Debug::PacketDrop(frame, DropReason::NotTcp).log();
            return;
        }
        let Some(flow) = Flow::from_frame(frame) else {
            Debug::PacketDrop(frame, DropReason::MissingAddress).log();
            return;
        };

        self.learn(nib, frame.port, frame.eth_src, flow);
        let Some(actions) = self.rewrite_actions(&flow) else {
            Debug::PacketDrop(frame, DropReason::NoTranslation).log();
            return;
        };
        southbound::send_packet(
            southbound,
            frame.switch,
            Payload::Frame(payload),
            actions,
        );
    }

    // Forgets the inside hosts behind `port` along with their flows.
    pub fn forget_port(&mut self, nib: &mut Nib, port: PortId) {
        let hosts = self
            .inside
            .iter()
            .filter(|(_, host)| host.port == port)
            .map(|(addr, _)| *addr)
            .collect::<BTreeSet<_>>();
        if hosts.is_empty() {
            return;
        }
        self.inside.retain(|addr, _| !hosts.contains(addr));

        let free_ports = &mut self.free_ports;
        let before = self.flows.len();
        self.flows
            .retain(|flow, translation| match translation.direction {
                Direction::Outgoing if hosts.contains(&flow.src_ip) => {
                    free_ports.insert(translation.port);
                    false
                }
                Direction::Incoming => !hosts.contains(&translation.addr),
                Direction::Outgoing => true,
            });
        Debug::NatFlush(before - self.flows.len()).log();
        nib.set_dirty();
    }

    // Drops every translation, e.g. when the NAT switch reconnects.
    pub fn reset(&mut self, nib: &mut Nib) {
        if self.flows.is_empty() && self.inside.is_empty() {
            return;
        }
        Debug::NatFlush(self.flows.len()).log();
        self.flows.clear();
        self.inside.clear();
        self.free_ports = self.port_range.clone().collect();
        nib.set_dirty();
    }

    // Replaces the policy of the NAT switch: one rewrite rule per known
    // flow, then escalation of everything else.
    pub fn decorate(&self, policy: &mut Policy) {
        let mut rules = self
            .flows
            .keys()
            .filter_map(|flow| {
                Some(Rule::new(flow.pred(), self.rewrite_actions(flow)?))
            })
            .collect::<Vec<_>>();
        rules.push(Rule::new(Pred::True, vec![Action::Escalate]));
        policy.switches.insert(self.switch, SwitchPolicy { rules });
    }
}

// ===== impl Flow =====

impl Flow {
    pub fn from_frame(frame: &FrameMeta) -> Option<Flow> {
        Some(Flow {
            src_ip: frame.ip4_src?,
            src_port: frame.tcp_src?,
            dst_ip: frame.ip4_dst?,
            dst_port: frame.tcp_dst?,
        })
    }

    fn pred(&self) -> Pred {
        Pred::test(Test::EthType(ETHTYPE_IPV4))
            .and(Pred::test(Test::IpProto(IPPROTO_TCP)))
            .and(Pred::test(Test::ip4_src_host(self.src_ip)))
            .and(Pred::test(Test::TcpSrc(self.src_port)))
            .and(Pred::test(Test::ip4_dst_host(self.dst_ip)))
            .and(Pred::test(Test::TcpDst(self.dst_port)))
    }
}

impl std::fmt::Display for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}
