//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Frame metadata exchanged with the packet codec.
//!
//! The controller never parses or builds wire-format frames itself. Inbound
//! frames arrive already decoded into [`FrameMeta`], and outbound frames are
//! described by [`Payload`], which the southbound runtime encodes.

use std::net::Ipv4Addr;

use bytes::Bytes;
use fabric_utils::mac_addr::MacAddr;
use fabric_utils::{PortId, SwitchId};
use serde::{Deserialize, Serialize};

pub const ETHTYPE_IPV4: u16 = 0x0800;
pub const ETHTYPE_ARP: u16 = 0x0806;
pub const IPPROTO_TCP: u8 = 6;

// Decoded header fields of a frame received by a switch.
//
// For ARP frames, `ip4_src` and `ip4_dst` carry the sender and target
// protocol addresses.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct FrameMeta {
    pub switch: SwitchId,
    pub port: PortId,
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub eth_type: u16,
    pub vlan: Option<u16>,
    pub ip4_src: Option<Ipv4Addr>,
    pub ip4_dst: Option<Ipv4Addr>,
    pub ip_proto: Option<u8>,
    pub tcp_src: Option<u16>,
    pub tcp_dst: Option<u16>,
    pub arp_op: Option<ArpOp>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArpOp {
    Request,
    Reply,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ArpPacket {
    pub op: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

// Frame handed to the southbound runtime for transmission.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Payload {
    // Buffered frame, as received in a packet-in.
    Frame(Bytes),
    // Frame originated by the controller; built by the packet codec.
    Arp {
        eth_src: MacAddr,
        eth_dst: MacAddr,
        packet: ArpPacket,
    },
}

// ===== impl FrameMeta =====

impl FrameMeta {
    pub fn new(
        switch: SwitchId,
        port: PortId,
        eth_src: MacAddr,
        eth_dst: MacAddr,
    ) -> FrameMeta {
        FrameMeta {
            switch,
            port,
            eth_src,
            eth_dst,
            ..Default::default()
        }
    }

    pub fn with_ipv4(mut self, src: Ipv4Addr, dst: Ipv4Addr) -> FrameMeta {
        self.eth_type = ETHTYPE_IPV4;
        self.ip4_src = Some(src);
        self.ip4_dst = Some(dst);
        self
    }

    pub fn with_tcp(mut self, src: u16, dst: u16) -> FrameMeta {
        self.ip_proto = Some(IPPROTO_TCP);
        self.tcp_src = Some(src);
        self.tcp_dst = Some(dst);
        self
    }

    pub fn with_arp(
        mut self,
        op: ArpOp,
        sender_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
    ) -> FrameMeta {
        self.eth_type = ETHTYPE_ARP;
        self.arp_op = Some(op);
        self.ip4_src = Some(sender_ip);
        self.ip4_dst = Some(target_ip);
        self
    }

    pub fn with_vlan(mut self, vlan: u16) -> FrameMeta {
        self.vlan = Some(vlan);
        self
    }

    pub fn is_ipv4(&self) -> bool {
        self.eth_type == ETHTYPE_IPV4
    }

    pub fn is_arp(&self) -> bool {
        self.eth_type == ETHTYPE_ARP
    }

    pub fn is_tcp(&self) -> bool {
        self.is_ipv4() && self.ip_proto == Some(IPPROTO_TCP)
    }

    // Source protocol address worth recording for this frame, if any.
    pub fn learnable_ip(&self) -> Option<Ipv4Addr> {
        if self.is_ipv4() || self.is_arp() {
            self.ip4_src
        } else {
            None
        }
    }
}

// ===== impl ArpPacket =====

impl ArpPacket {
    pub fn request(
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
    ) -> ArpPacket {
        ArpPacket {
            op: ArpOp::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    // Reply to `request`, answering on behalf of `mac`.
    pub fn reply_to(request: &FrameMeta, mac: MacAddr) -> Option<ArpPacket> {
        Some(ArpPacket {
            op: ArpOp::Reply,
            sender_mac: mac,
            sender_ip: request.ip4_dst?,
            target_mac: request.eth_src,
            target_ip: request.ip4_src?,
        })
    }
}

// ===== impl Payload =====

impl Payload {
    // Broadcast ARP request for `target_ip`.
    pub fn arp_request(
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
    ) -> Payload {
        Payload::Arp {
            eth_src: sender_mac,
            eth_dst: MacAddr::BROADCAST,
            packet: ArpPacket::request(sender_mac, sender_ip, target_ip),
        }
    }
}
