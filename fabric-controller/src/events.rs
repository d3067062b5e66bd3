//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use bytes::Bytes;
use fabric_utils::{PortId, SwitchId};

use crate::Master;
use crate::debug::{Debug, DropReason};
use crate::error::LookupError;
use crate::packet::{ArpOp, ArpPacket, FrameMeta, Payload};
use crate::policy::Action;
use crate::resolver::WaitingPacket;
use crate::southbound::{self, Southbound};

// ===== switch and port events =====

pub(crate) fn process_switch_up<S: Southbound>(
    master: &mut Master<S>,
    switch: SwitchId,
    ports: BTreeSet<PortId>,
) {
    master.nib.switch_up(switch, ports);
    if let Some(nat) = &mut master.nat
        && nat.switch == switch
    {
        nat.reset(&mut master.nib);
    }

    // Resolve the backends as soon as the router is reachable.
    if master.router_switch() == Some(switch)
        && let Some(lb) = &master.load_balancer
    {
        lb.resolve_backends(
            &master.nib,
            &mut master.resolver,
            &mut master.southbound,
        );
    }
}

pub(crate) fn process_switch_down<S: Southbound>(
    master: &mut Master<S>,
    switch: SwitchId,
) {
    master.nib.switch_down(switch);
    if let Some(nat) = &mut master.nat
        && nat.switch == switch
    {
        nat.reset(&mut master.nib);
    }
}

pub(crate) fn process_port_up<S: Southbound>(
    master: &mut Master<S>,
    switch: SwitchId,
    port: PortId,
) {
    master.nib.port_up(switch, port);
    if let Some(nat) = &mut master.nat
        && nat.switch == switch
    {
        nat.forget_port(&mut master.nib, port);
    }
}

pub(crate) fn process_port_down<S: Southbound>(
    master: &mut Master<S>,
    switch: SwitchId,
    port: PortId,
) {
    master.nib.port_down(switch, port);
    if let Some(nat) = &mut master.nat
        && nat.switch == switch
    {
        nat.forget_port(&mut master.nib, port);
    }
}

// ===== packet-in =====

pub(crate) fn process_packet_in<S: Southbound>(
    master: &mut Master<S>,
    frame: FrameMeta,
    payload: Bytes,
) {
    if !master.nib.is_connected(frame.switch) {
        Debug::PacketDrop(&frame, DropReason::SwitchNotConnected).log();
        return;
    }

    if let Some(nat) = &mut master.nat
        && nat.switch == frame.switch
    {
        nat.process_packet(
            &mut master.nib,
            &mut master.southbound,
            &frame,
            payload,
        );
    } else if master.router_switch() == Some(frame.switch) {
        process_router_packet(master, &frame, payload);
    } else {
        process_l2_packet(master, &frame, payload);
    }
}

// Learning switch behavior.
fn process_l2_packet<S: Southbound>(
    master: &mut Master<S>,
    frame: &FrameMeta,
    payload: Bytes,
) {
    let nib = &mut master.nib;
    let Some(topo) = nib.topology().switch(frame.switch) else {
        LookupError::UnknownSwitch(frame.switch).log();
        return;
    };

    // Hosts are only learned where they attach, never on inter-switch
    // links.
    if !topo.is_link_port(frame.port) && !frame.eth_src.is_multicast() {
        let ip = frame.learnable_ip();
        nib.learn(frame.eth_src, frame.switch, frame.port, ip);
    }

    let next_hop = nib
        .binding(&frame.eth_dst)
        .and_then(|binding| binding.next_hops.get(&frame.switch).copied());
    let actions = match next_hop {
        Some(port) if port != frame.port => vec![Action::Output(port)],
        // Destination behind the ingress port.
        Some(_) => return,
        None => {
            let ports = nib.flood_ports(frame.switch, frame.port);
            if ports.is_empty() {
                return;
            }
            vec![Action::Flood(ports)]
        }
    };

    southbound::send_packet(
        &mut master.southbound,
        frame.switch,
        Payload::Frame(payload),
        actions,
    );
}

// Router behavior, with the load balancer taking the first look.
fn process_router_packet<S: Southbound>(
    master: &mut Master<S>,
    frame: &FrameMeta,
    payload: Bytes,
) {
    if frame.is_arp() {
        match frame.arp_op {
            Some(ArpOp::Request) => process_arp_request(master, frame),
            Some(ArpOp::Reply) => {
                if !master.resolver.process_reply(
                    &mut master.nib,
                    &mut master.southbound,
                    frame,
                ) {
                    Debug::PacketDrop(frame, DropReason::UnsolicitedReply)
                        .log();
                }
            }
            None => {
                Debug::PacketDrop(frame, DropReason::MissingAddress).log();
            }
        }
        return;
    }

    if !frame.is_ipv4() {
        return;
    }

    if let Some(lb) = &mut master.load_balancer
        && lb.process_packet(
            &mut master.nib,
            &mut master.resolver,
            &mut master.southbound,
            frame,
            &payload,
        )
    {
        return;
    }

    let Some(dst) = frame.ip4_dst else {
        Debug::PacketDrop(frame, DropReason::MissingAddress).log();
        return;
    };
    route(master, frame, payload, dst);
}

// Answers ARP requests for the gateway addresses. Other requests are
// ignored.
fn process_arp_request<S: Southbound>(
    master: &mut Master<S>,
    frame: &FrameMeta,
) {
    let Some(router) = master.nib.router() else {
        return;
    };
    let Some(subnet) = frame
        .ip4_dst
        .and_then(|target| router.subnet_for(target))
        .filter(|subnet| frame.ip4_dst == Some(subnet.gateway))
    else {
        return;
    };
    let Some(packet) = ArpPacket::reply_to(frame, subnet.router_mac) else {
        return;
    };

    let payload = Payload::Arp {
        eth_src: subnet.router_mac,
        eth_dst: frame.eth_src,
        packet,
    };
    southbound::send_packet(
        &mut master.southbound,
        frame.switch,
        payload,
        vec![Action::Output(frame.port)],
    );
}

// Forwards a routed packet, or queues it until its destination is resolved.
// The installed policy does the same once the next update is pushed.
fn route<S: Southbound>(
    master: &mut Master<S>,
    frame: &FrameMeta,
    payload: Bytes,
    dst: Ipv4Addr,
) {
    let Some(router) = master.nib.router() else {
        return;
    };
    let Some(subnet) = router.subnet_for(dst) else {
        LookupError::NoSubnet(dst).log();
        Debug::PacketDrop(frame, DropReason::NoSubnet).log();
        return;
    };

    match master.nib.mac_for_ip(&dst) {
        Some(mac) => {
            southbound::send_packet(
                &mut master.southbound,
                frame.switch,
                Payload::Frame(payload),
                subnet.rewrite_actions(mac),
            );
        }
        None => {
            let packet = WaitingPacket {
                switch: frame.switch,
                port: frame.port,
                payload: Payload::Frame(payload),
                rewrite: vec![],
            };
            master.resolver.enqueue(
                &master.nib,
                &mut master.southbound,
                dst,
                packet,
            );
        }
    }
}
