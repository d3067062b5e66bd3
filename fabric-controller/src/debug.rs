//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use fabric_utils::mac_addr::MacAddr;
use fabric_utils::{PortId, SwitchId};
use tracing::{debug, debug_span};

use crate::nat::{Flow, Translation};
use crate::nib::HostBinding;
use crate::packet::FrameMeta;
use crate::resolver::PendingResolution;

// Controller debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    // NIB
    HostLearn(&'a HostBinding),
    HostUnlearn(&'a HostBinding),
    HostIpUpdate(&'a MacAddr, &'a Ipv4Addr),
    SwitchUp(SwitchId, &'a BTreeSet<PortId>),
    SwitchDown(SwitchId),
    PortUp(SwitchId, PortId),
    PortDown(SwitchId, PortId),
    PacketDrop(&'a FrameMeta, DropReason),
    // Update scheduler
    PolicyUpdateSchedule(Duration),
    PolicyInstall(usize),
    // Address resolution
    ResolutionRequest(&'a Ipv4Addr),
    ResolutionEnqueue(&'a Ipv4Addr, usize),
    ResolutionRelease(&'a Ipv4Addr, &'a MacAddr, usize),
    ResolutionRetry(&'a Ipv4Addr, u32),
    ResolutionAbandon(&'a PendingResolution),
    // Load balancer
    BackendAssign(&'a Ipv4Addr, &'a Ipv4Addr),
    // NAT
    NatFlowLearn(&'a Flow, &'a Translation),
    NatFlush(usize),
}

// Reason why a packet-in was discarded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DropReason {
    SwitchNotConnected,
    NoSubnet,
    UnsolicitedReply,
    MissingAddress,
    NotTcp,
    NoTranslation,
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::HostLearn(binding) | Debug::HostUnlearn(binding) => {
                debug_span!("nib").in_scope(|| {
                    debug!(
                        mac = %binding.mac,
                        switch = %binding.switch,
                        port = %binding.port,
                        ip = ?binding.ip,
                        learned_at = %binding.learned_at,
                        "{}", self
                    );
                })
            }
            Debug::HostIpUpdate(mac, ip) => {
                debug_span!("nib").in_scope(|| {
                    debug!(%mac, %ip, "{}", self);
                })
            }
            Debug::SwitchUp(switch, ports) => {
                debug_span!("nib").in_scope(|| {
                    debug!(%switch, ?ports, "{}", self);
                })
            }
            Debug::SwitchDown(switch) => {
                debug_span!("nib").in_scope(|| {
                    debug!(%switch, "{}", self);
                })
            }
            Debug::PortUp(switch, port) | Debug::PortDown(switch, port) => {
                debug_span!("nib").in_scope(|| {
                    debug!(%switch, %port, "{}", self);
                })
            }
            Debug::PacketDrop(frame, reason) => {
                debug!(
                    switch = %frame.switch,
                    port = %frame.port,
                    src = %frame.eth_src,
                    dst = %frame.eth_dst,
                    %reason,
                    "{}", self
                );
            }
            Debug::PolicyUpdateSchedule(delay) => {
                debug_span!("scheduler").in_scope(|| {
                    debug!(?delay, "{}", self);
                })
            }
            Debug::PolicyInstall(rules) => {
                debug_span!("scheduler").in_scope(|| {
                    debug!(%rules, "{}", self);
                })
            }
            Debug::ResolutionRequest(target) => {
                debug_span!("resolver").in_scope(|| {
                    debug!(%target, "{}", self);
                })
            }
            Debug::ResolutionEnqueue(target, queued) => {
                debug_span!("resolver").in_scope(|| {
                    debug!(%target, %queued, "{}", self);
                })
            }
            Debug::ResolutionRelease(target, mac, released) => {
                debug_span!("resolver").in_scope(|| {
                    debug!(%target, %mac, %released, "{}", self);
                })
            }
            Debug::ResolutionRetry(target, attempt) => {
                debug_span!("resolver").in_scope(|| {
                    debug!(%target, %attempt, "{}", self);
                })
            }
            Debug::ResolutionAbandon(pending) => {
                debug_span!("resolver").in_scope(|| {
                    debug!(
                        target = %pending.target,
                        retries = %pending.retries,
                        requested_at = %pending.requested_at,
                        dropped = %pending.queue.len(),
                        "{}", self
                    );
                })
            }
            Debug::BackendAssign(client, backend) => {
                debug_span!("load-balancer").in_scope(|| {
                    debug!(%client, %backend, "{}", self);
                })
            }
            Debug::NatFlowLearn(flow, translation) => {
                debug_span!("nat").in_scope(|| {
                    debug!(
                        %flow,
                        public_port = %translation.port,
                        created_at = %translation.created_at,
                        "{}", self
                    );
                })
            }
            Debug::NatFlush(flows) => {
                debug_span!("nat").in_scope(|| {
                    debug!(%flows, "{}", self);
                })
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::HostLearn(..) => {
                write!(f, "host learned")
            }
            Debug::HostUnlearn(..) => {
                write!(f, "host unlearned")
            }
            Debug::HostIpUpdate(..) => {
                write!(f, "host address updated")
            }
            Debug::SwitchUp(..) => {
                write!(f, "switch connected")
            }
            Debug::SwitchDown(..) => {
                write!(f, "switch disconnected")
            }
            Debug::PortUp(..) => {
                write!(f, "port up")
            }
            Debug::PortDown(..) => {
                write!(f, "port down")
            }
            Debug::PacketDrop(..) => {
                write!(f, "dropping packet")
            }
            Debug::PolicyUpdateSchedule(..) => {
                write!(f, "policy update scheduled")
            }
            Debug::PolicyInstall(..) => {
                write!(f, "installing policy")
            }
            Debug::ResolutionRequest(..) => {
                write!(f, "resolution requested")
            }
            Debug::ResolutionEnqueue(..) => {
                write!(f, "packet queued for resolution")
            }
            Debug::ResolutionRelease(..) => {
                write!(f, "resolution satisfied, releasing queued packets")
            }
            Debug::ResolutionRetry(..) => {
                write!(f, "resolution timed out, retrying")
            }
            Debug::ResolutionAbandon(..) => {
                write!(f, "resolution abandoned")
            }
            Debug::BackendAssign(..) => {
                write!(f, "backend assigned")
            }
            Debug::NatFlowLearn(..) => {
                write!(f, "flow translation learned")
            }
            Debug::NatFlush(..) => {
                write!(f, "flow translations removed")
            }
        }
    }
}

// ===== impl DropReason =====

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::SwitchNotConnected => {
                write!(f, "switch not connected")
            }
            DropReason::NoSubnet => {
                write!(f, "no connected subnet")
            }
            DropReason::UnsolicitedReply => {
                write!(f, "unsolicited ARP reply")
            }
            DropReason::MissingAddress => {
                write!(f, "missing protocol address")
            }
            DropReason::NotTcp => {
                write!(f, "not a TCP segment")
            }
            DropReason::NoTranslation => {
                write!(f, "no translation for flow")
            }
        }
    }
}
