//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Address resolution for routed traffic.
//!
//! Each target address is either unknown (no entry), pending (an entry with
//! a queue of packets waiting for the answer) or known (folded into the
//! NIB). Queued packets are released in enqueue order when the reply
//! arrives.

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fabric_utils::task::TimeoutTask;
use fabric_utils::{PortId, SwitchId, UnboundedSender};

use crate::config::ResolverCfg;
use crate::debug::Debug;
use crate::error::LookupError;
use crate::nib::{Nib, RouterInfo, Subnet};
use crate::packet::{FrameMeta, Payload};
use crate::policy::Action;
use crate::southbound::{self, Southbound};
use crate::tasks;
use crate::tasks::messages::input::TimerMsg;

#[derive(Debug)]
pub struct Resolver {
    pending: BTreeMap<Ipv4Addr, PendingResolution>,
    timeout: Option<Duration>,
    max_retries: u32,
    // Identifies the entry a timeout was armed for.
    next_generation: u64,
    timer_tx: UnboundedSender<TimerMsg>,
}

#[derive(Debug)]
pub struct PendingResolution {
    pub target: Ipv4Addr,
    pub queue: VecDeque<WaitingPacket>,
    pub retries: u32,
    pub requested_at: DateTime<Utc>,
    pub generation: u64,
    timeout_task: Option<TimeoutTask>,
}

// Packet held until the MAC address of its destination is known.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WaitingPacket {
    pub switch: SwitchId,
    pub port: PortId,
    pub payload: Payload,
    // Actions applied before the final Ethernet rewrite.
    pub rewrite: Vec<Action>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {
    // A request was sent for a previously unknown target.
    Requested,
    // Appended to an outstanding request.
    Queued,
    // No connected subnet for the target.
    Dropped,
}

// ===== impl Resolver =====

impl Resolver {
    pub fn new(
        cfg: &ResolverCfg,
        timer_tx: UnboundedSender<TimerMsg>,
    ) -> Resolver {
        Resolver {
            pending: Default::default(),
            timeout: cfg.timeout(),
            max_retries: cfg.max_retries,
            next_generation: 0,
            timer_tx,
        }
    }

    // Queues `packet` until `target` is resolved, requesting the resolution
    // if none is outstanding.
    pub fn enqueue(
        &mut self,
        nib: &Nib,
        southbound: &mut impl Southbound,
        target: Ipv4Addr,
        packet: WaitingPacket,
    ) -> EnqueueOutcome {
        if let Some(pending) = self.pending.get_mut(&target) {
            pending.queue.push_back(packet);
            Debug::ResolutionEnqueue(&target, pending.queue.len()).log();
            return EnqueueOutcome::Queued;
        }

        if !self.start(nib, southbound, target) {
            return EnqueueOutcome::Dropped;
        }
        if let Some(pending) = self.pending.get_mut(&target) {
            pending.queue.push_back(packet);
            Debug::ResolutionEnqueue(&target, pending.queue.len()).log();
        }
        EnqueueOutcome::Requested
    }

    // Requests the resolution of `target` without queuing anything. Returns
    // false if no request could be issued.
    pub fn request(
        &mut self,
        nib: &Nib,
        southbound: &mut impl Southbound,
        target: Ipv4Addr,
    ) -> bool {
        if self.pending.contains_key(&target) {
            return true;
        }
        self.start(nib, southbound, target)
    }

    fn start(
        &mut self,
        nib: &Nib,
        southbound: &mut impl Southbound,
        target: Ipv4Addr,
    ) -> bool {
        let Some((router, subnet)) = connected_subnet(nib, target) else {
            LookupError::NoSubnet(target).log();
            return false;
        };

        send_request(southbound, router, subnet, target);
        let generation = self.next_generation;
        self.next_generation += 1;
        let timeout_task = self.timeout.map(|timeout| {
            tasks::resolution_timeout(
                target,
                generation,
                timeout,
                &self.timer_tx,
            )
        });
        self.pending.insert(
            target,
            PendingResolution {
                target,
                queue: Default::default(),
                retries: 0,
                requested_at: Utc::now(),
                generation,
                timeout_task,
            },
        );
        true
    }

    // Processes an ARP reply received by the router. Returns false if the
    // reply doesn't answer an outstanding request.
    pub fn process_reply(
        &mut self,
        nib: &mut Nib,
        southbound: &mut impl Southbound,
        reply: &FrameMeta,
    ) -> bool {
        let Some(target) = reply.ip4_src else {
            return false;
        };
        let Some(pending) = self.pending.remove(&target) else {
            return false;
        };

        // Record the answer. A MAC that is already bound somewhere else only
        // gets its address updated.
        nib.learn(reply.eth_src, reply.switch, reply.port, Some(target));
        let mac = nib.mac_for_ip(&target).unwrap_or(reply.eth_src);
        let Some((_, subnet)) = connected_subnet(nib, target) else {
            LookupError::NoSubnet(target).log();
            return true;
        };

        Debug::ResolutionRelease(&target, &mac, pending.queue.len()).log();
        for packet in pending.queue {
            let mut actions = packet.rewrite;
            actions.extend(subnet.rewrite_actions(mac));
            southbound::send_packet(
                southbound,
                packet.switch,
                packet.payload,
                actions,
            );
        }
        true
    }

    // Retries an unanswered request, or gives up on it once the retry budget
    // is exhausted. Timeouts armed for an earlier entry of the same target
    // are ignored.
    pub fn process_timeout(
        &mut self,
        nib: &Nib,
        southbound: &mut impl Southbound,
        target: Ipv4Addr,
        generation: u64,
    ) {
        let Some(pending) = self.pending.get_mut(&target) else {
            return;
        };
        if pending.generation != generation {
            return;
        }

        if pending.retries < self.max_retries {
            pending.retries += 1;
            Debug::ResolutionRetry(&target, pending.retries).log();
            if let Some((router, subnet)) = connected_subnet(nib, target) {
                send_request(southbound, router, subnet, target);
            }
            pending.timeout_task = self.timeout.map(|timeout| {
                tasks::resolution_timeout(
                    target,
                    generation,
                    timeout,
                    &self.timer_tx,
                )
            });
            return;
        }

        if let Some(pending) = self.pending.remove(&target) {
            Debug::ResolutionAbandon(&pending).log();
        }
    }

    pub fn is_pending(&self, target: &Ipv4Addr) -> bool {
        self.pending.contains_key(target)
    }

    pub fn pending(&self, target: &Ipv4Addr) -> Option<&PendingResolution> {
        self.pending.get(target)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// ===== helper functions =====

fn connected_subnet(
    nib: &Nib,
    target: Ipv4Addr,
) -> Option<(&RouterInfo, &Subnet)> {
    let router = nib.router()?;
    let subnet = router.subnet_for(target)?;
    Some((router, subnet))
}

fn send_request(
    southbound: &mut impl Southbound,
    router: &RouterInfo,
    subnet: &Subnet,
    target: Ipv4Addr,
) {
    Debug::ResolutionRequest(&target).log();
    let payload =
        Payload::arp_request(subnet.router_mac, subnet.gateway, target);
    southbound::send_packet(
        southbound,
        router.switch,
        payload,
        vec![Action::Output(subnet.router_port)],
    );
}
