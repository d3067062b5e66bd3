//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Sticky round-robin load balancing layered on top of the router.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use bytes::Bytes;

use crate::config::LoadBalancerCfg;
use crate::debug::Debug;
use crate::error::{ConfigError, LookupError};
use crate::nib::Nib;
use crate::packet::{ETHTYPE_IPV4, FrameMeta, Payload};
use crate::policy::{Action, Policy, Pred, Rule, Test};
use crate::resolver::{Resolver, WaitingPacket};
use crate::southbound::{self, Southbound};

// Assigns clients to a fixed, ordered backend pool. The i-th distinct client
// gets backend `i mod pool size`, and keeps it forever.
#[derive(Clone, Debug)]
pub struct BackendAllocator<C, B> {
    backends: Vec<B>,
    assignments: BTreeMap<C, B>,
    next: usize,
}

#[derive(Debug)]
pub struct LoadBalancer {
    pub frontend: Ipv4Addr,
    allocator: BackendAllocator<Ipv4Addr, Ipv4Addr>,
}

// ===== impl BackendAllocator =====

impl<C, B> BackendAllocator<C, B>
where
    C: Ord + Clone,
    B: Clone,
{
    pub fn new(
        backends: Vec<B>,
    ) -> Result<BackendAllocator<C, B>, ConfigError> {
        if backends.is_empty() {
            return Err(ConfigError::EmptyBackendPool);
        }
        Ok(BackendAllocator {
            backends,
            assignments: Default::default(),
            next: 0,
        })
    }

    // Returns the backend of `client`, assigning the next one in the pool if
    // the client is new. The flag tells whether an assignment was made.
    pub fn allocate(&mut self, client: &C) -> (B, bool) {
        if let Some(backend) = self.assignments.get(client) {
            return (backend.clone(), false);
        }
        let backend = self.backends[self.next].clone();
        self.next = (self.next + 1) % self.backends.len();
        self.assignments.insert(client.clone(), backend.clone());
        (backend, true)
    }

    pub fn get(&self, client: &C) -> Option<&B> {
        self.assignments.get(client)
    }

    pub fn assignments(&self) -> impl Iterator<Item = (&C, &B)> {
        self.assignments.iter()
    }

    pub fn backends(&self) -> &[B] {
        &self.backends
    }
}

// ===== impl LoadBalancer =====

impl LoadBalancer {
    pub fn new(cfg: &LoadBalancerCfg) -> Result<LoadBalancer, ConfigError> {
        Ok(LoadBalancer {
            frontend: cfg.frontend,
            allocator: BackendAllocator::new(cfg.backends.clone())?,
        })
    }

    pub fn allocate_backend(
        &mut self,
        nib: &mut Nib,
        client: Ipv4Addr,
    ) -> Ipv4Addr {
        let (backend, new) = self.allocator.allocate(&client);
        if new {
            Debug::BackendAssign(&client, &backend).log();
            nib.set_dirty();
        }
        backend
    }

    pub fn is_backend(&self, addr: &Ipv4Addr) -> bool {
        self.allocator.backends().contains(addr)
    }

    pub fn backends(&self) -> &[Ipv4Addr] {
        self.allocator.backends()
    }

    // Asks for the MAC address of every backend ahead of the first request.
    pub fn resolve_backends(
        &self,
        nib: &Nib,
        resolver: &mut Resolver,
        southbound: &mut impl Southbound,
    ) {
        for backend in self.allocator.backends() {
            if nib.mac_for_ip(backend).is_none() {
                resolver.request(nib, southbound, *backend);
            }
        }
    }

    // Handles IPv4 frames to the front-end or from a backend. Returns false
    // for anything else, which is left to the router.
    pub fn process_packet(
        &mut self,
        nib: &mut Nib,
        resolver: &mut Resolver,
        southbound: &mut impl Southbound,
        frame: &FrameMeta,
        payload: &Bytes,
    ) -> bool {
        if !frame.is_ipv4() {
            return false;
        }
        let (Some(src), Some(dst)) = (frame.ip4_src, frame.ip4_dst) else {
            return false;
        };

        if dst == self.frontend {
            let backend = self.allocate_backend(nib, src);
            let rewrite = vec![Action::SetIp4Dst(backend)];
            deliver(
                nib, resolver, southbound, frame, payload, backend, rewrite,
            );
            return true;
        }
        if self.is_backend(&src) {
            let rewrite = vec![Action::SetIp4Src(self.frontend)];
            deliver(nib, resolver, southbound, frame, payload, dst, rewrite);
            return true;
        }
        false
    }

    // Puts the load-balancing rules in front of the router rules.
    pub fn decorate(&self, nib: &Nib, policy: &mut Policy) {
        let Some(router) = nib.router() else {
            return;
        };
        let Some(switch_policy) = policy.get_mut(router.switch) else {
            return;
        };

        let ipv4 = || Pred::test(Test::EthType(ETHTYPE_IPV4));
        let deliver_actions = |addr: Ipv4Addr, mut rewrite: Vec<Action>| {
            let mac = nib.mac_for_ip(&addr);
            let subnet = router.subnet_for(addr);
            match (mac, subnet) {
                (Some(mac), Some(subnet)) => {
                    rewrite.extend(subnet.rewrite_actions(mac));
                    rewrite
                }
                _ => vec![Action::Escalate],
            }
        };

        let mut rules = vec![];
        for (client, backend) in self.allocator.assignments() {
            // Request path.
            rules.push(Rule::new(
                ipv4()
                    .and(Pred::test(Test::ip4_src_host(*client)))
                    .and(Pred::test(Test::ip4_dst_host(self.frontend))),
                deliver_actions(*backend, vec![Action::SetIp4Dst(*backend)]),
            ));
            // Response path.
            rules.push(Rule::new(
                ipv4()
                    .and(Pred::test(Test::ip4_src_host(*backend)))
                    .and(Pred::test(Test::ip4_dst_host(*client))),
                deliver_actions(
                    *client,
                    vec![Action::SetIp4Src(self.frontend)],
                ),
            ));
        }

        // Unassigned clients and other backend traffic.
        let backends = self.allocator.backends().iter().copied();
        rules.push(Rule::new(
            ipv4().and(
                Pred::test(Test::ip4_dst_host(self.frontend))
                    .or(Pred::any_of(backends.map(Test::ip4_src_host))),
            ),
            vec![Action::Escalate],
        ));

        switch_policy.rules.splice(0..0, rules);
    }
}

// ===== helper functions =====

// Forwards a rewritten frame to `addr`, going through address resolution if
// its MAC address is unknown.
fn deliver(
    nib: &Nib,
    resolver: &mut Resolver,
    southbound: &mut impl Southbound,
    frame: &FrameMeta,
    payload: &Bytes,
    addr: Ipv4Addr,
    mut rewrite: Vec<Action>,
) {
    let payload = Payload::Frame(payload.clone());
    match nib.mac_for_ip(&addr) {
        Some(mac) => {
            let Some(subnet) = nib.router().and_then(|r| r.subnet_for(addr))
            else {
                LookupError::NoSubnet(addr).log();
                return;
            };
            rewrite.extend(subnet.rewrite_actions(mac));
            southbound::send_packet(southbound, frame.switch, payload, rewrite);
        }
        None => {
            let packet = WaitingPacket {
                switch: frame.switch,
                port: frame.port,
                payload,
                rewrite,
            };
            resolver.enqueue(nib, southbound, addr, packet);
        }
    }
}
