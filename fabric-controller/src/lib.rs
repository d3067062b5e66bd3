//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]

pub mod config;
pub mod debug;
pub mod error;
pub mod events;
pub mod lb;
pub mod nat;
pub mod nib;
pub mod packet;
pub mod policy;
pub mod resolver;
pub mod scheduler;
pub mod southbound;
pub mod tasks;
#[cfg(feature = "testing")]
pub mod test;
pub mod topology;

use std::net::Ipv4Addr;

use fabric_utils::mac_addr::MacAddr;
use fabric_utils::{PortId, SwitchId, UnboundedReceiver};
use tokio::sync::mpsc;
use tracing::{Instrument, debug_span, info};

use crate::config::ControllerCfg;
use crate::error::Error;
use crate::lb::LoadBalancer;
use crate::nat::Nat;
use crate::nib::{LearnOutcome, Nib, RouterInfo};
use crate::packet::FrameMeta;
use crate::policy::Policy;
use crate::resolver::Resolver;
use crate::scheduler::UpdateScheduler;
use crate::southbound::Southbound;
use crate::tasks::messages::input::{SouthboundEvent, TimerMsg};
use crate::topology::Topology;

// Controller main task state. Every handler runs to completion on this
// single task, so NIB accesses never interleave.
#[derive(Debug)]
pub struct Master<S: Southbound> {
    // Network information base.
    pub nib: Nib,
    // Outstanding address resolutions.
    pub resolver: Resolver,
    // Optional load-balancing layer over the router.
    pub load_balancer: Option<LoadBalancer>,
    // Optional port address translation switch.
    pub nat: Option<Nat>,
    // Policy update debouncing.
    pub scheduler: UpdateScheduler,
    // Southbound runtime.
    pub southbound: S,
    // Timer Rx channel.
    timer_rx: UnboundedReceiver<TimerMsg>,
}

// ===== impl Master =====

impl<S: Southbound> Master<S> {
    pub fn new(
        cfg: &ControllerCfg,
        southbound: S,
    ) -> Result<Master<S>, Error> {
        cfg.validate()?;

        let router_switch = cfg.router.as_ref().map(|router| router.switch);
        let topology = Topology::new(&cfg.topology, router_switch)?;
        let router = cfg
            .router
            .as_ref()
            .map(|router| RouterInfo::new(router, &topology))
            .transpose()?;
        let load_balancer = cfg
            .load_balancer
            .as_ref()
            .map(LoadBalancer::new)
            .transpose()?;
        let nat = cfg
            .nat
            .as_ref()
            .map(|nat| Nat::new(nat, &topology))
            .transpose()?;

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Ok(Master {
            nib: Nib::new(topology, router),
            resolver: Resolver::new(&cfg.resolver, timer_tx.clone()),
            load_balancer,
            nat,
            scheduler: UpdateScheduler::new(cfg.update_delay(), timer_tx),
            southbound,
            timer_rx,
        })
    }

    // Main loop. Returns once the southbound event channel is closed.
    pub async fn run(
        &mut self,
        mut event_rx: UnboundedReceiver<SouthboundEvent>,
    ) {
        let span = debug_span!("controller");
        async {
            info!("controller started");
            loop {
                tokio::select! {
                    event = event_rx.recv() => {
                        match event {
                            Some(event) => self.process_event(event),
                            None => break,
                        }
                    }
                    Some(msg) = self.timer_rx.recv() => {
                        self.process_timer(msg);
                    }
                }
            }
            info!("southbound channel closed, stopping controller");
        }
        .instrument(span)
        .await
    }

    pub fn process_event(&mut self, event: SouthboundEvent) {
        match event {
            SouthboundEvent::SwitchUp { switch, ports } => {
                events::process_switch_up(self, switch, ports);
            }
            SouthboundEvent::SwitchDown { switch } => {
                events::process_switch_down(self, switch);
            }
            SouthboundEvent::PortUp { switch, port } => {
                events::process_port_up(self, switch, port);
            }
            SouthboundEvent::PortDown { switch, port } => {
                events::process_port_down(self, switch, port);
            }
            SouthboundEvent::PacketIn { frame, payload } => {
                events::process_packet_in(self, frame, payload);
            }
        }
        self.scheduler.notify(&self.nib);
    }

    pub fn process_timer(&mut self, msg: TimerMsg) {
        match msg {
            TimerMsg::UpdateTimeout => {
                let load_balancer = self.load_balancer.as_ref();
                let nat = self.nat.as_ref();
                self.scheduler.fire(
                    &mut self.nib,
                    &mut self.southbound,
                    |nib| build_policy(nib, load_balancer, nat),
                );
            }
            TimerMsg::ResolutionTimeout { target, generation } => {
                self.resolver.process_timeout(
                    &self.nib,
                    &mut self.southbound,
                    target,
                    generation,
                );
            }
        }
        self.scheduler.notify(&self.nib);
    }

    pub fn router_switch(&self) -> Option<SwitchId> {
        self.nib.router().map(|router| router.switch)
    }

    pub fn learn(
        &mut self,
        mac: MacAddr,
        switch: SwitchId,
        port: PortId,
        ip: Option<Ipv4Addr>,
    ) -> LearnOutcome {
        let outcome = self.nib.learn(mac, switch, port, ip);
        self.scheduler.notify(&self.nib);
        outcome
    }

    pub fn unlearn(&mut self, mac: &MacAddr) -> bool {
        let removed = self.nib.unlearn(mac).is_some();
        self.scheduler.notify(&self.nib);
        removed
    }

    pub fn port_up(&mut self, switch: SwitchId, port: PortId) {
        self.process_event(SouthboundEvent::PortUp { switch, port });
    }

    pub fn port_down(&mut self, switch: SwitchId, port: PortId) {
        self.process_event(SouthboundEvent::PortDown { switch, port });
    }

    // Feeds an ARP reply to the resolver. Returns false if it didn't answer
    // any outstanding request.
    pub fn record_resolution_reply(&mut self, reply: &FrameMeta) -> bool {
        let released =
            self.resolver
                .process_reply(&mut self.nib, &mut self.southbound, reply);
        self.scheduler.notify(&self.nib);
        released
    }

    pub fn synthesize_policy(&self) -> Policy {
        build_policy(&self.nib, self.load_balancer.as_ref(), self.nat.as_ref())
    }

    pub fn is_dirty(&self) -> bool {
        self.nib.is_dirty()
    }

    pub fn clear_dirty(&mut self) {
        self.nib.clear_dirty();
    }

    // Returns the backend serving `client`, if load balancing is enabled.
    pub fn allocate_backend(&mut self, client: Ipv4Addr) -> Option<Ipv4Addr> {
        let lb = self.load_balancer.as_mut()?;
        let backend = lb.allocate_backend(&mut self.nib, client);
        self.scheduler.notify(&self.nib);
        Some(backend)
    }
}

// ===== global functions =====

// Synthesized policy, decorated with the load-balancing and NAT rules if
// enabled.
pub fn build_policy(
    nib: &Nib,
    load_balancer: Option<&LoadBalancer>,
    nat: Option<&Nat>,
) -> Policy {
    let mut policy = policy::synthesize(nib);
    if let Some(load_balancer) = load_balancer {
        load_balancer.decorate(nib, &mut policy);
    }
    if let Some(nat) = nat {
        nat.decorate(&mut policy);
    }
    policy
}
