//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Network Information Base.
//!
//! Authoritative controller state: learned host bindings, live ports of the
//! connected switches and the static router configuration. Every mutation
//! that can affect the synthesized policy raises the dirty flag, which is
//! only cleared once a regenerated policy was pushed successfully.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use fabric_utils::mac_addr::MacAddr;
use fabric_utils::{PortId, SwitchId};

use crate::config::{RouterCfg, SubnetCfg};
use crate::debug::Debug;
use crate::error::{ConfigError, Error, LookupError};
use crate::policy::Action;
use crate::topology::Topology;

#[derive(Debug)]
pub struct Nib {
    topology: Topology,
    router: Option<RouterInfo>,
    hosts: BTreeMap<MacAddr, HostBinding>,
    // IP address -> MAC address of the owning binding.
    addresses: BTreeMap<Ipv4Addr, MacAddr>,
    // Live ports of every connected switch.
    live_ports: BTreeMap<SwitchId, BTreeSet<PortId>>,
    dirty: bool,
}

#[derive(Clone, Debug)]
pub struct HostBinding {
    pub mac: MacAddr,
    pub switch: SwitchId,
    pub port: PortId,
    pub ip: Option<Ipv4Addr>,
    // Port leading to this host from every switch reachable over the
    // spanning tree.
    pub next_hops: BTreeMap<SwitchId, PortId>,
    pub learned_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LearnOutcome {
    Created,
    IpUpdated,
    Unchanged,
    Rejected,
}

#[derive(Clone, Debug)]
pub struct RouterInfo {
    pub switch: SwitchId,
    pub subnets: Vec<Subnet>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subnet {
    pub network: ipnetwork::Ipv4Network,
    pub router_port: PortId,
    pub router_mac: MacAddr,
    pub gateway: Ipv4Addr,
}

// ===== impl Nib =====

impl Nib {
    pub fn new(topology: Topology, router: Option<RouterInfo>) -> Nib {
        Nib {
            topology,
            router,
            hosts: Default::default(),
            addresses: Default::default(),
            live_ports: Default::default(),
            dirty: false,
        }
    }

    // Records the location of `mac`. The first observer of a MAC wins: later
    // calls only update the IP address of the existing binding.
    pub fn learn(
        &mut self,
        mac: MacAddr,
        switch: SwitchId,
        port: PortId,
        ip: Option<Ipv4Addr>,
    ) -> LearnOutcome {
        if !self.topology.contains(switch) {
            LookupError::UnknownSwitch(switch).log();
            return LearnOutcome::Rejected;
        }

        // Reject addresses already claimed by a different host.
        let ip = ip.filter(|ip| match self.addresses.get(ip) {
            Some(bound) if *bound != mac => {
                Error::DuplicateBinding {
                    ip: *ip,
                    bound: *bound,
                    claimant: mac,
                }
                .log();
                false
            }
            _ => true,
        });

        if let Some(binding) = self.hosts.get_mut(&mac) {
            let Some(ip) = ip else {
                return LearnOutcome::Unchanged;
            };
            if binding.ip == Some(ip) {
                return LearnOutcome::Unchanged;
            }
            if let Some(old) = binding.ip.replace(ip) {
                self.addresses.remove(&old);
            }
            self.addresses.insert(ip, mac);
            Debug::HostIpUpdate(&mac, &ip).log();
            self.dirty = true;
            return LearnOutcome::IpUpdated;
        }

        let binding = HostBinding {
            mac,
            switch,
            port,
            ip,
            next_hops: self.topology.next_hops(switch, port),
            learned_at: Utc::now(),
        };
        Debug::HostLearn(&binding).log();
        if let Some(ip) = ip {
            self.addresses.insert(ip, mac);
        }
        self.hosts.insert(mac, binding);
        self.dirty = true;
        LearnOutcome::Created
    }

    // Removes the binding of `mac`, if any.
    pub fn unlearn(&mut self, mac: &MacAddr) -> Option<HostBinding> {
        let binding = self.hosts.remove(mac)?;
        if let Some(ip) = binding.ip
            && self.addresses.get(&ip) == Some(mac)
        {
            self.addresses.remove(&ip);
        }
        Debug::HostUnlearn(&binding).log();
        self.dirty = true;
        Some(binding)
    }

    pub fn port_up(&mut self, switch: SwitchId, port: PortId) {
        if !self.topology.contains(switch) {
            LookupError::UnknownSwitch(switch).log();
            return;
        }
        Debug::PortUp(switch, port).log();
        self.unlearn_at(switch, port);
        self.live_ports.entry(switch).or_default().insert(port);
        self.dirty = true;
    }

    pub fn port_down(&mut self, switch: SwitchId, port: PortId) {
        if !self.topology.contains(switch) {
            LookupError::UnknownSwitch(switch).log();
            return;
        }
        Debug::PortDown(switch, port).log();
        self.unlearn_at(switch, port);
        if let Some(ports) = self.live_ports.get_mut(&switch) {
            ports.remove(&port);
        }
        self.dirty = true;
    }

    // A switch (re)connected: hosts seen on it before can't be trusted
    // anymore.
    pub fn switch_up(&mut self, switch: SwitchId, ports: BTreeSet<PortId>) {
        if !self.topology.contains(switch) {
            LookupError::UnknownSwitch(switch).log();
            return;
        }
        Debug::SwitchUp(switch, &ports).log();
        self.unlearn_switch(switch);
        self.live_ports.insert(switch, ports);
        self.dirty = true;
    }

    pub fn switch_down(&mut self, switch: SwitchId) {
        if !self.topology.contains(switch) {
            LookupError::UnknownSwitch(switch).log();
            return;
        }
        Debug::SwitchDown(switch).log();
        self.live_ports.remove(&switch);
        self.unlearn_switch(switch);
        self.dirty = true;
    }

    // Several hosts may sit behind one port (hubs, the router port).
    fn unlearn_at(&mut self, switch: SwitchId, port: PortId) {
        let macs = self
            .bindings_at(switch, port)
            .map(|binding| binding.mac)
            .collect::<Vec<_>>();
        for mac in macs {
            self.unlearn(&mac);
        }
    }

    fn unlearn_switch(&mut self, switch: SwitchId) {
        let macs = self
            .bindings_on_switch(switch)
            .map(|binding| binding.mac)
            .collect::<Vec<_>>();
        for mac in macs {
            self.unlearn(&mac);
        }
    }

    pub fn binding(&self, mac: &MacAddr) -> Option<&HostBinding> {
        self.hosts.get(mac)
    }

    pub fn bindings_at(
        &self,
        switch: SwitchId,
        port: PortId,
    ) -> impl Iterator<Item = &HostBinding> {
        self.hosts.values().filter(move |binding| {
            binding.switch == switch && binding.port == port
        })
    }

    pub fn bindings_on_switch(
        &self,
        switch: SwitchId,
    ) -> impl Iterator<Item = &HostBinding> {
        self.hosts
            .values()
            .filter(move |binding| binding.switch == switch)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &HostBinding> {
        self.hosts.values()
    }

    pub fn macs(&self) -> impl Iterator<Item = &MacAddr> {
        self.hosts.keys()
    }

    pub fn mac_for_ip(&self, ip: &Ipv4Addr) -> Option<MacAddr> {
        self.addresses.get(ip).copied()
    }

    pub fn is_connected(&self, switch: SwitchId) -> bool {
        self.live_ports.contains_key(&switch)
    }

    pub fn live_ports(&self, switch: SwitchId) -> BTreeSet<PortId> {
        self.live_ports.get(&switch).cloned().unwrap_or_default()
    }

    // Live ports not pruned by the spanning tree.
    pub fn enabled_ports(&self, switch: SwitchId) -> BTreeSet<PortId> {
        let (Some(live), Some(topo)) =
            (self.live_ports.get(&switch), self.topology.switch(switch))
        else {
            return Default::default();
        };
        live.difference(&topo.blocked_ports).copied().collect()
    }

    // Ports a broadcast received on `in_port` is sent out of.
    pub fn flood_ports(
        &self,
        switch: SwitchId,
        in_port: PortId,
    ) -> BTreeSet<PortId> {
        let Some(topo) = self.topology.switch(switch) else {
            return Default::default();
        };
        self.enabled_ports(switch)
            .into_iter()
            .filter(|port| *port != in_port)
            .filter(|port| topo.same_broadcast_domain(in_port, *port))
            .collect()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn router(&self) -> Option<&RouterInfo> {
        self.router.as_ref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

// ===== impl RouterInfo =====

impl RouterInfo {
    pub fn new(
        cfg: &RouterCfg,
        topology: &Topology,
    ) -> Result<RouterInfo, ConfigError> {
        let switch = topology
            .switch(cfg.switch)
            .ok_or(ConfigError::UnknownRouter(cfg.switch))?;
        let subnets = cfg
            .subnets
            .iter()
            .map(|subnet| {
                if !switch.ports.contains(&subnet.router_port) {
                    return Err(ConfigError::RouterPortUnknown(
                        cfg.switch,
                        subnet.router_port,
                    ));
                }
                Ok(Subnet::from(subnet))
            })
            .collect::<Result<_, _>>()?;

        Ok(RouterInfo {
            switch: cfg.switch,
            subnets,
        })
    }

    // Connected subnet containing `addr`.
    pub fn subnet_for(&self, addr: Ipv4Addr) -> Option<&Subnet> {
        self.subnets
            .iter()
            .find(|subnet| subnet.network.contains(addr))
    }

    pub fn is_gateway(&self, addr: Ipv4Addr) -> bool {
        self.subnets.iter().any(|subnet| subnet.gateway == addr)
    }
}

// ===== impl Subnet =====

impl Subnet {
    // Actions delivering a routed frame to `mac` on this subnet.
    pub fn rewrite_actions(&self, mac: MacAddr) -> Vec<Action> {
        vec![
            Action::SetEthSrc(self.router_mac),
            Action::SetEthDst(mac),
            Action::Output(self.router_port),
        ]
    }
}

impl From<&SubnetCfg> for Subnet {
    fn from(cfg: &SubnetCfg) -> Subnet {
        Subnet {
            network: cfg.network,
            router_port: cfg.router_port,
            router_mac: cfg.router_mac,
            gateway: cfg.gateway,
        }
    }
}
