//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(clippy::derivable_impls)]

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use fabric_utils::mac_addr::MacAddr;
use fabric_utils::{PortId, SwitchId};
use ipnetwork::Ipv4Network;
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerCfg {
    // Debounce delay between the first NIB change and the policy push.
    pub update_delay_ms: u64,
    pub resolver: ResolverCfg,
    pub topology: TopologyCfg,
    pub router: Option<RouterCfg>,
    pub load_balancer: Option<LoadBalancerCfg>,
    pub nat: Option<NatCfg>,
}

// Address resolution hardening. Both knobs are off by default: a lost reply
// leaves packets queued indefinitely.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverCfg {
    pub timeout_ms: Option<u64>,
    pub max_retries: u32,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopologyCfg {
    pub switches: Vec<SwitchCfg>,
    pub links: Vec<LinkCfg>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchCfg {
    pub id: SwitchId,
    #[serde(default)]
    pub ports: Vec<PortId>,
    #[serde(default)]
    pub vlans: Vec<VlanCfg>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VlanCfg {
    pub port: PortId,
    pub vlan: u16,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkCfg {
    pub switch_a: SwitchId,
    pub port_a: PortId,
    pub switch_b: SwitchId,
    pub port_b: PortId,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterCfg {
    pub switch: SwitchId,
    pub subnets: Vec<SubnetCfg>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubnetCfg {
    pub network: Ipv4Network,
    pub router_port: PortId,
    pub router_mac: MacAddr,
    pub gateway: Ipv4Addr,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadBalancerCfg {
    pub frontend: Ipv4Addr,
    pub backends: Vec<Ipv4Addr>,
}

// Port address translation on a single switch: inside hosts share the
// public address, each TCP flow getting its own public port.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NatCfg {
    pub switch: SwitchId,
    pub outside_port: PortId,
    pub public_ip: Ipv4Addr,
    pub public_mac: MacAddr,
    #[serde(default = "NatCfg::dflt_port_min")]
    pub port_min: u16,
    #[serde(default = "NatCfg::dflt_port_max")]
    pub port_max: u16,
}

// ===== impl ControllerCfg =====

impl ControllerCfg {
    pub const DFLT_UPDATE_DELAY_MS: u64 = 2000;

    pub fn update_delay(&self) -> Duration {
        Duration::from_millis(self.update_delay_ms)
    }

    // Checks the parts of the configuration that don't depend on the
    // topology. Topology checks happen when the graph is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update_delay_ms == 0 {
            return Err(ConfigError::InvalidDelay);
        }
        if let Some(router) = &self.router {
            router.validate()?;
        }
        if let Some(lb) = &self.load_balancer {
            let Some(router) = &self.router else {
                return Err(ConfigError::NoSubnetForAddress(lb.frontend));
            };
            lb.validate(router)?;
        }
        if let Some(nat) = &self.nat {
            nat.validate(self.router.as_ref())?;
        }
        Ok(())
    }
}

impl Default for ControllerCfg {
    fn default() -> ControllerCfg {
        ControllerCfg {
            update_delay_ms: Self::DFLT_UPDATE_DELAY_MS,
            resolver: Default::default(),
            topology: Default::default(),
            router: None,
            load_balancer: None,
            nat: None,
        }
    }
}

// ===== impl ResolverCfg =====

impl ResolverCfg {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

// ===== impl RouterCfg =====

impl RouterCfg {
    fn validate(&self) -> Result<(), ConfigError> {
        for (i, subnet) in self.subnets.iter().enumerate() {
            if !subnet.network.contains(subnet.gateway) {
                return Err(ConfigError::GatewayOutsideSubnet(
                    subnet.gateway,
                    subnet.network,
                ));
            }
            for other in &self.subnets[i + 1..] {
                if subnet.network.overlaps(other.network) {
                    return Err(ConfigError::SubnetOverlap(
                        subnet.network,
                        other.network,
                    ));
                }
            }
        }
        Ok(())
    }

    fn covers(&self, addr: Ipv4Addr) -> bool {
        self.subnets
            .iter()
            .any(|subnet| subnet.network.contains(addr))
    }
}

// ===== impl LoadBalancerCfg =====

impl LoadBalancerCfg {
    fn validate(&self, router: &RouterCfg) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::EmptyBackendPool);
        }
        if !router.covers(self.frontend) {
            return Err(ConfigError::NoSubnetForAddress(self.frontend));
        }
        let mut seen = BTreeSet::new();
        for backend in &self.backends {
            if !seen.insert(*backend) {
                return Err(ConfigError::DuplicateBackend(*backend));
            }
            if !router.covers(*backend) {
                return Err(ConfigError::NoSubnetForAddress(*backend));
            }
        }
        Ok(())
    }
}

// ===== impl NatCfg =====

impl NatCfg {
    pub const DFLT_PORT_MIN: u16 = 50000;
    pub const DFLT_PORT_MAX: u16 = 59999;

    fn dflt_port_min() -> u16 {
        Self::DFLT_PORT_MIN
    }

    fn dflt_port_max() -> u16 {
        Self::DFLT_PORT_MAX
    }

    fn validate(&self, router: Option<&RouterCfg>) -> Result<(), ConfigError> {
        if self.port_min > self.port_max {
            return Err(ConfigError::InvalidPortRange(
                self.port_min,
                self.port_max,
            ));
        }
        if router.is_some_and(|router| router.switch == self.switch) {
            return Err(ConfigError::NatOnRouter(self.switch));
        }
        Ok(())
    }
}
