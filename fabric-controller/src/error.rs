//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use fabric_utils::mac_addr::MacAddr;
use fabric_utils::{PortId, SwitchId};
use ipnetwork::Ipv4Network;
use tracing::{warn, warn_span};

// Controller errors.
#[derive(Debug)]
pub enum Error {
    Config(ConfigError),
    Topology(TopologyError),
    Lookup(LookupError),
    DuplicateBinding {
        ip: Ipv4Addr,
        bound: MacAddr,
        claimant: MacAddr,
    },
    NatPortsExhausted {
        src: Ipv4Addr,
        port: u16,
    },
    Southbound(SouthboundError),
}

// Malformed topology, subnet or load-balancer configuration. Fatal at load
// time.
#[derive(Debug)]
pub enum ConfigError {
    NoSwitches,
    DuplicateSwitch(SwitchId),
    UnknownSwitch(SwitchId),
    SelfLink(SwitchId),
    DuplicatePort(SwitchId, PortId),
    UnknownRouter(SwitchId),
    SubnetOverlap(Ipv4Network, Ipv4Network),
    GatewayOutsideSubnet(Ipv4Addr, Ipv4Network),
    RouterPortUnknown(SwitchId, PortId),
    EmptyBackendPool,
    DuplicateBackend(Ipv4Addr),
    NoSubnetForAddress(Ipv4Addr),
    UnknownNatSwitch(SwitchId),
    NatPortUnknown(SwitchId, PortId),
    NatOnRouter(SwitchId),
    InvalidPortRange(u16, u16),
    InvalidDelay,
    Parse(String),
}

#[derive(Debug)]
pub enum TopologyError {
    Disconnected { unreachable: Vec<SwitchId> },
}

// Failed lookups. Always recovered locally (flood, escalate or drop).
#[derive(Debug)]
pub enum LookupError {
    UnknownSwitch(SwitchId),
    NoSubnet(Ipv4Addr),
}

#[derive(Debug)]
pub enum SouthboundError {
    ChannelClosed,
    Io(std::io::Error),
}

// ===== impl Error =====

impl Error {
    pub fn log(&self) {
        match self {
            Error::Config(error) => {
                warn_span!("config").in_scope(|| {
                    warn!(error = %with_source(error), "{}", self);
                });
            }
            Error::Topology(error) => {
                warn_span!("topology").in_scope(|| error.log());
            }
            Error::Lookup(error) => {
                warn_span!("nib").in_scope(|| error.log());
            }
            Error::DuplicateBinding {
                ip,
                bound,
                claimant,
            } => {
                warn_span!("nib").in_scope(|| {
                    warn!(%ip, %bound, %claimant, "{}", self);
                });
            }
            Error::NatPortsExhausted { src, port } => {
                warn_span!("nat").in_scope(|| {
                    warn!(%src, %port, "{}", self);
                });
            }
            Error::Southbound(error) => {
                warn_span!("southbound").in_scope(|| {
                    warn!(error = %with_source(error), "{}", self);
                });
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(..) => write!(f, "invalid configuration"),
            Error::Topology(error) => error.fmt(f),
            Error::Lookup(error) => error.fmt(f),
            Error::DuplicateBinding { .. } => {
                write!(f, "IP address already bound to a different MAC")
            }
            Error::NatPortsExhausted { .. } => {
                write!(f, "no public port left for new flow")
            }
            Error::Southbound(..) => {
                write!(f, "failed to reach the southbound runtime")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(error) => Some(error),
            Error::Topology(error) => Some(error),
            Error::Lookup(error) => Some(error),
            Error::Southbound(error) => Some(error),
            Error::DuplicateBinding { .. }
            | Error::NatPortsExhausted { .. } => None,
        }
    }
}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Error {
        Error::Config(error)
    }
}

impl From<TopologyError> for Error {
    fn from(error: TopologyError) -> Error {
        Error::Topology(error)
    }
}

impl From<LookupError> for Error {
    fn from(error: LookupError) -> Error {
        Error::Lookup(error)
    }
}

impl From<SouthboundError> for Error {
    fn from(error: SouthboundError) -> Error {
        Error::Southbound(error)
    }
}

// ===== impl ConfigError =====

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoSwitches => {
                write!(f, "topology has no switches")
            }
            ConfigError::DuplicateSwitch(switch) => {
                write!(f, "switch {switch} declared more than once")
            }
            ConfigError::UnknownSwitch(switch) => {
                write!(f, "link references undeclared switch {switch}")
            }
            ConfigError::SelfLink(switch) => {
                write!(f, "link connects switch {switch} to itself")
            }
            ConfigError::DuplicatePort(switch, port) => {
                write!(f, "port {port} of switch {switch} is on two links")
            }
            ConfigError::UnknownRouter(switch) => {
                write!(f, "router switch {switch} is not part of the topology")
            }
            ConfigError::SubnetOverlap(a, b) => {
                write!(f, "subnets {a} and {b} overlap")
            }
            ConfigError::GatewayOutsideSubnet(gateway, subnet) => {
                write!(f, "gateway {gateway} is outside subnet {subnet}")
            }
            ConfigError::RouterPortUnknown(switch, port) => {
                write!(f, "router port {port} is not a port of switch {switch}")
            }
            ConfigError::EmptyBackendPool => {
                write!(f, "load balancer has no backends")
            }
            ConfigError::DuplicateBackend(addr) => {
                write!(f, "backend {addr} listed more than once")
            }
            ConfigError::NoSubnetForAddress(addr) => {
                write!(f, "address {addr} is not in any configured subnet")
            }
            ConfigError::UnknownNatSwitch(switch) => {
                write!(f, "NAT switch {switch} is not part of the topology")
            }
            ConfigError::NatPortUnknown(switch, port) => {
                write!(f, "NAT outside port {port} is not a port of {switch}")
            }
            ConfigError::NatOnRouter(switch) => {
                write!(f, "switch {switch} can't be both router and NAT")
            }
            ConfigError::InvalidPortRange(min, max) => {
                write!(f, "invalid public port range {min}-{max}")
            }
            ConfigError::InvalidDelay => {
                write!(f, "update delay must be greater than zero")
            }
            ConfigError::Parse(reason) => {
                write!(f, "failed to parse configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ===== impl TopologyError =====

impl TopologyError {
    pub(crate) fn log(&self) {
        match self {
            TopologyError::Disconnected { unreachable } => {
                warn!(?unreachable, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyError::Disconnected { .. } => {
                write!(f, "switch graph is disconnected")
            }
        }
    }
}

impl std::error::Error for TopologyError {}

// ===== impl LookupError =====

impl LookupError {
    pub(crate) fn log(&self) {
        match self {
            LookupError::UnknownSwitch(switch) => {
                warn!(%switch, "{}", self);
            }
            LookupError::NoSubnet(addr) => {
                warn!(%addr, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::UnknownSwitch(..) => {
                write!(f, "switch not found in topology")
            }
            LookupError::NoSubnet(..) => {
                write!(f, "no connected subnet for address")
            }
        }
    }
}

impl std::error::Error for LookupError {}

// ===== impl SouthboundError =====

impl std::fmt::Display for SouthboundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SouthboundError::ChannelClosed => {
                write!(f, "southbound channel closed")
            }
            SouthboundError::Io(..) => {
                write!(f, "southbound I/O error")
            }
        }
    }
}

impl std::error::Error for SouthboundError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SouthboundError::Io(error) => Some(error),
            SouthboundError::ChannelClosed => None,
        }
    }
}

// ===== global functions =====

pub fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}
