//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use fabric_utils::{PortId, SwitchId};
use serde::Serialize;

use crate::config::TopologyCfg;
use crate::error::{ConfigError, Error, TopologyError};

// Static switch graph, with its spanning tree computed once at startup.
#[derive(Debug)]
pub struct Topology {
    switches: BTreeMap<SwitchId, SwitchTopo>,
    links: Vec<Link>,
    tree: Vec<Link>,
    // Tree adjacency: switch -> neighbor -> local port toward the neighbor.
    tree_adj: BTreeMap<SwitchId, BTreeMap<SwitchId, PortId>>,
}

#[derive(Clone, Debug)]
pub struct SwitchTopo {
    pub id: SwitchId,
    pub role: Role,
    // Single inter-switch port of an edge switch.
    pub uplink: Option<PortId>,
    // Declared ports, including link ports.
    pub ports: BTreeSet<PortId>,
    pub link_ports: BTreeSet<PortId>,
    // Link ports pruned by the spanning tree.
    pub blocked_ports: BTreeSet<PortId>,
    pub vlans: BTreeMap<PortId, u16>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Core,
    Edge,
    Router,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Endpoint {
    pub switch: SwitchId,
    pub port: PortId,
}

// Undirected link. Endpoints are kept sorted so that the derived ordering is
// a total order on links independent of how they were declared.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Link {
    pub a: Endpoint,
    pub b: Endpoint,
}

// Disjoint-set forest over switch indexes.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

// ===== impl Topology =====

impl Topology {
    pub fn new(
        cfg: &TopologyCfg,
        router: Option<SwitchId>,
    ) -> Result<Topology, Error> {
        if cfg.switches.is_empty() {
            return Err(ConfigError::NoSwitches.into());
        }

        let mut switches = BTreeMap::new();
        for switch_cfg in &cfg.switches {
            let switch = SwitchTopo {
                id: switch_cfg.id,
                role: Role::Core,
                uplink: None,
                ports: switch_cfg.ports.iter().copied().collect(),
                link_ports: Default::default(),
                blocked_ports: Default::default(),
                vlans: switch_cfg
                    .vlans
                    .iter()
                    .map(|vlan| (vlan.port, vlan.vlan))
                    .collect(),
            };
            if switches.insert(switch_cfg.id, switch).is_some() {
                return Err(ConfigError::DuplicateSwitch(switch_cfg.id).into());
            }
        }

        let mut links = Vec::with_capacity(cfg.links.len());
        for link_cfg in &cfg.links {
            let link = Link::new(
                Endpoint::new(link_cfg.switch_a, link_cfg.port_a),
                Endpoint::new(link_cfg.switch_b, link_cfg.port_b),
            );
            if link.a.switch == link.b.switch {
                return Err(ConfigError::SelfLink(link.a.switch).into());
            }
            for endpoint in [link.a, link.b] {
                let switch = switches
                    .get_mut(&endpoint.switch)
                    .ok_or(ConfigError::UnknownSwitch(endpoint.switch))?;
                if !switch.link_ports.insert(endpoint.port) {
                    return Err(ConfigError::DuplicatePort(
                        endpoint.switch,
                        endpoint.port,
                    )
                    .into());
                }
                switch.ports.insert(endpoint.port);
            }
            links.push(link);
        }
        links.sort();

        if let Some(router) = router
            && !switches.contains_key(&router)
        {
            return Err(ConfigError::UnknownRouter(router).into());
        }

        // Role assignment.
        for switch in switches.values_mut() {
            if Some(switch.id) == router {
                switch.role = Role::Router;
            } else if switch.link_ports.len() == 1 {
                switch.role = Role::Edge;
                switch.uplink = switch.link_ports.first().copied();
            }
        }

        let ids = switches.keys().copied().collect::<BTreeSet<_>>();
        let tree = spanning_tree(&ids, &links)?;

        let mut tree_adj: BTreeMap<SwitchId, BTreeMap<SwitchId, PortId>> =
            BTreeMap::new();
        for link in &tree {
            tree_adj
                .entry(link.a.switch)
                .or_default()
                .insert(link.b.switch, link.a.port);
            tree_adj
                .entry(link.b.switch)
                .or_default()
                .insert(link.a.switch, link.b.port);
        }
        for link in links.iter().filter(|link| !tree.contains(link)) {
            for endpoint in [link.a, link.b] {
                if let Some(switch) = switches.get_mut(&endpoint.switch) {
                    switch.blocked_ports.insert(endpoint.port);
                }
            }
        }

        Ok(Topology {
            switches,
            links,
            tree,
            tree_adj,
        })
    }

    pub fn switch(&self, id: SwitchId) -> Option<&SwitchTopo> {
        self.switches.get(&id)
    }

    pub fn switches(&self) -> impl Iterator<Item = &SwitchTopo> {
        self.switches.values()
    }

    pub fn contains(&self, id: SwitchId) -> bool {
        self.switches.contains_key(&id)
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn tree(&self) -> &[Link] {
        &self.tree
    }

    // Forwarding table toward a host attached to `root` at `host_port`: every
    // switch reachable over the tree maps to the port leading to the host.
    pub fn next_hops(
        &self,
        root: SwitchId,
        host_port: PortId,
    ) -> BTreeMap<SwitchId, PortId> {
        let mut table = BTreeMap::new();
        if !self.contains(root) {
            return table;
        }
        table.insert(root, host_port);

        let mut queue = VecDeque::from([root]);
        while let Some(switch) = queue.pop_front() {
            let Some(neighbors) = self.tree_adj.get(&switch) else {
                continue;
            };
            for neighbor in neighbors.keys() {
                if table.contains_key(neighbor) {
                    continue;
                }
                let port = self.tree_adj[neighbor][&switch];
                table.insert(*neighbor, port);
                queue.push_back(*neighbor);
            }
        }
        table
    }
}

// ===== impl SwitchTopo =====

impl SwitchTopo {
    pub fn is_link_port(&self, port: PortId) -> bool {
        self.link_ports.contains(&port)
    }

    pub fn is_host_port(&self, port: PortId) -> bool {
        self.ports.contains(&port) && !self.is_link_port(port)
    }

    // Ports the spanning tree allows traffic on.
    pub fn enabled_ports(&self) -> BTreeSet<PortId> {
        self.ports
            .difference(&self.blocked_ports)
            .copied()
            .collect()
    }

    pub fn vlan(&self, port: PortId) -> Option<u16> {
        self.vlans.get(&port).copied()
    }

    // Whether a broadcast received on `in_port` may leave through `port`.
    // Inter-switch links carry every VLAN.
    pub fn same_broadcast_domain(&self, in_port: PortId, port: PortId) -> bool {
        self.is_link_port(in_port)
            || self.is_link_port(port)
            || self.vlan(in_port) == self.vlan(port)
    }
}

// ===== impl Endpoint =====

impl Endpoint {
    pub const fn new(switch: SwitchId, port: PortId) -> Endpoint {
        Endpoint { switch, port }
    }
}

// ===== impl Link =====

impl Link {
    pub fn new(a: Endpoint, b: Endpoint) -> Link {
        if a <= b { Link { a, b } } else { Link { a: b, b: a } }
    }
}

// ===== impl UnionFind =====

impl UnionFind {
    fn new(len: usize) -> UnionFind {
        UnionFind {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    // Returns false if both elements were already in the same set.
    fn union(&mut self, x: usize, y: usize) -> bool {
        let (x, y) = (self.find(x), self.find(y));
        if x == y {
            return false;
        }
        match self.rank[x].cmp(&self.rank[y]) {
            std::cmp::Ordering::Less => self.parent[x] = y,
            std::cmp::Ordering::Greater => self.parent[y] = x,
            std::cmp::Ordering::Equal => {
                self.parent[y] = x;
                self.rank[x] += 1;
            }
        }
        true
    }
}

// ===== global functions =====

// Computes a spanning tree of the switch graph. Links are considered in their
// total order, so the result only depends on the set of links.
pub fn spanning_tree(
    switches: &BTreeSet<SwitchId>,
    links: &[Link],
) -> Result<Vec<Link>, TopologyError> {
    let tree = spanning_forest(switches, links);
    if switches.len() > 1 && tree.len() != switches.len() - 1 {
        let reachable = component(switches, &tree);
        let unreachable = switches
            .iter()
            .filter(|switch| !reachable.contains(switch))
            .copied()
            .collect();
        return Err(TopologyError::Disconnected { unreachable });
    }
    Ok(tree)
}

fn spanning_forest(switches: &BTreeSet<SwitchId>, links: &[Link]) -> Vec<Link> {
    let index = switches
        .iter()
        .enumerate()
        .map(|(i, switch)| (*switch, i))
        .collect::<BTreeMap<_, _>>();
    let mut sets = UnionFind::new(switches.len());

    let mut sorted = links.to_vec();
    sorted.sort();
    sorted
        .into_iter()
        .filter(|link| {
            match (index.get(&link.a.switch), index.get(&link.b.switch)) {
                (Some(a), Some(b)) => sets.union(*a, *b),
                _ => false,
            }
        })
        .collect()
}

// Switches connected to the smallest switch identifier.
fn component(
    switches: &BTreeSet<SwitchId>,
    tree: &[Link],
) -> BTreeSet<SwitchId> {
    let mut reachable = BTreeSet::new();
    let Some(first) = switches.first() else {
        return reachable;
    };
    reachable.insert(*first);
    let mut queue = VecDeque::from([*first]);
    while let Some(switch) = queue.pop_front() {
        for link in tree {
            let peer = if link.a.switch == switch {
                link.b.switch
            } else if link.b.switch == switch {
                link.a.switch
            } else {
                continue;
            };
            if reachable.insert(peer) {
                queue.push_back(peer);
            }
        }
    }
    reachable
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn link(sa: SwitchId, pa: PortId, sb: SwitchId, pb: PortId) -> Link {
        Link::new(Endpoint::new(sa, pa), Endpoint::new(sb, pb))
    }

    #[test]
    fn link_endpoints_normalized() {
        assert_eq!(link(2, 1, 1, 3), link(1, 3, 2, 1));
        assert_eq!(link(2, 1, 1, 3).a.switch, 1);
    }

    #[test]
    fn triangle_prunes_one_link() {
        let switches = BTreeSet::from([1, 2, 3]);
        let links = [link(1, 1, 2, 1), link(2, 2, 3, 1), link(3, 2, 1, 2)];
        let tree = spanning_tree(&switches, &links).unwrap();
        assert_eq!(tree, vec![link(1, 1, 2, 1), link(1, 2, 3, 2)]);
    }

    #[test]
    fn tree_ignores_declaration_order() {
        let switches = BTreeSet::from([1, 2, 3, 4]);
        let mut links = vec![
            link(1, 1, 2, 1),
            link(2, 2, 3, 1),
            link(3, 2, 4, 1),
            link(4, 2, 1, 2),
        ];
        let expected = spanning_tree(&switches, &links).unwrap();
        links.reverse();
        assert_eq!(spanning_tree(&switches, &links).unwrap(), expected);
    }

    #[test]
    fn disconnected_graph() {
        let switches = BTreeSet::from([1, 2, 3]);
        let links = [link(2, 1, 3, 1)];
        let error = spanning_tree(&switches, &links).unwrap_err();
        let TopologyError::Disconnected { unreachable } = error;
        assert_eq!(unreachable, vec![2, 3]);
    }

    #[test]
    fn single_switch() {
        let switches = BTreeSet::from([7]);
        assert!(spanning_tree(&switches, &[]).unwrap().is_empty());
    }
}
