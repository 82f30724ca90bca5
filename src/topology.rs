//! Topology composition.
//!
//! Maps a node count onto the registered hosts: which host runs which node,
//! on which port, under which identity, and the full mesh of validator
//! references between them.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;

use crate::error::{ComposerError, Result};
use crate::keypair::Keypair;

/// First port assigned on every host.
pub const BASE_PORT: u16 = 12000;

/// Nodes per host; bounded by the two alias digits reserved for the node
/// index.
pub const MAX_NODES_PER_HOST: usize = 100;

/// Hosts per topology; bounded by the two alias digits reserved for the
/// host index.
pub const MAX_HOSTS: usize = 100;

/// Externally reachable node endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Same port on all interfaces.
    pub fn bind_all(&self) -> Endpoint {
        Endpoint {
            host: "0.0.0.0".into(),
            port: self.port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "https://{}:{}", self.host, self.port)
    }
}

/// A peer as seen from another node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    pub endpoint: Endpoint,
    pub address: String,
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?address={}", self.endpoint, self.address)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub keypair: Keypair,
    pub alias: String,
    pub endpoint: Endpoint,
    /// Index of the host in registry order.
    pub host: usize,
    validators: Vec<Validator>,
}

impl Node {
    pub fn address(&self) -> String {
        self.keypair.address()
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn add_validator(&mut self, validator: Validator) {
        self.validators.push(validator);
    }

    pub fn to_validator(&self) -> Validator {
        Validator {
            endpoint: self.endpoint.clone(),
            address: self.address(),
        }
    }
}

/// What the composer needs to know about a host.
#[derive(Debug, Clone, Copy)]
pub struct HostSlot<'a> {
    pub ip: &'a str,
    /// Identities for the first nodes on this host; random beyond these.
    pub seeds: &'a [Keypair],
}

#[derive(Debug, Default)]
pub struct Topology {
    nodes: BTreeMap<String, Node>,
    /// Node addresses per host, in creation order.
    per_host: Vec<Vec<String>>,
}

impl Topology {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes keyed by address.
    #[cfg(test)]
    pub fn nodes(&self) -> &BTreeMap<String, Node> {
        &self.nodes
    }

    /// Nodes assigned to host `index`, in port order.
    pub fn nodes_on(&self, index: usize) -> impl Iterator<Item = &Node> {
        self.per_host
            .get(index)
            .into_iter()
            .flatten()
            .filter_map(|a| self.nodes.get(a))
    }

    /// All nodes in host order, then port order.
    pub fn ordered(&self) -> impl Iterator<Item = &Node> {
        (0..self.per_host.len()).flat_map(move |i| self.nodes_on(i))
    }
}

/// Number of nodes each host receives: an even split with the remainder
/// going to the earliest hosts, capped per host.
pub fn distribute(node_count: usize, hosts: usize) -> Result<Vec<usize>> {
    if hosts == 0 {
        return Err(ComposerError::Topology("no hosts to place nodes on".into()));
    }
    let base = node_count / hosts;
    let remainder = node_count % hosts;
    Ok((0..hosts)
        .map(|i| (base + usize::from(i < remainder)).min(MAX_NODES_PER_HOST))
        .collect())
}

pub fn compose(node_count: usize, hosts: &[HostSlot<'_>]) -> Result<Topology> {
    if hosts.len() > MAX_HOSTS {
        return Err(ComposerError::Topology(format!(
            "too many hosts: {} (max {})",
            hosts.len(),
            MAX_HOSTS
        )));
    }
    let shares = distribute(node_count, hosts.len())?;
    debug!("trying to compose network: {} nodes, shares {:?}", node_count, shares);

    let mut topology = Topology {
        nodes: BTreeMap::new(),
        per_host: vec![Vec::new(); hosts.len()],
    };

    'hosts: for (i, (slot, share)) in hosts.iter().zip(shares).enumerate() {
        for j in 0..share {
            if topology.nodes.len() >= node_count {
                break 'hosts;
            }

            let keypair = slot.seeds.get(j).cloned().unwrap_or_else(Keypair::random);
            let address = keypair.address();
            if topology.nodes.contains_key(&address) {
                return Err(ComposerError::Topology(format!(
                    "identity {} assigned twice",
                    address
                )));
            }

            let node = Node {
                keypair,
                alias: format!("{:02}{:02}", i, j),
                endpoint: Endpoint {
                    host: slot.ip.to_string(),
                    port: BASE_PORT + j as u16,
                },
                host: i,
                validators: Vec::new(),
            };
            debug!(
                "generate node alias={} address={} endpoint={}",
                node.alias, address, node.endpoint
            );
            topology.per_host[i].push(address.clone());
            topology.nodes.insert(address, node);
        }
    }

    let peers: Vec<Validator> = topology.ordered().map(Node::to_validator).collect();
    for node in topology.nodes.values_mut() {
        let own = node.address();
        for peer in peers.iter().filter(|p| p.address != own) {
            node.add_validator(peer.clone());
        }
    }

    debug!("generated {} nodes", topology.len());
    Ok(topology)
}
