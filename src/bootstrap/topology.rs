//! Topology resolution: static inventory → validated cluster members.
//!
//! Runs once per run, before anything touches a node. Every inventory
//! defect is reported as a configuration error so a bad file never leaves
//! a half-formed cluster behind.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::IpAddr;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::bootstrap::error::{Error, Result};
use crate::bootstrap::vip::VipFailoverGroup;
use crate::inventory::{BootstrapConfig, Node, NodeInventoryEntry, NodeRole, PhaseStatus};

/// Maximum length of a DNS-1123 subdomain.
const MAX_NODE_ID_LEN: usize = 253;

/// Address of the shared control-plane endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

impl ApiEndpoint {
    /// Parse `host:port` or `[v6]:port`.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.trim().rsplit_once(':')?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let port: u16 = port.parse().ok()?;
        if host.is_empty() || port == 0 {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ApiEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Validated members of the cluster.
///
/// The designated primary is held apart from the other members, which keep
/// their inventory order.
#[derive(Clone, Debug)]
pub struct ResolvedTopology {
    primary: Node,
    members: Vec<Node>,
    api_endpoint: ApiEndpoint,
}

impl ResolvedTopology {
    pub fn primary(&self) -> &Node {
        &self.primary
    }

    /// Every node, primary first, then inventory order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        std::iter::once(&self.primary).chain(self.members.iter())
    }

    /// Control-plane nodes other than the primary, in inventory order.
    pub fn secondary_control_planes(&self) -> impl Iterator<Item = &Node> {
        self.members.iter().filter(|n| n.is_control_plane())
    }

    /// Control-plane nodes, primary first.
    pub fn control_planes(&self) -> impl Iterator<Item = &Node> {
        std::iter::once(&self.primary).chain(self.secondary_control_planes())
    }

    pub fn workers(&self) -> impl Iterator<Item = &Node> {
        self.members.iter().filter(|n| n.is_worker())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        if self.primary.id == id {
            return Some(&mut self.primary);
        }
        self.members.iter_mut().find(|n| n.id == id)
    }

    pub fn api_endpoint(&self) -> &ApiEndpoint {
        &self.api_endpoint
    }

    pub fn control_plane_count(&self) -> usize {
        self.control_planes().count()
    }

    pub fn worker_count(&self) -> usize {
        self.workers().count()
    }

    /// Node ids the finished cluster must report.
    pub fn expected_node_ids(&self) -> BTreeSet<String> {
        self.nodes().map(|n| n.id.clone()).collect()
    }

    /// Set a node's status. Unknown ids are ignored.
    pub fn set_status(&mut self, id: &str, status: PhaseStatus) {
        if let Some(node) = self.node_mut(id) {
            node.phase_status = status;
        }
    }

    pub fn status_of(&self, id: &str) -> Option<PhaseStatus> {
        self.node(id).map(|n| n.phase_status)
    }

    /// Copy the failover priorities onto the control-plane nodes.
    pub fn apply_vip_priorities(&mut self, group: &VipFailoverGroup) {
        for member in &group.members {
            if let Some(node) = self.node_mut(&member.node_id) {
                node.vip_priority = Some(member.priority);
            }
        }
    }
}

/// Validate the inventory and derive the cluster members.
pub fn resolve(config: &BootstrapConfig) -> Result<ResolvedTopology> {
    let entries = &config.nodes;
    if entries.is_empty() {
        return Err(Error::Configuration("node inventory is empty".into()));
    }

    let api_port = config.cluster.api_server_port;
    if api_port == 0 {
        return Err(Error::Configuration("apiServerPort must be non-zero".into()));
    }
    let api_endpoint = ApiEndpoint {
        host: config.vip.address.to_string(),
        port: api_port,
    };

    let mut ids = HashSet::new();
    let mut addresses = HashSet::new();
    for entry in entries {
        validate_node_id(&entry.id)?;
        validate_address(entry)?;
        if !ids.insert(entry.id.as_str()) {
            return Err(Error::Configuration(format!(
                "duplicate node id {:?}",
                entry.id
            )));
        }
        if !addresses.insert(entry.address.as_str()) {
            return Err(Error::Configuration(format!(
                "duplicate node address {:?} (node {})",
                entry.address, entry.id
            )));
        }
    }

    if !entries.iter().any(|e| e.role == NodeRole::ControlPlane) {
        return Err(Error::Configuration(
            "inventory has no control-plane node".into(),
        ));
    }

    let primaries: Vec<&NodeInventoryEntry> = entries.iter().filter(|e| e.primary).collect();
    let primary_entry = match primaries.as_slice() {
        [] => {
            return Err(Error::Configuration(
                "no node is designated primary".into(),
            ));
        }
        [only] => *only,
        many => {
            let names: Vec<&str> = many.iter().map(|e| e.id.as_str()).collect();
            return Err(Error::Configuration(format!(
                "exactly one primary is allowed, found {}: {}",
                names.len(),
                names.join(", ")
            )));
        }
    };
    if primary_entry.role != NodeRole::ControlPlane {
        return Err(Error::Configuration(format!(
            "primary {} must be a control-plane node",
            primary_entry.id
        )));
    }

    let mut primary = None;
    let mut members = Vec::with_capacity(entries.len().saturating_sub(1));
    for entry in entries {
        let node = resolve_entry(entry, &api_endpoint)?;
        if node.is_primary {
            primary = Some(node);
        } else {
            members.push(node);
        }
    }

    let primary = primary.ok_or_else(|| Error::Configuration("no primary resolved".into()))?;
    debug!(
        primary = %primary.id,
        control_planes = 1 + members.iter().filter(|n| n.is_control_plane()).count(),
        workers = members.iter().filter(|n| n.is_worker()).count(),
        endpoint = %api_endpoint,
        "Resolved topology"
    );

    Ok(ResolvedTopology {
        primary,
        members,
        api_endpoint,
    })
}

fn resolve_entry(entry: &NodeInventoryEntry, api_endpoint: &ApiEndpoint) -> Result<Node> {
    let control_plane_endpoint = match entry.role {
        NodeRole::ControlPlane => {
            if entry.control_plane_endpoint.is_some() {
                debug!(node = %entry.id, "Ignoring controlPlaneEndpoint on control-plane node");
            }
            None
        }
        NodeRole::Worker => match entry.control_plane_endpoint.as_deref() {
            None => Some(api_endpoint.to_string()),
            Some(raw) if raw.trim().is_empty() => {
                return Err(Error::Configuration(format!(
                    "worker {} has an empty controlPlaneEndpoint",
                    entry.id
                )));
            }
            Some(raw) => {
                let endpoint = ApiEndpoint::parse(raw).ok_or_else(|| {
                    Error::Configuration(format!(
                        "worker {} has invalid controlPlaneEndpoint {:?}, expected host:port",
                        entry.id, raw
                    ))
                })?;
                Some(endpoint.to_string())
            }
        },
    };

    Ok(Node {
        id: entry.id.clone(),
        address: entry.address.clone(),
        role: entry.role,
        is_primary: entry.primary,
        phase_status: PhaseStatus::Pending,
        vip_priority: None,
        control_plane_endpoint,
    })
}

fn validate_node_id(id: &str) -> Result<()> {
    let re = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .map_err(|e| Error::Configuration(format!("node id pattern: {e}")))?;
    if id.len() > MAX_NODE_ID_LEN || !re.is_match(id) {
        return Err(Error::Configuration(format!(
            "node id {id:?} is not a valid lowercase RFC 1123 hostname"
        )));
    }
    Ok(())
}

fn validate_address(entry: &NodeInventoryEntry) -> Result<()> {
    let address = entry.address.trim();
    if address.is_empty() {
        return Err(Error::Configuration(format!(
            "node {} has an empty address",
            entry.id
        )));
    }
    if address.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let re = Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9]*[A-Za-z0-9])?(\.[A-Za-z0-9]([-A-Za-z0-9]*[A-Za-z0-9])?)*$")
        .map_err(|e| Error::Configuration(format!("address pattern: {e}")))?;
    if !re.is_match(address) {
        return Err(Error::Configuration(format!(
            "node {} has invalid address {:?}",
            entry.id, entry.address
        )));
    }
    Ok(())
}
