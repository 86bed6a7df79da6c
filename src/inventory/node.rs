//! Node inventory records and resolved cluster members.

use serde::{Deserialize, Serialize};

/// Declared role of a node.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Runs the API server and etcd.
    ControlPlane,
    /// Runs workloads only.
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "control_plane",
            NodeRole::Worker => "worker",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a single node through formation.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Joined,
    Failed,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::Pending => write!(f, "pending"),
            PhaseStatus::InProgress => write!(f, "in_progress"),
            PhaseStatus::Joined => write!(f, "joined"),
            PhaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One entry of the operator-supplied inventory.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInventoryEntry {
    /// Hostname, also the Kubernetes node name.
    pub id: String,
    /// IP address or resolvable hostname used for SSH and advertisement.
    pub address: String,
    pub role: NodeRole,
    /// Marks the designated primary control-plane node.
    #[serde(default)]
    pub primary: bool,
    /// Endpoint a worker joins through. Defaults to the VIP endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<String>,
}

impl NodeInventoryEntry {
    pub fn control_plane(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            role: NodeRole::ControlPlane,
            primary: false,
            control_plane_endpoint: None,
        }
    }

    pub fn worker(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            role: NodeRole::Worker,
            primary: false,
            control_plane_endpoint: None,
        }
    }

    /// Mark this entry as the designated primary.
    pub fn as_primary(mut self) -> Self {
        self.primary = true;
        self
    }

    /// Set an explicit control-plane endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.control_plane_endpoint = Some(endpoint.into());
        self
    }
}

/// A validated cluster member.
///
/// Topology attributes (`id`, `address`, `role`, `is_primary`,
/// `control_plane_endpoint`) are fixed once resolved. The sequencer owns
/// `phase_status`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub address: String,
    pub role: NodeRole,
    pub is_primary: bool,
    pub phase_status: PhaseStatus,
    /// VRRP priority, control-plane nodes only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vip_priority: Option<u8>,
    /// Resolved join endpoint (`host:port`), workers only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<String>,
}

impl Node {
    pub fn is_control_plane(&self) -> bool {
        self.role == NodeRole::ControlPlane
    }

    pub fn is_worker(&self) -> bool {
        self.role == NodeRole::Worker
    }
}
