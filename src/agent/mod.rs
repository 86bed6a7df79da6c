//! Collaborators that touch the outside world.
//!
//! The bootstrap core only talks to nodes, the API server and the add-on
//! installer through the traits in this module. Production implementations
//! drive `kubeadm` over `ssh` ([`ssh::SshNodeAgent`]), probe the API with a
//! `kube` client ([`kube_probe::KubeClusterProbe`]) and shell out to `helm`
//! ([`helm::HelmAddonInstaller`]). Tests substitute recording mocks.

pub mod helm;
pub mod kube_probe;
pub mod parsing;
pub mod ssh;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::bootstrap::credentials::{CredentialBundle, StoredCredentials};
use crate::bootstrap::vip::{FailoverApply, FailoverInstance};
use crate::inventory::{AddonDescriptor, Node};

pub use helm::HelmAddonInstaller;
pub use kube_probe::KubeClusterProbe;
pub use parsing::ParseError;
pub use ssh::SshNodeAgent;

/// Errors returned by collaborators.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("`{command}` on {target} exited with status {status}: {stderr}")]
    CommandFailed {
        target: String,
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    /// The collaborator refused the request.
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl AgentError {
    /// Create a command failure error
    pub fn command_failed(
        target: impl Into<String>,
        command: impl Into<String>,
        status: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            target: target.into(),
            command: command.into(),
            status,
            stderr: stderr.into(),
        }
    }
}

/// Parameters for `kubeadm init` on the designated primary.
#[derive(Clone, Debug)]
pub struct InitRequest {
    /// Shared control-plane endpoint (`VIP:port`).
    pub control_plane_endpoint: String,
    pub advertise_address: String,
    pub api_server_port: u16,
    pub pod_network_cidr: String,
    pub service_cidr: String,
    pub kubernetes_version: Option<String>,
    /// Pre-generated token and certificate key. The CA hash only exists after init.
    pub credentials: StoredCredentials,
    pub token_ttl: Duration,
}

/// Parameters for `kubeadm join`.
#[derive(Clone, Debug)]
pub struct JoinRequest {
    /// Endpoint the node joins through (`host:port`).
    pub api_endpoint: String,
    pub advertise_address: String,
    pub credentials: CredentialBundle,
    /// Join as an additional control-plane member.
    pub control_plane: bool,
}

/// Remote node operations.
///
/// Every mutating call must be idempotent from the caller's perspective:
/// the sequencer re-checks [`NodeAgent::is_cluster_member`] before each
/// attempt and never issues a join for a node that is already a member.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// Whether the node already carries the joined-member marker.
    async fn is_cluster_member(&self, node: &Node) -> Result<bool, AgentError>;

    /// Initialize the first control-plane node.
    async fn init_primary(&self, node: &Node, request: &InitRequest) -> Result<(), AgentError>;

    /// Credential record persisted on the primary, if any.
    async fn read_credentials(&self, primary: &Node)
    -> Result<Option<StoredCredentials>, AgentError>;

    /// Register fresh credentials with the running primary and persist them.
    async fn publish_credentials(
        &self,
        primary: &Node,
        credentials: &StoredCredentials,
        ttl: Duration,
    ) -> Result<(), AgentError>;

    /// `sha256:<hex>` hash of the cluster CA public key.
    async fn ca_cert_hash(&self, primary: &Node) -> Result<String, AgentError>;

    /// Join the node to the cluster.
    async fn join(&self, node: &Node, request: &JoinRequest) -> Result<(), AgentError>;

    /// Install the failover agent configuration on a control-plane node and
    /// make sure the agent is running.
    async fn configure_failover(
        &self,
        node: &Node,
        instance: &FailoverInstance,
    ) -> Result<FailoverApply, AgentError>;
}

/// Read-only observation of the cluster.
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    /// The API server behind the VIP accepts requests.
    async fn api_server_healthy(&self) -> Result<bool, AgentError>;

    /// The node is registered and its `Ready` condition is `True`.
    async fn node_ready(&self, node_id: &str) -> Result<bool, AgentError>;

    /// Readiness of every registered node, keyed by node name.
    async fn node_readiness(&self) -> Result<BTreeMap<String, bool>, AgentError>;
}

/// Installs a single add-on from its desired-state descriptor.
#[async_trait]
pub trait AddonInstaller: Send + Sync {
    async fn install(&self, addon: &AddonDescriptor) -> Result<(), AgentError>;
}
