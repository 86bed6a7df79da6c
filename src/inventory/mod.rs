//! Static inputs of a bootstrap run: inventory, VIP, tunables and add-ons.
//!
//! The whole configuration is a single YAML document. Tunables have
//! defaults so a minimal file only lists the cluster VIP and the nodes:
//!
//! ```yaml
//! cluster:
//!   name: prod
//! vip:
//!   address: 10.0.0.100
//! nodes:
//!   - { id: ctrl-1, address: 10.0.0.11, role: control_plane, primary: true }
//!   - { id: ctrl-2, address: 10.0.0.12, role: control_plane }
//!   - { id: work-1, address: 10.0.0.21, role: worker }
//! ```

pub mod addon;
pub mod node;
pub mod phase;

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bootstrap::error::Result;
use crate::retry::RetryPolicy;

pub use addon::{AddonDescriptor, AddonSpec, InstallState, default_catalog};
pub use node::{Node, NodeInventoryEntry, NodeRole, PhaseStatus};
pub use phase::BootstrapPhase;

/// Complete configuration of a bootstrap run.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    #[serde(default)]
    pub cluster: ClusterSettings,
    pub vip: VipSettings,
    pub nodes: Vec<NodeInventoryEntry>,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub credentials: CredentialSettings,
    /// Add-ons to install. `None` selects [`default_catalog`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addons: Option<Vec<AddonSpec>>,
    /// Address for the health/metrics server while the run is in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<SocketAddr>,
}

impl BootstrapConfig {
    /// Parse a configuration document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Add-on set for this run.
    pub fn addon_specs(&self) -> Vec<AddonSpec> {
        self.addons.clone().unwrap_or_else(default_catalog)
    }
}

/// Cluster-wide kubeadm settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    pub name: String,
    pub api_server_port: u16,
    pub pod_network_cidr: String,
    pub service_cidr: String,
    /// Passed to `kubeadm init --kubernetes-version` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            name: "kubernetes".to_string(),
            api_server_port: 6443,
            pod_network_cidr: "10.244.0.0/16".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
            kubernetes_version: None,
        }
    }
}

/// Virtual IP and keepalived tunables.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VipSettings {
    pub address: IpAddr,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_virtual_router_id")]
    pub virtual_router_id: u8,
    #[serde(default = "default_advert_interval")]
    pub advert_interval_secs: u32,
    /// Priority of the designated primary. Others descend by `priorityStep`.
    #[serde(default = "default_priority_base")]
    pub priority_base: u8,
    #[serde(default = "default_priority_step")]
    pub priority_step: u8,
    #[serde(default)]
    pub health_check: HealthCheckSettings,
    /// Upper bound on MASTER re-election after the API probe fails.
    #[serde(default = "default_reelection_bound")]
    pub reelection_bound_secs: u32,
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_virtual_router_id() -> u8 {
    51
}

fn default_advert_interval() -> u32 {
    1
}

fn default_priority_base() -> u8 {
    150
}

fn default_priority_step() -> u8 {
    10
}

fn default_reelection_bound() -> u32 {
    15
}

impl VipSettings {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            interface: default_interface(),
            virtual_router_id: default_virtual_router_id(),
            advert_interval_secs: default_advert_interval(),
            priority_base: default_priority_base(),
            priority_step: default_priority_step(),
            health_check: HealthCheckSettings::default(),
            reelection_bound_secs: default_reelection_bound(),
        }
    }
}

/// Timing of the keepalived API-server liveness check.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckSettings {
    pub interval_secs: u32,
    pub timeout_secs: u32,
    /// Consecutive failures before the node drops its priority.
    pub fall: u32,
    /// Consecutive successes before the node regains its priority.
    pub rise: u32,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3,
            timeout_secs: 2,
            fall: 3,
            rise: 2,
        }
    }
}

/// How the orchestrator reaches nodes.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SshSettings {
    pub user: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// Bound on any single remote command.
    pub command_timeout_secs: u64,
    /// Prefix privileged commands with `sudo -n`.
    pub sudo: bool,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout_secs: 10,
            command_timeout_secs: 600,
            sudo: false,
        }
    }
}

/// Readiness budgets.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutSettings {
    pub primary_ready_secs: u64,
    pub node_ready_secs: u64,
    pub cluster_ready_secs: u64,
    pub addon_ready_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            primary_ready_secs: 300,
            node_ready_secs: 300,
            cluster_ready_secs: 600,
            addon_ready_secs: 300,
            poll_interval_secs: 5,
        }
    }
}

impl TimeoutSettings {
    pub fn primary_ready(&self) -> Duration {
        Duration::from_secs(self.primary_ready_secs)
    }

    pub fn node_ready(&self) -> Duration {
        Duration::from_secs(self.node_ready_secs)
    }

    pub fn cluster_ready(&self) -> Duration {
        Duration::from_secs(self.cluster_ready_secs)
    }

    pub fn addon_ready(&self) -> Duration {
        Duration::from_secs(self.addon_ready_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Retry budget applied to every remote mutation.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier.max(1.0),
        }
    }
}

/// Join credential lifetime.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialSettings {
    /// Requested token lifetime. Capped at the certificate-key lifetime.
    pub token_ttl_secs: u64,
    /// A stored bundle closer than this to expiry is regenerated.
    pub renewal_margin_secs: u64,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            token_ttl_secs: 7_200,
            renewal_margin_secs: 900,
        }
    }
}
