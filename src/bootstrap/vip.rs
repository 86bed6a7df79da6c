//! Virtual IP failover group planning and configuration.
//!
//! The coordinator assigns VRRP priorities to the control-plane nodes,
//! renders a keepalived instance per member and pushes it to the node.
//! Once configured, keepalived elects the MASTER on its own; nothing here
//! watches or reacts to failover events.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::agent::NodeAgent;
use crate::bootstrap::error::{Error, Result};
use crate::bootstrap::topology::ResolvedTopology;
use crate::inventory::VipSettings;
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Where keepalived reads its configuration.
pub const KEEPALIVED_CONF_PATH: &str = "/etc/keepalived/keepalived.conf";
/// Health-check script tracked by the VRRP instance.
pub const CHECK_SCRIPT_PATH: &str = "/etc/keepalived/check_apiserver.sh";

/// Initial VRRP state of a member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VrrpState {
    Master,
    Backup,
}

impl fmt::Display for VrrpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VrrpState::Master => write!(f, "MASTER"),
            VrrpState::Backup => write!(f, "BACKUP"),
        }
    }
}

/// Liveness probe the failover agent runs against the local API server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckContract {
    pub url: String,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub fall: u32,
    pub rise: u32,
}

/// One control-plane node in the failover group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VipMember {
    pub node_id: String,
    pub address: String,
    pub priority: u8,
}

/// Failover group of the control-plane nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VipFailoverGroup {
    pub virtual_ip: IpAddr,
    pub interface: String,
    pub virtual_router_id: u8,
    pub advert_interval_secs: u32,
    /// Strictly descending priority, primary first.
    pub members: Vec<VipMember>,
    /// Node id of the initial MASTER.
    pub master: String,
    pub health_check: HealthCheckContract,
}

impl VipFailoverGroup {
    /// Rendered failover configuration for one member.
    pub fn instance_for(&self, member: &VipMember) -> FailoverInstance {
        let state = if member.node_id == self.master {
            VrrpState::Master
        } else {
            VrrpState::Backup
        };
        FailoverInstance {
            node_id: member.node_id.clone(),
            state,
            priority: member.priority,
            interface: self.interface.clone(),
            virtual_router_id: self.virtual_router_id,
            advert_interval_secs: self.advert_interval_secs,
            virtual_ip: self.virtual_ip,
            unicast_src: member.address.clone(),
            unicast_peers: self
                .members
                .iter()
                .filter(|m| m.node_id != member.node_id)
                .map(|m| m.address.clone())
                .collect(),
            health_check: self.health_check.clone(),
        }
    }

    pub fn member(&self, node_id: &str) -> Option<&VipMember> {
        self.members.iter().find(|m| m.node_id == node_id)
    }
}

/// Failover configuration of a single node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverInstance {
    pub node_id: String,
    pub state: VrrpState,
    pub priority: u8,
    pub interface: String,
    pub virtual_router_id: u8,
    pub advert_interval_secs: u32,
    pub virtual_ip: IpAddr,
    pub unicast_src: String,
    pub unicast_peers: Vec<String>,
    pub health_check: HealthCheckContract,
}

impl FailoverInstance {
    /// keepalived.conf for this node.
    ///
    /// A failing check script moves the instance to FAULT, which releases
    /// the VIP to the highest-priority healthy BACKUP.
    pub fn render_keepalived_conf(&self) -> String {
        let mut conf = String::new();
        conf.push_str("global_defs {\n");
        conf.push_str(&format!("    router_id {}\n", self.node_id));
        conf.push_str("    enable_script_security\n");
        conf.push_str("    script_user root\n");
        conf.push_str("}\n\n");

        conf.push_str("vrrp_script check_apiserver {\n");
        conf.push_str(&format!("    script \"{CHECK_SCRIPT_PATH}\"\n"));
        conf.push_str(&format!("    interval {}\n", self.health_check.interval_secs));
        conf.push_str(&format!("    timeout {}\n", self.health_check.timeout_secs));
        conf.push_str(&format!("    fall {}\n", self.health_check.fall));
        conf.push_str(&format!("    rise {}\n", self.health_check.rise));
        conf.push_str("}\n\n");

        conf.push_str("vrrp_instance VI_1 {\n");
        conf.push_str(&format!("    state {}\n", self.state));
        conf.push_str(&format!("    interface {}\n", self.interface));
        conf.push_str(&format!("    virtual_router_id {}\n", self.virtual_router_id));
        conf.push_str(&format!("    priority {}\n", self.priority));
        conf.push_str(&format!("    advert_int {}\n", self.advert_interval_secs));
        conf.push_str(&format!("    unicast_src_ip {}\n", self.unicast_src));
        if !self.unicast_peers.is_empty() {
            conf.push_str("    unicast_peer {\n");
            for peer in &self.unicast_peers {
                conf.push_str(&format!("        {peer}\n"));
            }
            conf.push_str("    }\n");
        }
        conf.push_str("    virtual_ipaddress {\n");
        conf.push_str(&format!("        {}\n", self.virtual_ip));
        conf.push_str("    }\n");
        conf.push_str("    track_script {\n");
        conf.push_str("        check_apiserver\n");
        conf.push_str("    }\n");
        conf.push_str("}\n");
        conf
    }

    /// Health-check script probing the local API server.
    pub fn render_check_script(&self) -> String {
        format!(
            "#!/bin/sh\n\
             # API server liveness for keepalived\n\
             curl --silent --fail --insecure --max-time {} {} -o /dev/null || exit 1\n",
            self.health_check.timeout_secs, self.health_check.url
        )
    }
}

/// Outcome of applying a failover configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverApply {
    /// Configuration was written and keepalived reloaded.
    Changed,
    /// The node already had this exact configuration.
    Unchanged,
}

/// Plans and applies the VIP failover group.
#[derive(Clone, Debug)]
pub struct VipCoordinator {
    settings: VipSettings,
    api_server_port: u16,
}

impl VipCoordinator {
    pub fn new(settings: VipSettings, api_server_port: u16) -> Self {
        Self {
            settings,
            api_server_port,
        }
    }

    /// Worst-case time from API failure on the MASTER to a new MASTER.
    pub fn reelection_time(&self) -> Duration {
        let hc = &self.settings.health_check;
        let secs = u64::from(hc.fall) * u64::from(hc.interval_secs)
            + 3 * u64::from(self.settings.advert_interval_secs);
        Duration::from_secs(secs)
    }

    /// Compute priorities and the health-check contract.
    pub fn plan(&self, topology: &ResolvedTopology) -> Result<VipFailoverGroup> {
        let settings = &self.settings;
        let hc = &settings.health_check;

        if settings.virtual_router_id == 0 {
            return Err(Error::Configuration(
                "virtualRouterId must be between 1 and 255".into(),
            ));
        }
        if settings.interface.trim().is_empty() {
            return Err(Error::Configuration("VIP interface is empty".into()));
        }
        if settings.advert_interval_secs == 0 || hc.interval_secs == 0 || hc.timeout_secs == 0 {
            return Err(Error::Configuration(
                "VIP advertisement and health-check intervals must be non-zero".into(),
            ));
        }
        if hc.fall == 0 || hc.rise == 0 {
            return Err(Error::Configuration(
                "health-check fall and rise must be at least 1".into(),
            ));
        }

        let reelection = self.reelection_time();
        let bound = Duration::from_secs(u64::from(settings.reelection_bound_secs));
        if reelection > bound {
            return Err(Error::Configuration(format!(
                "VIP re-election can take {}s (fall {} x interval {}s + 3 x advert {}s), above the {}s bound",
                reelection.as_secs(),
                hc.fall,
                hc.interval_secs,
                settings.advert_interval_secs,
                bound.as_secs()
            )));
        }

        let vip = settings.address.to_string();
        if let Some(node) = topology.nodes().find(|n| n.address == vip) {
            return Err(Error::Configuration(format!(
                "VIP {vip} is also the address of node {}",
                node.id
            )));
        }

        let control_planes: Vec<_> = topology.control_planes().collect();
        if control_planes.len() > 1 && settings.priority_step == 0 {
            return Err(Error::Configuration(
                "priorityStep must be non-zero so priorities are unique".into(),
            ));
        }

        let mut members = Vec::with_capacity(control_planes.len());
        for (position, node) in control_planes.iter().enumerate() {
            let priority = i64::from(settings.priority_base)
                - i64::from(settings.priority_step) * position as i64;
            let priority = u8::try_from(priority)
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "VIP priority for {} would be {priority}; raise priorityBase or lower priorityStep",
                        node.id
                    ))
                })?;
            members.push(VipMember {
                node_id: node.id.clone(),
                address: node.address.clone(),
                priority,
            });
        }

        Ok(VipFailoverGroup {
            virtual_ip: settings.address,
            interface: settings.interface.clone(),
            virtual_router_id: settings.virtual_router_id,
            advert_interval_secs: settings.advert_interval_secs,
            members,
            master: topology.primary().id.clone(),
            health_check: HealthCheckContract {
                url: format!("https://127.0.0.1:{}/healthz", self.api_server_port),
                interval_secs: hc.interval_secs,
                timeout_secs: hc.timeout_secs,
                fall: hc.fall,
                rise: hc.rise,
            },
        })
    }

    /// Apply the group to every member. Idempotent.
    ///
    /// Any member that cannot be configured fails the whole call.
    pub async fn configure(
        &self,
        agent: &dyn NodeAgent,
        topology: &ResolvedTopology,
        group: &VipFailoverGroup,
        retry: &RetryPolicy,
    ) -> Result<Vec<(String, FailoverApply)>> {
        let mut applied = Vec::with_capacity(group.members.len());
        for member in &group.members {
            let node = topology.node(&member.node_id).ok_or_else(|| {
                Error::Configuration(format!("VIP member {} is not in the topology", member.node_id))
            })?;
            let instance = group.instance_for(member);

            let outcome = retry_with_backoff(retry, "configure_failover", || {
                agent.configure_failover(node, &instance)
            })
            .await
            .map_err(|e| {
                warn!(node = %node.id, error = %e, "Failed to configure VIP failover");
                Error::Agent {
                    node: node.id.clone(),
                    operation: "configure_failover",
                    source: e,
                }
            })?;

            info!(
                node = %node.id,
                state = %instance.state,
                priority = instance.priority,
                outcome = ?outcome,
                "VIP failover configured"
            );
            applied.push((node.id.clone(), outcome));
        }
        Ok(applied)
    }
}
