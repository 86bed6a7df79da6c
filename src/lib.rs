//! ha-bootstrap library crate
//!
//! Bootstraps a highly-available Kubernetes cluster: one primary control
//! plane, additional control planes behind a keepalived VIP, workers, then
//! add-ons in dependency order once every node is Ready.
//!
//! [`preflight`] validates a configuration without touching any node.
//! [`run_bootstrap`] executes a validated [`Plan`] with the collaborators
//! in a [`Context`].

pub mod agent;
pub mod bootstrap;
pub mod health;
pub mod inventory;
pub mod retry;

pub use health::HealthState;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use agent::{HelmAddonInstaller, KubeClusterProbe, SshNodeAgent};
use bootstrap::{
    AddonGate, BootstrapReport, BootstrapSequencer, Context, ResolvedTopology, Result,
    RunSettings, VipCoordinator, VipFailoverGroup, resolve,
};
use inventory::{BootstrapConfig, BootstrapPhase, Node};

/// Everything validated before the first remote call.
#[derive(Clone, Debug)]
pub struct Plan {
    pub topology: ResolvedTopology,
    pub coordinator: VipCoordinator,
    pub failover: VipFailoverGroup,
    pub addons: AddonGate,
}

/// Serializable view of a [`Plan`].
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub api_endpoint: String,
    pub nodes: Vec<Node>,
    pub failover: VipFailoverGroup,
    pub reelection_secs: u64,
    pub addon_order: Vec<String>,
}

impl Plan {
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            api_endpoint: self.topology.api_endpoint().to_string(),
            nodes: self.topology.nodes().cloned().collect(),
            failover: self.failover.clone(),
            reelection_secs: self.coordinator.reelection_time().as_secs(),
            addon_order: self.addons.order().into_iter().map(str::to_string).collect(),
        }
    }
}

/// Validate topology, VIP plan and add-on graph.
///
/// Any error here is a configuration error and no node has been touched.
pub fn preflight(config: &BootstrapConfig) -> Result<Plan> {
    let mut topology = resolve(config)?;
    let coordinator = VipCoordinator::new(config.vip.clone(), config.cluster.api_server_port);
    let failover = coordinator.plan(&topology)?;
    topology.apply_vip_priorities(&failover);
    let addons = AddonGate::new(config.addon_specs())?;

    info!(
        control_planes = topology.control_plane_count(),
        workers = topology.worker_count(),
        addons = addons.order().len(),
        endpoint = %topology.api_endpoint(),
        "Pre-flight checks passed"
    );
    Ok(Plan {
        topology,
        coordinator,
        failover,
        addons,
    })
}

/// Context wired to the real collaborators: `ssh`, the API server and `helm`.
///
/// `kubeconfig_out` is where the admin kubeconfig is written for `helm`.
pub fn production_context(
    config: &BootstrapConfig,
    plan: &Plan,
    kubeconfig_out: PathBuf,
    health_state: Option<Arc<HealthState>>,
) -> Context {
    let agent = SshNodeAgent::new(config.ssh.clone());
    let primary = plan.topology.primary().clone();
    let probe = KubeClusterProbe::new(agent.clone(), primary.clone());
    let installer = HelmAddonInstaller::new(
        agent.clone(),
        primary,
        kubeconfig_out,
        config.timeouts.addon_ready(),
    );
    Context::new(
        Arc::new(agent),
        Arc::new(probe),
        Arc::new(installer),
        RunSettings::from_config(config),
        health_state,
    )
}

/// Form the cluster, then install add-ons if it became ready.
///
/// Never returns an error: every failure is recorded in the report, whose
/// phase tells how far the run got.
pub async fn run_bootstrap(plan: Plan, ctx: Arc<Context>) -> BootstrapReport {
    let Plan {
        topology,
        coordinator,
        failover,
        mut addons,
    } = plan;
    let mut sequencer = BootstrapSequencer::new(ctx, topology).with_failover(coordinator, failover);

    if sequencer.run().await.is_err() || sequencer.phase() != BootstrapPhase::ClusterReady {
        return sequencer.report(None);
    }
    match sequencer.install_addons(&mut addons).await {
        Ok(report) => sequencer.report(Some(report)),
        Err(_) => sequencer.report(None),
    }
}
