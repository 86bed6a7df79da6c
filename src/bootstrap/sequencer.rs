//! Bootstrap phase sequencer.
//!
//! Drives cluster formation one node at a time: VIP failover, primary
//! initialization, secondary control-plane joins, worker joins and the
//! final readiness gate. Every phase change is fired through the
//! [`BootstrapStateMachine`]; the node handlers live in
//! [`super::phases`].
//!
//! A fatal error (primary, control plane, credentials, VIP) moves the run
//! to `Aborted` and is returned from [`BootstrapSequencer::run`]. Worker
//! failures are recorded on the node and the run continues.

use std::sync::Arc;

use jiff::Timestamp;
use serde::Serialize;
use tracing::{Instrument, error, info, info_span, warn};

use crate::bootstrap::addons::{AddonGate, AddonReport};
use crate::bootstrap::context::Context;
use crate::bootstrap::credentials::{CredentialBroker, CredentialBundle, CredentialSource};
use crate::bootstrap::error::{Error, Result};
use crate::bootstrap::readiness::{Readiness, ReadinessTarget};
use crate::bootstrap::report::BootstrapReport;
use crate::bootstrap::state_machine::{
    BootstrapEvent, BootstrapStateMachine, TransitionContext, TransitionResult,
};
use crate::bootstrap::topology::{ApiEndpoint, ResolvedTopology};
use crate::bootstrap::vip::{VipCoordinator, VipFailoverGroup};
use crate::inventory::{BootstrapPhase, Node, PhaseStatus};

/// Run state threaded through the sequencer.
///
/// Credentials are only accepted once the primary is ready and are never
/// replaced within a run.
#[derive(Debug)]
pub struct ClusterFormationState {
    phase: BootstrapPhase,
    credentials: Option<CredentialBundle>,
    credential_source: Option<CredentialSource>,
    api_endpoint: ApiEndpoint,
}

impl ClusterFormationState {
    pub fn new(api_endpoint: ApiEndpoint) -> Self {
        Self {
            phase: BootstrapPhase::Uninitialized,
            credentials: None,
            credential_source: None,
            api_endpoint,
        }
    }

    pub fn phase(&self) -> BootstrapPhase {
        self.phase
    }

    pub fn api_endpoint(&self) -> &ApiEndpoint {
        &self.api_endpoint
    }

    pub fn credential_source(&self) -> Option<CredentialSource> {
        self.credential_source
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// The join material of this run.
    pub fn credentials(&self) -> Result<&CredentialBundle> {
        if !self.phase.credentials_available() {
            return Err(Error::Credential(format!(
                "credentials are not available in phase {}",
                self.phase
            )));
        }
        self.credentials
            .as_ref()
            .ok_or_else(|| Error::Credential("credentials have not been obtained".into()))
    }

    pub(super) fn install_credentials(
        &mut self,
        bundle: CredentialBundle,
        source: CredentialSource,
    ) -> Result<()> {
        if !self.phase.credentials_available() {
            return Err(Error::Credential(format!(
                "credentials cannot be set in phase {}",
                self.phase
            )));
        }
        if self.credentials.is_some() {
            return Err(Error::Credential(
                "credentials are already set for this run".into(),
            ));
        }
        bundle.validate()?;
        self.credentials = Some(bundle);
        self.credential_source = Some(source);
        Ok(())
    }
}

/// One fired transition.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub from: BootstrapPhase,
    pub to: BootstrapPhase,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub at: Timestamp,
}

/// A failure recorded during the run.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub phase: BootstrapPhase,
    pub kind: String,
    pub message: String,
    /// Whether the failure stopped the run.
    pub fatal: bool,
}

/// Drives formation of one cluster.
pub struct BootstrapSequencer {
    pub(super) ctx: Arc<Context>,
    pub(super) machine: BootstrapStateMachine,
    pub(super) broker: CredentialBroker,
    pub(super) topology: ResolvedTopology,
    pub(super) failover: Option<(VipCoordinator, VipFailoverGroup)>,
    pub(super) state: ClusterFormationState,
    pub(super) progress: TransitionContext,
    pub(super) history: Vec<TransitionRecord>,
    pub(super) errors: Vec<NodeError>,
}

impl BootstrapSequencer {
    pub fn new(ctx: Arc<Context>, topology: ResolvedTopology) -> Self {
        let progress =
            TransitionContext::new(topology.control_plane_count(), topology.worker_count());
        let broker = CredentialBroker::new(ctx.settings.credentials.clone());
        let state = ClusterFormationState::new(topology.api_endpoint().clone());
        Self {
            ctx,
            machine: BootstrapStateMachine::new(),
            broker,
            topology,
            failover: None,
            state,
            progress,
            history: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Configure the VIP failover group before formation starts.
    pub fn with_failover(mut self, coordinator: VipCoordinator, group: VipFailoverGroup) -> Self {
        self.topology.apply_vip_priorities(&group);
        self.failover = Some((coordinator, group));
        self
    }

    pub fn phase(&self) -> BootstrapPhase {
        self.state.phase()
    }

    pub fn state(&self) -> &ClusterFormationState {
        &self.state
    }

    pub fn topology(&self) -> &ResolvedTopology {
        &self.topology
    }

    pub fn errors(&self) -> &[NodeError] {
        &self.errors
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Nodes that ended the run failed.
    pub fn failed_nodes(&self) -> Vec<&Node> {
        self.topology
            .nodes()
            .filter(|n| n.phase_status == PhaseStatus::Failed)
            .collect()
    }

    /// Form the cluster.
    ///
    /// On a fatal error the run is moved to `Aborted` and the error is
    /// returned. Partial progress stays visible through [`Self::report`].
    pub async fn run(&mut self) -> Result<()> {
        let span = info_span!(
            "bootstrap",
            run_id = %self.ctx.run_id,
            primary = %self.topology.primary().id
        );
        let result = self.drive().instrument(span).await;

        if let Err(e) = &result {
            error!(
                phase = %self.state.phase(),
                node = e.node().unwrap_or("-"),
                kind = e.kind(),
                error = %e,
                "Bootstrap aborted"
            );
            self.record_error(e, true);
            self.progress.join_in_flight = None;
            if let Err(abort_err) = self.fire(BootstrapEvent::Abort, None) {
                warn!(error = %abort_err, "Could not move run to aborted");
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        self.configure_failover().await?;
        self.handle_primary().await?;

        let secondaries: Vec<Node> = self.topology.secondary_control_planes().cloned().collect();
        for node in &secondaries {
            self.handle_control_plane_join(node).await?;
        }
        self.fire(BootstrapEvent::ControlPlaneFormed, None)?;

        let workers: Vec<Node> = self.topology.workers().cloned().collect();
        for node in &workers {
            self.handle_worker_join(node).await?;
        }
        self.fire(BootstrapEvent::WorkersSettled, None)?;

        self.verify_cluster().await
    }

    async fn configure_failover(&mut self) -> Result<()> {
        let Some((coordinator, group)) = &self.failover else {
            return Ok(());
        };
        info!(vip = %group.virtual_ip, members = group.members.len(), "Configuring VIP failover");
        coordinator
            .configure(
                self.ctx.agent.as_ref(),
                &self.topology,
                group,
                self.ctx.retry(),
            )
            .await?;
        Ok(())
    }

    /// Gate `workers_complete → cluster_ready`.
    ///
    /// A run with failed workers stays in `workers_complete`.
    async fn verify_cluster(&mut self) -> Result<()> {
        let failed: Vec<String> = self
            .failed_nodes()
            .iter()
            .map(|n| n.id.clone())
            .collect();
        if !failed.is_empty() {
            warn!(
                failed = %failed.join(","),
                "Workers failed to join, cluster stays in workers_complete"
            );
            return Ok(());
        }

        let target = ReadinessTarget::Cluster {
            expected: self.topology.expected_node_ids(),
        };
        let timeout = self.ctx.settings.timeouts.cluster_ready();
        match self
            .ctx
            .verifier
            .wait_for_ready(&target, timeout, self.ctx.poll_interval())
            .await
        {
            Readiness::Ready => {
                self.progress.nodes_ready = self.progress.nodes_expected;
                self.fire(BootstrapEvent::ClusterVerified, None)?;
                self.ctx.set_ready(true).await;
                Ok(())
            }
            Readiness::TimedOut {
                waited,
                last_observation,
            } => {
                warn!(observation = %last_observation, "Cluster did not become ready");
                Err(Error::BootstrapTimeout {
                    node: self.ctx.settings.cluster.name.clone(),
                    phase: self.state.phase(),
                    waited,
                })
            }
        }
    }

    /// Finish the run after the add-on gate.
    ///
    /// Fires `AddonsInstalled` when every enabled add-on is installed;
    /// otherwise records the failures and leaves the run in `cluster_ready`.
    pub fn record_addons(&mut self, report: &AddonReport) -> Result<()> {
        self.progress.addons_expected = report.enabled_count();
        self.progress.addons_installed = report.installed.len();

        for failure in &report.failed {
            self.errors.push(NodeError {
                node: None,
                phase: self.state.phase(),
                kind: "AddonInstallFailure".to_string(),
                message: format!("{}: {}", failure.name, failure.error),
                fatal: false,
            });
        }
        for blocked in &report.blocked {
            self.errors.push(NodeError {
                node: None,
                phase: self.state.phase(),
                kind: "AddonBlocked".to_string(),
                message: format!(
                    "{} not started, waiting on {}",
                    blocked.name,
                    blocked.waiting_on.join(", ")
                ),
                fatal: false,
            });
        }

        if report.is_complete() {
            self.fire(BootstrapEvent::AddonsInstalled, None)
        } else {
            warn!(
                installed = report.installed.len(),
                failed = report.failed.len(),
                blocked = report.blocked.len(),
                "Add-on installation incomplete"
            );
            Ok(())
        }
    }

    /// Run the add-on gate against this cluster.
    ///
    /// A gate error (wrong phase, cluster readiness lost) is recorded as a
    /// non-fatal error and returned; the run stays in its current phase.
    pub async fn install_addons(&mut self, gate: &mut AddonGate) -> Result<AddonReport> {
        let ctx = Arc::clone(&self.ctx);
        let expected = self.topology.expected_node_ids();
        match gate.install(&ctx, self.state.phase(), expected).await {
            Ok(report) => {
                self.record_addons(&report)?;
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "Add-on gate did not run");
                self.record_error(&e, false);
                Err(e)
            }
        }
    }

    /// Snapshot of the run.
    pub fn report(&self, addons: Option<AddonReport>) -> BootstrapReport {
        BootstrapReport {
            run_id: self.ctx.run_id.to_string(),
            cluster: self.ctx.settings.cluster.name.clone(),
            phase: self.state.phase(),
            api_endpoint: self.state.api_endpoint().to_string(),
            credential_source: self.state.credential_source(),
            nodes: self.topology.nodes().cloned().collect(),
            errors: self.errors.clone(),
            addons,
            history: self.history.clone(),
        }
    }

    /// Fire an event through the state machine.
    pub(super) fn fire(&mut self, event: BootstrapEvent, node: Option<&str>) -> Result<()> {
        let current = self.state.phase;
        match self.machine.transition(&current, event, &self.progress) {
            TransitionResult::Success {
                from,
                to,
                event,
                description,
            } => {
                info!(
                    from = %from,
                    to = %to,
                    event = %event,
                    node = node.unwrap_or("-"),
                    "{}",
                    description
                );
                self.state.phase = to;
                self.history.push(TransitionRecord {
                    from,
                    to,
                    event: event.to_string(),
                    node: node.map(str::to_string),
                    at: Timestamp::now(),
                });
                self.ctx.record_transition(from, to);
                Ok(())
            }
            TransitionResult::InvalidTransition { current, event } => {
                Err(Error::InvalidTransition {
                    from: current,
                    event,
                })
            }
            TransitionResult::GuardFailed {
                from,
                event,
                reason,
                ..
            } => Err(Error::GuardFailed {
                from,
                event,
                reason,
            }),
        }
    }

    pub(super) fn record_error(&mut self, error: &Error, fatal: bool) {
        self.errors.push(NodeError {
            node: error.node().map(str::to_string),
            phase: self.state.phase(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            fatal,
        });
    }
}
