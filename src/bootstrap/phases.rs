//! Per-node phase handlers of the sequencer.
//!
//! Each handler owns one node's trip through formation. Every remote
//! attempt first re-checks the membership marker, so a retry after a
//! half-applied `kubeadm join` never runs the join twice.

use std::time::Duration;

use jiff::Timestamp;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::{AgentError, InitRequest, JoinRequest, NodeAgent};
use crate::bootstrap::credentials::{CredentialBundle, CredentialSource};
use crate::bootstrap::error::{Error, Result};
use crate::bootstrap::readiness::{Readiness, ReadinessTarget};
use crate::bootstrap::sequencer::BootstrapSequencer;
use crate::bootstrap::state_machine::BootstrapEvent;
use crate::inventory::{Node, NodeRole, PhaseStatus};
use crate::retry::retry_with_backoff;

/// What a mutating attempt actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The node was already a member, nothing was run.
    AlreadyMember,
    /// The command ran and succeeded.
    Applied,
}

async fn init_once(
    agent: &dyn NodeAgent,
    node: &Node,
    request: &InitRequest,
) -> std::result::Result<JoinOutcome, AgentError> {
    if agent.is_cluster_member(node).await? {
        return Ok(JoinOutcome::AlreadyMember);
    }
    agent.init_primary(node, request).await?;
    Ok(JoinOutcome::Applied)
}

async fn join_once(
    agent: &dyn NodeAgent,
    node: &Node,
    request: &JoinRequest,
) -> std::result::Result<JoinOutcome, AgentError> {
    if agent.is_cluster_member(node).await? {
        return Ok(JoinOutcome::AlreadyMember);
    }
    agent.join(node, request).await?;
    Ok(JoinOutcome::Applied)
}

impl BootstrapSequencer {
    /// Query the membership marker, with retries.
    async fn membership(&self, node: &Node) -> Result<bool> {
        let agent = self.ctx.agent.as_ref();
        retry_with_backoff(self.ctx.retry(), "is_cluster_member", || {
            agent.is_cluster_member(node)
        })
        .await
        .map_err(|e| Error::Agent {
            node: node.id.clone(),
            operation: "is_cluster_member",
            source: e,
        })
    }

    /// `uninitialized → primary_initializing → primary_ready`, or straight
    /// to `primary_ready` when the primary is already initialized.
    pub(super) async fn handle_primary(&mut self) -> Result<()> {
        let primary = self.topology.primary().clone();
        self.progress.target_is_primary = true;

        if self.membership(&primary).await? {
            info!(node = %primary.id, "Primary already initialized, skipping kubeadm init");
            self.fire(BootstrapEvent::ExistingClusterDetected, Some(&primary.id))?;
            self.progress.target_is_primary = false;
            self.await_primary_ready(&primary).await?;
            self.topology.set_status(&primary.id, PhaseStatus::Joined);
            self.progress.control_planes_joined = 1;
            return Ok(());
        }

        self.fire(BootstrapEvent::InitializePrimary, Some(&primary.id))?;
        self.progress.target_is_primary = false;
        self.topology.set_status(&primary.id, PhaseStatus::InProgress);

        let stored = self.broker.generate(Timestamp::now())?;
        let cluster = &self.ctx.settings.cluster;
        let request = InitRequest {
            control_plane_endpoint: self.state.api_endpoint().to_string(),
            advertise_address: primary.address.clone(),
            api_server_port: cluster.api_server_port,
            pod_network_cidr: cluster.pod_network_cidr.clone(),
            service_cidr: cluster.service_cidr.clone(),
            kubernetes_version: cluster.kubernetes_version.clone(),
            credentials: stored.clone(),
            token_ttl: self.broker.token_ttl(),
        };

        info!(node = %primary.id, endpoint = %request.control_plane_endpoint, "Initializing primary");
        let started = Instant::now();
        let agent = self.ctx.agent.as_ref();
        let node = &primary;
        let outcome = retry_with_backoff(self.ctx.retry(), "init_primary", || {
            init_once(agent, node, &request)
        })
        .await;

        match outcome {
            Ok(JoinOutcome::Applied) => info!(node = %primary.id, "kubeadm init completed"),
            Ok(JoinOutcome::AlreadyMember) => {
                info!(node = %primary.id, "Primary initialized by an earlier attempt")
            }
            Err(e) => {
                self.topology.set_status(&primary.id, PhaseStatus::Failed);
                self.ctx
                    .record_join(NodeRole::ControlPlane, "failed", started.elapsed());
                return Err(Error::Agent {
                    node: primary.id.clone(),
                    operation: "init_primary",
                    source: e,
                });
            }
        }

        self.await_primary_ready(&primary).await?;
        self.fire(BootstrapEvent::PrimaryHealthy, Some(&primary.id))?;
        self.topology.set_status(&primary.id, PhaseStatus::Joined);
        self.progress.control_planes_joined = 1;
        self.ctx
            .record_join(NodeRole::ControlPlane, "joined", started.elapsed());

        let bundle = self
            .broker
            .complete(
                self.ctx.agent.as_ref(),
                &primary,
                &stored,
                self.ctx.retry(),
            )
            .await?;
        self.state
            .install_credentials(bundle, CredentialSource::Generated)?;
        Ok(())
    }

    /// API server up and the primary node Ready, within one budget.
    async fn await_primary_ready(&mut self, primary: &Node) -> Result<()> {
        let budget = self.ctx.settings.timeouts.primary_ready();
        let started = Instant::now();

        let api = self
            .ctx
            .verifier
            .wait_for_ready(&ReadinessTarget::ApiServer, budget, self.ctx.poll_interval())
            .await;
        if let Readiness::TimedOut { waited, .. } = api {
            self.topology.set_status(&primary.id, PhaseStatus::Failed);
            return Err(Error::BootstrapTimeout {
                node: primary.id.clone(),
                phase: self.state.phase(),
                waited,
            });
        }

        let remaining = budget.saturating_sub(started.elapsed());
        let node = self
            .ctx
            .verifier
            .wait_for_ready(
                &ReadinessTarget::Node(primary.id.clone()),
                remaining,
                self.ctx.poll_interval(),
            )
            .await;
        match node {
            Readiness::Ready => {
                self.progress.primary_ready = true;
                Ok(())
            }
            Readiness::TimedOut { .. } => {
                self.topology.set_status(&primary.id, PhaseStatus::Failed);
                Err(Error::BootstrapTimeout {
                    node: primary.id.clone(),
                    phase: self.state.phase(),
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Join material for the next join, obtained on first use.
    async fn ensure_credentials(&mut self) -> Result<CredentialBundle> {
        if !self.state.has_credentials() {
            let primary = self.topology.primary().clone();
            let (bundle, source) = self
                .broker
                .obtain(self.ctx.agent.as_ref(), &primary, self.ctx.retry())
                .await?;
            info!(source = %source, expires_at = %bundle.expires_at, "Join credentials ready");
            self.state.install_credentials(bundle, source)?;
        }

        let bundle = self.state.credentials()?;
        if bundle.is_expired(Timestamp::now()) {
            return Err(Error::Credential(format!(
                "join credentials expired at {}",
                bundle.expires_at
            )));
        }
        Ok(bundle.clone())
    }

    /// Join one secondary control-plane node. Any failure is fatal.
    pub(super) async fn handle_control_plane_join(&mut self, node: &Node) -> Result<()> {
        if self.membership(node).await? {
            info!(node = %node.id, "Control-plane node already a member, skipping join");
            self.await_node_ready(node, NodeRole::ControlPlane).await?;
            self.topology.set_status(&node.id, PhaseStatus::Joined);
            self.progress.control_planes_joined += 1;
            return Ok(());
        }

        let credentials = self.ensure_credentials().await?;
        self.fire(BootstrapEvent::ControlPlaneJoinStarted, Some(&node.id))?;
        self.progress.join_in_flight = Some(node.id.clone());
        self.topology.set_status(&node.id, PhaseStatus::InProgress);

        let request = JoinRequest {
            api_endpoint: self.state.api_endpoint().to_string(),
            advertise_address: node.address.clone(),
            credentials,
            control_plane: true,
        };
        let started = Instant::now();
        self.run_join(node, &request).await?;
        self.await_node_ready(node, NodeRole::ControlPlane).await?;

        self.topology.set_status(&node.id, PhaseStatus::Joined);
        self.progress.control_planes_joined += 1;
        self.progress.join_in_flight = None;
        self.ctx
            .record_join(NodeRole::ControlPlane, "joined", started.elapsed());
        Ok(())
    }

    /// Join one worker. Failures are recorded on the node and the run
    /// continues; only credential errors are returned.
    pub(super) async fn handle_worker_join(&mut self, node: &Node) -> Result<()> {
        match self.join_worker(node).await {
            Ok(()) => Ok(()),
            Err(e @ Error::Credential(_)) => Err(e),
            Err(e) => {
                warn!(node = %node.id, error = %e, "Worker join failed, continuing with remaining workers");
                self.topology.set_status(&node.id, PhaseStatus::Failed);
                self.record_error(&e, false);
                self.progress.workers_settled += 1;
                self.progress.join_in_flight = None;
                Ok(())
            }
        }
    }

    async fn join_worker(&mut self, node: &Node) -> Result<()> {
        if self.membership(node).await? {
            info!(node = %node.id, "Worker already a member, skipping join");
            self.await_node_ready(node, NodeRole::Worker).await?;
            self.topology.set_status(&node.id, PhaseStatus::Joined);
            self.progress.workers_settled += 1;
            return Ok(());
        }

        let credentials = self.ensure_credentials().await?;
        self.fire(BootstrapEvent::WorkerJoinStarted, Some(&node.id))?;
        self.progress.join_in_flight = Some(node.id.clone());
        self.topology.set_status(&node.id, PhaseStatus::InProgress);

        let api_endpoint = node
            .control_plane_endpoint
            .clone()
            .unwrap_or_else(|| self.state.api_endpoint().to_string());
        let request = JoinRequest {
            api_endpoint,
            advertise_address: node.address.clone(),
            credentials,
            control_plane: false,
        };
        let started = Instant::now();
        self.run_join(node, &request).await?;
        self.await_node_ready(node, NodeRole::Worker).await?;

        self.topology.set_status(&node.id, PhaseStatus::Joined);
        self.progress.workers_settled += 1;
        self.progress.join_in_flight = None;
        self.ctx
            .record_join(NodeRole::Worker, "joined", started.elapsed());
        Ok(())
    }

    async fn run_join(&mut self, node: &Node, request: &JoinRequest) -> Result<()> {
        info!(
            node = %node.id,
            role = %node.role,
            endpoint = %request.api_endpoint,
            "Joining node"
        );
        let started = Instant::now();
        let agent = self.ctx.agent.as_ref();
        let outcome = retry_with_backoff(self.ctx.retry(), "join", || {
            join_once(agent, node, request)
        })
        .await;

        match outcome {
            Ok(JoinOutcome::Applied) => {
                debug!(node = %node.id, elapsed_ms = started.elapsed().as_millis() as u64, "kubeadm join completed");
                Ok(())
            }
            Ok(JoinOutcome::AlreadyMember) => {
                info!(node = %node.id, "Node joined by an earlier attempt");
                Ok(())
            }
            Err(e) => {
                self.topology.set_status(&node.id, PhaseStatus::Failed);
                self.ctx.record_join(node.role, "failed", started.elapsed());
                Err(Error::JoinFailure {
                    node: node.id.clone(),
                    role: node.role,
                    source: e,
                })
            }
        }
    }

    async fn await_node_ready(&mut self, node: &Node, role: NodeRole) -> Result<()> {
        let timeout: Duration = self.ctx.settings.timeouts.node_ready();
        let readiness = self
            .ctx
            .verifier
            .wait_for_ready(
                &ReadinessTarget::Node(node.id.clone()),
                timeout,
                self.ctx.poll_interval(),
            )
            .await;
        match readiness {
            Readiness::Ready => Ok(()),
            Readiness::TimedOut { waited, .. } => {
                self.topology.set_status(&node.id, PhaseStatus::Failed);
                self.ctx.record_join(role, "timeout", waited);
                Err(Error::BootstrapTimeout {
                    node: node.id.clone(),
                    phase: self.state.phase(),
                    waited,
                })
            }
        }
    }
}
