//! End-of-run report.

use std::fmt;

use serde::Serialize;

use crate::bootstrap::addons::AddonReport;
use crate::bootstrap::credentials::CredentialSource;
use crate::bootstrap::diagnostic_hints::{DiagnosticHint, HintTarget};
use crate::bootstrap::error::Result;
use crate::bootstrap::sequencer::{NodeError, TransitionRecord};
use crate::inventory::{BootstrapPhase, Node, NodeRole, PhaseStatus};

/// Everything an operator needs after a run.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapReport {
    pub run_id: String,
    pub cluster: String,
    pub phase: BootstrapPhase,
    pub api_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_source: Option<CredentialSource>,
    pub nodes: Vec<Node>,
    pub errors: Vec<NodeError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addons: Option<AddonReport>,
    pub history: Vec<TransitionRecord>,
}

impl BootstrapReport {
    /// The run reached `addons_complete`.
    pub fn is_success(&self) -> bool {
        self.phase == BootstrapPhase::AddonsComplete
    }

    pub fn failed_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|n| n.phase_status == PhaseStatus::Failed)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Hints for every node that did not finish, plus the cluster-level
    /// stage the run stopped in.
    pub fn hints(&self) -> Vec<(String, DiagnosticHint)> {
        let primary_address = self
            .nodes
            .iter()
            .find(|n| n.is_primary)
            .map(|n| n.address.as_str())
            .unwrap_or("<primary>");

        let mut hints: Vec<(String, DiagnosticHint)> = self
            .nodes
            .iter()
            .filter(|n| {
                matches!(
                    n.phase_status,
                    PhaseStatus::Failed | PhaseStatus::InProgress
                )
            })
            .map(|n| {
                let phase = match (n.role, n.is_primary) {
                    (NodeRole::ControlPlane, true) => BootstrapPhase::PrimaryInitializing,
                    (NodeRole::ControlPlane, false) => BootstrapPhase::ControlPlaneJoining,
                    (NodeRole::Worker, _) => BootstrapPhase::WorkerJoining,
                };
                let target = HintTarget {
                    node: &n.id,
                    address: &n.address,
                    primary_address,
                    api_endpoint: &self.api_endpoint,
                };
                (n.id.clone(), DiagnosticHint::for_phase(phase, &target))
            })
            .collect();

        let stage = match self.phase {
            BootstrapPhase::Aborted => self.history.last().map(|t| t.from),
            BootstrapPhase::WorkersComplete | BootstrapPhase::ClusterReady => Some(self.phase),
            _ => None,
        };
        let cluster_stage = stage.filter(|p| {
            matches!(p, BootstrapPhase::WorkersComplete | BootstrapPhase::ClusterReady)
        });
        let addons_incomplete = self.addons.as_ref().is_some_and(|a| !a.is_complete());
        if let Some(phase) = cluster_stage
            && (phase != BootstrapPhase::ClusterReady || addons_incomplete)
        {
            let target = HintTarget {
                node: &self.cluster,
                address: primary_address,
                primary_address,
                api_endpoint: &self.api_endpoint,
            };
            hints.push((self.cluster.clone(), DiagnosticHint::for_phase(phase, &target)));
        }
        hints
    }
}

impl fmt::Display for BootstrapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cluster {} ({}): {}", self.cluster, self.api_endpoint, self.phase)?;
        writeln!(f)?;
        for node in &self.nodes {
            let priority = node
                .vip_priority
                .map(|p| format!(" vip-priority={p}"))
                .unwrap_or_default();
            writeln!(
                f,
                "  {:<20} {:<14} {:<12}{}{}",
                node.id,
                node.role.as_str(),
                node.phase_status.to_string(),
                if node.is_primary { " primary" } else { "" },
                priority
            )?;
        }
        if let Some(addons) = &self.addons {
            writeln!(f)?;
            writeln!(f, "Add-ons installed: {}", addons.installed.join(", "))?;
            for failure in &addons.failed {
                writeln!(f, "Add-on failed: {} ({})", failure.name, failure.error)?;
            }
            for blocked in &addons.blocked {
                writeln!(
                    f,
                    "Add-on blocked: {} (waiting on {})",
                    blocked.name,
                    blocked.waiting_on.join(", ")
                )?;
            }
        }
        if !self.errors.is_empty() {
            writeln!(f)?;
            writeln!(f, "Errors:")?;
            for error in &self.errors {
                writeln!(
                    f,
                    "  [{}{}] {}: {}",
                    error.kind,
                    if error.fatal { ", fatal" } else { "" },
                    error.node.as_deref().unwrap_or("-"),
                    error.message
                )?;
            }
        }
        Ok(())
    }
}
