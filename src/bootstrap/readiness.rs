//! Readiness polling.
//!
//! The verifier only observes. A probe error means "not ready yet", so a
//! flapping API server during `kubeadm init` does not fail the run; only
//! the overall timeout does.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::ClusterProbe;

/// What to wait for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadinessTarget {
    /// API server behind the VIP accepts requests.
    ApiServer,
    /// A single node is registered and Ready.
    Node(String),
    /// Exactly the expected node set is registered and every node is Ready.
    Cluster { expected: BTreeSet<String> },
}

impl fmt::Display for ReadinessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessTarget::ApiServer => write!(f, "api-server"),
            ReadinessTarget::Node(id) => write!(f, "node/{id}"),
            ReadinessTarget::Cluster { expected } => write!(f, "cluster({} nodes)", expected.len()),
        }
    }
}

/// Result of a wait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut {
        waited: Duration,
        /// Last thing the probe reported, for error messages.
        last_observation: String,
    },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// One probe outcome.
struct Observation {
    ready: bool,
    detail: String,
}

/// Polls a [`ClusterProbe`] until a target is ready.
#[derive(Clone)]
pub struct ReadinessVerifier {
    probe: Arc<dyn ClusterProbe>,
}

impl ReadinessVerifier {
    pub fn new(probe: Arc<dyn ClusterProbe>) -> Self {
        Self { probe }
    }

    /// Poll every `poll_interval` until `target` is ready or `timeout` elapses.
    ///
    /// The target is always checked at least once, even with a zero timeout.
    /// A probe call that outlives the deadline counts as not ready.
    pub async fn wait_for_ready(
        &self,
        target: &ReadinessTarget,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Readiness {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut polls = 0u32;

        loop {
            polls += 1;
            let budget = deadline.saturating_duration_since(Instant::now());
            let observation = tokio::time::timeout(budget, self.observe(target))
                .await
                .unwrap_or_else(|_| Observation::not_ready("probe timed out"));
            if observation.ready {
                info!(target = %target, polls, elapsed_ms = start.elapsed().as_millis() as u64, "Target ready");
                return Readiness::Ready;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    target = %target,
                    polls,
                    last = %observation.detail,
                    "Timed out waiting for readiness"
                );
                return Readiness::TimedOut {
                    waited: now.duration_since(start),
                    last_observation: observation.detail,
                };
            }

            debug!(target = %target, detail = %observation.detail, "Not ready yet");
            let remaining = deadline.duration_since(now);
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }
    }

    async fn observe(&self, target: &ReadinessTarget) -> Observation {
        match target {
            ReadinessTarget::ApiServer => match self.probe.api_server_healthy().await {
                Ok(true) => Observation::ready(),
                Ok(false) => Observation::not_ready("api server not healthy"),
                Err(e) => Observation::not_ready(format!("probe error: {e}")),
            },
            ReadinessTarget::Node(id) => match self.probe.node_ready(id).await {
                Ok(true) => Observation::ready(),
                Ok(false) => Observation::not_ready(format!("node {id} not Ready")),
                Err(e) => Observation::not_ready(format!("probe error: {e}")),
            },
            ReadinessTarget::Cluster { expected } => match self.probe.node_readiness().await {
                Ok(nodes) => cluster_observation(expected, &nodes),
                Err(e) => Observation::not_ready(format!("probe error: {e}")),
            },
        }
    }
}

impl Observation {
    fn ready() -> Self {
        Self {
            ready: true,
            detail: "ready".to_string(),
        }
    }

    fn not_ready(detail: impl Into<String>) -> Self {
        Self {
            ready: false,
            detail: detail.into(),
        }
    }
}

fn cluster_observation(expected: &BTreeSet<String>, nodes: &BTreeMap<String, bool>) -> Observation {
    let registered: BTreeSet<String> = nodes.keys().cloned().collect();
    let missing: Vec<&str> = expected
        .difference(&registered)
        .map(String::as_str)
        .collect();
    let unexpected: Vec<&str> = registered
        .difference(expected)
        .map(String::as_str)
        .collect();
    let not_ready: Vec<&str> = nodes
        .iter()
        .filter(|(_, ready)| !**ready)
        .map(|(name, _)| name.as_str())
        .collect();

    if missing.is_empty() && unexpected.is_empty() && not_ready.is_empty() {
        return Observation::ready();
    }

    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!("missing: {}", missing.join(",")));
    }
    if !unexpected.is_empty() {
        parts.push(format!("unexpected: {}", unexpected.join(",")));
    }
    if !not_ready.is_empty() {
        parts.push(format!("not ready: {}", not_ready.join(",")));
    }
    Observation::not_ready(parts.join("; "))
}
