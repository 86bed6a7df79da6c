//! Shared context for a bootstrap run.
//!
//! The Context holds the collaborators, the run-wide tunables and the
//! optional health state used for metrics and readiness.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::agent::{AddonInstaller, ClusterProbe, NodeAgent};
use crate::bootstrap::readiness::ReadinessVerifier;
use crate::health::HealthState;
use crate::inventory::{
    BootstrapConfig, BootstrapPhase, ClusterSettings, CredentialSettings, NodeRole,
    TimeoutSettings,
};
use crate::retry::RetryPolicy;

/// Tunables that apply to the whole run
#[derive(Clone, Debug)]
pub struct RunSettings {
    pub cluster: ClusterSettings,
    pub timeouts: TimeoutSettings,
    pub retry: RetryPolicy,
    pub credentials: CredentialSettings,
}

impl RunSettings {
    pub fn from_config(config: &BootstrapConfig) -> Self {
        Self {
            cluster: config.cluster.clone(),
            timeouts: config.timeouts.clone(),
            retry: config.retry.policy(),
            credentials: config.credentials.clone(),
        }
    }
}

/// Shared context for the sequencer and the add-on gate
#[derive(Clone)]
pub struct Context {
    /// Correlates every log line and the final report
    pub run_id: Uuid,
    pub agent: Arc<dyn NodeAgent>,
    pub verifier: ReadinessVerifier,
    pub installer: Arc<dyn AddonInstaller>,
    pub settings: RunSettings,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Create a new context with a fresh run id
    pub fn new(
        agent: Arc<dyn NodeAgent>,
        probe: Arc<dyn ClusterProbe>,
        installer: Arc<dyn AddonInstaller>,
        settings: RunSettings,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            agent,
            verifier: ReadinessVerifier::new(probe),
            installer,
            settings,
            health_state,
        }
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    pub fn poll_interval(&self) -> Duration {
        self.settings.timeouts.poll_interval()
    }

    /// Record a phase change in the metrics
    pub fn record_transition(&self, from: BootstrapPhase, to: BootstrapPhase) {
        if let Some(state) = &self.health_state {
            state.metrics.record_transition(from.as_str(), to.as_str());
            state.metrics.set_current_phase(to);
        }
    }

    /// Record the outcome of a join attempt in the metrics
    pub fn record_join(&self, role: NodeRole, outcome: &str, duration: Duration) {
        if let Some(state) = &self.health_state {
            state
                .metrics
                .record_join(role.as_str(), outcome, duration.as_secs_f64());
        }
    }

    /// Record the outcome of an add-on install in the metrics
    pub fn record_addon(&self, name: &str, outcome: &str) {
        if let Some(state) = &self.health_state {
            state.metrics.record_addon(name, outcome);
        }
    }

    /// Flip the readiness endpoint
    pub async fn set_ready(&self, ready: bool) {
        if let Some(state) = &self.health_state {
            state.set_ready(ready).await;
        }
    }
}
