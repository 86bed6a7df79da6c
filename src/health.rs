//! Health and metrics server for a running bootstrap.
//!
//! Provides:
//! - `/healthz` - Liveness (200 while the process runs)
//! - `/readyz` - 200 once the cluster has been verified ready
//! - `/metrics` - Prometheus metrics for phases, joins and add-ons

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

use crate::inventory::BootstrapPhase;

/// Labels for phase transitions
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TransitionLabels {
    pub from: String,
    pub to: String,
}

impl EncodeLabelSet for TransitionLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("from", self.from.as_str()).encode(encoder.encode_label())?;
        ("to", self.to.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for the current-phase gauge
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub phase: String,
}

impl EncodeLabelSet for PhaseLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("phase", self.phase.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for join attempts
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct JoinLabels {
    pub role: String,
    pub outcome: String,
}

impl EncodeLabelSet for JoinLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("role", self.role.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct RoleLabels {
    pub role: String,
}

impl EncodeLabelSet for RoleLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("role", self.role.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for add-on installs
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct AddonLabels {
    pub addon: String,
    pub outcome: String,
}

impl EncodeLabelSet for AddonLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("addon", self.addon.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Metrics for one bootstrap run
pub struct Metrics {
    /// Phase transitions taken
    pub phase_transitions_total: Family<TransitionLabels, Counter>,
    /// 1 for the phase the run is in, 0 for every other phase
    pub current_phase: Family<PhaseLabels, Gauge>,
    /// Join attempts by role and outcome
    pub joins_total: Family<JoinLabels, Counter>,
    /// Time from join start to node Ready
    pub join_duration_seconds: Family<RoleLabels, Histogram>,
    /// Add-on installs by outcome
    pub addon_installs_total: Family<AddonLabels, Counter>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let phase_transitions_total = Family::<TransitionLabels, Counter>::default();
        registry.register(
            "ha_bootstrap_phase_transitions",
            "Total number of bootstrap phase transitions",
            phase_transitions_total.clone(),
        );

        let current_phase = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "ha_bootstrap_current_phase",
            "Current bootstrap phase (1 for the active phase)",
            current_phase.clone(),
        );

        let joins_total = Family::<JoinLabels, Counter>::default();
        registry.register(
            "ha_bootstrap_joins",
            "Total number of node joins by role and outcome",
            joins_total.clone(),
        );

        // 1s .. ~68min
        let join_duration_seconds = Family::<RoleLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(1.0, 2.0, 13))
        });
        registry.register(
            "ha_bootstrap_join_duration_seconds",
            "Duration from join start to node Ready in seconds",
            join_duration_seconds.clone(),
        );

        let addon_installs_total = Family::<AddonLabels, Counter>::default();
        registry.register(
            "ha_bootstrap_addon_installs",
            "Total number of add-on installs by outcome",
            addon_installs_total.clone(),
        );

        Self {
            phase_transitions_total,
            current_phase,
            joins_total,
            join_duration_seconds,
            addon_installs_total,
            registry,
        }
    }

    pub fn record_transition(&self, from: &str, to: &str) {
        self.phase_transitions_total
            .get_or_create(&TransitionLabels {
                from: from.to_string(),
                to: to.to_string(),
            })
            .inc();
    }

    /// Point the current-phase gauge at `phase`.
    pub fn set_current_phase(&self, phase: BootstrapPhase) {
        for p in BootstrapPhase::ALL {
            let labels = PhaseLabels {
                phase: p.as_str().to_string(),
            };
            self.current_phase
                .get_or_create(&labels)
                .set(i64::from(p == phase));
        }
    }

    pub fn record_join(&self, role: &str, outcome: &str, duration_secs: f64) {
        self.joins_total
            .get_or_create(&JoinLabels {
                role: role.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        self.join_duration_seconds
            .get_or_create(&RoleLabels {
                role: role.to_string(),
            })
            .observe(duration_secs);
    }

    pub fn record_addon(&self, addon: &str, outcome: &str) {
        self.addon_installs_total
            .get_or_create(&AddonLabels {
                addon: addon.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Set once the cluster is verified ready
    ready: RwLock<bool>,
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Returns 503 until the cluster has been verified ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve health and metrics endpoints on `addr` until the task is dropped.
pub async fn run_health_server(
    addr: SocketAddr,
    state: Arc<HealthState>,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    info!(%addr, "Starting health server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
