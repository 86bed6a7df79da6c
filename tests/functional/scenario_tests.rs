//! End-to-end bootstrap scenarios against the mock world.
//!
//! Every test runs on a paused tokio clock, so readiness polling and
//! retry backoff complete instantly while still exercising the real
//! timeout arithmetic.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use jiff::{SignedDuration, Timestamp};

use crate::mock_agents::*;
use ha_bootstrap::bootstrap::{
    AddonGate, BootstrapEvent, BootstrapSequencer, Context, CredentialSource, Error, RunSettings,
};
use ha_bootstrap::health::HealthState;
use ha_bootstrap::inventory::{AddonSpec, BootstrapConfig, BootstrapPhase, PhaseStatus};
use ha_bootstrap::{Plan, preflight, run_bootstrap};

/// Catalog subset listed out of dependency order on purpose.
fn platform_addons() -> Vec<AddonSpec> {
    vec![
        AddonSpec::new(
            "ingress-nginx",
            "4.11.2",
            "ingress-nginx/ingress-nginx",
            "ingress-nginx",
        )
        .depends_on(["metallb", "cert-manager"]),
        AddonSpec::new("metallb", "0.14.8", "metallb/metallb", "metallb-system")
            .depends_on(["cni"]),
        AddonSpec::new(
            "cni",
            "v3.28.1",
            "projectcalico/tigera-operator",
            "tigera-operator",
        ),
        AddonSpec::new(
            "cert-manager",
            "v1.15.3",
            "jetstack/cert-manager",
            "cert-manager",
        )
        .depends_on(["cni"]),
    ]
}

fn sequencer(world: &MockWorld, config: &BootstrapConfig) -> BootstrapSequencer {
    let plan = preflight(config).unwrap();
    sequencer_for(world, config, plan)
}

fn sequencer_for(world: &MockWorld, config: &BootstrapConfig, plan: Plan) -> BootstrapSequencer {
    BootstrapSequencer::new(context(world, config), plan.topology)
        .with_failover(plan.coordinator, plan.failover)
}

fn status(seq: &BootstrapSequencer, id: &str) -> Option<PhaseStatus> {
    seq.topology().status_of(id)
}

// ============================================================================
// Full runs
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_end_to_end_three_control_planes_three_workers() {
    let world = MockWorld::new();
    let mut config = config(3, 3);
    config.addons = Some(platform_addons());

    let plan = preflight(&config).unwrap();
    let report = run_bootstrap(plan, context(&world, &config)).await;

    assert_eq!(report.phase, BootstrapPhase::AddonsComplete);
    assert!(report.is_success());
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(
        world.formation_trace(),
        vec![
            "init(ctrl-1)",
            "join(ctrl-2)",
            "join(ctrl-3)",
            "join(work-1)",
            "join(work-2)",
            "join(work-3)",
            "install(cni)",
            "install(metallb)",
            "install(cert-manager)",
            "install(ingress-nginx)",
        ]
    );
    assert!(
        report
            .nodes
            .iter()
            .all(|n| n.phase_status == PhaseStatus::Joined)
    );
    assert_eq!(report.credential_source, Some(CredentialSource::Generated));

    let priorities: Vec<Option<u8>> = report.nodes.iter().map(|n| n.vip_priority).collect();
    assert_eq!(
        priorities,
        vec![Some(150), Some(140), Some(130), None, None, None]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failover_is_configured_before_any_cluster_mutation() {
    let world = MockWorld::new();
    let config = config(3, 1);
    let mut seq = sequencer(&world, &config);
    seq.run().await.unwrap();

    let calls = world.calls();
    let first_init = calls
        .iter()
        .position(|c| matches!(c, Call::Init(_)))
        .unwrap();
    let failover: Vec<&Call> = calls
        .iter()
        .take(first_init)
        .filter(|c| matches!(c, Call::ConfigureFailover { .. }))
        .collect();
    assert_eq!(failover.len(), 3);
    assert!(
        failover
            .iter()
            .all(|c| matches!(c, Call::ConfigureFailover { changed: true, .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_joins_use_the_primary_credentials() {
    let world = MockWorld::new();
    let config = config(2, 1);
    let mut seq = sequencer(&world, &config);
    seq.run().await.unwrap();

    let init_token = world
        .state()
        .stored
        .as_ref()
        .map(|s| s.join_token.expose().to_string())
        .unwrap();
    for call in world.calls() {
        if let Call::Join { token, .. } = call {
            assert_eq!(token, init_token);
        }
    }
    assert!(
        !world
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Publish { .. })),
        "credentials from init are not re-published"
    );
    let joins: Vec<(String, bool)> = world
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Join {
                node, control_plane, ..
            } => Some((node, control_plane)),
            _ => None,
        })
        .collect();
    assert_eq!(
        joins,
        vec![("ctrl-2".to_string(), true), ("work-1".to_string(), false)]
    );
}

// ============================================================================
// Idempotence
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rerun_on_ready_cluster_makes_no_mutating_calls() {
    let world = MockWorld::new();
    let config = config(3, 3);

    let mut first = sequencer(&world, &config);
    first.run().await.unwrap();
    assert_eq!(first.phase(), BootstrapPhase::ClusterReady);

    world.clear_calls();
    let mut second = sequencer(&world, &config);
    second.run().await.unwrap();

    assert_eq!(second.phase(), BootstrapPhase::ClusterReady);
    assert!(
        world.mutating_calls().is_empty(),
        "unexpected mutations: {:?}",
        world.mutating_calls()
    );
    assert_eq!(second.state().credential_source(), None);

    let events: Vec<&str> = second.history().iter().map(|t| t.event.as_str()).collect();
    assert_eq!(
        events,
        vec![
            "ExistingClusterDetected",
            "ControlPlaneFormed",
            "WorkersSettled",
            "ClusterVerified"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_rerun_after_control_plane_abort_resumes() {
    let world = MockWorld::new().failing_join("ctrl-3", u32::MAX);
    let config = config(3, 2);

    let mut first = sequencer(&world, &config);
    assert!(first.run().await.is_err());
    assert_eq!(first.phase(), BootstrapPhase::Aborted);

    // Operator fixed ctrl-3.
    world.state().join_failures.clear();
    world.clear_calls();

    let mut second = sequencer(&world, &config);
    second.run().await.unwrap();
    assert_eq!(second.phase(), BootstrapPhase::ClusterReady);
    assert_eq!(world.joins(), vec!["ctrl-3", "work-1", "work-2"]);
    assert!(
        !world.calls().iter().any(|c| matches!(c, Call::Init(_))),
        "primary is never re-initialized"
    );
    assert_eq!(
        second.state().credential_source(),
        Some(CredentialSource::Reused)
    );
}

// ============================================================================
// Sequential joins
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_control_plane_joins_are_strictly_sequential() {
    let world = MockWorld::new().slow_joins(Duration::from_secs(20), 3);
    let config = config(3, 2);

    let mut seq = sequencer(&world, &config);
    seq.run().await.unwrap();

    let s = world.state();
    assert_eq!(s.max_joins_in_flight, 1);
    assert!(
        s.overlapping_joins.is_empty(),
        "join started while earlier nodes were not Ready: {:?}",
        s.overlapping_joins
    );
    drop(s);
    assert_eq!(world.joins(), vec!["ctrl-2", "ctrl-3", "work-1", "work-2"]);
    assert_eq!(seq.phase(), BootstrapPhase::ClusterReady);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_worker_timeout_is_isolated() {
    let world = MockWorld::new().never_ready("work-2");
    let config = config(3, 3);

    let mut seq = sequencer(&world, &config);
    seq.run().await.unwrap();

    assert_eq!(seq.phase(), BootstrapPhase::WorkersComplete);
    assert_eq!(status(&seq, "work-1"), Some(PhaseStatus::Joined));
    assert_eq!(status(&seq, "work-2"), Some(PhaseStatus::Failed));
    assert_eq!(status(&seq, "work-3"), Some(PhaseStatus::Joined));
    assert_eq!(
        world.joins(),
        vec!["ctrl-2", "ctrl-3", "work-1", "work-2", "work-3"]
    );

    let errors = seq.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].node.as_deref(), Some("work-2"));
    assert_eq!(errors[0].kind, "BootstrapTimeoutError");
    assert!(!errors[0].fatal);
}

#[tokio::test(start_paused = true)]
async fn test_failed_worker_blocks_addons() {
    let world = MockWorld::new().failing_join("work-1", u32::MAX);
    let mut config = config(3, 2);
    config.addons = Some(platform_addons());

    let plan = preflight(&config).unwrap();
    let report = run_bootstrap(plan, context(&world, &config)).await;

    assert_eq!(report.phase, BootstrapPhase::WorkersComplete);
    assert!(report.addons.is_none());
    assert!(world.installs().is_empty());
    assert_eq!(
        report.failed_nodes().map(|n| n.id.as_str()).collect::<Vec<_>>(),
        vec!["work-1"]
    );
    assert_eq!(report.errors[0].kind, "JoinFailure");

    let hints = report.hints();
    let hinted: Vec<&str> = hints.iter().map(|(target, _)| target.as_str()).collect();
    assert!(hinted.contains(&"work-1"));
    assert!(hinted.contains(&"test"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_worker_failure_is_retried() {
    let world = MockWorld::new().failing_join("work-2", 1);
    let config = config(1, 3);

    let mut seq = sequencer(&world, &config);
    seq.run().await.unwrap();

    assert_eq!(seq.phase(), BootstrapPhase::ClusterReady);
    assert_eq!(status(&seq, "work-2"), Some(PhaseStatus::Joined));
    assert_eq!(world.joins(), vec!["work-1", "work-2", "work-2", "work-3"]);
    assert!(seq.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_control_plane_failure_aborts_before_workers() {
    let world = MockWorld::new().failing_join("ctrl-2", u32::MAX);
    let config = config(3, 3);

    let mut seq = sequencer(&world, &config);
    let err = seq.run().await.unwrap_err();

    assert!(matches!(err, Error::JoinFailure { ref node, .. } if node == "ctrl-2"));
    assert_eq!(seq.phase(), BootstrapPhase::Aborted);
    assert_eq!(status(&seq, "ctrl-2"), Some(PhaseStatus::Failed));
    assert_eq!(status(&seq, "ctrl-3"), Some(PhaseStatus::Pending));
    assert!(
        world.joins().iter().all(|n| n == "ctrl-2"),
        "no join after the failed control plane: {:?}",
        world.joins()
    );

    let last = seq.errors().last().unwrap();
    assert!(last.fatal);
    assert_eq!(last.phase, BootstrapPhase::ControlPlaneJoining);
    assert_eq!(
        seq.history().last().map(|t| t.event.as_str()),
        Some("Abort")
    );
}

#[tokio::test(start_paused = true)]
async fn test_primary_init_failure_aborts() {
    let world = MockWorld::new().failing_init();
    let config = config(3, 1);

    let mut seq = sequencer(&world, &config);
    let err = seq.run().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Agent {
            operation: "init_primary",
            ..
        }
    ));
    assert_eq!(seq.phase(), BootstrapPhase::Aborted);
    assert_eq!(status(&seq, "ctrl-1"), Some(PhaseStatus::Failed));
    assert!(world.joins().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_primary_never_ready_times_out() {
    let world = MockWorld::new().never_ready("ctrl-1");
    let config = config(3, 0);

    let mut seq = sequencer(&world, &config);
    let err = seq.run().await.unwrap_err();

    match err {
        Error::BootstrapTimeout { node, phase, waited } => {
            assert_eq!(node, "ctrl-1");
            assert_eq!(phase, BootstrapPhase::PrimaryInitializing);
            assert!(waited >= Duration::from_secs(60));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(seq.phase(), BootstrapPhase::Aborted);
    assert!(world.joins().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_vip_failure_aborts_without_touching_the_cluster() {
    let world = MockWorld::new().failing_failover("ctrl-2");
    let config = config(3, 1);

    let mut seq = sequencer(&world, &config);
    let err = seq.run().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Agent {
            operation: "configure_failover",
            ..
        }
    ));
    assert_eq!(seq.phase(), BootstrapPhase::Aborted);
    assert!(
        world
            .mutating_calls()
            .iter()
            .all(|c| matches!(c, Call::ConfigureFailover { .. }))
    );
}

// ============================================================================
// Credentials
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_valid_stored_credentials_are_reused_verbatim() {
    let world = MockWorld::new();
    let mut seq = sequencer(&world, &config(2, 0));
    seq.run().await.unwrap();
    let original = world.state().stored.clone().unwrap();

    // Second run adds a worker.
    world.clear_calls();
    let mut second = sequencer(&world, &config(2, 1));
    second.run().await.unwrap();

    assert_eq!(
        second.state().credential_source(),
        Some(CredentialSource::Reused)
    );
    assert!(!world.calls().iter().any(|c| matches!(c, Call::Publish { .. })));
    let token = world
        .calls()
        .into_iter()
        .find_map(|c| match c {
            Call::Join { token, .. } => Some(token),
            _ => None,
        })
        .unwrap();
    assert_eq!(token, original.join_token.expose());
    assert_eq!(world.state().stored.as_ref(), Some(&original));
}

#[tokio::test(start_paused = true)]
async fn test_expired_credentials_are_regenerated() {
    let expired = Timestamp::now()
        .checked_sub(SignedDuration::from_hours(1))
        .unwrap();
    let world = MockWorld::new()
        .with_existing_cluster(&["ctrl-1", "ctrl-2"])
        .with_stored_credentials(stored_credentials("abcdef.0123456789abcdef", expired));

    let mut seq = sequencer(&world, &config(2, 1));
    seq.run().await.unwrap();

    assert_eq!(
        seq.state().credential_source(),
        Some(CredentialSource::Regenerated)
    );
    let published = world
        .calls()
        .into_iter()
        .find_map(|c| match c {
            Call::Publish { token } => Some(token),
            _ => None,
        })
        .unwrap();
    assert_ne!(published, "abcdef.0123456789abcdef");
    assert!(world.calls().contains(&Call::Join {
        node: "work-1".into(),
        control_plane: false,
        token: published,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_credentials_inside_renewal_margin_are_regenerated() {
    let soon = Timestamp::now()
        .checked_add(SignedDuration::from_mins(5))
        .unwrap();
    let world = MockWorld::new()
        .with_existing_cluster(&["ctrl-1"])
        .with_stored_credentials(stored_credentials("abcdef.0123456789abcdef", soon));

    let mut seq = sequencer(&world, &config(1, 1));
    seq.run().await.unwrap();

    assert_eq!(
        seq.state().credential_source(),
        Some(CredentialSource::Regenerated)
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_record_on_existing_primary_is_generated() {
    let world = MockWorld::new().with_existing_cluster(&["ctrl-1"]);

    let mut seq = sequencer(&world, &config(1, 2));
    seq.run().await.unwrap();

    assert_eq!(
        seq.state().credential_source(),
        Some(CredentialSource::Generated)
    );
    let publishes = world
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Publish { .. }))
        .count();
    assert_eq!(publishes, 1, "one bundle serves every join of the run");
}

// ============================================================================
// Add-on gate
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_addon_failure_blocks_dependents_only() {
    let world = MockWorld::new().failing_addon("metallb");
    let mut config = config(1, 1);
    config.addons = Some(platform_addons());

    let plan = preflight(&config).unwrap();
    let report = run_bootstrap(plan, context(&world, &config)).await;

    assert_eq!(report.phase, BootstrapPhase::ClusterReady);
    let addons = report.addons.as_ref().unwrap();
    assert_eq!(addons.installed, vec!["cni", "cert-manager"]);
    assert_eq!(addons.failed.len(), 1);
    assert_eq!(addons.failed[0].name, "metallb");
    assert_eq!(addons.blocked.len(), 1);
    assert_eq!(addons.blocked[0].name, "ingress-nginx");
    assert_eq!(addons.blocked[0].waiting_on, vec!["metallb"]);
    assert!(!world.installs().contains(&"ingress-nginx".to_string()));

    let kinds: BTreeSet<&str> = report.errors.iter().map(|e| e.kind.as_str()).collect();
    assert!(kinds.contains("AddonInstallFailure"));
    assert!(kinds.contains("AddonBlocked"));
    assert!(report.errors.iter().all(|e| !e.fatal));
}

#[tokio::test(start_paused = true)]
async fn test_addon_cycle_rejected_before_any_call() {
    let world = MockWorld::new();
    let mut config = config(1, 0);
    config.addons = Some(vec![
        AddonSpec::new("a", "1.0.0", "repo/a", "a").depends_on(["b"]),
        AddonSpec::new("b", "1.0.0", "repo/b", "b").depends_on(["a"]),
    ]);

    let err = preflight(&config).unwrap_err();
    assert!(matches!(err, Error::AddonDependency(_)));
    assert!(err.is_configuration());
    assert!(world.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_addon_gate_refuses_before_cluster_ready() {
    let world = MockWorld::new();
    let config = config(1, 0);
    let ctx = context(&world, &config);
    let mut gate = AddonGate::new(platform_addons()).unwrap();

    let err = gate
        .install(
            &ctx,
            BootstrapPhase::WorkersComplete,
            BTreeSet::from(["ctrl-1".to_string()]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            event: BootstrapEvent::AddonsInstalled,
            ..
        }
    ));
    assert!(world.installs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_addon_gate_rechecks_cluster_readiness() {
    let world = MockWorld::new().with_existing_cluster(&["ctrl-1"]);
    let config = config(1, 0);
    let ctx = context(&world, &config);
    let mut gate = AddonGate::new(platform_addons()).unwrap();

    world.state().registered.insert("ctrl-1".into(), u32::MAX);
    let err = gate
        .install(
            &ctx,
            BootstrapPhase::ClusterReady,
            BTreeSet::from(["ctrl-1".to_string()]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BootstrapTimeout { .. }));
    assert!(world.installs().is_empty());
}

// ============================================================================
// Metrics and readiness flag
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_health_state_follows_the_run() {
    let world = MockWorld::new();
    let config = config(1, 1);
    let health = Arc::new(HealthState::new());
    let mut settings = RunSettings::from_config(&config);
    settings.retry = fast_retry();
    let ctx = Arc::new(Context::new(
        Arc::new(world.clone()),
        Arc::new(world.clone()),
        Arc::new(world.clone()),
        settings,
        Some(health.clone()),
    ));

    let plan = preflight(&config).unwrap();
    assert!(!health.is_ready().await);
    let report = run_bootstrap(plan, ctx).await;

    assert!(report.is_success());
    assert!(health.is_ready().await);
    let metrics = health.metrics.encode();
    assert!(metrics.contains(r#"ha_bootstrap_current_phase{phase="addons_complete"} 1"#));
    assert!(metrics.contains(r#"role="worker",outcome="joined""#));
}
