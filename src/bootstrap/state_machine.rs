//! Formal finite state machine for cluster formation.
//!
//! Every phase change of a run goes through [`BootstrapStateMachine`]. The
//! transition table only contains legal orderings, so joining a worker
//! before the control plane is complete, or re-initializing a formed
//! primary, has no transition to fire. Guards additionally check the
//! run's progress counters (e.g. a join may not start while the previous
//! node has not reached Ready).
//!
//! ## Forward path
//! Uninitialized → PrimaryInitializing → PrimaryReady →
//! ControlPlaneJoining (×N) → ControlPlaneComplete → WorkerJoining (×M) →
//! WorkersComplete → ClusterReady → AddonsComplete
//!
//! An already-initialized primary skips `PrimaryInitializing`. `Aborted`
//! is reachable from every non-terminal phase.

use std::fmt;

use crate::inventory::BootstrapPhase;

/// Events that trigger phase transitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BootstrapEvent {
    /// `kubeadm init` is about to run on the designated primary
    InitializePrimary,
    /// The primary already carries the initialized-cluster marker
    ExistingClusterDetected,
    /// The primary's API server answers and the node is Ready
    PrimaryHealthy,
    /// A secondary control-plane join is about to start
    ControlPlaneJoinStarted,
    /// Every control-plane node is a Ready member
    ControlPlaneFormed,
    /// A worker join is about to start
    WorkerJoinStarted,
    /// Every worker joined or was flagged failed
    WorkersSettled,
    /// Node count matches the topology and all nodes are Ready
    ClusterVerified,
    /// Every enabled add-on is installed
    AddonsInstalled,
    /// A fatal error stops forward progress
    Abort,
}

impl BootstrapEvent {
    pub const ALL: [BootstrapEvent; 10] = [
        BootstrapEvent::InitializePrimary,
        BootstrapEvent::ExistingClusterDetected,
        BootstrapEvent::PrimaryHealthy,
        BootstrapEvent::ControlPlaneJoinStarted,
        BootstrapEvent::ControlPlaneFormed,
        BootstrapEvent::WorkerJoinStarted,
        BootstrapEvent::WorkersSettled,
        BootstrapEvent::ClusterVerified,
        BootstrapEvent::AddonsInstalled,
        BootstrapEvent::Abort,
    ];
}

impl fmt::Display for BootstrapEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapEvent::InitializePrimary => write!(f, "InitializePrimary"),
            BootstrapEvent::ExistingClusterDetected => write!(f, "ExistingClusterDetected"),
            BootstrapEvent::PrimaryHealthy => write!(f, "PrimaryHealthy"),
            BootstrapEvent::ControlPlaneJoinStarted => write!(f, "ControlPlaneJoinStarted"),
            BootstrapEvent::ControlPlaneFormed => write!(f, "ControlPlaneFormed"),
            BootstrapEvent::WorkerJoinStarted => write!(f, "WorkerJoinStarted"),
            BootstrapEvent::WorkersSettled => write!(f, "WorkersSettled"),
            BootstrapEvent::ClusterVerified => write!(f, "ClusterVerified"),
            BootstrapEvent::AddonsInstalled => write!(f, "AddonsInstalled"),
            BootstrapEvent::Abort => write!(f, "Abort"),
        }
    }
}

/// Progress counters consulted by transition guards
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// The node the event concerns is the designated primary
    pub target_is_primary: bool,
    /// Readiness of the primary has been confirmed
    pub primary_ready: bool,
    /// Node whose join has started but not yet reached Ready
    pub join_in_flight: Option<String>,
    pub control_planes_expected: usize,
    /// Control-plane members, including the primary
    pub control_planes_joined: usize,
    pub workers_expected: usize,
    /// Workers that joined, were already members, or were flagged failed
    pub workers_settled: usize,
    pub nodes_expected: usize,
    pub nodes_ready: usize,
    pub addons_expected: usize,
    pub addons_installed: usize,
}

impl TransitionContext {
    /// Create a context for a topology of the given shape
    pub fn new(control_planes: usize, workers: usize) -> Self {
        Self {
            control_planes_expected: control_planes,
            workers_expected: workers,
            nodes_expected: control_planes + workers,
            ..Default::default()
        }
    }

    pub fn all_control_planes_joined(&self) -> bool {
        self.control_planes_joined >= self.control_planes_expected
            && self.control_planes_expected > 0
    }

    pub fn all_workers_settled(&self) -> bool {
        self.workers_settled >= self.workers_expected
    }

    pub fn all_nodes_ready(&self) -> bool {
        self.nodes_ready >= self.nodes_expected && self.nodes_expected > 0
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: BootstrapPhase,
    pub to: BootstrapPhase,
    pub event: BootstrapEvent,
    /// Human-readable description of this transition
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: BootstrapPhase,
        to: BootstrapPhase,
        event: BootstrapEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: BootstrapPhase,
        to: BootstrapPhase,
        event: BootstrapEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: BootstrapPhase,
        event: BootstrapEvent,
    },
    GuardFailed {
        from: BootstrapPhase,
        to: BootstrapPhase,
        event: BootstrapEvent,
        reason: String,
    },
}

/// State machine for cluster formation
pub struct BootstrapStateMachine {
    transitions: Vec<Transition>,
}

impl Default for BootstrapStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapStateMachine {
    /// Create a new state machine with the formation transition table
    pub fn new() -> Self {
        use BootstrapEvent as E;
        use BootstrapPhase as P;

        let mut transitions = vec![
            // ========================================
            // Primary
            // ========================================
            Transition::new(
                P::Uninitialized,
                P::PrimaryInitializing,
                E::InitializePrimary,
                "Initializing the designated primary",
            ),
            Transition::new(
                P::Uninitialized,
                P::PrimaryReady,
                E::ExistingClusterDetected,
                "Primary already initialized, skipping init",
            ),
            Transition::new(
                P::PrimaryInitializing,
                P::PrimaryReady,
                E::PrimaryHealthy,
                "Primary API server ready",
            ),
            // ========================================
            // Control plane
            // ========================================
            Transition::new(
                P::PrimaryReady,
                P::ControlPlaneJoining,
                E::ControlPlaneJoinStarted,
                "Joining first secondary control-plane node",
            ),
            Transition::new(
                P::ControlPlaneJoining,
                P::ControlPlaneJoining,
                E::ControlPlaneJoinStarted,
                "Joining next control-plane node",
            ),
            Transition::new(
                P::PrimaryReady,
                P::ControlPlaneComplete,
                E::ControlPlaneFormed,
                "Control plane already complete",
            ),
            Transition::new(
                P::ControlPlaneJoining,
                P::ControlPlaneComplete,
                E::ControlPlaneFormed,
                "All control-plane nodes joined",
            ),
            // ========================================
            // Workers
            // ========================================
            Transition::new(
                P::ControlPlaneComplete,
                P::WorkerJoining,
                E::WorkerJoinStarted,
                "Joining first worker",
            ),
            Transition::new(
                P::WorkerJoining,
                P::WorkerJoining,
                E::WorkerJoinStarted,
                "Joining next worker",
            ),
            Transition::new(
                P::ControlPlaneComplete,
                P::WorkersComplete,
                E::WorkersSettled,
                "No worker joins needed",
            ),
            Transition::new(
                P::WorkerJoining,
                P::WorkersComplete,
                E::WorkersSettled,
                "All worker joins settled",
            ),
            // ========================================
            // Verification and add-ons
            // ========================================
            Transition::new(
                P::WorkersComplete,
                P::ClusterReady,
                E::ClusterVerified,
                "Cluster topology verified Ready",
            ),
            Transition::new(
                P::ClusterReady,
                P::AddonsComplete,
                E::AddonsInstalled,
                "All add-ons installed",
            ),
        ];

        // ========================================
        // Abort from every non-terminal phase
        // ========================================
        transitions.extend(
            BootstrapPhase::ALL
                .iter()
                .filter(|p| !p.is_terminal())
                .map(|p| Transition::new(*p, P::Aborted, E::Abort, "Run aborted")),
        );

        Self { transitions }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: &BootstrapPhase,
        event: BootstrapEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &BootstrapPhase, event: &BootstrapEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: &BootstrapPhase) -> Vec<&BootstrapEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    /// Check guard conditions for a transition
    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match &transition.event {
            BootstrapEvent::InitializePrimary | BootstrapEvent::ExistingClusterDetected => {
                if !ctx.target_is_primary {
                    Some("only the designated primary can form the cluster".to_string())
                } else {
                    None
                }
            }
            BootstrapEvent::PrimaryHealthy => {
                if !ctx.primary_ready {
                    Some("primary readiness has not been confirmed".to_string())
                } else {
                    None
                }
            }
            // Guard: one join at a time, each must reach Ready first
            BootstrapEvent::ControlPlaneJoinStarted | BootstrapEvent::WorkerJoinStarted => ctx
                .join_in_flight
                .as_ref()
                .map(|node| format!("join of {} has not reached Ready", node)),
            BootstrapEvent::ControlPlaneFormed => {
                if !ctx.all_control_planes_joined() {
                    Some(format!(
                        "{}/{} control-plane nodes joined",
                        ctx.control_planes_joined, ctx.control_planes_expected
                    ))
                } else {
                    None
                }
            }
            BootstrapEvent::WorkersSettled => {
                if !ctx.all_workers_settled() {
                    Some(format!(
                        "{}/{} workers settled",
                        ctx.workers_settled, ctx.workers_expected
                    ))
                } else {
                    None
                }
            }
            BootstrapEvent::ClusterVerified => {
                if !ctx.all_nodes_ready() {
                    Some(format!(
                        "{}/{} nodes Ready",
                        ctx.nodes_ready, ctx.nodes_expected
                    ))
                } else {
                    None
                }
            }
            BootstrapEvent::AddonsInstalled => {
                if ctx.addons_installed < ctx.addons_expected {
                    Some(format!(
                        "{}/{} add-ons installed",
                        ctx.addons_installed, ctx.addons_expected
                    ))
                } else {
                    None
                }
            }
            BootstrapEvent::Abort => None,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;

    fn primary_ctx() -> TransitionContext {
        TransitionContext {
            target_is_primary: true,
            ..TransitionContext::new(3, 3)
        }
    }

    #[test]
    fn test_uninitialized_to_primary_initializing() {
        let sm = BootstrapStateMachine::new();
        let result = sm.transition(
            &BootstrapPhase::Uninitialized,
            BootstrapEvent::InitializePrimary,
            &primary_ctx(),
        );
        match result {
            TransitionResult::Success { from, to, .. } => {
                assert_eq!(from, BootstrapPhase::Uninitialized);
                assert_eq!(to, BootstrapPhase::PrimaryInitializing);
            }
            _ => panic!("Expected successful transition"),
        }
    }

    #[test]
    fn test_existing_cluster_skips_init() {
        let sm = BootstrapStateMachine::new();
        let result = sm.transition(
            &BootstrapPhase::Uninitialized,
            BootstrapEvent::ExistingClusterDetected,
            &primary_ctx(),
        );
        match result {
            TransitionResult::Success { to, .. } => assert_eq!(to, BootstrapPhase::PrimaryReady),
            _ => panic!("Expected transition to PrimaryReady"),
        }
    }

    #[test]
    fn test_init_requires_primary() {
        let sm = BootstrapStateMachine::new();
        let ctx = TransitionContext::new(3, 3);
        let result = sm.transition(
            &BootstrapPhase::Uninitialized,
            BootstrapEvent::InitializePrimary,
            &ctx,
        );
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));
    }

    #[test]
    fn test_no_reinitialization_once_ready() {
        let sm = BootstrapStateMachine::new();
        for phase in BootstrapPhase::ALL {
            if phase == BootstrapPhase::Uninitialized {
                continue;
            }
            assert!(
                !sm.can_transition(&phase, &BootstrapEvent::InitializePrimary),
                "InitializePrimary must not fire from {}",
                phase
            );
        }
    }

    #[test]
    fn test_primary_healthy_guard() {
        let sm = BootstrapStateMachine::new();
        let mut ctx = primary_ctx();
        let result = sm.transition(
            &BootstrapPhase::PrimaryInitializing,
            BootstrapEvent::PrimaryHealthy,
            &ctx,
        );
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        ctx.primary_ready = true;
        let result = sm.transition(
            &BootstrapPhase::PrimaryInitializing,
            BootstrapEvent::PrimaryHealthy,
            &ctx,
        );
        assert!(matches!(result, TransitionResult::Success { .. }));
    }

    #[test]
    fn test_join_blocked_while_previous_in_flight() {
        let sm = BootstrapStateMachine::new();
        let ctx = TransitionContext {
            join_in_flight: Some("ctrl-2".to_string()),
            ..TransitionContext::new(3, 3)
        };
        let result = sm.transition(
            &BootstrapPhase::ControlPlaneJoining,
            BootstrapEvent::ControlPlaneJoinStarted,
            &ctx,
        );
        match result {
            TransitionResult::GuardFailed { reason, .. } => assert!(reason.contains("ctrl-2")),
            _ => panic!("Expected guard failure"),
        }
    }

    #[test]
    fn test_worker_join_before_control_plane_complete_is_invalid() {
        let sm = BootstrapStateMachine::new();
        let ctx = TransitionContext::new(3, 3);
        for phase in [
            BootstrapPhase::Uninitialized,
            BootstrapPhase::PrimaryInitializing,
            BootstrapPhase::PrimaryReady,
            BootstrapPhase::ControlPlaneJoining,
        ] {
            let result = sm.transition(&phase, BootstrapEvent::WorkerJoinStarted, &ctx);
            assert!(
                matches!(result, TransitionResult::InvalidTransition { .. }),
                "worker join must be invalid from {}",
                phase
            );
        }
    }

    #[test]
    fn test_control_plane_formed_guard() {
        let sm = BootstrapStateMachine::new();
        let mut ctx = TransitionContext::new(3, 3);
        ctx.control_planes_joined = 2;
        let result = sm.transition(
            &BootstrapPhase::ControlPlaneJoining,
            BootstrapEvent::ControlPlaneFormed,
            &ctx,
        );
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        ctx.control_planes_joined = 3;
        let result = sm.transition(
            &BootstrapPhase::ControlPlaneJoining,
            BootstrapEvent::ControlPlaneFormed,
            &ctx,
        );
        match result {
            TransitionResult::Success { to, .. } => {
                assert_eq!(to, BootstrapPhase::ControlPlaneComplete)
            }
            _ => panic!("Expected transition to ControlPlaneComplete"),
        }
    }

    #[test]
    fn test_cluster_verified_guard() {
        let sm = BootstrapStateMachine::new();
        let mut ctx = TransitionContext::new(3, 3);
        ctx.nodes_ready = 5;
        let result = sm.transition(
            &BootstrapPhase::WorkersComplete,
            BootstrapEvent::ClusterVerified,
            &ctx,
        );
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        ctx.nodes_ready = 6;
        let result = sm.transition(
            &BootstrapPhase::WorkersComplete,
            BootstrapEvent::ClusterVerified,
            &ctx,
        );
        assert!(matches!(result, TransitionResult::Success { .. }));
    }

    #[test]
    fn test_abort_from_any_non_terminal_state() {
        let sm = BootstrapStateMachine::new();
        for phase in BootstrapPhase::ALL {
            assert_eq!(
                sm.can_transition(&phase, &BootstrapEvent::Abort),
                !phase.is_terminal(),
                "Abort from {}",
                phase
            );
        }
    }

    #[test]
    fn test_terminal_states_have_no_events() {
        let sm = BootstrapStateMachine::new();
        assert!(sm.valid_events(&BootstrapPhase::Aborted).is_empty());
        assert!(sm.valid_events(&BootstrapPhase::AddonsComplete).is_empty());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(
            format!("{}", BootstrapEvent::ControlPlaneJoinStarted),
            "ControlPlaneJoinStarted"
        );
        assert_eq!(format!("{}", BootstrapEvent::Abort), "Abort");
    }
}
