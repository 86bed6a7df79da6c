//! Bootstrap orchestration core.
//!
//! - [`topology`] validates the inventory and picks the primary
//! - [`vip`] plans and configures the keepalived failover group
//! - [`credentials`] produces the join material
//! - [`sequencer`] and [`phases`] drive formation through the
//!   [`state_machine`]
//! - [`readiness`] gates every transition on observed health
//! - [`addons`] installs add-ons in dependency order once the cluster is ready

pub mod addons;
pub mod context;
pub mod credentials;
pub mod diagnostic_hints;
pub mod error;
mod phases;
pub mod readiness;
pub mod report;
pub mod sequencer;
pub mod state_machine;
pub mod topology;
pub mod vip;

pub use addons::{AddonGate, AddonReport};
pub use context::{Context, RunSettings};
pub use credentials::{CredentialBroker, CredentialBundle, CredentialSource, StoredCredentials};
pub use error::{Error, Result};
pub use phases::JoinOutcome;
pub use readiness::{Readiness, ReadinessTarget, ReadinessVerifier};
pub use report::BootstrapReport;
pub use sequencer::{BootstrapSequencer, ClusterFormationState, NodeError};
pub use state_machine::{BootstrapEvent, BootstrapStateMachine, TransitionContext};
pub use topology::{ApiEndpoint, ResolvedTopology, resolve};
pub use vip::{FailoverApply, FailoverInstance, VipCoordinator, VipFailoverGroup};
