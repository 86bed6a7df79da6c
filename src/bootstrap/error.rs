//! Error types for the bootstrap core.
//!
//! Errors are classified so the sequencer can decide whether a failure is
//! scoped to one worker or stops the whole run.

use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentError;
use crate::bootstrap::state_machine::BootstrapEvent;
use crate::inventory::{BootstrapPhase, NodeRole};

/// Error type for bootstrap operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid topology or configuration, detected before any remote call
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Missing, expired or malformed join credentials
    #[error("Credential error: {0}")]
    Credential(String),

    /// A readiness condition was not met within its budget
    #[error("Timed out after {waited:?} waiting for node {node} in phase {phase}")]
    BootstrapTimeout {
        node: String,
        phase: BootstrapPhase,
        waited: Duration,
    },

    /// The remote join command was rejected after exhausting retries
    #[error("Join of {role} node {node} failed: {source}")]
    JoinFailure {
        node: String,
        role: NodeRole,
        #[source]
        source: AgentError,
    },

    /// Cyclic or unsatisfiable add-on dependency graph
    #[error("Add-on dependency error: {0}")]
    AddonDependency(String),

    /// Any other remote operation failed after exhausting retries
    #[error("{operation} on node {node} failed: {source}")]
    Agent {
        node: String,
        operation: &'static str,
        #[source]
        source: AgentError,
    },

    /// The state machine has no transition for this event
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition {
        from: BootstrapPhase,
        event: BootstrapEvent,
    },

    /// A transition guard rejected the event
    #[error("Transition from {from} on {event} rejected: {reason}")]
    GuardFailed {
        from: BootstrapPhase,
        event: BootstrapEvent,
        reason: String,
    },

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors raised during pre-flight that never touched remote state.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::AddonDependency(_) | Error::ConfigParse(_)
        )
    }

    /// Whether re-running the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Credential(_)
            | Error::BootstrapTimeout { .. }
            | Error::JoinFailure { .. }
            | Error::Agent { .. }
            | Error::Io(_) => true,
            Error::Configuration(_)
            | Error::AddonDependency(_)
            | Error::InvalidTransition { .. }
            | Error::GuardFailed { .. }
            | Error::ConfigParse(_)
            | Error::Serialization(_) => false,
        }
    }

    /// Node the error is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Error::BootstrapTimeout { node, .. }
            | Error::JoinFailure { node, .. }
            | Error::Agent { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Stable machine-readable kind, used in reports and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) | Error::ConfigParse(_) => "ConfigurationError",
            Error::Credential(_) => "CredentialError",
            Error::BootstrapTimeout { .. } => "BootstrapTimeoutError",
            Error::JoinFailure { .. } => "JoinFailure",
            Error::AddonDependency(_) => "AddonDependencyError",
            Error::Agent { .. } => "AgentError",
            Error::InvalidTransition { .. } | Error::GuardFailed { .. } => "TransitionError",
            Error::Serialization(_) | Error::Io(_) => "InternalError",
        }
    }
}

/// Result type alias for bootstrap operations
pub type Result<T> = std::result::Result<T, Error>;
