//! Error types shared across the fleet crates.

use thiserror::Error;

use crate::types::{NodeId, NodeState};

/// Result type alias for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors that can occur during fleet operations.
///
/// A short reservation is not an error; see `Reservation::Partial` in the
/// core crate.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("registration failed: unknown node source {0}")]
    Registration(String),

    #[error("acquisition failed in source {source_name}: {reason}")]
    Acquisition { source_name: String, reason: String },

    #[error("inconsistent transition for {node}: {from} -> {to}")]
    InconsistentTransition {
        node: NodeId,
        from: NodeState,
        to: NodeState,
    },

    #[error("boundary violation: {0}")]
    BoundaryViolation(String),

    #[error("node already registered: {0}")]
    DuplicateNode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("unknown node source: {0}")]
    UnknownSource(String),

    #[error("node source already exists: {0}")]
    DuplicateSource(String),

    #[error("{operation} timed out")]
    Timeout { operation: String },

    #[error("backend error: {0}")]
    Backend(String),
}

impl FleetError {
    /// Whether a caller may retry the operation later.
    ///
    /// Permission and boundary violations are final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FleetError::Acquisition { .. } | FleetError::Timeout { .. } | FleetError::Backend(_)
        )
    }
}
