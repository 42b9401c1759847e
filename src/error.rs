//! # Error Taxonomy
//!
//! Crate-wide error type for the orchestration core. Module-local errors
//! (state machine, expressions, storage, configuration) fold into
//! [`WorkflowError`] so that every public operation returns a single
//! [`Result`] type.
//!
//! Propagation policy:
//! - `Validation`, `NotFound` and `InvalidStateTransition` are terminal for the
//!   request and nothing has been mutated when they are returned.
//! - `ConcurrencyConflict` is retryable (see [`WorkflowError::is_retryable`]).
//! - `RuleEvaluation` leaves the process Running with the node flagged for
//!   operator intervention.
//! - `Persistence` is propagated for primary state transitions; history and
//!   event writes treat it as log-and-continue.

use uuid::Uuid;

use crate::rules::ExpressionError;
use crate::state_machine::StateMachineError;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid state transition for {entity} {id}: cannot {action} from {from}")]
    InvalidStateTransition {
        entity: &'static str,
        id: String,
        from: String,
        action: String,
    },

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Rule evaluation failed for node {node_id}: {reason}")]
    RuleEvaluation { node_id: Uuid, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),
}

impl WorkflowError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        id: impl ToString,
        from: impl ToString,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidStateTransition {
            entity,
            id: id.to_string(),
            from: from.to_string(),
            action: action.into(),
        }
    }

    /// Whether the caller (or an internal bounded-retry wrapper) may retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }

    /// Short machine-readable code used in `error_info` event fields
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::RuleEvaluation { .. } => "rule_evaluation_error",
            Self::Persistence(_) => "persistence_error",
            Self::Configuration(_) => "configuration_error",
            Self::Expression(_) => "expression_error",
        }
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound {
                entity,
                id: id.to_string(),
            },
            StoreError::VersionConflict {
                entity,
                id,
                expected,
                actual,
            } => Self::ConcurrencyConflict(format!(
                "{entity} {id} was modified concurrently (expected version {expected}, found {actual})"
            )),
            StoreError::Duplicate { entity, id } => {
                Self::Validation(format!("{entity} {id} already exists"))
            }
            StoreError::InvalidCursor(cursor) => {
                Self::Validation(format!("invalid pagination cursor: {cursor}"))
            }
            StoreError::Backend(msg) => Self::Persistence(msg),
        }
    }
}

impl From<StateMachineError> for WorkflowError {
    fn from(err: StateMachineError) -> Self {
        match err {
            StateMachineError::InvalidTransition {
                entity,
                id,
                from,
                event,
            } => Self::InvalidStateTransition {
                entity,
                id: id.to_string(),
                from,
                action: event,
            },
            StateMachineError::GuardFailed { reason, .. } => Self::Validation(reason),
        }
    }
}

impl From<config::ConfigError> for WorkflowError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<crate::config::ConfigurationError> for WorkflowError {
    fn from(err: crate::config::ConfigurationError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
