use uuid::Uuid;

/// Errors raised while applying a state transition
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateMachineError {
    #[error("Invalid {entity} transition for {id}: {event} not allowed from {from}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        event: String,
    },

    #[error("Guard '{guard}' rejected transition: {reason}")]
    GuardFailed { guard: &'static str, reason: String },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

pub(crate) fn guard_failed(guard: &'static str, reason: impl Into<String>) -> StateMachineError {
    StateMachineError::GuardFailed {
        guard,
        reason: reason.into(),
    }
}
