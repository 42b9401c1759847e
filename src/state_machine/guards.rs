use super::errors::{guard_failed, StateMachineResult};
use super::events::ProcessEvent;
use crate::models::Task;

/// Trait for implementing state transition guards
pub trait StateGuard<T: ?Sized> {
    /// Check if a transition is allowed
    fn check(&self, subject: &T) -> StateMachineResult<()>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// Terminate, reject and cancel must say why
pub struct ReasonRequiredGuard;

impl StateGuard<ProcessEvent> for ReasonRequiredGuard {
    fn check(&self, event: &ProcessEvent) -> StateMachineResult<()> {
        match event {
            ProcessEvent::Terminate(reason)
            | ProcessEvent::Reject(reason)
            | ProcessEvent::Cancel(reason)
                if reason.trim().is_empty() =>
            {
                Err(guard_failed(
                    self.description(),
                    format!("{} requires a non-empty reason", event.event_type()),
                ))
            }
            _ => Ok(()),
        }
    }

    fn description(&self) -> &'static str {
        "Terminal process transitions must carry a reason"
    }
}

/// A task can only be (re)assigned when it has someone to assign it to
pub struct AssigneesPresentGuard;

impl StateGuard<Task> for AssigneesPresentGuard {
    fn check(&self, task: &Task) -> StateMachineResult<()> {
        if task.assignees.iter().any(|assignee| assignee.trim().is_empty()) {
            return Err(guard_failed(
                self.description(),
                format!("task {} has a blank assignee", task.task_id),
            ));
        }
        if task.assignees.is_empty() {
            return Err(guard_failed(
                self.description(),
                format!("task {} has no assignees", task.task_id),
            ));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Task must have at least one assignee"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_guard() {
        assert!(ReasonRequiredGuard.check(&ProcessEvent::Cancel("dup".into())).is_ok());
        assert!(ReasonRequiredGuard.check(&ProcessEvent::Reject(String::new())).is_err());
        assert!(ReasonRequiredGuard.check(&ProcessEvent::Suspend(None)).is_ok());
    }
}
