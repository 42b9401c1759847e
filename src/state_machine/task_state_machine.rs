use chrono::{DateTime, Utc};

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::TaskEvent,
    guards::{AssigneesPresentGuard, StateGuard},
    states::TaskStatus,
};
use crate::models::Task;

/// Lifecycle transitions for an actor-facing task
pub struct TaskStateMachine<'a> {
    task: &'a mut Task,
}

impl<'a> TaskStateMachine<'a> {
    pub fn new(task: &'a mut Task) -> Self {
        Self { task }
    }

    pub fn current_state(&self) -> TaskStatus {
        self.task.status
    }

    pub fn transition(
        &mut self,
        event: TaskEvent,
        now: DateTime<Utc>,
    ) -> StateMachineResult<TaskStatus> {
        let current = self.task.status;
        let target = determine_target_state(current, event).ok_or_else(|| {
            StateMachineError::InvalidTransition {
                entity: "task",
                id: self.task.task_id,
                from: current.to_string(),
                event: event.event_type().to_string(),
            }
        })?;

        if matches!(event, TaskEvent::Assign | TaskEvent::Transfer) {
            AssigneesPresentGuard.check(&*self.task)?;
        }

        let task = &mut *self.task;
        task.status = target;
        task.updated_at = now;
        if event == TaskEvent::MarkOverdue && task.overdue_at.is_none() {
            task.overdue_at = Some(now);
        }
        if target.is_terminal() {
            task.completed_at = Some(now);
        }

        Ok(target)
    }
}

/// Determine the target state based on current state and event
pub fn determine_target_state(current: TaskStatus, event: TaskEvent) -> Option<TaskStatus> {
    use TaskStatus::*;

    let target = match (current, event) {
        (Created, TaskEvent::Assign) => Assigned,

        (Assigned | Delegated | Transferred | Overdue, TaskEvent::Complete) => Completed,
        (Assigned | Delegated | Transferred | Overdue, TaskEvent::Delegate) => Delegated,
        (Assigned | Delegated | Transferred | Overdue, TaskEvent::Transfer) => Transferred,

        // Overdue is informational; the task stays actionable
        (Assigned | Delegated | Transferred, TaskEvent::MarkOverdue) => Overdue,

        (from, TaskEvent::Withdraw) if from.is_open() => Withdrawn,
        (from, TaskEvent::Timeout) if from.is_open() => Timeout,
        (from, TaskEvent::Cancel) if from.is_open() => Cancelled,

        _ => return None,
    };

    Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ApprovalMode;
    use uuid::Uuid;

    fn task(assignees: &[&str]) -> Task {
        Task::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Approve",
            assignees.iter().map(|a| a.to_string()).collect(),
            ApprovalMode::Any,
            "alice",
            None,
        )
    }

    #[test]
    fn test_assign_requires_assignees() {
        let mut empty = task(&[]);
        let err = TaskStateMachine::new(&mut empty)
            .transition(TaskEvent::Assign, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StateMachineError::GuardFailed { .. }));
        assert_eq!(empty.status, TaskStatus::Created);
    }

    #[test]
    fn test_overdue_task_remains_actionable() {
        let mut task = task(&["bob"]);
        let mut machine = TaskStateMachine::new(&mut task);
        machine.transition(TaskEvent::Assign, Utc::now()).unwrap();
        let marked = Utc::now();
        machine.transition(TaskEvent::MarkOverdue, marked).unwrap();
        assert!(machine.transition(TaskEvent::MarkOverdue, Utc::now()).is_err());
        machine.transition(TaskEvent::Complete, Utc::now()).unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.overdue_at, Some(marked));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_closed_task_rejects_everything() {
        for status in [
            TaskStatus::Completed,
            TaskStatus::Withdrawn,
            TaskStatus::Timeout,
            TaskStatus::Cancelled,
        ] {
            for event in [
                TaskEvent::Assign,
                TaskEvent::Complete,
                TaskEvent::Delegate,
                TaskEvent::Transfer,
                TaskEvent::Withdraw,
                TaskEvent::MarkOverdue,
                TaskEvent::Timeout,
                TaskEvent::Cancel,
            ] {
                assert_eq!(determine_target_state(status, event), None);
            }
        }
    }

    #[test]
    fn test_created_task_can_be_cancelled_but_not_completed() {
        assert_eq!(
            determine_target_state(TaskStatus::Created, TaskEvent::Cancel),
            Some(TaskStatus::Cancelled)
        );
        assert_eq!(determine_target_state(TaskStatus::Created, TaskEvent::Complete), None);
    }
}
