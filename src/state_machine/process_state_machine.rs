use chrono::{DateTime, Utc};

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::ProcessEvent,
    guards::{ReasonRequiredGuard, StateGuard},
    states::ProcessStatus,
};
use crate::models::Process;

/// Lifecycle transitions for a process instance.
///
/// The machine is pure: it validates the event against the current status,
/// runs guards and applies the new status with its timestamps to the row.
/// Persisting the row is the caller's job.
pub struct ProcessStateMachine<'a> {
    process: &'a mut Process,
}

impl<'a> ProcessStateMachine<'a> {
    pub fn new(process: &'a mut Process) -> Self {
        Self { process }
    }

    pub fn current_state(&self) -> ProcessStatus {
        self.process.status
    }

    /// Check whether `event` is legal without mutating the process
    pub fn can_transition(&self, event: &ProcessEvent) -> bool {
        determine_target_state(self.process.status, event).is_some()
    }

    /// Attempt to transition the process state
    pub fn transition(
        &mut self,
        event: &ProcessEvent,
        now: DateTime<Utc>,
    ) -> StateMachineResult<ProcessStatus> {
        let current = self.process.status;
        let target = determine_target_state(current, event).ok_or_else(|| {
            StateMachineError::InvalidTransition {
                entity: "process",
                id: self.process.process_id,
                from: current.to_string(),
                event: event.event_type().to_string(),
            }
        })?;

        ReasonRequiredGuard.check(event)?;

        let process = &mut *self.process;
        process.status = target;
        process.updated_at = now;
        match event {
            ProcessEvent::Start => process.started_at = Some(now),
            ProcessEvent::Suspend(reason) => process.suspend_reason = reason.clone(),
            ProcessEvent::Resume => process.suspend_reason = None,
            _ => {}
        }
        if target.is_terminal() {
            process.ended_at = Some(now);
            process.end_reason = event.reason().map(str::to_string);
        }

        Ok(target)
    }
}

/// Determine the target state based on current state and event
pub fn determine_target_state(current: ProcessStatus, event: &ProcessEvent) -> Option<ProcessStatus> {
    let target = match (current, event) {
        (ProcessStatus::Pending, ProcessEvent::Start) => ProcessStatus::Running,

        (ProcessStatus::Running, ProcessEvent::Suspend(_)) => ProcessStatus::Suspended,
        (ProcessStatus::Suspended, ProcessEvent::Resume) => ProcessStatus::Running,

        (ProcessStatus::Running, ProcessEvent::Complete) => ProcessStatus::Completed,
        (ProcessStatus::Running, ProcessEvent::Reject(_)) => ProcessStatus::Rejected,

        (ProcessStatus::Running | ProcessStatus::Suspended, ProcessEvent::Terminate(_)) => {
            ProcessStatus::Terminated
        }

        // Administrative cancel and owner withdraw
        (from, ProcessEvent::Cancel(_) | ProcessEvent::Withdraw) if !from.is_terminal() => {
            ProcessStatus::Cancelled
        }

        _ => return None,
    };

    Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn process() -> Process {
        Process::new(
            "expense",
            "Expense #1",
            "alice",
            Default::default(),
            serde_json::Value::Null,
        )
    }

    #[test]
    fn test_start_sets_started_at() {
        let mut process = process();
        let now = Utc::now();
        let status = ProcessStateMachine::new(&mut process)
            .transition(&ProcessEvent::Start, now)
            .unwrap();
        assert_eq!(status, ProcessStatus::Running);
        assert_eq!(process.started_at, Some(now));
        assert!(process.ended_at.is_none());
    }

    #[test]
    fn test_suspend_requires_running() {
        let mut process = process();
        let err = ProcessStateMachine::new(&mut process)
            .transition(&ProcessEvent::Suspend(None), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { entity: "process", .. }));
        assert_eq!(process.status, ProcessStatus::Pending);
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        for status in ProcessStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for event in [
                ProcessEvent::Start,
                ProcessEvent::Resume,
                ProcessEvent::Complete,
                ProcessEvent::Terminate("x".into()),
                ProcessEvent::Cancel("x".into()),
                ProcessEvent::Withdraw,
            ] {
                assert_eq!(determine_target_state(status, &event), None);
            }
        }
    }

    #[test]
    fn test_terminate_records_reason_and_end() {
        let mut process = process();
        process.process_id = Uuid::new_v4();
        let mut machine = ProcessStateMachine::new(&mut process);
        machine.transition(&ProcessEvent::Start, Utc::now()).unwrap();
        machine
            .transition(&ProcessEvent::Suspend(Some("awaiting input".into())), Utc::now())
            .unwrap();
        machine
            .transition(&ProcessEvent::Terminate("budget cut".into()), Utc::now())
            .unwrap();

        assert_eq!(process.status, ProcessStatus::Terminated);
        assert_eq!(process.end_reason.as_deref(), Some("budget cut"));
        assert!(process.ended_at.is_some());
    }

    #[test]
    fn test_blank_terminate_reason_fails_guard() {
        let mut process = process();
        let mut machine = ProcessStateMachine::new(&mut process);
        machine.transition(&ProcessEvent::Start, Utc::now()).unwrap();
        let err = machine
            .transition(&ProcessEvent::Terminate("  ".into()), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StateMachineError::GuardFailed { .. }));
        assert_eq!(process.status, ProcessStatus::Running);
    }
}
