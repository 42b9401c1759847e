//! # History Model
//!
//! Append-only audit record of a single transition. Records are ordered within
//! a process by `(timestamp, sequence)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    ProcessCreated,
    ProcessUpdated,
    ProcessStarted,
    ProcessSuspended,
    ProcessResumed,
    ProcessCompleted,
    ProcessTerminated,
    ProcessRejected,
    ProcessCancelled,
    ProcessWithdrawn,
    ProcessError,
    NodeStarted,
    NodeCompleted,
    NodeTimeout,
    NodeCancelled,
    NodeError,
    TaskCreated,
    /// One assignee acted on an All/Sequential task that is still open
    TaskApproved,
    TaskCompleted,
    TaskDelegated,
    TaskTransferred,
    TaskUrged,
    TaskWithdrawn,
    TaskOverdue,
    TaskTimeout,
    TaskCancelled,
    TaskAssigneeRemoved,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessCreated => "process.created",
            Self::ProcessUpdated => "process.updated",
            Self::ProcessStarted => "process.started",
            Self::ProcessSuspended => "process.suspended",
            Self::ProcessResumed => "process.resumed",
            Self::ProcessCompleted => "process.completed",
            Self::ProcessTerminated => "process.terminated",
            Self::ProcessRejected => "process.rejected",
            Self::ProcessCancelled => "process.cancelled",
            Self::ProcessWithdrawn => "process.withdrawn",
            Self::ProcessError => "process.error",
            Self::NodeStarted => "node.started",
            Self::NodeCompleted => "node.completed",
            Self::NodeTimeout => "node.timeout",
            Self::NodeCancelled => "node.cancelled",
            Self::NodeError => "node.error",
            Self::TaskCreated => "task.created",
            Self::TaskApproved => "task.approved",
            Self::TaskCompleted => "task.completed",
            Self::TaskDelegated => "task.delegated",
            Self::TaskTransferred => "task.transferred",
            Self::TaskUrged => "task.urged",
            Self::TaskWithdrawn => "task.withdrawn",
            Self::TaskOverdue => "task.overdue",
            Self::TaskTimeout => "task.timeout",
            Self::TaskCancelled => "task.cancelled",
            Self::TaskAssigneeRemoved => "task.assignee_removed",
        }
    }

    const ALL: [HistoryAction; 27] = [
        Self::ProcessCreated,
        Self::ProcessUpdated,
        Self::ProcessStarted,
        Self::ProcessSuspended,
        Self::ProcessResumed,
        Self::ProcessCompleted,
        Self::ProcessTerminated,
        Self::ProcessRejected,
        Self::ProcessCancelled,
        Self::ProcessWithdrawn,
        Self::ProcessError,
        Self::NodeStarted,
        Self::NodeCompleted,
        Self::NodeTimeout,
        Self::NodeCancelled,
        Self::NodeError,
        Self::TaskCreated,
        Self::TaskApproved,
        Self::TaskCompleted,
        Self::TaskDelegated,
        Self::TaskTransferred,
        Self::TaskUrged,
        Self::TaskWithdrawn,
        Self::TaskOverdue,
        Self::TaskTimeout,
        Self::TaskCancelled,
        Self::TaskAssigneeRemoved,
    ];
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HistoryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|action| action.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Invalid history action: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub history_id: Uuid,
    pub process_id: Uuid,
    pub node_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub operator: String,
    pub action: HistoryAction,
    pub timestamp: DateTime<Utc>,
    /// Insertion order within the process; assigned by the recorder
    pub sequence: u64,
    pub duration_ms: Option<i64>,
    pub details: Value,
}

impl HistoryRecord {
    pub fn new(process_id: Uuid, operator: impl Into<String>, action: HistoryAction) -> Self {
        Self {
            history_id: Uuid::new_v4(),
            process_id,
            node_id: None,
            task_id: None,
            operator: operator.into(),
            action,
            timestamp: Utc::now(),
            sequence: 0,
            duration_ms: None,
            details: Value::Null,
        }
    }

    pub fn with_node(mut self, node_id: Uuid) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_duration(mut self, duration_ms: Option<i64>) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_action_string_round_trip() {
        for action in HistoryAction::ALL {
            assert_eq!(action.as_str().parse::<HistoryAction>().unwrap(), action);
        }
        assert!("node.exploded".parse::<HistoryAction>().is_err());
    }

    #[test]
    fn test_record_builder() {
        let process_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        let record = HistoryRecord::new(process_id, "bob", HistoryAction::NodeCompleted)
            .with_node(node_id)
            .with_duration(Some(1200))
            .with_details(serde_json::json!({"outcome": "approved"}));

        assert_eq!(record.node_id, Some(node_id));
        assert_eq!(record.task_id, None);
        assert_eq!(record.duration_ms, Some(1200));
        assert_eq!(record.details["outcome"], "approved");
    }
}
