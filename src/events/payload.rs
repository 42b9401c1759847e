//! Event payload published on every transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::constants::events;
use crate::error::WorkflowError;
use crate::models::{Node, Process, Task, Variables};
use crate::state_machine::ProcessStatus;

/// Closed catalogue of event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ProcessError,
    ProcessStarted,
    ProcessTerminated,
    ProcessCompleted,
    ProcessRejected,
    ProcessSuspended,
    ProcessWithdraw,
    ProcessResumed,
    ProcessCancelled,
    NodeError,
    NodeStarted,
    NodeTimeout,
    NodeCompleted,
    NodeCancelled,
    TaskError,
    TaskCreated,
    TaskCompleted,
    TaskDelegated,
    TaskTransferred,
    TaskUrged,
    TaskTimeout,
    TaskWithdrawn,
    TaskAssigned,
    TaskCancelled,
    TaskOverdue,
}

impl EventType {
    pub const ALL: [EventType; 25] = [
        Self::ProcessError,
        Self::ProcessStarted,
        Self::ProcessTerminated,
        Self::ProcessCompleted,
        Self::ProcessRejected,
        Self::ProcessSuspended,
        Self::ProcessWithdraw,
        Self::ProcessResumed,
        Self::ProcessCancelled,
        Self::NodeError,
        Self::NodeStarted,
        Self::NodeTimeout,
        Self::NodeCompleted,
        Self::NodeCancelled,
        Self::TaskError,
        Self::TaskCreated,
        Self::TaskCompleted,
        Self::TaskDelegated,
        Self::TaskTransferred,
        Self::TaskUrged,
        Self::TaskTimeout,
        Self::TaskWithdrawn,
        Self::TaskAssigned,
        Self::TaskCancelled,
        Self::TaskOverdue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessError => events::PROCESS_ERROR,
            Self::ProcessStarted => events::PROCESS_STARTED,
            Self::ProcessTerminated => events::PROCESS_TERMINATED,
            Self::ProcessCompleted => events::PROCESS_COMPLETED,
            Self::ProcessRejected => events::PROCESS_REJECTED,
            Self::ProcessSuspended => events::PROCESS_SUSPENDED,
            Self::ProcessWithdraw => events::PROCESS_WITHDRAW,
            Self::ProcessResumed => events::PROCESS_RESUMED,
            Self::ProcessCancelled => events::PROCESS_CANCELLED,
            Self::NodeError => events::NODE_ERROR,
            Self::NodeStarted => events::NODE_STARTED,
            Self::NodeTimeout => events::NODE_TIMEOUT,
            Self::NodeCompleted => events::NODE_COMPLETED,
            Self::NodeCancelled => events::NODE_CANCELLED,
            Self::TaskError => events::TASK_ERROR,
            Self::TaskCreated => events::TASK_CREATED,
            Self::TaskCompleted => events::TASK_COMPLETED,
            Self::TaskDelegated => events::TASK_DELEGATED,
            Self::TaskTransferred => events::TASK_TRANSFERRED,
            Self::TaskUrged => events::TASK_URGED,
            Self::TaskTimeout => events::TASK_TIMEOUT,
            Self::TaskWithdrawn => events::TASK_WITHDRAWN,
            Self::TaskAssigned => events::TASK_ASSIGNED,
            Self::TaskCancelled => events::TASK_CANCELLED,
            Self::TaskOverdue => events::TASK_OVERDUE,
        }
    }

    /// Event announcing a process reaching `status`, if that status has one
    pub fn for_process_status(status: ProcessStatus) -> Option<Self> {
        match status {
            ProcessStatus::Pending => None,
            ProcessStatus::Running => Some(Self::ProcessStarted),
            ProcessStatus::Suspended => Some(Self::ProcessSuspended),
            ProcessStatus::Completed => Some(Self::ProcessCompleted),
            ProcessStatus::Terminated => Some(Self::ProcessTerminated),
            ProcessStatus::Rejected => Some(Self::ProcessRejected),
            ProcessStatus::Cancelled => Some(Self::ProcessCancelled),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|event_type| event_type.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown event type: {s}"))
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Machine-readable error attached to `*.error` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl From<&WorkflowError> for ErrorInfo {
    fn from(err: &WorkflowError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub process_id: Uuid,
    pub process_name: Option<String>,
    pub node_id: Option<Uuid>,
    pub node_name: Option<String>,
    pub task_id: Option<Uuid>,
    pub task_name: Option<String>,
    pub operator: Option<String>,
    pub action: Option<String>,
    pub variables: Variables,
    pub business_data: Value,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub process_status: Option<ProcessStatus>,
    /// Node type as `start`, `task`, `gateway:<kind>` or `end`
    pub node_type: Option<String>,
    pub prev_node_id: Option<Uuid>,
    pub next_node_id: Option<Uuid>,
    /// Milliseconds
    pub duration: Option<i64>,
    pub error_info: Option<ErrorInfo>,
    pub assignees: Vec<String>,
    pub comment: Option<String>,
    pub details: Map<String, Value>,
}

impl WorkflowEvent {
    pub fn new(event_type: EventType, process_id: Uuid) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            process_id,
            process_name: None,
            node_id: None,
            node_name: None,
            task_id: None,
            task_name: None,
            operator: None,
            action: None,
            variables: Variables::new(),
            business_data: Value::Null,
            timestamp: Utc::now().timestamp_millis(),
            process_status: None,
            node_type: None,
            prev_node_id: None,
            next_node_id: None,
            duration: None,
            error_info: None,
            assignees: Vec::new(),
            comment: None,
            details: Map::new(),
        }
    }

    /// Event carrying the process context (name, status, variables, business data)
    pub fn for_process(event_type: EventType, process: &Process) -> Self {
        let mut event = Self::new(event_type, process.process_id);
        event.process_name = Some(process.name.clone());
        event.process_status = Some(process.status);
        event.variables = process.variables.clone();
        event.business_data = process.business_data.clone();
        event
    }

    pub fn with_node(mut self, node: &Node) -> Self {
        self.node_id = Some(node.node_id);
        self.node_name = Some(node.name.clone());
        self.node_type = Some(node.node_type.to_string());
        self
    }

    pub fn with_task(mut self, task: &Task) -> Self {
        self.task_id = Some(task.task_id);
        self.task_name = Some(task.name.clone());
        self.assignees = task.assignees.clone();
        self
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }

    pub fn with_duration(mut self, duration_ms: Option<i64>) -> Self {
        self.duration = duration_ms;
        self
    }

    pub fn with_prev_node(mut self, node_id: Option<Uuid>) -> Self {
        self.prev_node_id = node_id;
        self
    }

    pub fn with_next_node(mut self, node_id: Option<Uuid>) -> Self {
        self.next_node_id = node_id;
        self
    }

    pub fn with_error(mut self, err: &WorkflowError) -> Self {
        self.error_info = Some(ErrorInfo::from(err));
        self
    }

    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = at.timestamp_millis();
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn event_name(&self) -> &'static str {
        self.event_type.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeConfig, NodeType};
    use serde_json::json;

    #[test]
    fn test_event_type_names_round_trip() {
        for event_type in EventType::ALL {
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
            assert!(event_type.as_str().starts_with("workflow."));
        }
        assert!("workflow.process.exploded".parse::<EventType>().is_err());
    }

    #[test]
    fn test_payload_wire_shape() {
        let mut variables = Variables::new();
        variables.insert("amount".into(), json!(500));
        let process = Process::new("tpl", "Expense", "alice", variables, json!({"ref": "X-1"}));
        let node = Node::new(process.process_id, "review", "Review", NodeType::Task, NodeConfig::default());

        let event = WorkflowEvent::for_process(EventType::NodeStarted, &process)
            .with_node(&node)
            .with_operator("alice")
            .with_detail("attempt", json!(1));
        let wire = serde_json::to_value(&event).unwrap();

        assert_eq!(wire["type"], "workflow.node.started");
        assert_eq!(wire["process_name"], "Expense");
        assert_eq!(wire["node_type"], "task");
        assert_eq!(wire["variables"]["amount"], 500);
        assert_eq!(wire["business_data"]["ref"], "X-1");
        assert_eq!(wire["process_status"], "pending");
        assert_eq!(wire["details"]["attempt"], 1);
        assert!(wire["timestamp"].is_i64());
    }

    #[test]
    fn test_error_info_uses_error_code() {
        let err = WorkflowError::RuleEvaluation {
            node_id: Uuid::nil(),
            reason: "no rule matched".into(),
        };
        let event = WorkflowEvent::new(EventType::NodeError, Uuid::nil()).with_error(&err);
        let info = event.error_info.unwrap();
        assert_eq!(info.code, "rule_evaluation_error");
        assert!(info.message.contains("no rule matched"));
    }
}
