//! # Storage Collaborators
//!
//! The orchestration core talks to persistence only through the
//! [`WorkflowStore`] and [`HistoryStore`] traits. Updates use optimistic
//! versioning: the caller passes the row it read, and the store rejects the
//! write with [`StoreError::VersionConflict`] if someone else wrote first.
//!
//! List operations are cursor paginated. Cursors are opaque strings produced
//! by the store; callers pass back `next_cursor` unchanged.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::models::{HistoryAction, HistoryRecord, Node, Process, Rule, Task};
use crate::state_machine::{NodeStatus, ProcessStatus, TaskStatus};

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgWorkflowStore;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("{entity} {id} version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        entity: &'static str,
        id: Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("{entity} {id} already exists")]
    Duplicate { entity: &'static str, id: Uuid },

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Cursor pagination request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            cursor: None,
            limit: Some(limit),
        }
    }

    pub fn after(cursor: impl Into<String>, limit: usize) -> Self {
        Self {
            cursor: Some(cursor.into()),
            limit: Some(limit),
        }
    }

    /// Effective page size, clamped to `1..=MAX_PAGE_SIZE`
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page; `None` on the last page
    pub next_cursor: Option<String>,
    /// Total number of rows matching the filter
    pub total: u64,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
            total: 0,
        }
    }
}

/// Sort position encoded into a cursor: `(timestamp micros, sequence, id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey {
    pub micros: i64,
    pub sequence: u64,
    pub id: Uuid,
}

impl SortKey {
    pub fn new(at: DateTime<Utc>, sequence: u64, id: Uuid) -> Self {
        Self {
            micros: at.timestamp_micros(),
            sequence,
            id,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}.{}.{}", self.micros, self.sequence, self.id)
    }

    pub fn decode(cursor: &str) -> StoreResult<Self> {
        let invalid = || StoreError::InvalidCursor(cursor.to_string());
        let mut parts = cursor.splitn(3, '.');
        let micros = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let sequence = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let id = parts
            .next()
            .and_then(|p| Uuid::parse_str(p).ok())
            .ok_or_else(invalid)?;
        Ok(Self {
            micros,
            sequence,
            id,
        })
    }
}

/// Inclusive-from, exclusive-to time window; open on either side when `None`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at < to)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessFilter {
    pub status: Option<ProcessStatus>,
    pub created_by: Option<String>,
    pub template_id: Option<String>,
    pub created: TimeRange,
}

impl ProcessFilter {
    pub fn matches(&self, process: &Process) -> bool {
        self.status.map_or(true, |s| process.status == s)
            && self.created_by.as_deref().map_or(true, |op| process.created_by == op)
            && self
                .template_id
                .as_deref()
                .map_or(true, |t| process.template_id == t)
            && self.created.contains(process.created_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFilter {
    pub process_id: Option<Uuid>,
    pub status: Option<NodeStatus>,
    /// Only nodes whose timeout deadline is at or before this instant
    pub deadline_before: Option<DateTime<Utc>>,
}

impl NodeFilter {
    pub fn matches(&self, node: &Node) -> bool {
        self.process_id.map_or(true, |id| node.process_id == id)
            && self.status.map_or(true, |s| node.status == s)
            && self
                .deadline_before
                .map_or(true, |cutoff| node.deadline().is_some_and(|d| d <= cutoff))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub process_id: Option<Uuid>,
    pub node_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    /// Tasks where this operator is an assignee of record or a delegate
    pub assignee: Option<String>,
    pub open_only: bool,
    /// Only tasks with a due date at or before this instant
    pub due_before: Option<DateTime<Utc>>,
    pub created: TimeRange,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.process_id.map_or(true, |id| task.process_id == id)
            && self.node_id.map_or(true, |id| task.node_id == id)
            && self.status.map_or(true, |s| task.status == s)
            && self.assignee.as_deref().map_or(true, |op| {
                task.assignees.iter().any(|a| a == op) || task.delegations.values().any(|d| d == op)
            })
            && (!self.open_only || task.is_open())
            && self
                .due_before
                .map_or(true, |cutoff| task.due_date.is_some_and(|due| due <= cutoff))
            && self.created.contains(task.created_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleFilter {
    pub process_id: Option<Uuid>,
    pub source_node_id: Option<Uuid>,
}

impl RuleFilter {
    pub fn matches(&self, rule: &Rule) -> bool {
        self.process_id.map_or(true, |id| rule.process_id == id)
            && self.source_node_id.map_or(true, |id| rule.source_node_id == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub process_id: Option<Uuid>,
    pub node_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub operator: Option<String>,
    pub action: Option<HistoryAction>,
    pub time: TimeRange,
}

impl HistoryFilter {
    pub fn for_process(process_id: Uuid) -> Self {
        Self {
            process_id: Some(process_id),
            ..Default::default()
        }
    }

    pub fn for_task(task_id: Uuid) -> Self {
        Self {
            task_id: Some(task_id),
            ..Default::default()
        }
    }

    pub fn for_operator(operator: impl Into<String>) -> Self {
        Self {
            operator: Some(operator.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &HistoryRecord) -> bool {
        self.process_id.map_or(true, |id| record.process_id == id)
            && self.node_id.map_or(true, |id| record.node_id == Some(id))
            && self.task_id.map_or(true, |id| record.task_id == Some(id))
            && self.operator.as_deref().map_or(true, |op| record.operator == op)
            && self.action.map_or(true, |a| record.action == a)
            && self.time.contains(record.timestamp)
    }
}

/// Persistence for process, node, task and rule rows.
///
/// `update_*` methods compare `version` on the passed row with the stored
/// row, write on match and return the row with its version incremented.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    // Processes
    async fn create_process(&self, process: &Process) -> StoreResult<()>;
    async fn get_process(&self, process_id: Uuid) -> StoreResult<Process>;
    async fn update_process(&self, process: &Process) -> StoreResult<Process>;
    /// Delete a process together with its nodes, tasks and rules
    async fn delete_process(&self, process_id: Uuid) -> StoreResult<()>;
    async fn list_processes(&self, filter: &ProcessFilter, page: &PageRequest) -> StoreResult<Page<Process>>;
    async fn count_processes(&self, filter: &ProcessFilter) -> StoreResult<u64>;

    // Nodes
    async fn create_nodes(&self, nodes: &[Node]) -> StoreResult<()>;
    async fn get_node(&self, node_id: Uuid) -> StoreResult<Node>;
    async fn update_node(&self, node: &Node) -> StoreResult<Node>;
    async fn delete_node(&self, node_id: Uuid) -> StoreResult<()>;
    async fn list_nodes(&self, filter: &NodeFilter, page: &PageRequest) -> StoreResult<Page<Node>>;
    async fn count_nodes(&self, filter: &NodeFilter) -> StoreResult<u64>;
    /// Every node of a process, in creation order
    async fn process_nodes(&self, process_id: Uuid) -> StoreResult<Vec<Node>>;

    // Tasks
    async fn create_task(&self, task: &Task) -> StoreResult<()>;
    async fn get_task(&self, task_id: Uuid) -> StoreResult<Task>;
    async fn update_task(&self, task: &Task) -> StoreResult<Task>;
    async fn delete_task(&self, task_id: Uuid) -> StoreResult<()>;
    async fn list_tasks(&self, filter: &TaskFilter, page: &PageRequest) -> StoreResult<Page<Task>>;
    async fn count_tasks(&self, filter: &TaskFilter) -> StoreResult<u64>;
    /// Every task of a process, in creation order
    async fn process_tasks(&self, process_id: Uuid) -> StoreResult<Vec<Task>>;

    // Rules
    async fn create_rules(&self, rules: &[Rule]) -> StoreResult<()>;
    async fn get_rule(&self, rule_id: Uuid) -> StoreResult<Rule>;
    async fn update_rule(&self, rule: &Rule) -> StoreResult<Rule>;
    async fn delete_rule(&self, rule_id: Uuid) -> StoreResult<()>;
    async fn list_rules(&self, filter: &RuleFilter, page: &PageRequest) -> StoreResult<Page<Rule>>;
    async fn count_rules(&self, filter: &RuleFilter) -> StoreResult<u64>;
    /// Every rule of a process
    async fn process_rules(&self, process_id: Uuid) -> StoreResult<Vec<Rule>>;
}

/// Append-only audit storage. Records are returned ordered by
/// `(timestamp, sequence)` ascending.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: &HistoryRecord) -> StoreResult<()>;
    async fn list_history(&self, filter: &HistoryFilter, page: &PageRequest) -> StoreResult<Page<HistoryRecord>>;
    async fn count_history(&self, filter: &HistoryFilter) -> StoreResult<u64>;
    /// Most recent record of a process by `(timestamp, sequence)`
    async fn latest_history(&self, process_id: Uuid) -> StoreResult<Option<HistoryRecord>>;
}
