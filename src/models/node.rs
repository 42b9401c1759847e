//! # Node Model
//!
//! One step in a process's directed graph. Nodes reference their neighbours by
//! id only; the graph is an arena of rows keyed by `node_id`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::task::ApprovalMode;
use crate::constants::MAX_NODE_OFFSET_SECONDS;
use crate::state_machine::NodeStatus;

/// Branching semantics of a gateway node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    /// First matching rule wins
    Exclusive,
    /// Every configured target, conditions ignored; also a join barrier
    Parallel,
    /// Every matching rule, default when none match
    Inclusive,
}

/// Node type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    Task,
    Gateway(GatewayKind),
    End,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Task => write!(f, "task"),
            Self::Gateway(GatewayKind::Exclusive) => write!(f, "gateway:exclusive"),
            Self::Gateway(GatewayKind::Parallel) => write!(f, "gateway:parallel"),
            Self::Gateway(GatewayKind::Inclusive) => write!(f, "gateway:inclusive"),
            Self::End => write!(f, "end"),
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "task" => Ok(Self::Task),
            "gateway:exclusive" => Ok(Self::Gateway(GatewayKind::Exclusive)),
            "gateway:parallel" => Ok(Self::Gateway(GatewayKind::Parallel)),
            "gateway:inclusive" => Ok(Self::Gateway(GatewayKind::Inclusive)),
            "end" => Ok(Self::End),
            _ => Err(format!("Invalid node type: {s}")),
        }
    }
}

/// What happens once a node's deadline passes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Activate the node with this template key
    Advance { target: String },
    TerminateProcess,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub after_seconds: i64,
    pub action: TimeoutAction,
}

/// What happens to a task node when its open task is withdrawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawPolicy {
    /// Create a fresh task for the same assignees
    #[default]
    Requeue,
    /// Cancel the node
    CancelNode,
}

/// How a process ends when it reaches this End node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndKind {
    #[default]
    Completed,
    Rejected,
}

/// Per-node behaviour copied from the template at instantiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    /// Operators that must act on a task node; empty means a system task
    pub assignees: Vec<String>,
    pub approval_mode: ApprovalMode,
    /// Due date offset for created tasks
    pub due_in_seconds: Option<i64>,
    pub timeout: Option<TimeoutPolicy>,
    pub withdraw_policy: WithdrawPolicy,
    pub end_kind: EndKind,
    /// Number of completed incoming branches a join waits for; derived when absent
    pub join_required: Option<u32>,
}

impl NodeConfig {
    /// Reject due and timeout offsets that are not positive or exceed
    /// [`MAX_NODE_OFFSET_SECONDS`]
    pub fn check_offsets(&self, key: &str) -> Result<(), String> {
        if let Some(seconds) = self.due_in_seconds {
            if !(1..=MAX_NODE_OFFSET_SECONDS).contains(&seconds) {
                return Err(format!(
                    "node '{key}' due offset {seconds}s must be between 1 and {MAX_NODE_OFFSET_SECONDS}"
                ));
            }
        }
        if let Some(policy) = &self.timeout {
            if policy.after_seconds <= 0 {
                return Err(format!("node '{key}' timeout must be positive"));
            }
            if policy.after_seconds > MAX_NODE_OFFSET_SECONDS {
                return Err(format!(
                    "node '{key}' timeout {}s exceeds {MAX_NODE_OFFSET_SECONDS}",
                    policy.after_seconds
                ));
            }
        }
        Ok(())
    }
}

/// `base + seconds`, or `None` when the offset leaves chrono's range
pub fn offset_by_seconds(base: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(seconds).and_then(|delta| base.checked_add_signed(delta))
}

/// A node instance belonging to exactly one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: Uuid,
    pub process_id: Uuid,
    /// Key of the template node this instance was created from
    pub template_key: String,
    pub name: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub config: NodeConfig,
    pub previous: Vec<Uuid>,
    pub next: Vec<Uuid>,
    pub incoming_required: u32,
    pub incoming_completed: u32,
    /// Outcome recorded on completion, exposed to rules as `outcome`
    pub outcome: Option<String>,
    /// Set when routing failed; the node stays Active and retry-eligible
    pub last_error: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Node {
    pub fn new(
        process_id: Uuid,
        template_key: impl Into<String>,
        name: impl Into<String>,
        node_type: NodeType,
        config: NodeConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            node_id: Uuid::new_v4(),
            process_id,
            template_key: template_key.into(),
            name: name.into(),
            node_type,
            status: NodeStatus::Pending,
            config,
            previous: Vec::new(),
            next: Vec::new(),
            incoming_required: 1,
            incoming_completed: 0,
            outcome: None,
            last_error: None,
            activated_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Task node that waits for actor input
    pub fn requires_actor(&self) -> bool {
        self.node_type == NodeType::Task && !self.config.assignees.is_empty()
    }

    /// Fan-in node that waits for more than one incoming branch
    pub fn is_join(&self) -> bool {
        self.incoming_required > 1
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Whether routing previously failed and the node awaits a retry
    pub fn is_retry_eligible(&self) -> bool {
        self.status == NodeStatus::Active && self.last_error.is_some()
    }

    /// Completed incoming branches needed before activation: the explicit
    /// `join_required` clamped to the incoming edge count, every incoming edge
    /// for a Parallel gateway, otherwise one
    pub fn derive_incoming_required(&self) -> u32 {
        let incoming = self.previous.len().max(1) as u32;
        match (self.config.join_required, self.node_type) {
            (Some(required), _) => required.clamp(1, incoming),
            (None, NodeType::Gateway(GatewayKind::Parallel)) => incoming,
            (None, _) => 1,
        }
    }

    /// Deadline computed from activation time and the timeout policy; `None`
    /// when the policy's offset is out of range
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let policy = self.config.timeout.as_ref()?;
        offset_by_seconds(self.activated_at?, policy.after_seconds)
    }

    /// Milliseconds spent between activation and `now`
    pub fn duration_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        self.activated_at
            .map(|activated| (now - activated).num_milliseconds().max(0))
    }
}

/// Metadata-only update for administrative edits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub config: Option<NodeConfig>,
}
