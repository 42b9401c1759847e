//! # Task Model
//!
//! Actor-facing unit of work bound to exactly one Task-type node. The task
//! keeps its assignees of record, temporary delegations, and every assignee
//! action so that approval-mode completion can be decided from the row alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::state_machine::TaskStatus;

/// How many assignee actions complete a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// First qualifying action completes the task
    #[default]
    Any,
    /// Every assignee must act
    All,
    /// Assignees act one after another in list order
    Sequential,
}

impl std::fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::All => write!(f, "all"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

impl std::str::FromStr for ApprovalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(Self::Any),
            "all" => Ok(Self::All),
            "sequential" => Ok(Self::Sequential),
            _ => Err(format!("Invalid approval mode: {s}")),
        }
    }
}

/// One completing action recorded against a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAction {
    /// Operator who acted
    pub operator: String,
    /// Assignee of record the action counts for
    pub assignee: String,
    pub comment: Option<String>,
    pub outcome: Option<String>,
    pub acted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub node_id: Uuid,
    pub process_id: Uuid,
    pub name: String,
    /// Assignees of record, in sequence order
    pub assignees: Vec<String>,
    pub approval_mode: ApprovalMode,
    pub status: TaskStatus,
    /// Temporary reassignments: assignee of record -> delegate
    pub delegations: BTreeMap<String, String>,
    pub actions: Vec<TaskAction>,
    pub created_by: String,
    pub due_date: Option<DateTime<Utc>>,
    /// Set by the overdue sweep; never cleared
    pub overdue_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Task {
    pub fn new(
        node_id: Uuid,
        process_id: Uuid,
        name: impl Into<String>,
        assignees: Vec<String>,
        approval_mode: ApprovalMode,
        created_by: impl Into<String>,
        due_date: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            node_id,
            process_id,
            name: name.into(),
            assignees,
            approval_mode,
            status: TaskStatus::Created,
            delegations: BTreeMap::new(),
            actions: Vec::new(),
            created_by: created_by.into(),
            due_date,
            overdue_at: None,
            created_at: now,
            completed_at: None,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn has_acted(&self, assignee: &str) -> bool {
        self.actions.iter().any(|action| action.assignee == assignee)
    }

    /// Assignees of record that still owe an action
    pub fn pending_assignees(&self) -> Vec<&str> {
        self.assignees
            .iter()
            .filter(|assignee| !self.has_acted(assignee))
            .map(String::as_str)
            .collect()
    }

    /// Assignee whose turn it is under Sequential approval
    pub fn current_sequential_assignee(&self) -> Option<&str> {
        self.assignees
            .iter()
            .find(|assignee| !self.has_acted(assignee))
            .map(String::as_str)
    }

    /// Resolve which assignee of record `operator` may act for right now.
    ///
    /// An operator acts for themselves when they are an assignee, or for the
    /// assignee that delegated to them. Under Sequential approval only the
    /// current assignee in order is eligible; assignees that already acted are
    /// never eligible again.
    pub fn eligible_assignee_for(&self, operator: &str) -> Option<String> {
        let candidates = self.assignees.iter().filter(|assignee| {
            let delegate = self.delegations.get(assignee.as_str());
            assignee.as_str() == operator || delegate.map(String::as_str) == Some(operator)
        });

        match self.approval_mode {
            ApprovalMode::Sequential => {
                let current = self.current_sequential_assignee()?;
                candidates
                    .filter(|assignee| assignee.as_str() == current)
                    .cloned()
                    .next()
            }
            ApprovalMode::Any | ApprovalMode::All => candidates
                .filter(|assignee| !self.has_acted(assignee))
                .cloned()
                .next(),
        }
    }

    /// Whether the recorded actions satisfy the approval mode
    pub fn approval_satisfied(&self) -> bool {
        match self.approval_mode {
            ApprovalMode::Any => !self.actions.is_empty(),
            ApprovalMode::All | ApprovalMode::Sequential => {
                !self.assignees.is_empty() && self.pending_assignees().is_empty()
            }
        }
    }

    /// Outcome of the last completing action
    pub fn final_outcome(&self) -> Option<String> {
        self.actions.last().and_then(|action| action.outcome.clone())
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|completed| (completed - self.created_at).num_milliseconds().max(0))
    }
}

/// Metadata-only update for administrative edits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(mode: ApprovalMode, assignees: &[&str]) -> Task {
        Task::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Approve",
            assignees.iter().map(|a| a.to_string()).collect(),
            mode,
            "alice",
            None,
        )
    }

    fn act(task: &mut Task, operator: &str) {
        let assignee = task.eligible_assignee_for(operator).unwrap();
        task.actions.push(TaskAction {
            operator: operator.to_string(),
            assignee,
            comment: None,
            outcome: Some("approved".into()),
            acted_at: Utc::now(),
        });
    }

    #[test]
    fn test_any_mode_first_action_satisfies() {
        let mut task = task(ApprovalMode::Any, &["bob", "carol"]);
        assert!(!task.approval_satisfied());
        act(&mut task, "carol");
        assert!(task.approval_satisfied());
    }

    #[test]
    fn test_all_mode_requires_every_assignee() {
        let mut task = task(ApprovalMode::All, &["bob", "carol"]);
        act(&mut task, "bob");
        assert!(!task.approval_satisfied());
        assert!(task.eligible_assignee_for("bob").is_none());
        act(&mut task, "carol");
        assert!(task.approval_satisfied());
    }

    #[test]
    fn test_sequential_mode_enforces_order() {
        let mut task = task(ApprovalMode::Sequential, &["bob", "carol"]);
        assert!(task.eligible_assignee_for("carol").is_none());
        act(&mut task, "bob");
        assert_eq!(task.eligible_assignee_for("carol").as_deref(), Some("carol"));
    }

    #[test]
    fn test_delegate_acts_for_assignee_of_record() {
        let mut task = task(ApprovalMode::Any, &["bob"]);
        task.delegations.insert("bob".into(), "dave".into());
        assert_eq!(task.eligible_assignee_for("dave").as_deref(), Some("bob"));
        assert!(task.eligible_assignee_for("erin").is_none());
    }
}
