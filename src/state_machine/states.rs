use serde::{Deserialize, Serialize};
use std::fmt;

/// Process instance lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Created but not yet started
    #[default]
    Pending,
    /// Advancing through its node graph
    Running,
    /// Frozen by an operator; reads and Terminate/Cancel still allowed
    Suspended,
    /// Every terminal path resolved
    Completed,
    /// Force-ended by an operator
    Terminated,
    /// Ended by a business rejection outcome
    Rejected,
    /// Administratively cancelled or withdrawn by its owner
    Cancelled,
}

impl ProcessStatus {
    pub const ALL: [ProcessStatus; 7] = [
        Self::Pending,
        Self::Running,
        Self::Suspended,
        Self::Completed,
        Self::Terminated,
        Self::Rejected,
        Self::Cancelled,
    ];

    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Terminated | Self::Rejected | Self::Cancelled
        )
    }

    /// Check if the process may advance automatically
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Completed => write!(f, "completed"),
            Self::Terminated => write!(f, "terminated"),
            Self::Rejected => write!(f, "rejected"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "terminated" => Ok(Self::Terminated),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid process status: {s}")),
        }
    }
}

/// Node lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting for activation (or for a join barrier to fill)
    #[default]
    Pending,
    /// Activated; a task node stays here until its task resolves
    Active,
    Completed,
    /// Exceeded its configured deadline
    Timeout,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Timeout | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid node status: {s}")),
        }
    }
}

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Created,
    Assigned,
    Completed,
    /// Temporarily handed to another operator; still open
    Delegated,
    /// Permanently handed to another operator; still open
    Transferred,
    Withdrawn,
    Timeout,
    /// Due date elapsed while open; still actionable
    Overdue,
    Cancelled,
}

impl TaskStatus {
    /// Open tasks still accept assignee actions
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Assigned | Self::Delegated | Self::Transferred | Self::Overdue
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Assigned => write!(f, "assigned"),
            Self::Completed => write!(f, "completed"),
            Self::Delegated => write!(f, "delegated"),
            Self::Transferred => write!(f, "transferred"),
            Self::Withdrawn => write!(f, "withdrawn"),
            Self::Timeout => write!(f, "timeout"),
            Self::Overdue => write!(f, "overdue"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "assigned" => Ok(Self::Assigned),
            "completed" => Ok(Self::Completed),
            "delegated" => Ok(Self::Delegated),
            "transferred" => Ok(Self::Transferred),
            "withdrawn" => Ok(Self::Withdrawn),
            "timeout" => Ok(Self::Timeout),
            "overdue" => Ok(Self::Overdue),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_status_terminal_check() {
        assert!(ProcessStatus::Completed.is_terminal());
        assert!(ProcessStatus::Terminated.is_terminal());
        assert!(ProcessStatus::Rejected.is_terminal());
        assert!(ProcessStatus::Cancelled.is_terminal());
        assert!(!ProcessStatus::Pending.is_terminal());
        assert!(!ProcessStatus::Running.is_terminal());
        assert!(!ProcessStatus::Suspended.is_terminal());
    }

    #[test]
    fn test_task_status_open_check() {
        assert!(TaskStatus::Assigned.is_open());
        assert!(TaskStatus::Overdue.is_open());
        assert!(TaskStatus::Delegated.is_open());
        assert!(!TaskStatus::Completed.is_open());
        assert!(!TaskStatus::Withdrawn.is_open());
        assert!(!TaskStatus::Cancelled.is_open());
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(ProcessStatus::Suspended.to_string(), "suspended");
        assert_eq!(
            "terminated".parse::<ProcessStatus>().unwrap(),
            ProcessStatus::Terminated
        );
        assert_eq!(NodeStatus::Timeout.to_string(), "timeout");
        assert_eq!("overdue".parse::<TaskStatus>().unwrap(), TaskStatus::Overdue);
        assert!("in_progress".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&TaskStatus::Transferred).unwrap();
        assert_eq!(json, "\"transferred\"");

        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::Transferred);
    }
}
