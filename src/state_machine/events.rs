use serde::{Deserialize, Serialize};

/// Events that can trigger process state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProcessEvent {
    Start,
    Suspend(Option<String>),
    Resume,
    Complete,
    Terminate(String),
    Reject(String),
    Cancel(String),
    /// Owner pulls back their own process
    Withdraw,
}

impl ProcessEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Suspend(_) => "suspend",
            Self::Resume => "resume",
            Self::Complete => "complete",
            Self::Terminate(_) => "terminate",
            Self::Reject(_) => "reject",
            Self::Cancel(_) => "cancel",
            Self::Withdraw => "withdraw",
        }
    }

    /// Reason attached to the event, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Suspend(reason) => reason.as_deref(),
            Self::Terminate(reason) | Self::Reject(reason) | Self::Cancel(reason) => {
                Some(reason.as_str())
            }
            _ => None,
        }
    }

    /// Check if this event ends the process
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Terminate(_) | Self::Reject(_) | Self::Cancel(_) | Self::Withdraw
        )
    }
}

/// Events that can trigger node state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEvent {
    Activate,
    Complete,
    Timeout,
    Cancel,
}

impl NodeEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Complete => "complete",
            Self::Timeout => "timeout",
            Self::Cancel => "cancel",
        }
    }
}

/// Events that can trigger task state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Assign,
    Complete,
    Delegate,
    Transfer,
    Withdraw,
    MarkOverdue,
    Timeout,
    Cancel,
}

impl TaskEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Assign => "assign",
            Self::Complete => "complete",
            Self::Delegate => "delegate",
            Self::Transfer => "transfer",
            Self::Withdraw => "withdraw",
            Self::MarkOverdue => "mark_overdue",
            Self::Timeout => "timeout",
            Self::Cancel => "cancel",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_event_reason() {
        assert_eq!(
            ProcessEvent::Suspend(Some("awaiting input".into())).reason(),
            Some("awaiting input")
        );
        assert_eq!(ProcessEvent::Suspend(None).reason(), None);
        assert_eq!(ProcessEvent::Terminate("stop".into()).reason(), Some("stop"));
        assert!(ProcessEvent::Withdraw.is_terminal());
        assert!(!ProcessEvent::Resume.is_terminal());
    }

    #[test]
    fn test_process_event_serde_shape() {
        let json = serde_json::to_value(ProcessEvent::Terminate("manual".into())).unwrap();
        assert_eq!(json, serde_json::json!({"type": "terminate", "data": "manual"}));
    }
}
