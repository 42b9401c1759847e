//! # System Constants
//!
//! Event names, the system operator identity and operational defaults shared by
//! every orchestration component.

/// Event type names published on every transition
pub mod events {
    // Process lifecycle events
    pub const PROCESS_ERROR: &str = "workflow.process.error";
    pub const PROCESS_STARTED: &str = "workflow.process.started";
    pub const PROCESS_TERMINATED: &str = "workflow.process.terminated";
    pub const PROCESS_COMPLETED: &str = "workflow.process.completed";
    pub const PROCESS_REJECTED: &str = "workflow.process.rejected";
    pub const PROCESS_SUSPENDED: &str = "workflow.process.suspended";
    pub const PROCESS_WITHDRAW: &str = "workflow.process.withdraw";
    pub const PROCESS_RESUMED: &str = "workflow.process.resumed";
    pub const PROCESS_CANCELLED: &str = "workflow.process.cancelled";

    // Node lifecycle events
    pub const NODE_ERROR: &str = "workflow.node.error";
    pub const NODE_STARTED: &str = "workflow.node.started";
    pub const NODE_TIMEOUT: &str = "workflow.node.timeout";
    pub const NODE_COMPLETED: &str = "workflow.node.completed";
    pub const NODE_CANCELLED: &str = "workflow.node.cancelled";

    // Task lifecycle events
    pub const TASK_ERROR: &str = "workflow.task.error";
    pub const TASK_CREATED: &str = "workflow.task.created";
    pub const TASK_COMPLETED: &str = "workflow.task.completed";
    pub const TASK_DELEGATED: &str = "workflow.task.delegated";
    pub const TASK_TRANSFERRED: &str = "workflow.task.transferred";
    pub const TASK_URGED: &str = "workflow.task.urged";
    pub const TASK_TIMEOUT: &str = "workflow.task.timeout";
    pub const TASK_WITHDRAWN: &str = "workflow.task.withdrawn";
    pub const TASK_ASSIGNED: &str = "workflow.task.assigned";
    pub const TASK_CANCELLED: &str = "workflow.task.cancelled";
    pub const TASK_OVERDUE: &str = "workflow.task.overdue";
}

/// Operator identity recorded for transitions the engine performs on its own
pub const SYSTEM_OPERATOR: &str = "system";

/// Variable name under which a node outcome is exposed to rule conditions
pub const OUTCOME_VARIABLE: &str = "outcome";

/// Default page size for list operations
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Upper bound on a single page
pub const MAX_PAGE_SIZE: usize = 1000;

/// Largest due-date or timeout offset a node may carry (100 years)
pub const MAX_NODE_OFFSET_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;
