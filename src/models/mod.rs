//! # Workflow Models
//!
//! Rows owned by the orchestration core. Every entity is keyed by a `Uuid` and
//! references its parent by id; nothing is shared across processes.

pub mod history;
pub mod node;
pub mod process;
pub mod rule;
pub mod task;
pub mod template;

pub use history::{HistoryAction, HistoryRecord};
pub use node::{
    EndKind, GatewayKind, Node, NodeConfig, NodeType, NodeUpdate, TimeoutAction, TimeoutPolicy,
    WithdrawPolicy,
};
pub use process::{Process, ProcessUpdate, Variables};
pub use rule::{validate_rule_set, Rule, RuleUpdate};
pub use task::{ApprovalMode, Task, TaskAction, TaskUpdate};
pub use template::{NodeTemplate, ProcessTemplate, RuleTemplate};
