#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Procflow Core
//!
//! Process orchestration core for approval-style workflows.
//!
//! ## Overview
//!
//! A process is instantiated from a [`models::ProcessTemplate`] into a graph
//! of nodes joined by routing rules. Task nodes hand work to human assignees;
//! gateways branch and join; End nodes finish the process. Every transition
//! appends an immutable history record and publishes an event.
//!
//! ## Module Organization
//!
//! - [`models`] - Processes, nodes, rules, tasks, history records and templates
//! - [`state_machine`] - Process, node and task state machines with guards
//! - [`rules`] - Condition expression language and next-node selection
//! - [`orchestration`] - ProcessManager, NodeEngine, TaskScheduler and Sweeper
//! - [`history`] - Append-only audit trail with retry and dead letters
//! - [`events`] - In-process publish/subscribe with per-process ordering
//! - [`store`] - Storage traits, the in-memory store and (optionally) PostgreSQL
//! - [`config`] - Layered TOML/environment configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured tracing setup and operation helpers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use procflow_core::models::{ApprovalMode, NodeTemplate, ProcessTemplate, RuleTemplate};
//! use procflow_core::orchestration::{NewProcess, ProcessManager};
//!
//! # async fn example() -> procflow_core::Result<()> {
//! let template = ProcessTemplate::new("leave", "Leave request")
//!     .with_node(NodeTemplate::start("start"))
//!     .with_node(NodeTemplate::task("approve", "Approve", ["manager"], ApprovalMode::Any))
//!     .with_node(NodeTemplate::end("end"))
//!     .with_rule(RuleTemplate::always("start", "approve", 0))
//!     .with_rule(RuleTemplate::always("approve", "end", 0));
//!
//! let manager = ProcessManager::in_memory();
//! let process = manager.create(&template, NewProcess::named("Leave for alice"), "alice").await?;
//! manager.start(process.process_id, "alice").await?;
//!
//! let tasks = manager.task_scheduler().process_tasks(process.process_id).await?;
//! manager
//!     .task_scheduler()
//!     .complete_task(tasks[0].task_id, "manager", None, Some("approve".into()))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and scenario tests
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod history;
pub mod identity;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod rules;
pub mod state_machine;
pub mod store;

pub use config::{ConfigManager, WorkflowConfig};
// Re-export constants events with different name to avoid conflict
pub use constants::events as event_names;
pub use error::{Result, WorkflowError};
pub use events::{EventPublisher, EventSubscriber, EventType, WorkflowEvent};
pub use history::{HistoryRecorder, HistoryStats};
pub use identity::{IdentityProvider, StaticIdentity};
pub use models::{
    ApprovalMode, HistoryAction, HistoryRecord, Node, NodeTemplate, NodeType, Process,
    ProcessTemplate, Rule, RuleTemplate, Task,
};
pub use orchestration::{
    NewProcess, NewRule, NewTask, NodeEngine, ProcessManager, SweepReport, Sweeper, TaskScheduler,
};
pub use rules::{Expression, RuleEvaluator};
pub use state_machine::{NodeStatus, ProcessStatus, TaskStatus};
pub use store::{InMemoryStore, Page, PageRequest, WorkflowStore};
