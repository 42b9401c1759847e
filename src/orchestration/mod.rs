//! # Orchestration
//!
//! Coordinates processes, nodes and tasks over a shared [`EngineCore`].
//!
//! ## Components
//!
//! - **ProcessManager**: process lifecycle, admin CRUD and history queries
//! - **NodeEngine**: node activation, completion, routing and joins
//! - **TaskScheduler**: task creation, approval, reassignment and sweeps
//! - **Sweeper**: background loop for overdue tasks, timeouts and redelivery
//!
//! Every mutation takes the per-process lock, writes the store, then appends
//! history and publishes events in that order before the lock is released.

pub mod core;
pub mod locks;
pub mod node_engine;
pub mod process_manager;
pub mod sweeper;
pub mod task_scheduler;

pub use self::core::EngineCore;
pub use locks::{ProcessGuard, ProcessLocks};
pub use node_engine::NodeEngine;
pub use process_manager::{NewProcess, NewRule, ProcessManager};
pub use sweeper::{SweepReport, Sweeper};
pub use task_scheduler::{NewTask, TaskScheduler};
