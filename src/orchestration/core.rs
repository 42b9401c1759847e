//! # Engine Core
//!
//! Shared state behind [`ProcessManager`](super::ProcessManager),
//! [`NodeEngine`](super::NodeEngine) and [`TaskScheduler`](super::TaskScheduler).
//!
//! Every mutating operation follows the same shape:
//!
//! 1. take the per-process lock ([`EngineCore::begin`])
//! 2. validate against the current persisted status, then write the primary
//!    state changes through the store (optimistic version checks)
//! 3. collect history records and events on the [`Txn`] while writing
//! 4. [`EngineCore::finish`]: append history and publish events for whatever
//!    was committed, then release the lock. Once a process has reached a
//!    terminal status its lock entry and history cursor are dropped.
//!
//! History and events are therefore never emitted for a write that did not
//! commit, and a failure to record or deliver them never undoes a commit.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::locks::{ProcessGuard, ProcessLocks};
use crate::config::WorkflowConfig;
use crate::error::{Result, WorkflowError};
use crate::events::{EventPublisher, EventType, WorkflowEvent};
use crate::history::HistoryRecorder;
use crate::identity::IdentityProvider;
use crate::logging::{log_error, log_process_operation};
use crate::models::{HistoryAction, HistoryRecord, Node, Process, Task};
use crate::rules::RuleEvaluator;
use crate::state_machine::guards::{ReasonRequiredGuard, StateGuard};
use crate::state_machine::process_state_machine::determine_target_state;
use crate::state_machine::{
    NodeEvent, NodeStateMachine, NodeStatus, ProcessEvent, ProcessStateMachine, TaskEvent,
    TaskStateMachine,
};
use crate::store::WorkflowStore;

/// Effects of one locked operation, flushed by [`EngineCore::finish`]
#[derive(Debug)]
pub(crate) struct Txn {
    pub(crate) process_id: Uuid,
    _guard: ProcessGuard,
    history: Vec<HistoryRecord>,
    events: Vec<WorkflowEvent>,
    /// Set when the process reached a terminal status in this operation
    ended: bool,
}

impl Txn {
    pub(crate) fn record(&mut self, record: HistoryRecord) {
        self.history.push(record);
    }

    pub(crate) fn emit(&mut self, event: WorkflowEvent) {
        self.events.push(event);
    }
}

pub struct EngineCore {
    pub(crate) store: Arc<dyn WorkflowStore>,
    pub(crate) rules: RuleEvaluator,
    pub(crate) history: Arc<HistoryRecorder>,
    pub(crate) events: Arc<EventPublisher>,
    pub(crate) locks: ProcessLocks,
    pub(crate) identity: Arc<dyn IdentityProvider>,
    pub(crate) config: WorkflowConfig,
}

impl std::fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCore")
            .field("config", &self.config)
            .field("locks", &self.locks.len())
            .finish()
    }
}

impl EngineCore {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        history: Arc<HistoryRecorder>,
        events: Arc<EventPublisher>,
        identity: Arc<dyn IdentityProvider>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            store,
            rules: RuleEvaluator::new(),
            history,
            events,
            locks: ProcessLocks::new(config.engine.lock_timeout()),
            identity,
            config,
        }
    }

    pub(crate) fn system_operator(&self) -> String {
        self.identity.system_operator()
    }

    pub(crate) async fn begin(&self, process_id: Uuid) -> Result<Txn> {
        let guard = self.locks.acquire(process_id).await?;
        Ok(Txn {
            process_id,
            _guard: guard,
            history: Vec::new(),
            events: Vec::new(),
            ended: false,
        })
    }

    /// Flush the effects of `txn` and hand back the operation's result
    pub(crate) async fn finish<T>(&self, txn: Txn, result: Result<T>) -> Result<T> {
        let Txn {
            process_id,
            _guard,
            history,
            events,
            ended,
        } = txn;
        if let Err(err) = &result {
            debug!(process_id = %process_id, error = %err, "Operation failed, flushing committed effects");
        }
        self.history.append_all(history).await;
        self.events.publish_all(events).await;
        if ended {
            self.history.forget(process_id);
            drop(_guard);
            self.locks.evict(process_id);
        }
        result
    }

    /// Re-run `operation` on optimistic version conflicts, up to
    /// `engine.max_conflict_retries` extra attempts
    pub(crate) async fn with_conflict_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retries = self.config.engine.max_conflict_retries;
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if err.is_retryable() && attempt < retries => {
                    attempt += 1;
                    warn!(
                        operation = %operation,
                        attempt = attempt,
                        error = %err,
                        "Concurrency conflict, retrying"
                    );
                    let backoff = self.config.engine.conflict_backoff() * attempt;
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    pub(crate) async fn load_process(&self, process_id: Uuid) -> Result<Process> {
        Ok(self.store.get_process(process_id).await?)
    }

    pub(crate) async fn load_node(&self, node_id: Uuid) -> Result<Node> {
        Ok(self.store.get_node(node_id).await?)
    }

    pub(crate) async fn load_task(&self, task_id: Uuid) -> Result<Task> {
        Ok(self.store.get_task(task_id).await?)
    }

    /// Fail unless the process may advance automatically
    pub(crate) fn ensure_running(process: &Process, action: &str) -> Result<()> {
        if process.status.is_active() {
            return Ok(());
        }
        Err(WorkflowError::invalid_transition(
            "process",
            process.process_id,
            process.status,
            action,
        ))
    }

    /// Nodes that still take part in the run: Active nodes and joins that
    /// have received at least one branch
    pub(crate) async fn in_flight_nodes(&self, process_id: Uuid) -> Result<Vec<Node>> {
        Ok(self
            .store
            .process_nodes(process_id)
            .await?
            .into_iter()
            .filter(node_in_flight)
            .collect())
    }

    /// Apply a process state-machine event, persist it, and record the
    /// matching history entry and event
    pub(crate) async fn transition_process(
        &self,
        txn: &mut Txn,
        process: &mut Process,
        event: ProcessEvent,
        operator: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        let now = Utc::now();
        let from = process.status;
        let to = ProcessStateMachine::new(process).transition(&event, now)?;
        process.updated_at = now;
        *process = self.store.update_process(process).await?;

        let action = match &event {
            ProcessEvent::Start => HistoryAction::ProcessStarted,
            ProcessEvent::Suspend(_) => HistoryAction::ProcessSuspended,
            ProcessEvent::Resume => HistoryAction::ProcessResumed,
            ProcessEvent::Complete => HistoryAction::ProcessCompleted,
            ProcessEvent::Terminate(_) => HistoryAction::ProcessTerminated,
            ProcessEvent::Reject(_) => HistoryAction::ProcessRejected,
            ProcessEvent::Cancel(_) => HistoryAction::ProcessCancelled,
            ProcessEvent::Withdraw => HistoryAction::ProcessWithdrawn,
        };
        let event_type = match &event {
            ProcessEvent::Withdraw => Some(EventType::ProcessWithdraw),
            ProcessEvent::Resume => Some(EventType::ProcessResumed),
            _ => EventType::for_process_status(to),
        };

        let mut details = match details {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        details.insert("from".into(), json!(from));
        details.insert("to".into(), json!(to));
        if let Some(reason) = event.reason() {
            details.insert("reason".into(), json!(reason));
        }

        txn.record(
            HistoryRecord::new(process.process_id, operator, action)
                .with_duration(if to.is_terminal() { process.duration_ms() } else { None })
                .with_details(serde_json::Value::Object(details.clone())),
        );
        if to.is_terminal() {
            txn.ended = true;
        }
        if let Some(event_type) = event_type {
            let mut published = WorkflowEvent::for_process(event_type, process)
                .with_operator(operator)
                .with_action(event.event_type())
                .with_comment(event.reason().map(str::to_string))
                .with_timestamp(now);
            if to.is_terminal() {
                published = published.with_duration(process.duration_ms());
            }
            published.details = details;
            txn.emit(published);
        }

        log_process_operation(
            event.event_type(),
            process.process_id,
            Some(&process.name),
            &to.to_string(),
            Some(operator),
            event.reason(),
        );
        Ok(())
    }

    /// Cancel every open task and in-flight node of a process, then apply the
    /// terminal process event.
    ///
    /// Each child is retried individually on conflict; children that still
    /// fail are reported in the process history details rather than blocking
    /// the process transition.
    pub(crate) async fn finish_process(
        &self,
        txn: &mut Txn,
        process: &mut Process,
        event: ProcessEvent,
        operator: &str,
    ) -> Result<()> {
        let to = determine_target_state(process.status, &event).ok_or_else(|| {
            WorkflowError::invalid_transition("process", process.process_id, process.status, event.event_type())
        })?;
        ReasonRequiredGuard.check(&event)?;

        let failures = self.cascade_cancel(txn, process, operator).await;
        let details = if failures.is_empty() {
            json!({})
        } else {
            json!({ "cascade_failures": failures })
        };
        self.transition_process(txn, process, event, operator, details).await?;

        info!(
            process_id = %process.process_id,
            status = %to,
            cascade_failures = failures.len(),
            "Process finished"
        );
        Ok(())
    }

    /// Cancel open tasks then in-flight nodes; returns the ids that could not
    /// be cancelled
    pub(crate) async fn cascade_cancel(&self, txn: &mut Txn, process: &Process, operator: &str) -> Vec<String> {
        let mut failures = Vec::new();

        let tasks = match self.store.process_tasks(process.process_id).await {
            Ok(tasks) => tasks,
            Err(err) => {
                log_error("engine", "cascade_cancel", &err.to_string(), Some(&process.process_id.to_string()));
                failures.push(format!("tasks of {}", process.process_id));
                Vec::new()
            }
        };
        for task in tasks.into_iter().filter(Task::is_open) {
            let task_id = task.task_id;
            if let Err(err) = self
                .close_task_with_retry(txn, process, task, TaskEvent::Cancel, operator)
                .await
            {
                log_error("engine", "cancel_task", &err.to_string(), Some(&task_id.to_string()));
                failures.push(task_id.to_string());
            }
        }

        let nodes = match self.in_flight_nodes(process.process_id).await {
            Ok(nodes) => nodes,
            Err(err) => {
                log_error("engine", "cascade_cancel", &err.to_string(), Some(&process.process_id.to_string()));
                failures.push(format!("nodes of {}", process.process_id));
                Vec::new()
            }
        };
        for node in nodes {
            let node_id = node.node_id;
            if let Err(err) = self.cancel_node_with_retry(txn, process, node, operator).await {
                log_error("engine", "cancel_node", &err.to_string(), Some(&node_id.to_string()));
                failures.push(node_id.to_string());
            }
        }
        failures
    }

    /// Move an open task to a closing status (Cancel or Timeout), reloading
    /// and retrying on version conflicts
    pub(crate) async fn close_task_with_retry(
        &self,
        txn: &mut Txn,
        process: &Process,
        mut task: Task,
        event: TaskEvent,
        operator: &str,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.close_task(txn, process, &mut task, event, operator).await {
                Err(err) if err.is_retryable() && attempt < self.config.engine.max_conflict_retries => {
                    attempt += 1;
                    task = self.load_task(task.task_id).await?;
                    if !task.is_open() {
                        return Ok(());
                    }
                }
                other => return other,
            }
        }
    }

    async fn close_task(
        &self,
        txn: &mut Txn,
        process: &Process,
        task: &mut Task,
        event: TaskEvent,
        operator: &str,
    ) -> Result<()> {
        let now = Utc::now();
        TaskStateMachine::new(task).transition(event, now)?;
        task.updated_at = now;
        *task = self.store.update_task(task).await?;

        let (action, event_type) = match event {
            TaskEvent::Timeout => (HistoryAction::TaskTimeout, EventType::TaskTimeout),
            _ => (HistoryAction::TaskCancelled, EventType::TaskCancelled),
        };
        txn.record(
            HistoryRecord::new(process.process_id, operator, action)
                .with_node(task.node_id)
                .with_task(task.task_id)
                .with_duration(task.duration_ms()),
        );
        txn.emit(
            WorkflowEvent::for_process(event_type, process)
                .with_task(task)
                .with_operator(operator)
                .with_action(event.event_type())
                .with_duration(task.duration_ms())
                .with_timestamp(now)
                .with_detail("node_id", json!(task.node_id)),
        );
        Ok(())
    }

    pub(crate) async fn cancel_node_with_retry(
        &self,
        txn: &mut Txn,
        process: &Process,
        mut node: Node,
        operator: &str,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.cancel_node(txn, process, &mut node, operator).await {
                Err(err) if err.is_retryable() && attempt < self.config.engine.max_conflict_retries => {
                    attempt += 1;
                    node = self.load_node(node.node_id).await?;
                    if !node.is_open() {
                        return Ok(());
                    }
                }
                other => return other,
            }
        }
    }

    async fn cancel_node(&self, txn: &mut Txn, process: &Process, node: &mut Node, operator: &str) -> Result<()> {
        let now = Utc::now();
        let duration = node.duration_ms(now);
        NodeStateMachine::new(node).transition(NodeEvent::Cancel, now)?;
        node.updated_at = now;
        *node = self.store.update_node(node).await?;

        txn.record(
            HistoryRecord::new(process.process_id, operator, HistoryAction::NodeCancelled)
                .with_node(node.node_id)
                .with_duration(duration),
        );
        txn.emit(
            WorkflowEvent::for_process(EventType::NodeCancelled, process)
                .with_node(node)
                .with_operator(operator)
                .with_action(NodeEvent::Cancel.event_type())
                .with_duration(duration)
                .with_timestamp(now),
        );
        Ok(())
    }

    /// Record an error against a process in history and on both error events
    pub(crate) fn record_error(
        &self,
        txn: &mut Txn,
        process: &Process,
        node: Option<&Node>,
        operator: &str,
        err: &WorkflowError,
        at: DateTime<Utc>,
    ) {
        let mut record = HistoryRecord::new(
            process.process_id,
            operator,
            if node.is_some() { HistoryAction::NodeError } else { HistoryAction::ProcessError },
        )
        .with_details(json!({ "code": err.code(), "error": err.to_string() }));
        if let Some(node) = node {
            record = record.with_node(node.node_id);
        }
        txn.record(record);

        if let Some(node) = node {
            txn.emit(
                WorkflowEvent::for_process(EventType::NodeError, process)
                    .with_node(node)
                    .with_operator(operator)
                    .with_error(err)
                    .with_timestamp(at),
            );
        }
        let mut process_event = WorkflowEvent::for_process(EventType::ProcessError, process)
            .with_operator(operator)
            .with_error(err)
            .with_timestamp(at);
        if let Some(node) = node {
            process_event = process_event.with_node(node);
        }
        txn.emit(process_event);
        log_error("engine", "route", &err.to_string(), Some(&process.process_id.to_string()));
    }
}

/// Whether a node still participates in the run
pub(crate) fn node_in_flight(node: &Node) -> bool {
    match node.status {
        NodeStatus::Active => true,
        NodeStatus::Pending => node.incoming_completed > 0,
        _ => false,
    }
}
