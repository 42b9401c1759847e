//! # Task Scheduler
//!
//! Actor-facing work items bound to Active task nodes.
//!
//! Completion follows the task's approval mode: `Any` closes on the first
//! qualifying action, `All` waits for every assignee of record, `Sequential`
//! only accepts the assignee whose turn it is. Partial approvals are recorded
//! on the task and in history while the task stays open. Once a task closes
//! its node is completed with the last action's outcome.
//!
//! The overdue and timeout sweeps live here as well; both are idempotent and
//! take the same per-process lock as foreground operations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::core::{EngineCore, Txn};
use super::node_engine::Step;
use crate::error::{Result, WorkflowError};
use crate::events::{EventType, WorkflowEvent};
use crate::logging::{log_error, log_task_operation};
use crate::models::node::offset_by_seconds;
use crate::models::{
    ApprovalMode, HistoryAction, HistoryRecord, Node, NodeType, Process, Task, TaskAction,
    TaskUpdate, WithdrawPolicy,
};
use crate::state_machine::{NodeStatus, ProcessEvent, TaskEvent, TaskStateMachine};
use crate::store::{NodeFilter, Page, PageRequest, TaskFilter};

/// Administrative request for an extra task on an Active task node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub name: Option<String>,
    pub assignees: Vec<String>,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TaskScheduler {
    core: Arc<EngineCore>,
}

impl TaskScheduler {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    /// Create a task on an Active task node that has none open
    pub async fn create_task(&self, node_id: Uuid, request: NewTask, operator: &str) -> Result<Task> {
        if request.assignees.is_empty() {
            return Err(WorkflowError::Validation("a task needs at least one assignee".into()));
        }
        let node = self.core.load_node(node_id).await?;
        let mut txn = self.core.begin(node.process_id).await?;
        let result = self.create_task_once(&mut txn, node_id, request, operator).await;
        self.core.finish(txn, result).await
    }

    async fn create_task_once(
        &self,
        txn: &mut Txn,
        node_id: Uuid,
        request: NewTask,
        operator: &str,
    ) -> Result<Task> {
        let process = self.core.load_process(txn.process_id).await?;
        EngineCore::ensure_running(&process, "create task")?;
        let node = self.core.load_node(node_id).await?;
        if node.node_type != NodeType::Task || node.status != NodeStatus::Active {
            return Err(WorkflowError::Validation(format!(
                "node {node_id} is not an Active task node"
            )));
        }
        let open = self
            .core
            .store
            .process_tasks(process.process_id)
            .await?
            .into_iter()
            .any(|task| task.node_id == node_id && task.is_open());
        if open {
            return Err(WorkflowError::Validation(format!("node {node_id} already has an open task")));
        }

        let task = Task::new(
            node.node_id,
            process.process_id,
            request.name.unwrap_or_else(|| node.name.clone()),
            request.assignees,
            request.approval_mode,
            operator,
            request.due_date,
        );
        self.core.insert_task_locked(txn, &process, task, operator).await
    }

    /// Record a completing action by `operator`.
    ///
    /// Closes the task and completes its node once the approval mode is
    /// satisfied. A routing failure on the node is reported through the error
    /// events and leaves the node retry-eligible; the completed task is still
    /// returned.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        operator: &str,
        comment: Option<String>,
        outcome: Option<String>,
    ) -> Result<Task> {
        self.core
            .with_conflict_retry("complete_task", || {
                self.complete_task_once(task_id, operator, comment.clone(), outcome.clone())
            })
            .await
    }

    async fn complete_task_once(
        &self,
        task_id: Uuid,
        operator: &str,
        comment: Option<String>,
        outcome: Option<String>,
    ) -> Result<Task> {
        let task = self.core.load_task(task_id).await?;
        let mut txn = self.core.begin(task.process_id).await?;
        let result = self
            .complete_task_locked(&mut txn, task_id, operator, comment, outcome)
            .await;
        self.core.finish(txn, result).await
    }

    async fn complete_task_locked(
        &self,
        txn: &mut Txn,
        task_id: Uuid,
        operator: &str,
        comment: Option<String>,
        outcome: Option<String>,
    ) -> Result<Task> {
        let mut process = self.core.load_process(txn.process_id).await?;
        EngineCore::ensure_running(&process, "complete task")?;
        let mut task = self.core.load_task(task_id).await?;
        if !task.is_open() {
            return Err(WorkflowError::invalid_transition("task", task_id, task.status, "complete"));
        }
        let assignee = task.eligible_assignee_for(operator).ok_or_else(|| {
            WorkflowError::Validation(format!(
                "operator '{operator}' is not an eligible assignee of task {task_id}"
            ))
        })?;

        let now = Utc::now();
        task.actions.push(TaskAction {
            operator: operator.to_string(),
            assignee: assignee.clone(),
            comment: comment.clone(),
            outcome: outcome.clone(),
            acted_at: now,
        });
        let details = json!({ "assignee": assignee, "comment": comment, "outcome": outcome });

        if !task.approval_satisfied() {
            task.updated_at = now;
            let task = self.core.store.update_task(&task).await?;
            txn.record(
                HistoryRecord::new(process.process_id, operator, HistoryAction::TaskApproved)
                    .with_node(task.node_id)
                    .with_task(task.task_id)
                    .with_details(json!({
                        "assignee": assignee,
                        "comment": comment,
                        "outcome": outcome,
                        "pending": task.pending_assignees(),
                    })),
            );
            debug!(task_id = %task_id, assignee = %assignee, pending = task.pending_assignees().len(), "Partial approval recorded");
            return Ok(task);
        }

        TaskStateMachine::new(&mut task).transition(TaskEvent::Complete, now)?;
        let task = self.core.store.update_task(&task).await?;
        txn.record(
            HistoryRecord::new(process.process_id, operator, HistoryAction::TaskCompleted)
                .with_node(task.node_id)
                .with_task(task.task_id)
                .with_duration(task.duration_ms())
                .with_details(details),
        );
        txn.emit(
            WorkflowEvent::for_process(EventType::TaskCompleted, &process)
                .with_task(&task)
                .with_operator(operator)
                .with_action(TaskEvent::Complete.event_type())
                .with_comment(comment)
                .with_duration(task.duration_ms())
                .with_timestamp(now)
                .with_detail("node_id", json!(task.node_id))
                .with_detail("outcome", json!(outcome)),
        );
        log_task_operation(
            "complete",
            process.process_id,
            task.task_id,
            Some(operator),
            &task.status.to_string(),
            None,
        );

        let step = Step::Complete {
            node_id: task.node_id,
            outcome: task.final_outcome(),
        };
        match self.core.drive(txn, &mut process, step, operator).await {
            Ok(()) => {}
            Err(WorkflowError::RuleEvaluation { node_id, reason }) => {
                warn!(task_id = %task_id, node_id = %node_id, reason = %reason, "Task completed but node routing failed");
            }
            Err(err) => return Err(err),
        }
        Ok(task)
    }

    /// Temporarily hand a pending assignee's turn to `to`; `from` stays the
    /// assignee of record
    pub async fn delegate(&self, task_id: Uuid, from: &str, to: &str, operator: &str) -> Result<Task> {
        self.reassign(task_id, from, to, operator, TaskEvent::Delegate).await
    }

    /// Permanently replace pending assignee `from` with `to`
    pub async fn transfer(&self, task_id: Uuid, from: &str, to: &str, operator: &str) -> Result<Task> {
        self.reassign(task_id, from, to, operator, TaskEvent::Transfer).await
    }

    async fn reassign(
        &self,
        task_id: Uuid,
        from: &str,
        to: &str,
        operator: &str,
        event: TaskEvent,
    ) -> Result<Task> {
        if to.trim().is_empty() {
            return Err(WorkflowError::Validation("reassignment target must not be blank".into()));
        }
        self.core
            .with_conflict_retry(event.event_type(), || {
                self.reassign_once(task_id, from, to, operator, event)
            })
            .await
    }

    async fn reassign_once(
        &self,
        task_id: Uuid,
        from: &str,
        to: &str,
        operator: &str,
        event: TaskEvent,
    ) -> Result<Task> {
        let task = self.core.load_task(task_id).await?;
        let mut txn = self.core.begin(task.process_id).await?;
        let result = self.reassign_locked(&mut txn, task_id, from, to, operator, event).await;
        self.core.finish(txn, result).await
    }

    async fn reassign_locked(
        &self,
        txn: &mut Txn,
        task_id: Uuid,
        from: &str,
        to: &str,
        operator: &str,
        event: TaskEvent,
    ) -> Result<Task> {
        let process = self.open_process(txn.process_id, event.event_type()).await?;
        let mut task = self.open_task(task_id, event.event_type()).await?;
        if !task.pending_assignees().contains(&from) {
            return Err(WorkflowError::Validation(format!(
                "'{from}' is not a pending assignee of task {task_id}"
            )));
        }
        if to == from || task.assignees.iter().any(|assignee| assignee == to) {
            return Err(WorkflowError::Validation(format!(
                "'{to}' is already an assignee of task {task_id}"
            )));
        }

        let (action, event_type) = match event {
            TaskEvent::Transfer => {
                for assignee in task.assignees.iter_mut().filter(|assignee| assignee.as_str() == from) {
                    *assignee = to.to_string();
                }
                task.delegations.remove(from);
                (HistoryAction::TaskTransferred, EventType::TaskTransferred)
            }
            _ => {
                task.delegations.insert(from.to_string(), to.to_string());
                (HistoryAction::TaskDelegated, EventType::TaskDelegated)
            }
        };
        let now = Utc::now();
        TaskStateMachine::new(&mut task).transition(event, now)?;
        let task = self.core.store.update_task(&task).await?;

        txn.record(
            HistoryRecord::new(process.process_id, operator, action)
                .with_node(task.node_id)
                .with_task(task.task_id)
                .with_details(json!({ "from": from, "to": to })),
        );
        txn.emit(
            WorkflowEvent::for_process(event_type, &process)
                .with_task(&task)
                .with_operator(operator)
                .with_action(event.event_type())
                .with_timestamp(now)
                .with_detail("from", json!(from))
                .with_detail("to", json!(to)),
        );
        log_task_operation(
            event.event_type(),
            process.process_id,
            task.task_id,
            Some(operator),
            &task.status.to_string(),
            Some(&format!("{from} -> {to}")),
        );
        Ok(task)
    }

    /// Remind the pending assignees; no state changes
    pub async fn urge(&self, task_id: Uuid, operator: &str, comment: Option<String>) -> Result<Task> {
        let task = self.core.load_task(task_id).await?;
        let mut txn = self.core.begin(task.process_id).await?;
        let result = async {
            let process = self.open_process(txn.process_id, "urge").await?;
            let task = self.open_task(task_id, "urge").await?;
            let pending: Vec<String> = task.pending_assignees().into_iter().map(str::to_string).collect();
            txn.record(
                HistoryRecord::new(process.process_id, operator, HistoryAction::TaskUrged)
                    .with_node(task.node_id)
                    .with_task(task.task_id)
                    .with_details(json!({ "comment": comment, "pending": pending })),
            );
            txn.emit(
                WorkflowEvent::for_process(EventType::TaskUrged, &process)
                    .with_task(&task)
                    .with_operator(operator)
                    .with_action("urge")
                    .with_comment(comment.clone())
                    .with_detail("pending", json!(pending)),
            );
            Ok::<Task, WorkflowError>(task)
        }
        .await;
        self.core.finish(txn, result).await
    }

    /// Pull back an open task. Only the task's creator or the process owner
    /// may withdraw; the node's withdraw policy decides what happens next.
    pub async fn withdraw(&self, task_id: Uuid, operator: &str) -> Result<Task> {
        self.core
            .with_conflict_retry("withdraw_task", || self.withdraw_once(task_id, operator))
            .await
    }

    async fn withdraw_once(&self, task_id: Uuid, operator: &str) -> Result<Task> {
        let task = self.core.load_task(task_id).await?;
        let mut txn = self.core.begin(task.process_id).await?;
        let result = self.withdraw_locked(&mut txn, task_id, operator).await;
        self.core.finish(txn, result).await
    }

    async fn withdraw_locked(&self, txn: &mut Txn, task_id: Uuid, operator: &str) -> Result<Task> {
        let mut process = self.core.load_process(txn.process_id).await?;
        EngineCore::ensure_running(&process, "withdraw task")?;
        let mut task = self.open_task(task_id, "withdraw").await?;
        if operator != task.created_by && operator != process.created_by {
            return Err(WorkflowError::Validation(format!(
                "operator '{operator}' may not withdraw task {task_id}"
            )));
        }

        let now = Utc::now();
        TaskStateMachine::new(&mut task).transition(TaskEvent::Withdraw, now)?;
        let task = self.core.store.update_task(&task).await?;
        txn.record(
            HistoryRecord::new(process.process_id, operator, HistoryAction::TaskWithdrawn)
                .with_node(task.node_id)
                .with_task(task.task_id)
                .with_duration(task.duration_ms()),
        );
        txn.emit(
            WorkflowEvent::for_process(EventType::TaskWithdrawn, &process)
                .with_task(&task)
                .with_operator(operator)
                .with_action(TaskEvent::Withdraw.event_type())
                .with_duration(task.duration_ms())
                .with_timestamp(now),
        );

        let node = self.core.load_node(task.node_id).await?;
        if node.status != NodeStatus::Active {
            return Ok(task);
        }
        match node.config.withdraw_policy {
            WithdrawPolicy::Requeue => {
                self.core.create_task_locked(txn, &process, &node, operator).await?;
            }
            WithdrawPolicy::CancelNode => {
                self.core.cancel_node_with_retry(txn, &process, node, operator).await?;
                let completed = self.core.complete_if_finished(txn, &mut process, operator).await?;
                if !completed && self.core.in_flight_nodes(process.process_id).await?.is_empty() {
                    let reason = format!("task '{}' withdrawn", task.name);
                    self.core
                        .finish_process(txn, &mut process, ProcessEvent::Cancel(reason), operator)
                        .await?;
                }
            }
        }
        Ok(task)
    }

    /// Drop a pending assignee from an open task. The last pending assignee
    /// cannot be removed, so this never completes the task.
    pub async fn remove_assignee(&self, task_id: Uuid, assignee: &str, operator: &str) -> Result<Task> {
        self.core
            .with_conflict_retry("remove_assignee", || {
                self.remove_assignee_once(task_id, assignee, operator)
            })
            .await
    }

    async fn remove_assignee_once(&self, task_id: Uuid, assignee: &str, operator: &str) -> Result<Task> {
        let task = self.core.load_task(task_id).await?;
        let mut txn = self.core.begin(task.process_id).await?;
        let result = self.remove_assignee_locked(&mut txn, task_id, assignee, operator).await;
        self.core.finish(txn, result).await
    }

    async fn remove_assignee_locked(
        &self,
        txn: &mut Txn,
        task_id: Uuid,
        assignee: &str,
        operator: &str,
    ) -> Result<Task> {
        let process = self.open_process(txn.process_id, "remove assignee").await?;
        let mut task = self.open_task(task_id, "remove assignee").await?;
        let pending = task.pending_assignees();
        if !pending.contains(&assignee) {
            return Err(WorkflowError::Validation(format!(
                "'{assignee}' is not a pending assignee of task {task_id}"
            )));
        }
        if pending.len() == 1 {
            return Err(WorkflowError::Validation(format!(
                "'{assignee}' is the last pending assignee of task {task_id}"
            )));
        }

        task.assignees.retain(|candidate| candidate != assignee);
        task.delegations.remove(assignee);
        task.updated_at = Utc::now();
        let task = self.core.store.update_task(&task).await?;
        txn.record(
            HistoryRecord::new(process.process_id, operator, HistoryAction::TaskAssigneeRemoved)
                .with_node(task.node_id)
                .with_task(task.task_id)
                .with_details(json!({ "assignee": assignee, "remaining": task.assignees })),
        );
        log_task_operation(
            "remove_assignee",
            process.process_id,
            task.task_id,
            Some(operator),
            &task.status.to_string(),
            Some(assignee),
        );
        Ok(task)
    }

    /// Edit name or due date of an open task
    pub async fn update(&self, task_id: Uuid, update: TaskUpdate, operator: &str) -> Result<Task> {
        if update.name.is_none() && update.due_date.is_none() {
            return Err(WorkflowError::Validation("task update has no fields".into()));
        }
        let task = self.core.load_task(task_id).await?;
        let txn = self.core.begin(task.process_id).await?;
        let result = async {
            let mut task = self.open_task(task_id, "update").await?;
            if let Some(name) = update.name {
                task.name = name;
            }
            if let Some(due_date) = update.due_date {
                task.due_date = Some(due_date);
            }
            task.updated_at = Utc::now();
            let task = self.core.store.update_task(&task).await?;
            log_task_operation("update", task.process_id, task.task_id, Some(operator), &task.status.to_string(), None);
            Ok::<Task, WorkflowError>(task)
        }
        .await;
        self.core.finish(txn, result).await
    }

    /// Delete a task row; only allowed once its process has ended
    pub async fn delete(&self, task_id: Uuid) -> Result<()> {
        let task = self.core.load_task(task_id).await?;
        let txn = self.core.begin(task.process_id).await?;
        let result = async {
            let process = self.core.load_process(task.process_id).await?;
            if !process.is_terminal() {
                return Err(WorkflowError::invalid_transition(
                    "task",
                    task_id,
                    task.status,
                    "delete while its process is not finished",
                ));
            }
            self.core.store.delete_task(task_id).await?;
            debug!(task_id = %task_id, "Deleted task");
            Ok::<(), WorkflowError>(())
        }
        .await;
        self.core.finish(txn, result).await
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Task> {
        self.core.load_task(task_id).await
    }

    pub async fn list(&self, filter: &TaskFilter, page: &PageRequest) -> Result<Page<Task>> {
        Ok(self.core.store.list_tasks(filter, page).await?)
    }

    pub async fn count(&self, filter: &TaskFilter) -> Result<u64> {
        Ok(self.core.store.count_tasks(filter).await?)
    }

    /// Open tasks where `operator` is an assignee of record or a delegate
    pub async fn tasks_for_assignee(&self, operator: &str, page: &PageRequest) -> Result<Page<Task>> {
        let filter = TaskFilter {
            assignee: Some(operator.to_string()),
            open_only: true,
            ..Default::default()
        };
        self.list(&filter, page).await
    }

    pub async fn process_tasks(&self, process_id: Uuid) -> Result<Vec<Task>> {
        Ok(self.core.store.process_tasks(process_id).await?)
    }

    /// Mark open tasks whose due date passed as Overdue.
    ///
    /// Tasks already carrying `overdue_at` are skipped, so repeated sweeps add
    /// no history or events. Returns the number of tasks marked.
    pub async fn sweep_overdue(&self, now: DateTime<Utc>) -> Result<usize> {
        let filter = TaskFilter {
            open_only: true,
            due_before: Some(now),
            ..Default::default()
        };
        let batch = self.core.config.scheduler.sweep_batch_size;
        let operator = self.core.system_operator();
        let mut cursor = None;
        let mut marked = 0;

        loop {
            let page = PageRequest {
                cursor: cursor.take(),
                limit: Some(batch),
            };
            let page = self.core.store.list_tasks(&filter, &page).await?;
            for task in page.items.into_iter().filter(|task| task.overdue_at.is_none()) {
                match self.mark_overdue(task.task_id, task.process_id, now, &operator).await {
                    Ok(true) => marked += 1,
                    Ok(false) => {}
                    Err(err) => log_error("scheduler", "sweep_overdue", &err.to_string(), Some(&task.task_id.to_string())),
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if marked > 0 {
            info!(marked = marked, "Overdue sweep marked tasks");
        }
        Ok(marked)
    }

    async fn mark_overdue(&self, task_id: Uuid, process_id: Uuid, now: DateTime<Utc>, operator: &str) -> Result<bool> {
        let mut txn = self.core.begin(process_id).await?;
        let result = self.mark_overdue_locked(&mut txn, task_id, now, operator).await;
        self.core.finish(txn, result).await
    }

    async fn mark_overdue_locked(&self, txn: &mut Txn, task_id: Uuid, now: DateTime<Utc>, operator: &str) -> Result<bool> {
        let process = self.core.load_process(txn.process_id).await?;
        let mut task = self.core.load_task(task_id).await?;
        let due = task.due_date.is_some_and(|due| due <= now);
        let markable = crate::state_machine::task_state_machine::determine_target_state(
            task.status,
            TaskEvent::MarkOverdue,
        )
        .is_some();
        if process.is_terminal() || task.overdue_at.is_some() || !due || !markable {
            return Ok(false);
        }

        TaskStateMachine::new(&mut task).transition(TaskEvent::MarkOverdue, now)?;
        let task = self.core.store.update_task(&task).await?;
        txn.record(
            HistoryRecord::new(process.process_id, operator, HistoryAction::TaskOverdue)
                .with_node(task.node_id)
                .with_task(task.task_id)
                .with_details(json!({ "due_date": task.due_date })),
        );
        txn.emit(
            WorkflowEvent::for_process(EventType::TaskOverdue, &process)
                .with_task(&task)
                .with_operator(operator)
                .with_action(TaskEvent::MarkOverdue.event_type())
                .with_timestamp(now)
                .with_detail("due_date", json!(task.due_date)),
        );
        Ok(true)
    }

    /// Time out Active nodes whose deadline passed. Nodes of processes that
    /// are not Running are left for a later sweep.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<usize> {
        let filter = NodeFilter {
            status: Some(NodeStatus::Active),
            deadline_before: Some(now),
            ..Default::default()
        };
        let batch = self.core.config.scheduler.sweep_batch_size;
        let operator = self.core.system_operator();
        let mut cursor = None;
        let mut timed_out = 0;

        loop {
            let page = PageRequest {
                cursor: cursor.take(),
                limit: Some(batch),
            };
            let page = self.core.store.list_nodes(&filter, &page).await?;
            for node in page.items {
                match self.timeout_if_due(node.node_id, node.process_id, now, &operator).await {
                    Ok(true) => timed_out += 1,
                    Ok(false) => {}
                    Err(err) => log_error("scheduler", "sweep_timeouts", &err.to_string(), Some(&node.node_id.to_string())),
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if timed_out > 0 {
            info!(timed_out = timed_out, "Timeout sweep closed nodes");
        }
        Ok(timed_out)
    }

    async fn timeout_if_due(&self, node_id: Uuid, process_id: Uuid, now: DateTime<Utc>, operator: &str) -> Result<bool> {
        let mut txn = self.core.begin(process_id).await?;
        let result = async {
            let mut process = self.core.load_process(process_id).await?;
            if !process.status.is_active() {
                return Ok(false);
            }
            let node = self.core.load_node(node_id).await?;
            let due = node.deadline().is_some_and(|deadline| deadline <= now);
            if node.status != NodeStatus::Active || !due {
                return Ok(false);
            }
            self.core.timeout_node_locked(&mut txn, &mut process, node, operator).await?;
            Ok::<bool, WorkflowError>(true)
        }
        .await;
        self.core.finish(txn, result).await
    }

    async fn open_process(&self, process_id: Uuid, action: &str) -> Result<Process> {
        let process = self.core.load_process(process_id).await?;
        if process.is_terminal() {
            return Err(WorkflowError::invalid_transition("process", process_id, process.status, action));
        }
        Ok(process)
    }

    async fn open_task(&self, task_id: Uuid, action: &str) -> Result<Task> {
        let task = self.core.load_task(task_id).await?;
        if !task.is_open() {
            return Err(WorkflowError::invalid_transition("task", task_id, task.status, action));
        }
        Ok(task)
    }
}

impl EngineCore {
    /// Create and assign the task for a freshly activated task node
    pub(crate) async fn create_task_locked(
        &self,
        txn: &mut Txn,
        process: &Process,
        node: &Node,
        operator: &str,
    ) -> Result<Task> {
        let now = Utc::now();
        let due_date = match node.config.due_in_seconds {
            Some(seconds) => Some(offset_by_seconds(now, seconds).ok_or_else(|| {
                WorkflowError::Validation(format!(
                    "node '{}' due offset {seconds}s is out of range",
                    node.template_key
                ))
            })?),
            None => match self.config.scheduler.default_due_hours {
                Some(hours) => Some(
                    Duration::try_hours(hours)
                        .and_then(|delta| now.checked_add_signed(delta))
                        .ok_or_else(|| {
                            WorkflowError::Configuration(format!(
                                "scheduler.default_due_hours {hours} is out of range"
                            ))
                        })?,
                ),
                None => None,
            },
        };
        let task = Task::new(
            node.node_id,
            process.process_id,
            node.name.clone(),
            node.config.assignees.clone(),
            node.config.approval_mode,
            process.created_by.clone(),
            due_date,
        );
        self.insert_task_locked(txn, process, task, operator).await
    }

    pub(crate) async fn insert_task_locked(
        &self,
        txn: &mut Txn,
        process: &Process,
        mut task: Task,
        operator: &str,
    ) -> Result<Task> {
        let now = Utc::now();
        TaskStateMachine::new(&mut task).transition(TaskEvent::Assign, now)?;
        self.store.create_task(&task).await?;

        txn.record(
            HistoryRecord::new(process.process_id, operator, HistoryAction::TaskCreated)
                .with_node(task.node_id)
                .with_task(task.task_id)
                .with_details(json!({
                    "assignees": task.assignees,
                    "approval_mode": task.approval_mode,
                    "due_date": task.due_date,
                })),
        );
        txn.emit(
            WorkflowEvent::for_process(EventType::TaskCreated, process)
                .with_task(&task)
                .with_operator(operator)
                .with_action("create")
                .with_timestamp(now)
                .with_detail("node_id", json!(task.node_id))
                .with_detail("approval_mode", json!(task.approval_mode))
                .with_detail("due_date", json!(task.due_date)),
        );
        txn.emit(
            WorkflowEvent::for_process(EventType::TaskAssigned, process)
                .with_task(&task)
                .with_operator(operator)
                .with_action(TaskEvent::Assign.event_type())
                .with_timestamp(now)
                .with_detail("node_id", json!(task.node_id)),
        );
        log_task_operation(
            "create",
            process.process_id,
            task.task_id,
            Some(operator),
            &task.status.to_string(),
            None,
        );
        Ok(task)
    }
}
