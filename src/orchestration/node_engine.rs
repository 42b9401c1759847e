//! # Node Engine
//!
//! Drives a process across its node graph.
//!
//! ## Overview
//!
//! Activation and completion are expressed as [`Step`]s on a work queue that
//! is drained while the process lock is held. A Start, Gateway, End or system
//! Task node queues its own completion; an actor Task node hands off to the
//! task scheduler and waits. Completing a node asks the [`RuleEvaluator`]
//! for targets and bumps their fan-in counters, queueing the ones whose
//! barrier is satisfied.
//!
//! ## Routing failures
//!
//! When no rule matches and there is no default, the node stays Active with
//! `last_error` set, `workflow.node.error` and `workflow.process.error` are
//! published and the process keeps Running. The node can then be retried
//! through [`ProcessManager::retry_node`](super::ProcessManager::retry_node).
//!
//! [`RuleEvaluator`]: crate::rules::RuleEvaluator

use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::core::{node_in_flight, EngineCore, Txn};
use crate::error::{Result, WorkflowError};
use crate::events::{EventType, WorkflowEvent};
use crate::logging::log_node_operation;
use crate::models::{EndKind, HistoryAction, HistoryRecord, Node, NodeType, Process, TimeoutAction};
use crate::rules::Environment;
use crate::state_machine::{NodeEvent, NodeStateMachine, NodeStatus, ProcessEvent, TaskEvent};
use crate::store::{NodeFilter, Page, PageRequest};

/// One unit of graph progress
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Activate { node_id: Uuid, prev: Option<Uuid> },
    Complete { node_id: Uuid, outcome: Option<String> },
}

/// Public handle for node-level operations
#[derive(Debug, Clone)]
pub struct NodeEngine {
    core: Arc<EngineCore>,
}

impl NodeEngine {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    /// Activate a Pending node of a Running process and drive the graph
    /// forward from it
    pub async fn activate(&self, node_id: Uuid, operator: &str) -> Result<Node> {
        self.core
            .with_conflict_retry("activate_node", || self.activate_once(node_id, operator))
            .await
    }

    async fn activate_once(&self, node_id: Uuid, operator: &str) -> Result<Node> {
        let node = self.core.load_node(node_id).await?;
        let mut txn = self.core.begin(node.process_id).await?;
        let result = async {
            let mut process = self.core.load_process(node.process_id).await?;
            EngineCore::ensure_running(&process, "activate node")?;
            let node = self.core.load_node(node_id).await?;
            if node.status != NodeStatus::Pending {
                return Err(WorkflowError::invalid_transition("node", node_id, node.status, "activate"));
            }
            self.core
                .drive(&mut txn, &mut process, Step::Activate { node_id, prev: None }, operator)
                .await?;
            self.core.load_node(node_id).await
        }
        .await;
        self.core.finish(txn, result).await
    }

    /// Complete an Active node with an optional outcome and route onwards.
    ///
    /// Actor task nodes complete through their task; calling this on one that
    /// still has an open task is rejected.
    pub async fn complete(&self, node_id: Uuid, outcome: Option<String>, operator: &str) -> Result<Node> {
        self.core
            .with_conflict_retry("complete_node", || {
                self.complete_once(node_id, outcome.clone(), operator)
            })
            .await
    }

    async fn complete_once(&self, node_id: Uuid, outcome: Option<String>, operator: &str) -> Result<Node> {
        let node = self.core.load_node(node_id).await?;
        let mut txn = self.core.begin(node.process_id).await?;
        let result = async {
            let mut process = self.core.load_process(node.process_id).await?;
            EngineCore::ensure_running(&process, "complete node")?;
            let open_tasks = self
                .core
                .store
                .process_tasks(process.process_id)
                .await?
                .into_iter()
                .filter(|task| task.node_id == node_id && task.is_open())
                .count();
            if open_tasks > 0 {
                return Err(WorkflowError::Validation(format!(
                    "node {node_id} has {open_tasks} open task(s); complete the task instead"
                )));
            }
            self.core
                .drive(&mut txn, &mut process, Step::Complete { node_id, outcome }, operator)
                .await?;
            self.core.load_node(node_id).await
        }
        .await;
        self.core.finish(txn, result).await
    }

    /// Time out an Active node and apply its timeout policy
    pub async fn timeout(&self, node_id: Uuid, operator: &str) -> Result<Node> {
        self.core
            .with_conflict_retry("timeout_node", || self.timeout_once(node_id, operator))
            .await
    }

    async fn timeout_once(&self, node_id: Uuid, operator: &str) -> Result<Node> {
        let node = self.core.load_node(node_id).await?;
        let mut txn = self.core.begin(node.process_id).await?;
        let result = async {
            let mut process = self.core.load_process(node.process_id).await?;
            EngineCore::ensure_running(&process, "time out node")?;
            let node = self.core.load_node(node_id).await?;
            self.core.timeout_node_locked(&mut txn, &mut process, node, operator).await?;
            self.core.load_node(node_id).await
        }
        .await;
        self.core.finish(txn, result).await
    }

    pub async fn get(&self, node_id: Uuid) -> Result<Node> {
        self.core.load_node(node_id).await
    }

    pub async fn list(&self, filter: &NodeFilter, page: &PageRequest) -> Result<Page<Node>> {
        Ok(self.core.store.list_nodes(filter, page).await?)
    }

    pub async fn count(&self, filter: &NodeFilter) -> Result<u64> {
        Ok(self.core.store.count_nodes(filter).await?)
    }

    /// Every node of a process, in creation order
    pub async fn process_nodes(&self, process_id: Uuid) -> Result<Vec<Node>> {
        Ok(self.core.store.process_nodes(process_id).await?)
    }
}

impl EngineCore {
    /// Drain the step queue starting at `initial`.
    ///
    /// Stops early once the process leaves Running (an End node finished it,
    /// or a timeout terminated it); remaining steps are dropped because the
    /// cascade already closed their nodes.
    pub(crate) async fn drive(
        &self,
        txn: &mut Txn,
        process: &mut Process,
        initial: Step,
        operator: &str,
    ) -> Result<()> {
        let mut queue = VecDeque::from([initial]);

        while let Some(step) = queue.pop_front() {
            if !process.status.is_active() {
                debug!(process_id = %process.process_id, status = %process.status, "Process left Running, dropping queued steps");
                break;
            }
            match step {
                Step::Activate { node_id, prev } => {
                    self.activate_node_locked(txn, process, node_id, prev, operator, &mut queue)
                        .await?;
                }
                Step::Complete { node_id, outcome } => {
                    self.complete_node_locked(txn, process, node_id, outcome, operator, &mut queue)
                        .await?;
                    self.complete_if_finished(txn, process, operator).await?;
                }
            }
        }
        Ok(())
    }

    async fn activate_node_locked(
        &self,
        txn: &mut Txn,
        process: &mut Process,
        node_id: Uuid,
        prev: Option<Uuid>,
        operator: &str,
        queue: &mut VecDeque<Step>,
    ) -> Result<()> {
        let mut node = self.load_node(node_id).await?;
        if node.status != NodeStatus::Pending {
            debug!(node_id = %node_id, status = %node.status, "Node already left Pending, skipping activation");
            return Ok(());
        }

        let now = Utc::now();
        NodeStateMachine::new(&mut node).transition(NodeEvent::Activate, now)?;
        let node = self.store.update_node(&node).await?;

        txn.record(
            HistoryRecord::new(process.process_id, operator, HistoryAction::NodeStarted)
                .with_node(node.node_id)
                .with_details(json!({ "prev_node_id": prev, "node_type": node.node_type.to_string() })),
        );
        txn.emit(
            WorkflowEvent::for_process(EventType::NodeStarted, process)
                .with_node(&node)
                .with_operator(operator)
                .with_action(NodeEvent::Activate.event_type())
                .with_prev_node(prev)
                .with_timestamp(now),
        );
        log_node_operation(
            "activate",
            process.process_id,
            node.node_id,
            Some(&node.name),
            &node.status.to_string(),
            None,
        );

        if node.requires_actor() {
            self.create_task_locked(txn, process, &node, operator).await?;
        } else {
            queue.push_back(Step::Complete {
                node_id: node.node_id,
                outcome: None,
            });
        }
        Ok(())
    }

    async fn complete_node_locked(
        &self,
        txn: &mut Txn,
        process: &mut Process,
        node_id: Uuid,
        outcome: Option<String>,
        operator: &str,
        queue: &mut VecDeque<Step>,
    ) -> Result<()> {
        let mut node = self.load_node(node_id).await?;
        if node.status != NodeStatus::Active {
            return Err(WorkflowError::invalid_transition("node", node_id, node.status, "complete"));
        }

        let rules = self.store.process_rules(process.process_id).await?;
        let routed = {
            let env = Environment::new(&process.variables, &process.business_data)
                .with_outcome(outcome.as_deref());
            self.rules.select_next(&node, &rules, &env)
        };
        let targets = match routed {
            Ok(targets) => targets,
            Err(err) => {
                let now = Utc::now();
                node.last_error = Some(err.to_string());
                node.outcome = outcome;
                node.updated_at = now;
                let node = self.store.update_node(&node).await?;
                warn!(
                    process_id = %process.process_id,
                    node_id = %node.node_id,
                    error = %err,
                    "Routing failed, node left Active for retry"
                );
                self.record_error(txn, process, Some(&node), operator, &err, now);
                return Err(err);
            }
        };

        let now = Utc::now();
        let duration = node.duration_ms(now);
        NodeStateMachine::new(&mut node).transition(NodeEvent::Complete, now)?;
        node.outcome = outcome;
        node.last_error = None;
        let node = self.store.update_node(&node).await?;

        let next_node_id = match targets.as_slice() {
            [only] => Some(*only),
            _ => None,
        };
        txn.record(
            HistoryRecord::new(process.process_id, operator, HistoryAction::NodeCompleted)
                .with_node(node.node_id)
                .with_duration(duration)
                .with_details(json!({ "outcome": node.outcome, "next_node_ids": targets })),
        );
        txn.emit(
            WorkflowEvent::for_process(EventType::NodeCompleted, process)
                .with_node(&node)
                .with_operator(operator)
                .with_action(NodeEvent::Complete.event_type())
                .with_duration(duration)
                .with_next_node(next_node_id)
                .with_timestamp(now)
                .with_detail("next_node_ids", json!(targets))
                .with_detail("outcome", json!(node.outcome)),
        );
        log_node_operation(
            "complete",
            process.process_id,
            node.node_id,
            Some(&node.name),
            &node.status.to_string(),
            node.outcome.as_deref(),
        );

        for target_id in targets {
            let mut target = self.load_node(target_id).await?;
            target.incoming_completed += 1;
            target.updated_at = now;
            let target = self.store.update_node(&target).await?;
            if target.status == NodeStatus::Pending && target.incoming_completed >= target.incoming_required {
                queue.push_back(Step::Activate {
                    node_id: target.node_id,
                    prev: Some(node.node_id),
                });
            } else {
                debug!(
                    node_id = %target.node_id,
                    incoming_completed = target.incoming_completed,
                    incoming_required = target.incoming_required,
                    "Join waiting for more branches"
                );
            }
        }

        if node.node_type == NodeType::End && node.config.end_kind == EndKind::Rejected {
            let reason = format!("reached rejecting end '{}'", node.name);
            self.finish_process(txn, process, ProcessEvent::Reject(reason), operator)
                .await?;
        }
        Ok(())
    }

    /// Complete the process once an End node has been reached and no branch
    /// is still in flight
    pub(crate) async fn complete_if_finished(
        &self,
        txn: &mut Txn,
        process: &mut Process,
        operator: &str,
    ) -> Result<bool> {
        if !process.status.is_active() {
            return Ok(false);
        }
        let nodes = self.store.process_nodes(process.process_id).await?;
        let end_reached = nodes
            .iter()
            .any(|node| node.node_type == NodeType::End && node.status == NodeStatus::Completed);
        if !end_reached || nodes.iter().any(node_in_flight) {
            return Ok(false);
        }
        self.finish_process(txn, process, ProcessEvent::Complete, operator)
            .await?;
        Ok(true)
    }

    /// Time out `node`, close its open tasks and apply the timeout policy
    pub(crate) async fn timeout_node_locked(
        &self,
        txn: &mut Txn,
        process: &mut Process,
        mut node: Node,
        operator: &str,
    ) -> Result<()> {
        if node.status != NodeStatus::Active {
            return Err(WorkflowError::invalid_transition("node", node.node_id, node.status, "timeout"));
        }
        let action = node
            .config
            .timeout
            .as_ref()
            .map(|policy| policy.action.clone())
            .unwrap_or(TimeoutAction::TerminateProcess);

        // Resolve the advance target before anything is written
        let advance_to = match &action {
            TimeoutAction::Advance { target } => {
                let nodes = self.store.process_nodes(process.process_id).await?;
                let target_node = nodes
                    .into_iter()
                    .find(|candidate| &candidate.template_key == target)
                    .ok_or_else(|| {
                        WorkflowError::Validation(format!(
                            "timeout target '{target}' of node {} does not exist",
                            node.node_id
                        ))
                    })?;
                if target_node.status != NodeStatus::Pending {
                    return Err(WorkflowError::invalid_transition(
                        "node",
                        target_node.node_id,
                        target_node.status,
                        "activate",
                    ));
                }
                Some(target_node.node_id)
            }
            TimeoutAction::TerminateProcess => None,
        };

        let tasks = self.store.process_tasks(process.process_id).await?;
        for task in tasks
            .into_iter()
            .filter(|task| task.node_id == node.node_id && task.is_open())
        {
            self.close_task_with_retry(txn, process, task, TaskEvent::Timeout, operator)
                .await?;
        }

        let now = Utc::now();
        let duration = node.duration_ms(now);
        NodeStateMachine::new(&mut node).transition(NodeEvent::Timeout, now)?;
        let node = self.store.update_node(&node).await?;
        txn.record(
            HistoryRecord::new(process.process_id, operator, HistoryAction::NodeTimeout)
                .with_node(node.node_id)
                .with_duration(duration)
                .with_details(json!({ "action": action })),
        );
        txn.emit(
            WorkflowEvent::for_process(EventType::NodeTimeout, process)
                .with_node(&node)
                .with_operator(operator)
                .with_action(NodeEvent::Timeout.event_type())
                .with_duration(duration)
                .with_next_node(advance_to)
                .with_timestamp(now),
        );
        info!(
            process_id = %process.process_id,
            node_id = %node.node_id,
            advance_to = ?advance_to,
            "Node timed out"
        );

        match advance_to {
            Some(target_id) => {
                self.drive(
                    txn,
                    process,
                    Step::Activate {
                        node_id: target_id,
                        prev: Some(node.node_id),
                    },
                    operator,
                )
                .await
            }
            None => {
                let reason = format!("node '{}' timed out", node.name);
                self.finish_process(txn, process, ProcessEvent::Terminate(reason), operator)
                    .await
            }
        }
    }

    /// Recompute neighbour lists and fan-in requirements from the current
    /// rule set; used after administrative graph edits
    pub(crate) async fn relink(&self, process_id: Uuid) -> Result<()> {
        let nodes = self.store.process_nodes(process_id).await?;
        let rules = self.store.process_rules(process_id).await?;

        let mut previous: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut next: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for rule in &rules {
            let targets = next.entry(rule.source_node_id).or_default();
            if !targets.contains(&rule.target_node_id) {
                targets.push(rule.target_node_id);
            }
            let sources = previous.entry(rule.target_node_id).or_default();
            if !sources.contains(&rule.source_node_id) {
                sources.push(rule.source_node_id);
            }
        }

        for mut node in nodes {
            let new_previous = previous.remove(&node.node_id).unwrap_or_default();
            let new_next = next.remove(&node.node_id).unwrap_or_default();
            let mut changed = node.previous != new_previous || node.next != new_next;
            node.previous = new_previous;
            node.next = new_next;
            if node.status == NodeStatus::Pending && node.incoming_completed == 0 {
                let required = node.derive_incoming_required();
                changed |= node.incoming_required != required;
                node.incoming_required = required;
            }
            if changed {
                node.updated_at = Utc::now();
                self.store.update_node(&node).await?;
            }
        }
        debug!(process_id = %process_id, "Relinked process graph");
        Ok(())
    }
}
