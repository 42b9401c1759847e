//! # Process Manager
//!
//! Entry point of the orchestration core. Owns the process lifecycle and
//! exposes the node engine, task scheduler, history and event publisher that
//! share its [`EngineCore`].
//!
//! ## Lifecycle
//!
//! ```text
//! Pending --start--> Running --complete--> Completed
//!                    Running <--resume-- Suspended
//!                    Running --suspend--> Suspended
//!          Running | Suspended --terminate--> Terminated
//!                    Running --reject--> Rejected
//!          any non-terminal --cancel | withdraw--> Cancelled
//! ```
//!
//! Ending a process cancels its open tasks and in-flight nodes first; a child
//! that cannot be cancelled is reported in the history details and can be
//! swept up later with [`ProcessManager::reconcile`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use procflow_core::models::{ApprovalMode, NodeTemplate, ProcessTemplate, RuleTemplate};
//! use procflow_core::orchestration::{NewProcess, ProcessManager};
//!
//! # async fn example() -> procflow_core::error::Result<()> {
//! let manager = ProcessManager::in_memory();
//! let template = ProcessTemplate::new("expense", "Expense approval")
//!     .with_node(NodeTemplate::start("start"))
//!     .with_node(NodeTemplate::task("review", "Review", ["bob"], ApprovalMode::Any))
//!     .with_node(NodeTemplate::end("end"))
//!     .with_rule(RuleTemplate::always("start", "review", 1))
//!     .with_rule(RuleTemplate::always("review", "end", 1));
//!
//! let process = manager
//!     .create(&template, NewProcess::named("Expense #42"), "alice")
//!     .await?;
//! manager.start(process.process_id, "alice").await?;
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::core::{EngineCore, Txn};
use super::node_engine::{NodeEngine, Step};
use super::task_scheduler::TaskScheduler;
use crate::config::WorkflowConfig;
use crate::error::{Result, WorkflowError};
use crate::events::EventPublisher;
use crate::history::HistoryRecorder;
use crate::identity::{IdentityProvider, StaticIdentity};
use crate::logging::log_process_operation;
use crate::models::{
    validate_rule_set, HistoryAction, HistoryRecord, Node, NodeTemplate, NodeType, NodeUpdate,
    Process, ProcessTemplate, ProcessUpdate, Rule, RuleUpdate, Variables,
};
use crate::state_machine::{NodeStatus, ProcessEvent, ProcessStatus};
use crate::store::{
    HistoryFilter, HistoryStore, InMemoryStore, Page, PageRequest, ProcessFilter, RuleFilter,
    WorkflowStore,
};

/// Caller-supplied fields for a new process instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewProcess {
    pub name: String,
    pub description: Option<String>,
    pub variables: Variables,
    pub business_data: Value,
}

impl NewProcess {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            business_data: json!({}),
            ..Default::default()
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_business_data(mut self, business_data: Value) -> Self {
        self.business_data = business_data;
        self
    }
}

/// Administrative request for a new outgoing rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProcessManager {
    core: Arc<EngineCore>,
    nodes: NodeEngine,
    tasks: TaskScheduler,
}

impl ProcessManager {
    /// Build a manager over one store that persists both workflow rows and
    /// history
    pub fn new<S>(store: Arc<S>, config: WorkflowConfig) -> Result<Self>
    where
        S: WorkflowStore + HistoryStore + 'static,
    {
        let workflow_store: Arc<dyn WorkflowStore> = store.clone();
        let history_store: Arc<dyn HistoryStore> = store;
        Self::with_parts(
            workflow_store,
            history_store,
            Arc::new(StaticIdentity::system()),
            config,
        )
    }

    pub fn with_parts(
        store: Arc<dyn WorkflowStore>,
        history_store: Arc<dyn HistoryStore>,
        identity: Arc<dyn IdentityProvider>,
        config: WorkflowConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(store, history_store, identity, config))
    }

    /// Manager over a fresh [`InMemoryStore`] with default configuration
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self::assemble(
            store.clone(),
            store,
            Arc::new(StaticIdentity::system()),
            WorkflowConfig::default(),
        )
    }

    fn assemble(
        store: Arc<dyn WorkflowStore>,
        history_store: Arc<dyn HistoryStore>,
        identity: Arc<dyn IdentityProvider>,
        config: WorkflowConfig,
    ) -> Self {
        let history = Arc::new(HistoryRecorder::new(history_store, config.history.clone()));
        let events = Arc::new(EventPublisher::new(config.events.clone()));
        let core = Arc::new(EngineCore::new(store, history, events, identity, config));
        info!(
            lock_timeout_ms = core.config.engine.lock_timeout_ms,
            max_conflict_retries = core.config.engine.max_conflict_retries,
            "Process manager ready"
        );
        Self {
            nodes: NodeEngine::new(Arc::clone(&core)),
            tasks: TaskScheduler::new(Arc::clone(&core)),
            core,
        }
    }

    pub fn node_engine(&self) -> &NodeEngine {
        &self.nodes
    }

    pub fn task_scheduler(&self) -> &TaskScheduler {
        &self.tasks
    }

    pub fn events(&self) -> &Arc<EventPublisher> {
        &self.core.events
    }

    pub fn history(&self) -> &Arc<HistoryRecorder> {
        &self.core.history
    }

    /// Number of processes with an entry in the lock table
    pub fn tracked_locks(&self) -> usize {
        self.core.locks.len()
    }

    /// Drop lock entries of processes no operation holds or waits on
    pub fn release_idle_locks(&self) -> usize {
        self.core.locks.evict_idle()
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.core.store
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.core.config
    }

    /// Operator reported by the identity collaborator for the current request
    pub fn current_operator(&self) -> String {
        self.core.identity.current_operator()
    }

    // ------------------------------------------------------------------
    // Process CRUD
    // ------------------------------------------------------------------

    /// Validate `template` and persist a Pending process with its nodes and rules
    pub async fn create(&self, template: &ProcessTemplate, request: NewProcess, operator: &str) -> Result<Process> {
        if request.name.trim().is_empty() {
            return Err(WorkflowError::Validation("process name must not be empty".into()));
        }
        if operator.trim().is_empty() {
            return Err(WorkflowError::Validation("operator must not be empty".into()));
        }
        template.validate().map_err(WorkflowError::Validation)?;

        let mut process = Process::new(
            template.template_id.clone(),
            request.name,
            operator,
            request.variables,
            request.business_data,
        );
        process.description = request.description;
        let (nodes, rules) = template
            .instantiate(process.process_id)
            .map_err(WorkflowError::Validation)?;

        let mut txn = self.core.begin(process.process_id).await?;
        let result = async {
            self.core.store.create_process(&process).await?;
            self.core.store.create_nodes(&nodes).await?;
            self.core.store.create_rules(&rules).await?;
            Ok::<(), WorkflowError>(())
        }
        .await;
        if result.is_ok() {
            txn.record(
                HistoryRecord::new(process.process_id, operator, HistoryAction::ProcessCreated).with_details(json!({
                    "template_id": template.template_id,
                    "nodes": nodes.len(),
                    "rules": rules.len(),
                })),
            );
            log_process_operation(
                "create",
                process.process_id,
                Some(&process.name),
                &process.status.to_string(),
                Some(operator),
                Some(&template.template_id),
            );
        }
        self.core.finish(txn, result).await?;
        Ok(process)
    }

    pub async fn get(&self, process_id: Uuid) -> Result<Process> {
        self.core.load_process(process_id).await
    }

    pub async fn list(&self, filter: &ProcessFilter, page: &PageRequest) -> Result<Page<Process>> {
        Ok(self.core.store.list_processes(filter, page).await?)
    }

    pub async fn count(&self, filter: &ProcessFilter) -> Result<u64> {
        Ok(self.core.store.count_processes(filter).await?)
    }

    /// Metadata update; status is only changed through lifecycle operations
    pub async fn update(&self, process_id: Uuid, update: ProcessUpdate, operator: &str) -> Result<Process> {
        if update.is_empty() {
            return Err(WorkflowError::Validation("process update has no fields".into()));
        }
        self.core
            .with_conflict_retry("update_process", || self.update_once(process_id, update.clone(), operator))
            .await
    }

    async fn update_once(&self, process_id: Uuid, update: ProcessUpdate, operator: &str) -> Result<Process> {
        let mut txn = self.core.begin(process_id).await?;
        let result = async {
            let mut process = self.core.load_process(process_id).await?;
            if process.is_terminal() {
                return Err(WorkflowError::invalid_transition("process", process_id, process.status, "update"));
            }
            let fields: Vec<&str> = [
                update.name.as_ref().map(|_| "name"),
                update.description.as_ref().map(|_| "description"),
                update.variables.as_ref().map(|_| "variables"),
                update.business_data.as_ref().map(|_| "business_data"),
            ]
            .into_iter()
            .flatten()
            .collect();
            update.apply(&mut process);
            process.updated_at = Utc::now();
            let process = self.core.store.update_process(&process).await?;
            txn.record(
                HistoryRecord::new(process_id, operator, HistoryAction::ProcessUpdated)
                    .with_details(json!({ "fields": fields })),
            );
            Ok::<Process, WorkflowError>(process)
        }
        .await;
        self.core.finish(txn, result).await
    }

    /// Delete a Pending or finished process together with its children
    pub async fn delete(&self, process_id: Uuid) -> Result<()> {
        let txn = self.core.begin(process_id).await?;
        let result = async {
            let process = self.core.load_process(process_id).await?;
            if !(process.status == ProcessStatus::Pending || process.is_terminal()) {
                return Err(WorkflowError::invalid_transition("process", process_id, process.status, "delete"));
            }
            self.core.store.delete_process(process_id).await?;
            Ok::<(), WorkflowError>(())
        }
        .await;
        self.core.finish(txn, result).await?;
        self.core.locks.remove(process_id);
        self.core.history.forget(process_id);
        info!(process_id = %process_id, "Deleted process");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Pending -> Running, then activate the Start node
    pub async fn start(&self, process_id: Uuid, operator: &str) -> Result<Process> {
        self.apply(process_id, ProcessEvent::Start, operator).await
    }

    /// Explicit completion. Accepted again on an already Completed process;
    /// refused while any branch is still in flight.
    pub async fn complete(&self, process_id: Uuid, operator: &str) -> Result<Process> {
        self.apply(process_id, ProcessEvent::Complete, operator).await
    }

    pub async fn terminate(&self, process_id: Uuid, reason: impl Into<String>, operator: &str) -> Result<Process> {
        self.apply(process_id, ProcessEvent::Terminate(reason.into()), operator)
            .await
    }

    pub async fn suspend(&self, process_id: Uuid, reason: Option<String>, operator: &str) -> Result<Process> {
        self.apply(process_id, ProcessEvent::Suspend(reason), operator).await
    }

    pub async fn resume(&self, process_id: Uuid, operator: &str) -> Result<Process> {
        self.apply(process_id, ProcessEvent::Resume, operator).await
    }

    /// Administrative cancel from any non-terminal status
    pub async fn cancel(&self, process_id: Uuid, reason: impl Into<String>, operator: &str) -> Result<Process> {
        self.apply(process_id, ProcessEvent::Cancel(reason.into()), operator)
            .await
    }

    /// Administrative business rejection of a Running process
    pub async fn reject(&self, process_id: Uuid, reason: impl Into<String>, operator: &str) -> Result<Process> {
        self.apply(process_id, ProcessEvent::Reject(reason.into()), operator)
            .await
    }

    /// Owner withdraws their own process
    pub async fn withdraw(&self, process_id: Uuid, operator: &str) -> Result<Process> {
        self.apply(process_id, ProcessEvent::Withdraw, operator).await
    }

    async fn apply(&self, process_id: Uuid, event: ProcessEvent, operator: &str) -> Result<Process> {
        self.core
            .with_conflict_retry(event.event_type(), || {
                self.apply_once(process_id, event.clone(), operator)
            })
            .await
    }

    async fn apply_once(&self, process_id: Uuid, event: ProcessEvent, operator: &str) -> Result<Process> {
        let mut txn = self.core.begin(process_id).await?;
        let result = self.apply_locked(&mut txn, event, operator).await;
        self.core.finish(txn, result).await
    }

    async fn apply_locked(&self, txn: &mut Txn, event: ProcessEvent, operator: &str) -> Result<Process> {
        let mut process = self.core.load_process(txn.process_id).await?;

        match event {
            ProcessEvent::Start => {
                self.core
                    .transition_process(txn, &mut process, ProcessEvent::Start, operator, json!({}))
                    .await?;
                let start = self
                    .core
                    .store
                    .process_nodes(process.process_id)
                    .await?
                    .into_iter()
                    .find(|node| node.node_type == NodeType::Start)
                    .ok_or_else(|| {
                        WorkflowError::Validation(format!("process {} has no start node", process.process_id))
                    })?;
                let step = Step::Activate {
                    node_id: start.node_id,
                    prev: None,
                };
                match self.core.drive(txn, &mut process, step, operator).await {
                    Ok(()) => {}
                    Err(WorkflowError::RuleEvaluation { node_id, reason }) => {
                        warn!(process_id = %process.process_id, node_id = %node_id, reason = %reason, "Process started but routing failed");
                    }
                    Err(err) => return Err(err),
                }
            }
            event @ (ProcessEvent::Suspend(_) | ProcessEvent::Resume) => {
                self.core
                    .transition_process(txn, &mut process, event, operator, json!({}))
                    .await?;
            }
            ProcessEvent::Complete => {
                if process.status == ProcessStatus::Completed {
                    return Ok(process);
                }
                EngineCore::ensure_running(&process, "complete")?;
                let in_flight = self.core.in_flight_nodes(process.process_id).await?;
                if !in_flight.is_empty() {
                    return Err(WorkflowError::invalid_transition(
                        "process",
                        process.process_id,
                        process.status,
                        format!("complete while {} node(s) are in flight", in_flight.len()),
                    ));
                }
                self.core
                    .finish_process(txn, &mut process, ProcessEvent::Complete, operator)
                    .await?;
            }
            ProcessEvent::Withdraw => {
                if operator != process.created_by {
                    return Err(WorkflowError::Validation(format!(
                        "only the owner '{}' may withdraw process {}",
                        process.created_by, process.process_id
                    )));
                }
                self.core
                    .finish_process(txn, &mut process, ProcessEvent::Withdraw, operator)
                    .await?;
            }
            event @ (ProcessEvent::Terminate(_) | ProcessEvent::Reject(_) | ProcessEvent::Cancel(_)) => {
                self.core
                    .finish_process(txn, &mut process, event, operator)
                    .await?;
            }
        }

        self.core.load_process(process.process_id).await
    }

    /// Re-run completion of a node whose routing failed, typically after its
    /// variables or rules were corrected
    pub async fn retry_node(&self, node_id: Uuid, operator: &str) -> Result<Node> {
        self.core
            .with_conflict_retry("retry_node", || self.retry_node_once(node_id, operator))
            .await
    }

    async fn retry_node_once(&self, node_id: Uuid, operator: &str) -> Result<Node> {
        let node = self.core.load_node(node_id).await?;
        let mut txn = self.core.begin(node.process_id).await?;
        let result = async {
            let mut process = self.core.load_process(node.process_id).await?;
            EngineCore::ensure_running(&process, "retry node")?;
            let node = self.core.load_node(node_id).await?;
            if !node.is_retry_eligible() {
                return Err(WorkflowError::invalid_transition("node", node_id, node.status, "retry"));
            }
            info!(process_id = %process.process_id, node_id = %node_id, last_error = ?node.last_error, "Retrying node routing");
            let step = Step::Complete {
                node_id,
                outcome: node.outcome.clone(),
            };
            self.core.drive(&mut txn, &mut process, step, operator).await?;
            self.core.load_node(node_id).await
        }
        .await;
        self.core.finish(txn, result).await
    }

    /// Re-apply the end-of-process cascade to a finished process whose
    /// children were not all closed
    pub async fn reconcile(&self, process_id: Uuid, operator: &str) -> Result<Process> {
        let mut txn = self.core.begin(process_id).await?;
        let result = async {
            let process = self.core.load_process(process_id).await?;
            if !process.is_terminal() {
                return Err(WorkflowError::invalid_transition("process", process_id, process.status, "reconcile"));
            }
            let failures = self.core.cascade_cancel(&mut txn, &process, operator).await;
            if !failures.is_empty() {
                return Err(WorkflowError::Persistence(format!(
                    "{} child row(s) of process {process_id} could not be cancelled: {}",
                    failures.len(),
                    failures.join(", ")
                )));
            }
            Ok(process)
        }
        .await;
        self.core.finish(txn, result).await
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub async fn history_by_process(&self, process_id: Uuid, page: &PageRequest) -> Result<Page<HistoryRecord>> {
        self.core.history.by_process(process_id, page).await
    }

    pub async fn history_by_task(&self, task_id: Uuid, page: &PageRequest) -> Result<Page<HistoryRecord>> {
        self.core.history.by_task(task_id, page).await
    }

    pub async fn history_by_operator(&self, operator: &str, page: &PageRequest) -> Result<Page<HistoryRecord>> {
        self.core.history.by_operator(operator, page).await
    }

    pub async fn query_history(&self, filter: &HistoryFilter, page: &PageRequest) -> Result<Page<HistoryRecord>> {
        self.core.history.query(filter, page).await
    }

    // ------------------------------------------------------------------
    // Graph administration
    // ------------------------------------------------------------------

    /// Add a node to a Pending process
    pub async fn create_node(&self, process_id: Uuid, template: NodeTemplate) -> Result<Node> {
        let txn = self.core.begin(process_id).await?;
        let result = async {
            self.pending_process(process_id, "add node").await?;
            let existing = self.core.store.process_nodes(process_id).await?;
            if existing.iter().any(|node| node.template_key == template.key) {
                return Err(WorkflowError::Validation(format!(
                    "process {process_id} already has a node with key '{}'",
                    template.key
                )));
            }
            if template.node_type == NodeType::Start {
                return Err(WorkflowError::Validation("a process has exactly one start node".into()));
            }
            template.config.check_offsets(&template.key).map_err(WorkflowError::Validation)?;
            let node = Node::new(process_id, template.key, template.name, template.node_type, template.config);
            self.core.store.create_nodes(std::slice::from_ref(&node)).await?;
            Ok::<Node, WorkflowError>(node)
        }
        .await;
        self.core.finish(txn, result).await
    }

    /// Rename or reconfigure a node of a Pending process
    pub async fn update_node(&self, node_id: Uuid, update: NodeUpdate) -> Result<Node> {
        let node = self.core.load_node(node_id).await?;
        let txn = self.core.begin(node.process_id).await?;
        let result = async {
            self.pending_process(node.process_id, "update node").await?;
            let mut node = self.core.load_node(node_id).await?;
            if let Some(name) = update.name {
                node.name = name;
            }
            if let Some(config) = update.config {
                config.check_offsets(&node.template_key).map_err(WorkflowError::Validation)?;
                node.config = config;
            }
            node.updated_at = Utc::now();
            self.core.store.update_node(&node).await?;
            self.core.relink(node.process_id).await?;
            self.core.load_node(node_id).await
        }
        .await;
        self.core.finish(txn, result).await
    }

    /// Remove an unconnected node from a Pending process
    pub async fn delete_node(&self, node_id: Uuid) -> Result<()> {
        let node = self.core.load_node(node_id).await?;
        let txn = self.core.begin(node.process_id).await?;
        let result = async {
            self.pending_process(node.process_id, "delete node").await?;
            if node.node_type == NodeType::Start {
                return Err(WorkflowError::Validation("the start node cannot be deleted".into()));
            }
            let rules = self.core.store.process_rules(node.process_id).await?;
            if rules
                .iter()
                .any(|rule| rule.source_node_id == node_id || rule.target_node_id == node_id)
            {
                return Err(WorkflowError::Validation(format!(
                    "node {node_id} still has rules attached; delete them first"
                )));
            }
            self.core.store.delete_node(node_id).await?;
            Ok::<(), WorkflowError>(())
        }
        .await;
        self.core.finish(txn, result).await
    }

    pub async fn get_rule(&self, rule_id: Uuid) -> Result<Rule> {
        Ok(self.core.store.get_rule(rule_id).await?)
    }

    pub async fn list_rules(&self, filter: &RuleFilter, page: &PageRequest) -> Result<Page<Rule>> {
        Ok(self.core.store.list_rules(filter, page).await?)
    }

    pub async fn process_rules(&self, process_id: Uuid) -> Result<Vec<Rule>> {
        Ok(self.core.store.process_rules(process_id).await?)
    }

    /// Add an outgoing rule. Allowed until the process finishes so a failed
    /// routing decision can be corrected before a retry.
    pub async fn create_rule(&self, process_id: Uuid, request: NewRule) -> Result<Rule> {
        let txn = self.core.begin(process_id).await?;
        let result = async {
            self.open_process(process_id, "add rule").await?;
            let mut rule = Rule::new(
                process_id,
                request.source_node_id,
                request.target_node_id,
                request.priority,
                request.condition,
            );
            rule.is_default = request.is_default;
            rule.name = request.name;
            if rule.is_default {
                rule.condition = None;
                rule.priority = i32::MAX;
            }
            self.check_rule(&rule, None).await?;
            self.core.store.create_rules(std::slice::from_ref(&rule)).await?;
            self.core.relink(process_id).await?;
            Ok::<Rule, WorkflowError>(rule)
        }
        .await;
        self.core.finish(txn, result).await
    }

    pub async fn update_rule(&self, rule_id: Uuid, update: RuleUpdate) -> Result<Rule> {
        let rule = self.core.store.get_rule(rule_id).await?;
        let txn = self.core.begin(rule.process_id).await?;
        let result = async {
            self.open_process(rule.process_id, "update rule").await?;
            let mut rule = self.core.store.get_rule(rule_id).await?;
            if let Some(name) = update.name {
                rule.name = Some(name);
            }
            if let Some(priority) = update.priority {
                rule.priority = priority;
            }
            if let Some(condition) = update.condition {
                rule.condition = Some(condition);
                rule.is_default = false;
            }
            if let Some(target) = update.target_node_id {
                rule.target_node_id = target;
            }
            rule.updated_at = Utc::now();
            self.check_rule(&rule, Some(rule_id)).await?;
            let rule = self.core.store.update_rule(&rule).await?;
            self.core.relink(rule.process_id).await?;
            Ok::<Rule, WorkflowError>(rule)
        }
        .await;
        self.core.finish(txn, result).await
    }

    pub async fn delete_rule(&self, rule_id: Uuid) -> Result<()> {
        let rule = self.core.store.get_rule(rule_id).await?;
        let txn = self.core.begin(rule.process_id).await?;
        let result = async {
            self.open_process(rule.process_id, "delete rule").await?;
            self.core.store.delete_rule(rule_id).await?;
            self.core.relink(rule.process_id).await?;
            Ok::<(), WorkflowError>(())
        }
        .await;
        self.core.finish(txn, result).await
    }

    /// Endpoints belong to the process, the condition parses, and the
    /// source's rule set stays well formed
    async fn check_rule(&self, rule: &Rule, replacing: Option<Uuid>) -> Result<()> {
        if rule.source_node_id == rule.target_node_id {
            return Err(WorkflowError::Validation("a rule cannot target its own source".into()));
        }
        for node_id in [rule.source_node_id, rule.target_node_id] {
            let node = self.core.load_node(node_id).await?;
            if node.process_id != rule.process_id {
                return Err(WorkflowError::Validation(format!(
                    "node {node_id} does not belong to process {}",
                    rule.process_id
                )));
            }
        }
        let source = self.core.load_node(rule.source_node_id).await?;
        if source.node_type == NodeType::End {
            return Err(WorkflowError::Validation("end nodes have no outgoing rules".into()));
        }
        if let Some(condition) = rule.condition.as_deref() {
            self.core.rules.validate_condition(condition)?;
        }

        let siblings: Vec<Rule> = self
            .core
            .store
            .process_rules(rule.process_id)
            .await?
            .into_iter()
            .filter(|other| other.source_node_id == rule.source_node_id && Some(other.rule_id) != replacing)
            .chain(std::iter::once(rule.clone()))
            .collect();
        validate_rule_set(&siblings).map_err(WorkflowError::Validation)
    }

    async fn pending_process(&self, process_id: Uuid, action: &str) -> Result<Process> {
        let process = self.core.load_process(process_id).await?;
        if process.status != ProcessStatus::Pending {
            return Err(WorkflowError::invalid_transition("process", process_id, process.status, action));
        }
        Ok(process)
    }

    async fn open_process(&self, process_id: Uuid, action: &str) -> Result<Process> {
        let process = self.core.load_process(process_id).await?;
        if process.is_terminal() {
            return Err(WorkflowError::invalid_transition("process", process_id, process.status, action));
        }
        Ok(process)
    }

    /// Nodes that currently hold the process open
    pub async fn active_nodes(&self, process_id: Uuid) -> Result<Vec<Node>> {
        Ok(self
            .core
            .store
            .process_nodes(process_id)
            .await?
            .into_iter()
            .filter(|node| node.status == NodeStatus::Active)
            .collect())
    }
}
