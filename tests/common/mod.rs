//! Shared fixtures for the integration suites: template builders, a
//! recording subscriber and a history store that fails on demand.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use procflow_core::config::WorkflowConfig;
use procflow_core::events::{EventSubscriber, EventType, SubscriberError, WorkflowEvent};
use procflow_core::identity::StaticIdentity;
use procflow_core::models::{
    ApprovalMode, GatewayKind, HistoryAction, HistoryRecord, NodeTemplate, ProcessTemplate,
    RuleTemplate, Task,
};
use procflow_core::orchestration::{NewProcess, ProcessManager};
use procflow_core::store::{
    HistoryFilter, HistoryStore, InMemoryStore, Page, PageRequest, StoreError, StoreResult,
};

pub const OWNER: &str = "alice";

/// Start -> review (single assignee) -> End
pub fn single_review(assignees: &[&str], mode: ApprovalMode) -> ProcessTemplate {
    single_review_with(NodeTemplate::task(
        "review",
        "Review",
        assignees.iter().copied(),
        mode,
    ))
}

pub fn single_review_with(review: NodeTemplate) -> ProcessTemplate {
    ProcessTemplate::new("single_review", "Single review")
        .with_node(NodeTemplate::start("start"))
        .with_node(review)
        .with_node(NodeTemplate::end("end"))
        .with_rule(RuleTemplate::always("start", "review", 1))
        .with_rule(RuleTemplate::always("review", "end", 1))
}

/// Start -> review -> [outcome == "approve"] -> End, else -> rejected End
pub fn approve_or_reject(assignee: &str) -> ProcessTemplate {
    ProcessTemplate::new("approve_or_reject", "Approve or reject")
        .with_node(NodeTemplate::start("start"))
        .with_node(NodeTemplate::task("review", "Review", [assignee], ApprovalMode::Any))
        .with_node(NodeTemplate::end("approved"))
        .with_node(NodeTemplate::rejected_end("rejected"))
        .with_rule(RuleTemplate::always("start", "review", 1))
        .with_rule(RuleTemplate::when("review", "approved", 1, "outcome == \"approve\""))
        .with_rule(RuleTemplate::otherwise("review", "rejected"))
}

/// Start -> gate (Exclusive) -> [amount > 1000] big / default small -> End
pub fn amount_router() -> ProcessTemplate {
    ProcessTemplate::new("amount_router", "Amount router")
        .with_node(NodeTemplate::start("start"))
        .with_node(NodeTemplate::gateway("gate", GatewayKind::Exclusive))
        .with_node(NodeTemplate::task("big", "Director sign-off", ["director"], ApprovalMode::Any))
        .with_node(NodeTemplate::task("small", "Manager sign-off", ["manager"], ApprovalMode::Any))
        .with_node(NodeTemplate::end("end"))
        .with_rule(RuleTemplate::always("start", "gate", 1))
        .with_rule(RuleTemplate::when("gate", "big", 1, "amount > 1000"))
        .with_rule(RuleTemplate::otherwise("gate", "small"))
        .with_rule(RuleTemplate::always("big", "end", 1))
        .with_rule(RuleTemplate::always("small", "end", 1))
}

/// Start -> fork (Parallel) -> legal, finance -> join (Parallel) -> End
pub fn parallel_review() -> ProcessTemplate {
    ProcessTemplate::new("parallel_review", "Parallel review")
        .with_node(NodeTemplate::start("start"))
        .with_node(NodeTemplate::gateway("fork", GatewayKind::Parallel))
        .with_node(NodeTemplate::task("legal", "Legal", ["lawyer"], ApprovalMode::Any))
        .with_node(NodeTemplate::task("finance", "Finance", ["accountant"], ApprovalMode::Any))
        .with_node(NodeTemplate::gateway("join", GatewayKind::Parallel))
        .with_node(NodeTemplate::end("end"))
        .with_rule(RuleTemplate::always("start", "fork", 1))
        .with_rule(RuleTemplate::always("fork", "legal", 1))
        .with_rule(RuleTemplate::always("fork", "finance", 2))
        .with_rule(RuleTemplate::always("legal", "join", 1))
        .with_rule(RuleTemplate::always("finance", "join", 1))
        .with_rule(RuleTemplate::always("join", "end", 1))
}

pub async fn create(manager: &ProcessManager, template: &ProcessTemplate, request: NewProcess) -> Uuid {
    manager
        .create(template, request, OWNER)
        .await
        .expect("create process")
        .process_id
}

pub async fn create_and_start(manager: &ProcessManager, template: &ProcessTemplate, request: NewProcess) -> Uuid {
    let process_id = create(manager, template, request).await;
    manager.start(process_id, OWNER).await.expect("start process");
    process_id
}

pub async fn open_tasks(manager: &ProcessManager, process_id: Uuid) -> Vec<Task> {
    manager
        .task_scheduler()
        .process_tasks(process_id)
        .await
        .expect("list tasks")
        .into_iter()
        .filter(Task::is_open)
        .collect()
}

pub async fn open_task(manager: &ProcessManager, process_id: Uuid) -> Task {
    let mut tasks = open_tasks(manager, process_id).await;
    assert_eq!(tasks.len(), 1, "expected exactly one open task, got {tasks:?}");
    tasks.remove(0)
}

pub async fn history_actions(manager: &ProcessManager, process_id: Uuid) -> Vec<HistoryAction> {
    history(manager, process_id)
        .await
        .into_iter()
        .map(|record| record.action)
        .collect()
}

pub async fn history(manager: &ProcessManager, process_id: Uuid) -> Vec<HistoryRecord> {
    manager
        .history_by_process(process_id, &PageRequest::first(1000))
        .await
        .expect("history")
        .items
}

/// Subscriber that keeps every event it sees and can be told to fail
#[derive(Debug, Default)]
pub struct RecordingSubscriber {
    events: Mutex<Vec<WorkflowEvent>>,
    failures_left: AtomicU32,
}

impl RecordingSubscriber {
    pub fn failing(times: u32) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(times),
        }
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().clone()
    }

    pub fn types_for(&self, process_id: Uuid) -> Vec<EventType> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.process_id == process_id)
            .map(|event| event.event_type)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSubscriber for RecordingSubscriber {
    async fn handle_event(&self, event: &WorkflowEvent) -> Result<(), SubscriberError> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err("subscriber unavailable".into());
        }
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn subscriber_name(&self) -> &str {
        "recording_subscriber"
    }
}

pub async fn record_all(manager: &ProcessManager) -> Arc<RecordingSubscriber> {
    let recorder = Arc::new(RecordingSubscriber::default());
    manager
        .events()
        .register_subscriber("recorder", vec!["*".to_string()], recorder.clone())
        .await
        .expect("register subscriber");
    recorder
}

/// History store that rejects appends while `failing` is set and cursor
/// reads while `failing_reads` is set
#[derive(Debug, Default)]
pub struct FlakyHistoryStore {
    inner: InMemoryStore,
    failing: Mutex<bool>,
    failing_reads: Mutex<bool>,
}

impl FlakyHistoryStore {
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn set_failing_reads(&self, failing: bool) {
        *self.failing_reads.lock() = failing;
    }
}

#[async_trait]
impl HistoryStore for FlakyHistoryStore {
    async fn append(&self, record: &HistoryRecord) -> StoreResult<()> {
        if *self.failing.lock() {
            return Err(StoreError::Backend("history table unavailable".into()));
        }
        self.inner.append(record).await
    }

    async fn list_history(&self, filter: &HistoryFilter, page: &PageRequest) -> StoreResult<Page<HistoryRecord>> {
        self.inner.list_history(filter, page).await
    }

    async fn count_history(&self, filter: &HistoryFilter) -> StoreResult<u64> {
        self.inner.count_history(filter).await
    }

    async fn latest_history(&self, process_id: Uuid) -> StoreResult<Option<HistoryRecord>> {
        if *self.failing_reads.lock() {
            return Err(StoreError::Backend("history table unavailable".into()));
        }
        self.inner.latest_history(process_id).await
    }
}

/// Manager whose history goes to a [`FlakyHistoryStore`] with fast retries
pub fn manager_with_flaky_history() -> (ProcessManager, Arc<FlakyHistoryStore>) {
    let history = Arc::new(FlakyHistoryStore::default());
    let manager = flaky_history_manager(Arc::new(InMemoryStore::new()), history.clone());
    (manager, history)
}

/// Manager over existing stores, e.g. a second engine instance after a restart
pub fn flaky_history_manager(store: Arc<InMemoryStore>, history: Arc<FlakyHistoryStore>) -> ProcessManager {
    let mut config = WorkflowConfig::default();
    config.history.append_attempts = 2;
    config.history.retry_backoff_ms = 1;
    ProcessManager::with_parts(store, history, Arc::new(StaticIdentity::system()), config)
        .expect("valid config")
}

/// Manager with fast event redelivery backoff
pub fn manager_with_fast_events() -> ProcessManager {
    let mut config = WorkflowConfig::default();
    config.events.delivery_attempts = 1;
    config.events.retry_backoff_ms = 1;
    let store = Arc::new(InMemoryStore::new());
    ProcessManager::new(store, config).expect("valid config")
}
