//! PostgreSQL implementation of the storage traits.
//!
//! Statuses and enums are stored as text, maps and lists as JSONB, and every
//! mutable row carries an optimistic `version` column. Listing uses keyset
//! pagination on `(created_at, seq, id)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

use super::{
    HistoryFilter, HistoryStore, NodeFilter, Page, PageRequest, ProcessFilter, RuleFilter,
    SortKey, StoreError, StoreResult, TaskFilter, TimeRange, WorkflowStore,
};
use crate::models::{
    HistoryRecord, Node, NodeConfig, Process, Rule, Task, TaskAction, Variables,
};

const SCHEMA: &str = include_str!("../../migrations/0001_procflow_core.sql");

const OPEN_TASK_STATUSES: [&str; 5] = ["created", "assigned", "delegated", "transferred", "overdue"];

#[derive(Debug, Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url).await.map_err(backend)?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        info!("Procflow schema is up to date");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn insert_error(entity: &'static str, id: Uuid) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| match err.as_database_error().and_then(|db| db.code()) {
        Some(code) if code == "23505" => StoreError::Duplicate { entity, id },
        _ => backend(err),
    }
}

fn decode<T: std::str::FromStr<Err = String>>(value: &str) -> StoreResult<T> {
    value.parse().map_err(StoreError::Backend)
}

fn cursor_time(key: &SortKey) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(key.micros)
        .ok_or_else(|| StoreError::InvalidCursor(key.encode()))
}

fn push_time_range(qb: &mut QueryBuilder<'_, Postgres>, column: &str, range: &TimeRange) {
    if let Some(from) = range.from {
        qb.push(format!(" AND {column} >= ")).push_bind(from);
    }
    if let Some(to) = range.to {
        qb.push(format!(" AND {column} < ")).push_bind(to);
    }
}

/// Append the keyset predicate, ordering and limit (one extra row to detect
/// whether a next page exists)
fn push_page(
    qb: &mut QueryBuilder<'_, Postgres>,
    time_column: &str,
    seq_column: &str,
    id_column: &str,
    page: &PageRequest,
) -> StoreResult<()> {
    if let Some(cursor) = page.cursor.as_deref() {
        let key = SortKey::decode(cursor)?;
        qb.push(format!(" AND ({time_column}, {seq_column}, {id_column}) > ("))
            .push_bind(cursor_time(&key)?)
            .push(", ")
            .push_bind(key.sequence as i64)
            .push(", ")
            .push_bind(key.id)
            .push(")");
    }
    qb.push(format!(
        " ORDER BY {time_column}, {seq_column}, {id_column} LIMIT "
    ))
    .push_bind((page.effective_limit() + 1) as i64);
    Ok(())
}

fn finish_page<T>(mut rows: Vec<(SortKey, T)>, limit: usize, total: u64) -> Page<T> {
    let has_more = rows.len() > limit;
    rows.truncate(limit);
    let next_cursor = if has_more {
        rows.last().map(|(key, _)| key.encode())
    } else {
        None
    };
    Page {
        items: rows.into_iter().map(|(_, item)| item).collect(),
        next_cursor,
        total,
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
struct ProcessRow {
    process_id: Uuid,
    seq: i64,
    template_id: String,
    name: String,
    description: Option<String>,
    status: String,
    variables: Json<Variables>,
    business_data: Json<serde_json::Value>,
    created_by: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    suspend_reason: Option<String>,
    end_reason: Option<String>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl ProcessRow {
    fn into_keyed(self) -> StoreResult<(SortKey, Process)> {
        let key = SortKey::new(self.created_at, self.seq as u64, self.process_id);
        let process = Process {
            process_id: self.process_id,
            template_id: self.template_id,
            name: self.name,
            description: self.description,
            status: decode(&self.status)?,
            variables: self.variables.0,
            business_data: self.business_data.0,
            created_by: self.created_by,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            suspend_reason: self.suspend_reason,
            end_reason: self.end_reason,
            updated_at: self.updated_at,
            version: self.version,
        };
        Ok((key, process))
    }
}

#[derive(Debug, FromRow)]
struct NodeRow {
    node_id: Uuid,
    seq: i64,
    process_id: Uuid,
    template_key: String,
    name: String,
    node_type: String,
    status: String,
    config: Json<NodeConfig>,
    previous: Json<Vec<Uuid>>,
    next: Json<Vec<Uuid>>,
    incoming_required: i32,
    incoming_completed: i32,
    outcome: Option<String>,
    last_error: Option<String>,
    activated_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl NodeRow {
    fn into_keyed(self) -> StoreResult<(SortKey, Node)> {
        let key = SortKey::new(self.created_at, self.seq as u64, self.node_id);
        let node = Node {
            node_id: self.node_id,
            process_id: self.process_id,
            template_key: self.template_key,
            name: self.name,
            node_type: decode(&self.node_type)?,
            status: decode(&self.status)?,
            config: self.config.0,
            previous: self.previous.0,
            next: self.next.0,
            incoming_required: self.incoming_required.max(0) as u32,
            incoming_completed: self.incoming_completed.max(0) as u32,
            outcome: self.outcome,
            last_error: self.last_error,
            activated_at: self.activated_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version,
        };
        Ok((key, node))
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    task_id: Uuid,
    seq: i64,
    node_id: Uuid,
    process_id: Uuid,
    name: String,
    assignees: Json<Vec<String>>,
    approval_mode: String,
    status: String,
    delegations: Json<BTreeMap<String, String>>,
    actions: Json<Vec<TaskAction>>,
    created_by: String,
    due_date: Option<DateTime<Utc>>,
    overdue_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TaskRow {
    fn into_keyed(self) -> StoreResult<(SortKey, Task)> {
        let key = SortKey::new(self.created_at, self.seq as u64, self.task_id);
        let task = Task {
            task_id: self.task_id,
            node_id: self.node_id,
            process_id: self.process_id,
            name: self.name,
            assignees: self.assignees.0,
            approval_mode: decode(&self.approval_mode)?,
            status: decode(&self.status)?,
            delegations: self.delegations.0,
            actions: self.actions.0,
            created_by: self.created_by,
            due_date: self.due_date,
            overdue_at: self.overdue_at,
            created_at: self.created_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
            version: self.version,
        };
        Ok((key, task))
    }
}

#[derive(Debug, FromRow)]
struct RuleRow {
    rule_id: Uuid,
    seq: i64,
    process_id: Uuid,
    source_node_id: Uuid,
    target_node_id: Uuid,
    name: Option<String>,
    priority: i32,
    condition: Option<String>,
    is_default: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RuleRow {
    fn into_keyed(self) -> (SortKey, Rule) {
        let key = SortKey::new(self.created_at, self.seq as u64, self.rule_id);
        let rule = Rule {
            rule_id: self.rule_id,
            process_id: self.process_id,
            source_node_id: self.source_node_id,
            target_node_id: self.target_node_id,
            name: self.name,
            priority: self.priority,
            condition: self.condition,
            is_default: self.is_default,
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        (key, rule)
    }
}

#[derive(Debug, FromRow)]
struct HistoryRow {
    history_id: Uuid,
    process_id: Uuid,
    node_id: Option<Uuid>,
    task_id: Option<Uuid>,
    operator: String,
    action: String,
    timestamp: DateTime<Utc>,
    sequence: i64,
    duration_ms: Option<i64>,
    details: Json<serde_json::Value>,
}

impl HistoryRow {
    fn into_keyed(self) -> StoreResult<(SortKey, HistoryRecord)> {
        let key = SortKey::new(self.timestamp, self.sequence as u64, self.history_id);
        let record = HistoryRecord {
            history_id: self.history_id,
            process_id: self.process_id,
            node_id: self.node_id,
            task_id: self.task_id,
            operator: self.operator,
            action: decode(&self.action)?,
            timestamp: self.timestamp,
            sequence: self.sequence as u64,
            duration_ms: self.duration_ms,
            details: self.details.0,
        };
        Ok((key, record))
    }
}

fn collect_keyed<R, T>(
    rows: Vec<R>,
    convert: impl Fn(R) -> StoreResult<(SortKey, T)>,
) -> StoreResult<Vec<(SortKey, T)>> {
    rows.into_iter().map(convert).collect()
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

fn push_process_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &ProcessFilter) {
    qb.push(" WHERE TRUE");
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.to_string());
    }
    if let Some(created_by) = &filter.created_by {
        qb.push(" AND created_by = ").push_bind(created_by.clone());
    }
    if let Some(template_id) = &filter.template_id {
        qb.push(" AND template_id = ").push_bind(template_id.clone());
    }
    push_time_range(qb, "created_at", &filter.created);
}

fn push_node_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &NodeFilter) {
    qb.push(" WHERE TRUE");
    if let Some(process_id) = filter.process_id {
        qb.push(" AND process_id = ").push_bind(process_id);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.to_string());
    }
    if let Some(cutoff) = filter.deadline_before {
        qb.push(
            " AND activated_at IS NOT NULL AND config -> 'timeout' IS NOT NULL \
             AND config -> 'timeout' <> 'null'::jsonb \
             AND activated_at + make_interval(secs => (config -> 'timeout' ->> 'after_seconds')::double precision) <= ",
        )
        .push_bind(cutoff);
    }
}

fn push_task_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &TaskFilter) {
    qb.push(" WHERE TRUE");
    if let Some(process_id) = filter.process_id {
        qb.push(" AND process_id = ").push_bind(process_id);
    }
    if let Some(node_id) = filter.node_id {
        qb.push(" AND node_id = ").push_bind(node_id);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.to_string());
    }
    if let Some(assignee) = &filter.assignee {
        qb.push(" AND (assignees ? ")
            .push_bind(assignee.clone())
            .push(" OR EXISTS (SELECT 1 FROM jsonb_each_text(delegations) d WHERE d.value = ")
            .push_bind(assignee.clone())
            .push("))");
    }
    if filter.open_only {
        qb.push(" AND status = ANY(")
            .push_bind(OPEN_TASK_STATUSES.map(str::to_string).to_vec())
            .push(")");
    }
    if let Some(cutoff) = filter.due_before {
        qb.push(" AND due_date IS NOT NULL AND due_date <= ").push_bind(cutoff);
    }
    push_time_range(qb, "created_at", &filter.created);
}

fn push_rule_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &RuleFilter) {
    qb.push(" WHERE TRUE");
    if let Some(process_id) = filter.process_id {
        qb.push(" AND process_id = ").push_bind(process_id);
    }
    if let Some(source) = filter.source_node_id {
        qb.push(" AND source_node_id = ").push_bind(source);
    }
}

fn push_history_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &HistoryFilter) {
    qb.push(" WHERE TRUE");
    if let Some(process_id) = filter.process_id {
        qb.push(" AND process_id = ").push_bind(process_id);
    }
    if let Some(node_id) = filter.node_id {
        qb.push(" AND node_id = ").push_bind(node_id);
    }
    if let Some(task_id) = filter.task_id {
        qb.push(" AND task_id = ").push_bind(task_id);
    }
    if let Some(operator) = &filter.operator {
        qb.push(" AND operator = ").push_bind(operator.clone());
    }
    if let Some(action) = filter.action {
        qb.push(" AND action = ").push_bind(action.as_str());
    }
    push_time_range(qb, "\"timestamp\"", &filter.time);
}

impl PgWorkflowStore {
    async fn count_with(&self, mut qb: QueryBuilder<'_, Postgres>) -> StoreResult<u64> {
        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_rows<R>(&self, mut qb: QueryBuilder<'_, Postgres>) -> StoreResult<Vec<R>>
    where
        R: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        qb.build_query_as::<R>()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn create_process(&self, process: &Process) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO procflow_processes (process_id, template_id, name, description, status, \
             variables, business_data, created_by, created_at, started_at, ended_at, \
             suspend_reason, end_reason, updated_at, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(process.process_id)
        .bind(&process.template_id)
        .bind(&process.name)
        .bind(&process.description)
        .bind(process.status.to_string())
        .bind(Json(&process.variables))
        .bind(Json(&process.business_data))
        .bind(&process.created_by)
        .bind(process.created_at)
        .bind(process.started_at)
        .bind(process.ended_at)
        .bind(&process.suspend_reason)
        .bind(&process.end_reason)
        .bind(process.updated_at)
        .bind(process.version)
        .execute(&self.pool)
        .await
        .map_err(insert_error("process", process.process_id))?;
        Ok(())
    }

    async fn get_process(&self, process_id: Uuid) -> StoreResult<Process> {
        let row: Option<ProcessRow> =
            sqlx::query_as("SELECT * FROM procflow_processes WHERE process_id = $1")
                .bind(process_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        let row = row.ok_or(StoreError::NotFound {
            entity: "process",
            id: process_id,
        })?;
        Ok(row.into_keyed()?.1)
    }

    async fn update_process(&self, process: &Process) -> StoreResult<Process> {
        let result = sqlx::query(
            "UPDATE procflow_processes SET name = $2, description = $3, status = $4, \
             variables = $5, business_data = $6, started_at = $7, ended_at = $8, \
             suspend_reason = $9, end_reason = $10, updated_at = $11, version = version + 1 \
             WHERE process_id = $1 AND version = $12",
        )
        .bind(process.process_id)
        .bind(&process.name)
        .bind(&process.description)
        .bind(process.status.to_string())
        .bind(Json(&process.variables))
        .bind(Json(&process.business_data))
        .bind(process.started_at)
        .bind(process.ended_at)
        .bind(&process.suspend_reason)
        .bind(&process.end_reason)
        .bind(process.updated_at)
        .bind(process.version)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            let current = self.get_process(process.process_id).await?;
            return Err(StoreError::VersionConflict {
                entity: "process",
                id: process.process_id,
                expected: process.version,
                actual: current.version,
            });
        }
        let mut updated = process.clone();
        updated.version += 1;
        Ok(updated)
    }

    async fn delete_process(&self, process_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM procflow_processes WHERE process_id = $1")
            .bind(process_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "process",
                id: process_id,
            });
        }
        Ok(())
    }

    async fn list_processes(&self, filter: &ProcessFilter, page: &PageRequest) -> StoreResult<Page<Process>> {
        let total = self.count_processes(filter).await?;
        let mut qb = QueryBuilder::new("SELECT * FROM procflow_processes");
        push_process_filter(&mut qb, filter);
        push_page(&mut qb, "created_at", "seq", "process_id", page)?;
        let rows = collect_keyed(self.fetch_rows::<ProcessRow>(qb).await?, ProcessRow::into_keyed)?;
        Ok(finish_page(rows, page.effective_limit(), total))
    }

    async fn count_processes(&self, filter: &ProcessFilter) -> StoreResult<u64> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM procflow_processes");
        push_process_filter(&mut qb, filter);
        self.count_with(qb).await
    }

    async fn create_nodes(&self, nodes: &[Node]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for node in nodes {
            sqlx::query(
                "INSERT INTO procflow_nodes (node_id, process_id, template_key, name, node_type, \
                 status, config, previous, next, incoming_required, incoming_completed, outcome, \
                 last_error, activated_at, completed_at, created_at, updated_at, version) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
            )
            .bind(node.node_id)
            .bind(node.process_id)
            .bind(&node.template_key)
            .bind(&node.name)
            .bind(node.node_type.to_string())
            .bind(node.status.to_string())
            .bind(Json(&node.config))
            .bind(Json(&node.previous))
            .bind(Json(&node.next))
            .bind(node.incoming_required as i32)
            .bind(node.incoming_completed as i32)
            .bind(&node.outcome)
            .bind(&node.last_error)
            .bind(node.activated_at)
            .bind(node.completed_at)
            .bind(node.created_at)
            .bind(node.updated_at)
            .bind(node.version)
            .execute(&mut *tx)
            .await
            .map_err(insert_error("node", node.node_id))?;
        }
        tx.commit().await.map_err(backend)
    }

    async fn get_node(&self, node_id: Uuid) -> StoreResult<Node> {
        let row: Option<NodeRow> = sqlx::query_as("SELECT * FROM procflow_nodes WHERE node_id = $1")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        let row = row.ok_or(StoreError::NotFound {
            entity: "node",
            id: node_id,
        })?;
        Ok(row.into_keyed()?.1)
    }

    async fn update_node(&self, node: &Node) -> StoreResult<Node> {
        let result = sqlx::query(
            "UPDATE procflow_nodes SET name = $2, status = $3, config = $4, previous = $5, \
             next = $6, incoming_required = $7, incoming_completed = $8, outcome = $9, \
             last_error = $10, activated_at = $11, completed_at = $12, updated_at = $13, \
             version = version + 1 WHERE node_id = $1 AND version = $14",
        )
        .bind(node.node_id)
        .bind(&node.name)
        .bind(node.status.to_string())
        .bind(Json(&node.config))
        .bind(Json(&node.previous))
        .bind(Json(&node.next))
        .bind(node.incoming_required as i32)
        .bind(node.incoming_completed as i32)
        .bind(&node.outcome)
        .bind(&node.last_error)
        .bind(node.activated_at)
        .bind(node.completed_at)
        .bind(node.updated_at)
        .bind(node.version)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            let current = self.get_node(node.node_id).await?;
            return Err(StoreError::VersionConflict {
                entity: "node",
                id: node.node_id,
                expected: node.version,
                actual: current.version,
            });
        }
        let mut updated = node.clone();
        updated.version += 1;
        Ok(updated)
    }

    async fn delete_node(&self, node_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM procflow_nodes WHERE node_id = $1")
            .bind(node_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "node",
                id: node_id,
            });
        }
        Ok(())
    }

    async fn list_nodes(&self, filter: &NodeFilter, page: &PageRequest) -> StoreResult<Page<Node>> {
        let total = self.count_nodes(filter).await?;
        let mut qb = QueryBuilder::new("SELECT * FROM procflow_nodes");
        push_node_filter(&mut qb, filter);
        push_page(&mut qb, "created_at", "seq", "node_id", page)?;
        let rows = collect_keyed(self.fetch_rows::<NodeRow>(qb).await?, NodeRow::into_keyed)?;
        Ok(finish_page(rows, page.effective_limit(), total))
    }

    async fn count_nodes(&self, filter: &NodeFilter) -> StoreResult<u64> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM procflow_nodes");
        push_node_filter(&mut qb, filter);
        self.count_with(qb).await
    }

    async fn process_nodes(&self, process_id: Uuid) -> StoreResult<Vec<Node>> {
        let rows: Vec<NodeRow> =
            sqlx::query_as("SELECT * FROM procflow_nodes WHERE process_id = $1 ORDER BY seq")
                .bind(process_id)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        rows.into_iter()
            .map(|row| row.into_keyed().map(|(_, node)| node))
            .collect()
    }

    async fn create_task(&self, task: &Task) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO procflow_tasks (task_id, node_id, process_id, name, assignees, \
             approval_mode, status, delegations, actions, created_by, due_date, overdue_at, \
             created_at, completed_at, updated_at, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(task.task_id)
        .bind(task.node_id)
        .bind(task.process_id)
        .bind(&task.name)
        .bind(Json(&task.assignees))
        .bind(task.approval_mode.to_string())
        .bind(task.status.to_string())
        .bind(Json(&task.delegations))
        .bind(Json(&task.actions))
        .bind(&task.created_by)
        .bind(task.due_date)
        .bind(task.overdue_at)
        .bind(task.created_at)
        .bind(task.completed_at)
        .bind(task.updated_at)
        .bind(task.version)
        .execute(&self.pool)
        .await
        .map_err(insert_error("task", task.task_id))?;
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> StoreResult<Task> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM procflow_tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        let row = row.ok_or(StoreError::NotFound {
            entity: "task",
            id: task_id,
        })?;
        Ok(row.into_keyed()?.1)
    }

    async fn update_task(&self, task: &Task) -> StoreResult<Task> {
        let result = sqlx::query(
            "UPDATE procflow_tasks SET name = $2, assignees = $3, status = $4, delegations = $5, \
             actions = $6, due_date = $7, overdue_at = $8, completed_at = $9, updated_at = $10, \
             version = version + 1 WHERE task_id = $1 AND version = $11",
        )
        .bind(task.task_id)
        .bind(&task.name)
        .bind(Json(&task.assignees))
        .bind(task.status.to_string())
        .bind(Json(&task.delegations))
        .bind(Json(&task.actions))
        .bind(task.due_date)
        .bind(task.overdue_at)
        .bind(task.completed_at)
        .bind(task.updated_at)
        .bind(task.version)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            let current = self.get_task(task.task_id).await?;
            return Err(StoreError::VersionConflict {
                entity: "task",
                id: task.task_id,
                expected: task.version,
                actual: current.version,
            });
        }
        let mut updated = task.clone();
        updated.version += 1;
        Ok(updated)
    }

    async fn delete_task(&self, task_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM procflow_tasks WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "task",
                id: task_id,
            });
        }
        Ok(())
    }

    async fn list_tasks(&self, filter: &TaskFilter, page: &PageRequest) -> StoreResult<Page<Task>> {
        let total = self.count_tasks(filter).await?;
        let mut qb = QueryBuilder::new("SELECT * FROM procflow_tasks");
        push_task_filter(&mut qb, filter);
        push_page(&mut qb, "created_at", "seq", "task_id", page)?;
        let rows = collect_keyed(self.fetch_rows::<TaskRow>(qb).await?, TaskRow::into_keyed)?;
        Ok(finish_page(rows, page.effective_limit(), total))
    }

    async fn count_tasks(&self, filter: &TaskFilter) -> StoreResult<u64> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM procflow_tasks");
        push_task_filter(&mut qb, filter);
        self.count_with(qb).await
    }

    async fn process_tasks(&self, process_id: Uuid) -> StoreResult<Vec<Task>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM procflow_tasks WHERE process_id = $1 ORDER BY seq")
                .bind(process_id)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        rows.into_iter()
            .map(|row| row.into_keyed().map(|(_, task)| task))
            .collect()
    }

    async fn create_rules(&self, rules: &[Rule]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for rule in rules {
            sqlx::query(
                "INSERT INTO procflow_rules (rule_id, process_id, source_node_id, target_node_id, \
                 name, priority, condition, is_default, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(rule.rule_id)
            .bind(rule.process_id)
            .bind(rule.source_node_id)
            .bind(rule.target_node_id)
            .bind(&rule.name)
            .bind(rule.priority)
            .bind(&rule.condition)
            .bind(rule.is_default)
            .bind(rule.created_at)
            .bind(rule.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(insert_error("rule", rule.rule_id))?;
        }
        tx.commit().await.map_err(backend)
    }

    async fn get_rule(&self, rule_id: Uuid) -> StoreResult<Rule> {
        let row: Option<RuleRow> = sqlx::query_as("SELECT * FROM procflow_rules WHERE rule_id = $1")
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| row.into_keyed().1).ok_or(StoreError::NotFound {
            entity: "rule",
            id: rule_id,
        })
    }

    async fn update_rule(&self, rule: &Rule) -> StoreResult<Rule> {
        let result = sqlx::query(
            "UPDATE procflow_rules SET target_node_id = $2, name = $3, priority = $4, \
             condition = $5, is_default = $6, updated_at = $7 WHERE rule_id = $1",
        )
        .bind(rule.rule_id)
        .bind(rule.target_node_id)
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(&rule.condition)
        .bind(rule.is_default)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "rule",
                id: rule.rule_id,
            });
        }
        Ok(rule.clone())
    }

    async fn delete_rule(&self, rule_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM procflow_rules WHERE rule_id = $1")
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "rule",
                id: rule_id,
            });
        }
        Ok(())
    }

    async fn list_rules(&self, filter: &RuleFilter, page: &PageRequest) -> StoreResult<Page<Rule>> {
        let total = self.count_rules(filter).await?;
        let mut qb = QueryBuilder::new("SELECT * FROM procflow_rules");
        push_rule_filter(&mut qb, filter);
        push_page(&mut qb, "created_at", "seq", "rule_id", page)?;
        let rows = self
            .fetch_rows::<RuleRow>(qb)
            .await?
            .into_iter()
            .map(RuleRow::into_keyed)
            .collect();
        Ok(finish_page(rows, page.effective_limit(), total))
    }

    async fn count_rules(&self, filter: &RuleFilter) -> StoreResult<u64> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM procflow_rules");
        push_rule_filter(&mut qb, filter);
        self.count_with(qb).await
    }

    async fn process_rules(&self, process_id: Uuid) -> StoreResult<Vec<Rule>> {
        let rows: Vec<RuleRow> =
            sqlx::query_as("SELECT * FROM procflow_rules WHERE process_id = $1 ORDER BY seq")
                .bind(process_id)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        Ok(rows.into_iter().map(|row| row.into_keyed().1).collect())
    }
}

#[async_trait]
impl HistoryStore for PgWorkflowStore {
    async fn append(&self, record: &HistoryRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO procflow_history (history_id, process_id, node_id, task_id, operator, \
             action, \"timestamp\", sequence, duration_ms, details) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(record.history_id)
        .bind(record.process_id)
        .bind(record.node_id)
        .bind(record.task_id)
        .bind(&record.operator)
        .bind(record.action.as_str())
        .bind(record.timestamp)
        .bind(record.sequence as i64)
        .bind(record.duration_ms)
        .bind(Json(&record.details))
        .execute(&self.pool)
        .await
        .map_err(insert_error("history", record.history_id))?;
        Ok(())
    }

    async fn list_history(&self, filter: &HistoryFilter, page: &PageRequest) -> StoreResult<Page<HistoryRecord>> {
        let total = self.count_history(filter).await?;
        let mut qb = QueryBuilder::new("SELECT * FROM procflow_history");
        push_history_filter(&mut qb, filter);
        push_page(&mut qb, "\"timestamp\"", "sequence", "history_id", page)?;
        let rows = collect_keyed(self.fetch_rows::<HistoryRow>(qb).await?, HistoryRow::into_keyed)?;
        Ok(finish_page(rows, page.effective_limit(), total))
    }

    async fn count_history(&self, filter: &HistoryFilter) -> StoreResult<u64> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM procflow_history");
        push_history_filter(&mut qb, filter);
        self.count_with(qb).await
    }

    async fn latest_history(&self, process_id: Uuid) -> StoreResult<Option<HistoryRecord>> {
        let row: Option<HistoryRow> = sqlx::query_as(
            "SELECT * FROM procflow_history WHERE process_id = $1 \
             ORDER BY \"timestamp\" DESC, sequence DESC LIMIT 1",
        )
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|row| row.into_keyed().map(|(_, record)| record))
            .transpose()
    }
}
