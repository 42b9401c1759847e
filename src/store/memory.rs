//! In-memory implementation of both storage traits.
//!
//! Rows live in `DashMap`s keyed by id; each row carries the insertion
//! sequence it was created with so that listings are stable when several rows
//! share a creation timestamp.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use super::{
    HistoryFilter, HistoryStore, NodeFilter, Page, PageRequest, ProcessFilter, RuleFilter,
    SortKey, StoreError, StoreResult, TaskFilter, WorkflowStore,
};
use crate::models::{HistoryRecord, Node, Process, Rule, Task};

#[derive(Debug, Clone)]
struct Row<T> {
    seq: u64,
    value: T,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    processes: DashMap<Uuid, Row<Process>>,
    nodes: DashMap<Uuid, Row<Node>>,
    tasks: DashMap<Uuid, Row<Task>>,
    rules: DashMap<Uuid, Row<Rule>>,
    history: RwLock<Vec<HistoryRecord>>,
    seq: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }
}

fn paginate<T>(mut rows: Vec<(SortKey, T)>, page: &PageRequest) -> StoreResult<Page<T>> {
    rows.sort_by_key(|(key, _)| *key);
    let total = rows.len() as u64;
    let after = page.cursor.as_deref().map(SortKey::decode).transpose()?;

    let mut remaining = rows
        .into_iter()
        .filter(|(key, _)| after.map_or(true, |cursor| *key > cursor));
    let taken: Vec<(SortKey, T)> = remaining.by_ref().take(page.effective_limit()).collect();
    let next_cursor = match remaining.next() {
        Some(_) => taken.last().map(|(key, _)| key.encode()),
        None => None,
    };

    Ok(Page {
        items: taken.into_iter().map(|(_, value)| value).collect(),
        next_cursor,
        total,
    })
}

/// Compare-and-set on the optimistic version column
fn update_versioned<T: Clone>(
    map: &DashMap<Uuid, Row<T>>,
    entity: &'static str,
    id: Uuid,
    expected: i64,
    version_of: impl Fn(&T) -> i64,
    value: &T,
    bump: impl Fn(&mut T),
) -> StoreResult<T> {
    let mut row = map.get_mut(&id).ok_or(StoreError::NotFound { entity, id })?;
    let actual = version_of(&row.value);
    if actual != expected {
        return Err(StoreError::VersionConflict {
            entity,
            id,
            expected,
            actual,
        });
    }
    let mut updated = value.clone();
    bump(&mut updated);
    row.value = updated.clone();
    Ok(updated)
}

fn insert_unique<T>(
    map: &DashMap<Uuid, Row<T>>,
    entity: &'static str,
    id: Uuid,
    seq: u64,
    value: T,
) -> StoreResult<()> {
    match map.entry(id) {
        dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Duplicate { entity, id }),
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(Row { seq, value });
            Ok(())
        }
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn create_process(&self, process: &Process) -> StoreResult<()> {
        insert_unique(
            &self.processes,
            "process",
            process.process_id,
            self.next_seq(),
            process.clone(),
        )
    }

    async fn get_process(&self, process_id: Uuid) -> StoreResult<Process> {
        self.processes
            .get(&process_id)
            .map(|row| row.value.clone())
            .ok_or(StoreError::NotFound {
                entity: "process",
                id: process_id,
            })
    }

    async fn update_process(&self, process: &Process) -> StoreResult<Process> {
        update_versioned(
            &self.processes,
            "process",
            process.process_id,
            process.version,
            |p| p.version,
            process,
            |p| p.version += 1,
        )
    }

    async fn delete_process(&self, process_id: Uuid) -> StoreResult<()> {
        self.processes.remove(&process_id).ok_or(StoreError::NotFound {
            entity: "process",
            id: process_id,
        })?;
        self.nodes.retain(|_, row| row.value.process_id != process_id);
        self.tasks.retain(|_, row| row.value.process_id != process_id);
        self.rules.retain(|_, row| row.value.process_id != process_id);
        Ok(())
    }

    async fn list_processes(&self, filter: &ProcessFilter, page: &PageRequest) -> StoreResult<Page<Process>> {
        let rows = self
            .processes
            .iter()
            .filter(|row| filter.matches(&row.value))
            .map(|row| {
                let p = &row.value;
                (SortKey::new(p.created_at, row.seq, p.process_id), p.clone())
            })
            .collect();
        paginate(rows, page)
    }

    async fn count_processes(&self, filter: &ProcessFilter) -> StoreResult<u64> {
        Ok(self.processes.iter().filter(|row| filter.matches(&row.value)).count() as u64)
    }

    async fn create_nodes(&self, nodes: &[Node]) -> StoreResult<()> {
        if let Some(existing) = nodes.iter().find(|n| self.nodes.contains_key(&n.node_id)) {
            return Err(StoreError::Duplicate {
                entity: "node",
                id: existing.node_id,
            });
        }
        for node in nodes {
            insert_unique(&self.nodes, "node", node.node_id, self.next_seq(), node.clone())?;
        }
        Ok(())
    }

    async fn get_node(&self, node_id: Uuid) -> StoreResult<Node> {
        self.nodes
            .get(&node_id)
            .map(|row| row.value.clone())
            .ok_or(StoreError::NotFound {
                entity: "node",
                id: node_id,
            })
    }

    async fn update_node(&self, node: &Node) -> StoreResult<Node> {
        update_versioned(
            &self.nodes,
            "node",
            node.node_id,
            node.version,
            |n| n.version,
            node,
            |n| n.version += 1,
        )
    }

    async fn delete_node(&self, node_id: Uuid) -> StoreResult<()> {
        self.nodes.remove(&node_id).map(|_| ()).ok_or(StoreError::NotFound {
            entity: "node",
            id: node_id,
        })
    }

    async fn list_nodes(&self, filter: &NodeFilter, page: &PageRequest) -> StoreResult<Page<Node>> {
        let rows = self
            .nodes
            .iter()
            .filter(|row| filter.matches(&row.value))
            .map(|row| {
                let n = &row.value;
                (SortKey::new(n.created_at, row.seq, n.node_id), n.clone())
            })
            .collect();
        paginate(rows, page)
    }

    async fn count_nodes(&self, filter: &NodeFilter) -> StoreResult<u64> {
        Ok(self.nodes.iter().filter(|row| filter.matches(&row.value)).count() as u64)
    }

    async fn process_nodes(&self, process_id: Uuid) -> StoreResult<Vec<Node>> {
        let mut rows: Vec<(u64, Node)> = self
            .nodes
            .iter()
            .filter(|row| row.value.process_id == process_id)
            .map(|row| (row.seq, row.value.clone()))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, node)| node).collect())
    }

    async fn create_task(&self, task: &Task) -> StoreResult<()> {
        insert_unique(&self.tasks, "task", task.task_id, self.next_seq(), task.clone())
    }

    async fn get_task(&self, task_id: Uuid) -> StoreResult<Task> {
        self.tasks
            .get(&task_id)
            .map(|row| row.value.clone())
            .ok_or(StoreError::NotFound {
                entity: "task",
                id: task_id,
            })
    }

    async fn update_task(&self, task: &Task) -> StoreResult<Task> {
        update_versioned(
            &self.tasks,
            "task",
            task.task_id,
            task.version,
            |t| t.version,
            task,
            |t| t.version += 1,
        )
    }

    async fn delete_task(&self, task_id: Uuid) -> StoreResult<()> {
        self.tasks.remove(&task_id).map(|_| ()).ok_or(StoreError::NotFound {
            entity: "task",
            id: task_id,
        })
    }

    async fn list_tasks(&self, filter: &TaskFilter, page: &PageRequest) -> StoreResult<Page<Task>> {
        let rows = self
            .tasks
            .iter()
            .filter(|row| filter.matches(&row.value))
            .map(|row| {
                let t = &row.value;
                (SortKey::new(t.created_at, row.seq, t.task_id), t.clone())
            })
            .collect();
        paginate(rows, page)
    }

    async fn count_tasks(&self, filter: &TaskFilter) -> StoreResult<u64> {
        Ok(self.tasks.iter().filter(|row| filter.matches(&row.value)).count() as u64)
    }

    async fn process_tasks(&self, process_id: Uuid) -> StoreResult<Vec<Task>> {
        let mut rows: Vec<(u64, Task)> = self
            .tasks
            .iter()
            .filter(|row| row.value.process_id == process_id)
            .map(|row| (row.seq, row.value.clone()))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, task)| task).collect())
    }

    async fn create_rules(&self, rules: &[Rule]) -> StoreResult<()> {
        if let Some(existing) = rules.iter().find(|r| self.rules.contains_key(&r.rule_id)) {
            return Err(StoreError::Duplicate {
                entity: "rule",
                id: existing.rule_id,
            });
        }
        for rule in rules {
            insert_unique(&self.rules, "rule", rule.rule_id, self.next_seq(), rule.clone())?;
        }
        Ok(())
    }

    async fn get_rule(&self, rule_id: Uuid) -> StoreResult<Rule> {
        self.rules
            .get(&rule_id)
            .map(|row| row.value.clone())
            .ok_or(StoreError::NotFound {
                entity: "rule",
                id: rule_id,
            })
    }

    async fn update_rule(&self, rule: &Rule) -> StoreResult<Rule> {
        let mut row = self.rules.get_mut(&rule.rule_id).ok_or(StoreError::NotFound {
            entity: "rule",
            id: rule.rule_id,
        })?;
        row.value = rule.clone();
        Ok(rule.clone())
    }

    async fn delete_rule(&self, rule_id: Uuid) -> StoreResult<()> {
        self.rules.remove(&rule_id).map(|_| ()).ok_or(StoreError::NotFound {
            entity: "rule",
            id: rule_id,
        })
    }

    async fn list_rules(&self, filter: &RuleFilter, page: &PageRequest) -> StoreResult<Page<Rule>> {
        let rows = self
            .rules
            .iter()
            .filter(|row| filter.matches(&row.value))
            .map(|row| {
                let r = &row.value;
                (SortKey::new(r.created_at, row.seq, r.rule_id), r.clone())
            })
            .collect();
        paginate(rows, page)
    }

    async fn count_rules(&self, filter: &RuleFilter) -> StoreResult<u64> {
        Ok(self.rules.iter().filter(|row| filter.matches(&row.value)).count() as u64)
    }

    async fn process_rules(&self, process_id: Uuid) -> StoreResult<Vec<Rule>> {
        let mut rows: Vec<(u64, Rule)> = self
            .rules
            .iter()
            .filter(|row| row.value.process_id == process_id)
            .map(|row| (row.seq, row.value.clone()))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, rule)| rule).collect())
    }
}

#[async_trait]
impl HistoryStore for InMemoryStore {
    async fn append(&self, record: &HistoryRecord) -> StoreResult<()> {
        let mut history = self.history.write();
        if history.iter().any(|r| r.history_id == record.history_id) {
            return Err(StoreError::Duplicate {
                entity: "history",
                id: record.history_id,
            });
        }
        history.push(record.clone());
        Ok(())
    }

    async fn list_history(&self, filter: &HistoryFilter, page: &PageRequest) -> StoreResult<Page<HistoryRecord>> {
        let rows = self
            .history
            .read()
            .iter()
            .filter(|record| filter.matches(record))
            .map(|r| (SortKey::new(r.timestamp, r.sequence, r.history_id), r.clone()))
            .collect();
        paginate(rows, page)
    }

    async fn count_history(&self, filter: &HistoryFilter) -> StoreResult<u64> {
        Ok(self
            .history
            .read()
            .iter()
            .filter(|record| filter.matches(record))
            .count() as u64)
    }

    async fn latest_history(&self, process_id: Uuid) -> StoreResult<Option<HistoryRecord>> {
        Ok(self
            .history
            .read()
            .iter()
            .filter(|record| record.process_id == process_id)
            .max_by_key(|r| (r.timestamp, r.sequence))
            .cloned())
    }
}
