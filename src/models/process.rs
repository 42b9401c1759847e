//! # Process Model
//!
//! One running execution of a workflow template.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::state_machine::ProcessStatus;

/// Typed process variables consulted by rule conditions
pub type Variables = BTreeMap<String, Value>;

/// A workflow process instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub process_id: Uuid,
    pub template_id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: ProcessStatus,
    pub variables: Variables,
    /// Opaque document owned by the calling domain
    pub business_data: Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Reason given for the latest suspension, cleared on resume
    pub suspend_reason: Option<String>,
    /// Reason given for a terminate/reject/cancel
    pub end_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency version, bumped by the store on every update
    pub version: i64,
}

impl Process {
    pub fn new(
        template_id: impl Into<String>,
        name: impl Into<String>,
        created_by: impl Into<String>,
        variables: Variables,
        business_data: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            process_id: Uuid::new_v4(),
            template_id: template_id.into(),
            name: name.into(),
            description: None,
            status: ProcessStatus::Pending,
            variables,
            business_data,
            created_by: created_by.into(),
            created_at: now,
            started_at: None,
            ended_at: None,
            suspend_reason: None,
            end_reason: None,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration in milliseconds between start and end
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Metadata-only update; status is never touched through this path
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Merged into the existing variables (keys with `null` are removed)
    pub variables: Option<Variables>,
    pub business_data: Option<Value>,
}

impl ProcessUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.variables.is_none()
            && self.business_data.is_none()
    }

    pub(crate) fn apply(self, process: &mut Process) {
        if let Some(name) = self.name {
            process.name = name;
        }
        if let Some(description) = self.description {
            process.description = Some(description);
        }
        if let Some(variables) = self.variables {
            for (key, value) in variables {
                if value.is_null() {
                    process.variables.remove(&key);
                } else {
                    process.variables.insert(key, value);
                }
            }
        }
        if let Some(business_data) = self.business_data {
            process.business_data = business_data;
        }
    }
}
