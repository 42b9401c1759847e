//! # Rule Model
//!
//! Routing condition attached to a node's outgoing edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: Uuid,
    pub process_id: Uuid,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub name: Option<String>,
    /// Lower evaluates first
    pub priority: i32,
    /// Condition expression; `None` on the default/else rule
    pub condition: Option<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn new(
        process_id: Uuid,
        source_node_id: Uuid,
        target_node_id: Uuid,
        priority: i32,
        condition: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            rule_id: Uuid::new_v4(),
            process_id,
            source_node_id,
            target_node_id,
            name: None,
            priority,
            condition,
            is_default: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Unconditional fallback evaluated after every conditional rule
    pub fn default_rule(process_id: Uuid, source_node_id: Uuid, target_node_id: Uuid) -> Self {
        Self {
            is_default: true,
            ..Self::new(process_id, source_node_id, target_node_id, i32::MAX, None)
        }
    }
}

/// Check the per-source invariant: unique priorities among conditional rules,
/// at most one default rule.
pub fn validate_rule_set<'a>(rules: impl IntoIterator<Item = &'a Rule>) -> Result<(), String> {
    let mut priorities = HashSet::new();
    let mut defaults = 0;

    for rule in rules {
        if rule.is_default {
            defaults += 1;
            if defaults > 1 {
                return Err(format!(
                    "node {} has more than one default rule",
                    rule.source_node_id
                ));
            }
            continue;
        }
        if !priorities.insert(rule.priority) {
            return Err(format!(
                "node {} has duplicate rule priority {}",
                rule.source_node_id, rule.priority
            ));
        }
    }

    Ok(())
}

/// Metadata update for administrative rule edits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub priority: Option<i32>,
    pub condition: Option<String>,
    pub target_node_id: Option<Uuid>,
}
