//! # Process Templates
//!
//! Definition-time description of a process graph. A template is validated
//! once and then instantiated into per-process [`Node`] and [`Rule`] rows;
//! instances never share rows with each other.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::node::{
    EndKind, GatewayKind, Node, NodeConfig, NodeType, TimeoutAction, TimeoutPolicy, WithdrawPolicy,
};
use super::rule::Rule;
use super::task::ApprovalMode;
use crate::rules::Expression;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub key: String,
    pub name: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub config: NodeConfig,
}

impl NodeTemplate {
    pub fn new(key: impl Into<String>, name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            node_type,
            config: NodeConfig::default(),
        }
    }

    pub fn start(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(key.clone(), key, NodeType::Start)
    }

    pub fn end(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(key.clone(), key, NodeType::End)
    }

    /// End node that drives the process to Rejected
    pub fn rejected_end(key: impl Into<String>) -> Self {
        let mut node = Self::end(key);
        node.config.end_kind = EndKind::Rejected;
        node
    }

    pub fn task<S: Into<String>>(
        key: impl Into<String>,
        name: impl Into<String>,
        assignees: impl IntoIterator<Item = S>,
        approval_mode: ApprovalMode,
    ) -> Self {
        let mut node = Self::new(key, name, NodeType::Task);
        node.config.assignees = assignees.into_iter().map(Into::into).collect();
        node.config.approval_mode = approval_mode;
        node
    }

    /// Task node without assignees; completes as soon as it is activated
    pub fn system_task(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(key, name, NodeType::Task)
    }

    pub fn gateway(key: impl Into<String>, kind: GatewayKind) -> Self {
        let key = key.into();
        Self::new(key.clone(), key, NodeType::Gateway(kind))
    }

    pub fn with_due_in(mut self, seconds: i64) -> Self {
        self.config.due_in_seconds = Some(seconds);
        self
    }

    pub fn with_timeout(mut self, after_seconds: i64, action: TimeoutAction) -> Self {
        self.config.timeout = Some(TimeoutPolicy {
            after_seconds,
            action,
        });
        self
    }

    pub fn with_withdraw_policy(mut self, policy: WithdrawPolicy) -> Self {
        self.config.withdraw_policy = policy;
        self
    }

    pub fn with_join_required(mut self, required: u32) -> Self {
        self.config.join_required = Some(required);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTemplate {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub name: Option<String>,
}

impl RuleTemplate {
    /// Conditional rule
    pub fn when(
        source: impl Into<String>,
        target: impl Into<String>,
        priority: i32,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            priority,
            condition: Some(condition.into()),
            is_default: false,
            name: None,
        }
    }

    /// Default/else rule
    pub fn otherwise(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            priority: i32::MAX,
            condition: None,
            is_default: true,
            name: None,
        }
    }

    /// Unconditional edge, used for straight-line flow and parallel fan-out
    pub fn always(source: impl Into<String>, target: impl Into<String>, priority: i32) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            priority,
            condition: None,
            is_default: false,
            name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessTemplate {
    pub template_id: String,
    pub name: String,
    pub nodes: Vec<NodeTemplate>,
    pub rules: Vec<RuleTemplate>,
}

impl ProcessTemplate {
    pub fn new(template_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            name: name.into(),
            nodes: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: NodeTemplate) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_rule(mut self, rule: RuleTemplate) -> Self {
        self.rules.push(rule);
        self
    }

    /// Structural validation of the graph and its routing rules
    pub fn validate(&self) -> Result<(), String> {
        if self.template_id.trim().is_empty() {
            return Err("template id must not be empty".to_string());
        }

        let mut nodes: HashMap<&str, &NodeTemplate> = HashMap::new();
        for node in &self.nodes {
            if node.key.trim().is_empty() {
                return Err("node key must not be empty".to_string());
            }
            if nodes.insert(node.key.as_str(), node).is_some() {
                return Err(format!("duplicate node key '{}'", node.key));
            }
        }

        let starts = self
            .nodes
            .iter()
            .filter(|node| node.node_type == NodeType::Start)
            .count();
        if starts != 1 {
            return Err(format!("template must have exactly one start node, found {starts}"));
        }
        if !self.nodes.iter().any(|node| node.node_type == NodeType::End) {
            return Err("template must have at least one end node".to_string());
        }

        let mut outgoing: HashMap<&str, Vec<&RuleTemplate>> = HashMap::new();
        for rule in &self.rules {
            let source = nodes
                .get(rule.source.as_str())
                .ok_or_else(|| format!("rule source '{}' is not a node", rule.source))?;
            let target = nodes
                .get(rule.target.as_str())
                .ok_or_else(|| format!("rule target '{}' is not a node", rule.target))?;
            if source.node_type == NodeType::End {
                return Err(format!("end node '{}' cannot have outgoing rules", source.key));
            }
            if target.node_type == NodeType::Start {
                return Err(format!("start node '{}' cannot be a rule target", target.key));
            }
            if rule.is_default && rule.condition.is_some() {
                return Err(format!(
                    "default rule {} -> {} must not carry a condition",
                    rule.source, rule.target
                ));
            }
            if let Some(condition) = &rule.condition {
                Expression::parse(condition).map_err(|e| {
                    format!("rule {} -> {} has invalid condition: {e}", rule.source, rule.target)
                })?;
            }
            outgoing.entry(rule.source.as_str()).or_default().push(rule);
        }

        for (source, rules) in &outgoing {
            let mut priorities = HashSet::new();
            let mut defaults = 0;
            for rule in rules {
                if rule.is_default {
                    defaults += 1;
                } else if !priorities.insert(rule.priority) {
                    return Err(format!(
                        "node '{source}' has duplicate rule priority {}",
                        rule.priority
                    ));
                }
            }
            if defaults > 1 {
                return Err(format!("node '{source}' has more than one default rule"));
            }
        }

        for node in &self.nodes {
            if node.node_type != NodeType::End && !outgoing.contains_key(node.key.as_str()) {
                return Err(format!("node '{}' has no outgoing rule", node.key));
            }
            if node.node_type == NodeType::Task
                && node.config.approval_mode != ApprovalMode::Any
                && node.config.assignees.is_empty()
            {
                return Err(format!(
                    "task node '{}' uses {} approval without assignees",
                    node.key, node.config.approval_mode
                ));
            }
            node.config.check_offsets(&node.key)?;
            if let Some(policy) = &node.config.timeout {
                if let TimeoutAction::Advance { target } = &policy.action {
                    if !nodes.contains_key(target.as_str()) {
                        return Err(format!(
                            "node '{}' timeout target '{target}' is not a node",
                            node.key
                        ));
                    }
                }
            }
        }

        if let Some(key) = find_cycle(&outgoing) {
            return Err(format!("rules form a cycle through node '{key}'"));
        }

        Ok(())
    }

    /// Create the node and rule rows for a new process instance
    pub fn instantiate(&self, process_id: Uuid) -> Result<(Vec<Node>, Vec<Rule>), String> {
        self.validate()?;

        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .map(|template| {
                Node::new(
                    process_id,
                    template.key.clone(),
                    template.name.clone(),
                    template.node_type,
                    template.config.clone(),
                )
            })
            .collect();

        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(position, node)| (node.template_key.clone(), position))
            .collect();

        let mut rules = Vec::with_capacity(self.rules.len());
        for template in &self.rules {
            let (Some(&source), Some(&target)) =
                (index.get(&template.source), index.get(&template.target))
            else {
                return Err(format!(
                    "rule {} -> {} references an unknown node",
                    template.source, template.target
                ));
            };
            let source_id = nodes[source].node_id;
            let target_id = nodes[target].node_id;

            if !nodes[source].next.contains(&target_id) {
                nodes[source].next.push(target_id);
            }
            if !nodes[target].previous.contains(&source_id) {
                nodes[target].previous.push(source_id);
            }

            let mut rule = Rule::new(
                process_id,
                source_id,
                target_id,
                template.priority,
                template.condition.clone(),
            );
            rule.is_default = template.is_default;
            rule.name = template.name.clone();
            rules.push(rule);
        }

        for node in &mut nodes {
            node.incoming_required = node.derive_incoming_required();
        }

        Ok((nodes, rules))
    }
}

/// Depth-first search for a back edge; node instances cannot be re-entered
fn find_cycle<'a>(outgoing: &HashMap<&'a str, Vec<&'a RuleTemplate>>) -> Option<&'a str> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        key: &'a str,
        outgoing: &HashMap<&'a str, Vec<&'a RuleTemplate>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Option<&'a str> {
        match marks.get(key) {
            Some(Mark::Visiting) => return Some(key),
            Some(Mark::Done) => return None,
            None => {}
        }
        marks.insert(key, Mark::Visiting);
        for rule in outgoing.get(key).into_iter().flatten() {
            if let Some(found) = visit(rule.target.as_str(), outgoing, marks) {
                return Some(found);
            }
        }
        marks.insert(key, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut sources: Vec<&&str> = outgoing.keys().collect();
    sources.sort();
    sources
        .into_iter()
        .find_map(|source| visit(*source, outgoing, &mut marks))
}
