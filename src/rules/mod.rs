//! # Rule Evaluation
//!
//! Routing conditions are small, side-effect free expressions parsed into a
//! tagged AST ([`ast::Expr`]) and interpreted against process variables,
//! business data and the outcome of the node being routed.
//!
//! [`RuleEvaluator::select_next`] applies gateway semantics on top:
//!
//! - Exclusive gateways and plain nodes take the first matching rule in
//!   priority order, then the default rule.
//! - Parallel gateways ignore conditions and return every configured target.
//! - Inclusive gateways return every matching target, then the default rule.
//!
//! An empty selection from a node with outgoing rules is a
//! [`WorkflowError::RuleEvaluation`].

pub mod ast;
pub mod evaluator;
pub mod lexer;
pub mod parser;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::models::{GatewayKind, Node, NodeType, Rule};

pub use ast::Expr;
pub use evaluator::Environment;

/// Errors raised while parsing or evaluating a condition
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("Condition is empty")]
    Empty,

    #[error("Syntax error at column {col}: {message}")]
    Syntax { col: usize, message: String },

    #[error("Unexpected token at column {col}: expected {expected}, found '{found}'")]
    UnexpectedToken {
        expected: String,
        found: String,
        col: usize,
    },

    #[error("Unexpected end of condition: expected {0}")]
    UnexpectedEof(String),

    #[error("Cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: String,
        left: String,
        right: String,
    },

    #[error("Condition must evaluate to a boolean, got {0}")]
    NotBoolean(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Arithmetic produced a non-finite number")]
    NonFiniteNumber,
}

/// A parsed condition together with its source text
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> std::result::Result<Self, ExpressionError> {
        Ok(Self {
            source: source.to_string(),
            ast: parser::Parser::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn evaluate(&self, env: &Environment<'_>) -> std::result::Result<bool, ExpressionError> {
        evaluator::evaluate_condition(&self.ast, env)
    }
}

/// Selects the successor node(s) of a completing node.
///
/// Holds a cache of compiled conditions keyed by source text; the cache only
/// avoids re-parsing and never changes a result.
#[derive(Debug, Default)]
pub struct RuleEvaluator {
    compiled: RwLock<HashMap<String, Arc<Expression>>>,
}

impl RuleEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse (or fetch from cache) a condition
    pub fn compile(&self, source: &str) -> std::result::Result<Arc<Expression>, ExpressionError> {
        if let Some(expr) = self.compiled.read().get(source) {
            return Ok(Arc::clone(expr));
        }
        let expr = Arc::new(Expression::parse(source)?);
        self.compiled
            .write()
            .insert(source.to_string(), Arc::clone(&expr));
        Ok(expr)
    }

    /// Check a condition's syntax without evaluating it
    pub fn validate_condition(&self, source: &str) -> Result<()> {
        self.compile(source)?;
        Ok(())
    }

    pub fn cached_len(&self) -> usize {
        self.compiled.read().len()
    }

    /// Select next node ids for `node` given its outgoing `rules`.
    ///
    /// Rules whose source is not `node` are ignored. Returns an empty list only
    /// when the node has no outgoing rules at all (an End node).
    pub fn select_next(&self, node: &Node, rules: &[Rule], env: &Environment<'_>) -> Result<Vec<Uuid>> {
        let mut outgoing: Vec<&Rule> = rules
            .iter()
            .filter(|rule| rule.source_node_id == node.node_id)
            .collect();
        if outgoing.is_empty() {
            return Ok(Vec::new());
        }
        // Priority ascending, default last, rule id as a stable tie-break
        outgoing.sort_by(|a, b| {
            (a.is_default, a.priority, a.rule_id).cmp(&(b.is_default, b.priority, b.rule_id))
        });

        let default_target = outgoing
            .iter()
            .find(|rule| rule.is_default)
            .map(|rule| rule.target_node_id);
        let conditional = outgoing.iter().filter(|rule| !rule.is_default);

        let selected = match node.node_type {
            NodeType::Gateway(GatewayKind::Parallel) => {
                let mut targets = Vec::new();
                for rule in &outgoing {
                    push_unique(&mut targets, rule.target_node_id);
                }
                targets
            }
            NodeType::Gateway(GatewayKind::Inclusive) => {
                let mut targets = Vec::new();
                for rule in conditional {
                    if self.matches(node, rule, env)? {
                        push_unique(&mut targets, rule.target_node_id);
                    }
                }
                if targets.is_empty() {
                    targets.extend(default_target);
                }
                targets
            }
            _ => {
                let mut first = None;
                for rule in conditional {
                    if self.matches(node, rule, env)? {
                        first = Some(rule.target_node_id);
                        break;
                    }
                }
                first.or(default_target).into_iter().collect()
            }
        };

        if selected.is_empty() {
            return Err(WorkflowError::RuleEvaluation {
                node_id: node.node_id,
                reason: format!(
                    "no rule matched among {} outgoing rule(s) and no default rule exists",
                    outgoing.len()
                ),
            });
        }

        debug!(
            node_id = %node.node_id,
            node_type = %node.node_type,
            selected = ?selected,
            "Selected next nodes"
        );
        Ok(selected)
    }

    fn matches(&self, node: &Node, rule: &Rule, env: &Environment<'_>) -> Result<bool> {
        let Some(source) = rule.condition.as_deref() else {
            // Unconditional edge
            return Ok(true);
        };
        let rule_error = |err: ExpressionError| WorkflowError::RuleEvaluation {
            node_id: node.node_id,
            reason: format!("rule {} condition '{source}' failed: {err}", rule.rule_id),
        };
        let expr = self.compile(source).map_err(rule_error)?;
        expr.evaluate(env).map_err(rule_error)
    }
}

fn push_unique(targets: &mut Vec<Uuid>, target: Uuid) {
    if !targets.contains(&target) {
        targets.push(target);
    }
}
