//! # Event Subscribers
//!
//! Subscribers register with the [`EventPublisher`](super::EventPublisher)
//! under one or more event patterns:
//!
//! - `*` matches every event
//! - `workflow.task.*` matches by prefix
//! - `*.error` matches by suffix
//! - anything else must match the event name exactly

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::payload::WorkflowEvent;

pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Trait for event subscribers
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Handle an event. An `Err` counts as a failed delivery and is retried.
    async fn handle_event(&self, event: &WorkflowEvent) -> Result<(), SubscriberError>;

    /// Get subscriber name for identification
    fn subscriber_name(&self) -> &str {
        "unnamed_subscriber"
    }
}

/// A registered subscriber and its delivery counters
pub struct Subscription {
    pub subscriber_id: String,
    pub event_patterns: Vec<String>,
    pub subscriber: Arc<dyn EventSubscriber>,
    events_received: AtomicU64,
    failures: AtomicU64,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subscriber_id", &self.subscriber_id)
            .field("event_patterns", &self.event_patterns)
            .field("subscriber", &self.subscriber.subscriber_name())
            .field("events_received", &self.events_received())
            .finish()
    }
}

impl Subscription {
    pub fn new(
        subscriber_id: impl Into<String>,
        event_patterns: Vec<String>,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            event_patterns,
            subscriber,
            events_received: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_event_at: Mutex::new(None),
        }
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.event_patterns
            .iter()
            .any(|pattern| matches_pattern(pattern, event_type))
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        *self.last_event_at.lock()
    }

    pub(crate) fn record_delivery(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        *self.last_event_at.lock() = Some(Utc::now());
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Check if an event name matches a subscription pattern
pub fn matches_pattern(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return event_type.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return event_type.ends_with(suffix);
    }
    pattern == event_type
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("*", "workflow.task.created"));
        assert!(matches_pattern("workflow.task.*", "workflow.task.created"));
        assert!(!matches_pattern("workflow.task.*", "workflow.node.started"));
        assert!(matches_pattern("*.error", "workflow.node.error"));
        assert!(!matches_pattern("*.error", "workflow.node.started"));
        assert!(matches_pattern("workflow.process.started", "workflow.process.started"));
        assert!(!matches_pattern("workflow.process.started", "workflow.process.suspended"));
    }
}
