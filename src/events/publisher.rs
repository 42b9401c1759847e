use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::payload::WorkflowEvent;
use super::subscriber::{EventSubscriber, Subscription};
use crate::config::EventsConfig;
use crate::error::{Result, WorkflowError};

/// An event a subscriber has not acknowledged yet
#[derive(Debug, Clone)]
struct PendingDelivery {
    subscriber_id: String,
    event: WorkflowEvent,
    attempts: u32,
}

/// Ordering is kept per (subscriber, process)
type DeliveryKey = (String, Uuid);

impl PendingDelivery {
    fn key(&self) -> DeliveryKey {
        (self.subscriber_id.clone(), self.event.process_id)
    }
}

/// Keys claimed by one `redeliver_pending` pass. Dropping it puts undelivered
/// entries back at the front of the queue and releases the keys, also when
/// the pass is cancelled mid-delivery.
struct Redelivery<'a> {
    publisher: &'a EventPublisher,
    claimed: HashSet<DeliveryKey>,
    kept: Vec<PendingDelivery>,
    current: Option<PendingDelivery>,
    remaining: VecDeque<PendingDelivery>,
}

impl Drop for Redelivery<'_> {
    fn drop(&mut self) {
        let mut queue = self.publisher.pending.lock();
        let unfinished: Vec<PendingDelivery> = self
            .kept
            .drain(..)
            .chain(self.current.take())
            .chain(self.remaining.drain(..))
            .collect();
        for pending in unfinished.into_iter().rev() {
            queue.push_front(pending);
        }
        let mut in_flight = self.publisher.in_flight.lock();
        for key in &self.claimed {
            in_flight.remove(key);
        }
        drop(in_flight);
        self.publisher.trim_pending(&mut queue);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventPublisherStats {
    pub published: u64,
    pub delivered: u64,
    pub failed_attempts: u64,
    pub redelivered: u64,
    pub dropped: u64,
    pub pending: usize,
    pub subscribers: usize,
}

/// Delivers workflow events to registered subscribers.
///
/// Delivery is at-least-once per subscriber. `publish` awaits delivery to
/// every matching subscriber, retrying failures with backoff; an event a
/// subscriber still rejects is queued for [`EventPublisher::redeliver_pending`].
/// While a subscriber has queued events for a process, or a redelivery pass
/// for that pair is still running, newer events of that process are queued
/// behind them so per-process order is kept.
pub struct EventPublisher {
    config: EventsConfig,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    sender: broadcast::Sender<WorkflowEvent>,
    pending: Mutex<VecDeque<PendingDelivery>>,
    /// Lock order: `pending` before `in_flight`
    in_flight: Mutex<HashSet<DeliveryKey>>,
    published: AtomicU64,
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    redelivered: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("config", &self.config)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(EventsConfig::default())
    }
}

impl EventPublisher {
    pub fn new(config: EventsConfig) -> Self {
        let (sender, _) = broadcast::channel(config.buffer_size.max(1));
        Self {
            config,
            subscriptions: RwLock::new(Vec::new()),
            sender,
            pending: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashSet::new()),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            redelivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber for specific event patterns
    pub async fn register_subscriber(
        &self,
        subscriber_id: &str,
        event_patterns: Vec<String>,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Result<()> {
        if event_patterns.is_empty() {
            return Err(WorkflowError::Validation(format!(
                "subscriber '{subscriber_id}' must subscribe to at least one pattern"
            )));
        }

        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.iter().any(|s| s.subscriber_id == subscriber_id) {
            return Err(WorkflowError::Validation(format!(
                "subscriber '{subscriber_id}' is already registered"
            )));
        }
        subscriptions.push(Arc::new(Subscription::new(
            subscriber_id,
            event_patterns,
            subscriber,
        )));

        info!(subscriber_id = %subscriber_id, "Registered event subscriber");
        Ok(())
    }

    /// Unregister a subscriber and discard its queued events
    pub async fn unregister_subscriber(&self, subscriber_id: &str) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.subscriber_id != subscriber_id);
        if subscriptions.len() == before {
            return Err(WorkflowError::not_found("subscriber", subscriber_id));
        }
        drop(subscriptions);

        self.pending
            .lock()
            .retain(|pending| pending.subscriber_id != subscriber_id);
        info!(subscriber_id = %subscriber_id, "Unregistered event subscriber");
        Ok(())
    }

    pub async fn subscription(&self, subscriber_id: &str) -> Option<Arc<Subscription>> {
        self.subscriptions
            .read()
            .await
            .iter()
            .find(|s| s.subscriber_id == subscriber_id)
            .cloned()
    }

    /// Passive, lossy tap on every published event
    pub fn subscribe_stream(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Never fails the caller; undeliverable events are
    /// queued for redelivery.
    pub async fn publish(&self, event: WorkflowEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            event_type = %event.event_type,
            process_id = %event.process_id,
            "Publishing event"
        );

        // No receivers is fine for the tap
        let _ = self.sender.send(event.clone());

        let matching: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.matches(event.event_type.as_str()))
            .cloned()
            .collect();
        if matching.is_empty() {
            return;
        }

        let deliveries = matching.into_iter().map(|subscription| {
            let event = &event;
            async move {
                if self.queue_if_blocked(&subscription.subscriber_id, event) {
                    return;
                }
                if !self.deliver_with_retry(&subscription, event).await {
                    self.enqueue(PendingDelivery {
                        subscriber_id: subscription.subscriber_id.clone(),
                        event: event.clone(),
                        attempts: self.config.delivery_attempts,
                    });
                }
            }
        });
        join_all(deliveries).await;
    }

    /// Publish several events in order
    pub async fn publish_all(&self, events: Vec<WorkflowEvent>) {
        for event in events {
            self.publish(event).await;
        }
    }

    /// Retry queued deliveries once each, in queue order. Returns the number
    /// delivered. Entries whose (subscriber, process) is claimed by another
    /// pass still running are left for a later pass.
    pub async fn redeliver_pending(&self) -> usize {
        let mut pass = self.claim_pending();
        if pass.remaining.is_empty() {
            return 0;
        }

        let subscriptions = self.subscriptions.read().await.clone();
        let mut blocked: HashSet<DeliveryKey> = HashSet::new();
        let mut delivered = 0;

        while let Some(pending) = pass.remaining.pop_front() {
            let key = pending.key();
            if blocked.contains(&key) {
                pass.kept.push(pending);
                continue;
            }
            let Some(subscription) = subscriptions
                .iter()
                .find(|s| s.subscriber_id == pending.subscriber_id)
            else {
                continue;
            };

            let pending = pass.current.insert(pending);
            pending.attempts += 1;
            let outcome = subscription.subscriber.handle_event(&pending.event).await;
            let Some(pending) = pass.current.take() else {
                continue;
            };
            match outcome {
                Ok(()) => {
                    subscription.record_delivery();
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    self.redelivered.fetch_add(1, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(err) => {
                    subscription.record_failure();
                    self.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        subscriber_id = %pending.subscriber_id,
                        event_type = %pending.event.event_type,
                        attempts = pending.attempts,
                        error = %err,
                        "Redelivery failed"
                    );
                    blocked.insert(key);
                    pass.kept.push(pending);
                }
            }
        }

        delivered
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub async fn stats(&self) -> EventPublisherStats {
        EventPublisherStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: self.pending_count(),
            subscribers: self.subscriptions.read().await.len(),
        }
    }

    async fn deliver_with_retry(&self, subscription: &Subscription, event: &WorkflowEvent) -> bool {
        let attempts = self.config.delivery_attempts.max(1);
        for attempt in 1..=attempts {
            match subscription.subscriber.handle_event(event).await {
                Ok(()) => {
                    subscription.record_delivery();
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(err) => {
                    subscription.record_failure();
                    self.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscriber_id = %subscription.subscriber_id,
                        event_type = %event.event_type,
                        process_id = %event.process_id,
                        attempt = attempt,
                        error = %err,
                        "Event delivery failed"
                    );
                    if attempt < attempts {
                        let backoff = self.config.retry_backoff_ms * u64::from(attempt);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        false
    }

    /// Queue the event behind older undelivered events of the same process,
    /// or behind a redelivery pass working on them. Returns whether it was
    /// queued.
    fn queue_if_blocked(&self, subscriber_id: &str, event: &WorkflowEvent) -> bool {
        let mut queue = self.pending.lock();
        let key = (subscriber_id.to_string(), event.process_id);
        let blocked = queue
            .iter()
            .any(|p| p.subscriber_id == subscriber_id && p.event.process_id == event.process_id)
            || self.in_flight.lock().contains(&key);
        if blocked {
            queue.push_back(PendingDelivery {
                subscriber_id: key.0,
                event: event.clone(),
                attempts: 0,
            });
            self.trim_pending(&mut queue);
        }
        blocked
    }

    /// Take every queued entry whose key no other pass holds, and mark those
    /// keys in flight
    fn claim_pending(&self) -> Redelivery<'_> {
        let mut queue = self.pending.lock();
        let mut in_flight = self.in_flight.lock();
        let mut claimed = HashSet::new();
        let mut remaining = VecDeque::new();
        let mut left = VecDeque::new();
        for pending in queue.drain(..) {
            let key = pending.key();
            if claimed.contains(&key) || in_flight.insert(key.clone()) {
                claimed.insert(key);
                remaining.push_back(pending);
            } else {
                left.push_back(pending);
            }
        }
        *queue = left;
        Redelivery {
            publisher: self,
            claimed,
            kept: Vec::new(),
            current: None,
            remaining,
        }
    }

    fn enqueue(&self, pending: PendingDelivery) {
        let mut queue = self.pending.lock();
        queue.push_back(pending);
        self.trim_pending(&mut queue);
    }

    fn trim_pending(&self, queue: &mut VecDeque<PendingDelivery>) {
        while queue.len() > self.config.max_pending {
            if let Some(dropped) = queue.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscriber_id = %dropped.subscriber_id,
                    event_type = %dropped.event.event_type,
                    "Pending event queue full, dropping oldest event"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::payload::EventType;
    use crate::events::subscriber::SubscriberError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<EventType>>,
        failing: AtomicBool,
        delay_ms: AtomicU64,
    }

    #[async_trait]
    impl EventSubscriber for Recorder {
        async fn handle_event(&self, event: &WorkflowEvent) -> std::result::Result<(), SubscriberError> {
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err("subscriber offline".into());
            }
            self.seen.lock().push(event.event_type);
            Ok(())
        }
    }

    fn publisher() -> EventPublisher {
        EventPublisher::new(EventsConfig {
            buffer_size: 16,
            delivery_attempts: 2,
            retry_backoff_ms: 1,
            max_pending: 8,
        })
    }

    #[tokio::test]
    async fn test_pattern_routing() {
        let publisher = publisher();
        let tasks = Arc::new(Recorder::default());
        let errors = Arc::new(Recorder::default());
        publisher
            .register_subscriber("tasks", vec!["workflow.task.*".into()], tasks.clone())
            .await
            .unwrap();
        publisher
            .register_subscriber("errors", vec!["*.error".into()], errors.clone())
            .await
            .unwrap();

        let process_id = Uuid::new_v4();
        publisher.publish(WorkflowEvent::new(EventType::TaskCreated, process_id)).await;
        publisher.publish(WorkflowEvent::new(EventType::NodeError, process_id)).await;
        publisher.publish(WorkflowEvent::new(EventType::ProcessStarted, process_id)).await;

        assert_eq!(*tasks.seen.lock(), vec![EventType::TaskCreated]);
        assert_eq!(*errors.seen.lock(), vec![EventType::NodeError]);
        assert_eq!(publisher.stats().await.published, 3);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_queued_in_process_order() {
        let publisher = publisher();
        let subscriber = Arc::new(Recorder::default());
        publisher
            .register_subscriber("audit", vec!["*".into()], subscriber.clone())
            .await
            .unwrap();

        let process_id = Uuid::new_v4();
        subscriber.failing.store(true, Ordering::SeqCst);
        publisher.publish(WorkflowEvent::new(EventType::TaskCompleted, process_id)).await;
        subscriber.failing.store(false, Ordering::SeqCst);
        // Queued behind the failed event instead of overtaking it
        publisher.publish(WorkflowEvent::new(EventType::NodeCompleted, process_id)).await;
        assert_eq!(publisher.pending_count(), 2);
        assert!(subscriber.seen.lock().is_empty());

        assert_eq!(publisher.redeliver_pending().await, 2);
        assert_eq!(
            *subscriber.seen.lock(),
            vec![EventType::TaskCompleted, EventType::NodeCompleted]
        );
        assert_eq!(publisher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_queues_behind_running_redelivery() {
        let publisher = Arc::new(publisher());
        let subscriber = Arc::new(Recorder::default());
        publisher
            .register_subscriber("audit", vec!["*".into()], subscriber.clone())
            .await
            .unwrap();

        let process_id = Uuid::new_v4();
        subscriber.failing.store(true, Ordering::SeqCst);
        publisher.publish(WorkflowEvent::new(EventType::TaskCompleted, process_id)).await;
        assert_eq!(publisher.pending_count(), 1);
        subscriber.failing.store(false, Ordering::SeqCst);

        // Slow handler keeps the first pass mid-delivery
        subscriber.delay_ms.store(100, Ordering::SeqCst);
        let running = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.redeliver_pending().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        subscriber.delay_ms.store(0, Ordering::SeqCst);

        publisher.publish(WorkflowEvent::new(EventType::NodeCompleted, process_id)).await;
        assert_eq!(publisher.pending_count(), 1);
        // A second pass leaves the claimed pair alone
        assert_eq!(publisher.redeliver_pending().await, 0);
        assert!(subscriber.seen.lock().is_empty());

        assert_eq!(running.await.unwrap(), 1);
        assert_eq!(publisher.redeliver_pending().await, 1);
        assert_eq!(
            *subscriber.seen.lock(),
            vec![EventType::TaskCompleted, EventType::NodeCompleted]
        );
        assert_eq!(publisher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_redelivery_requeues_and_releases() {
        let publisher = publisher();
        let subscriber = Arc::new(Recorder::default());
        publisher
            .register_subscriber("audit", vec!["*".into()], subscriber.clone())
            .await
            .unwrap();

        let process_id = Uuid::new_v4();
        subscriber.failing.store(true, Ordering::SeqCst);
        publisher.publish(WorkflowEvent::new(EventType::TaskCompleted, process_id)).await;
        subscriber.failing.store(false, Ordering::SeqCst);

        subscriber.delay_ms.store(200, Ordering::SeqCst);
        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), publisher.redeliver_pending()).await;
        assert!(cancelled.is_err());
        subscriber.delay_ms.store(0, Ordering::SeqCst);

        assert_eq!(publisher.pending_count(), 1);
        assert_eq!(publisher.redeliver_pending().await, 1);
        publisher.publish(WorkflowEvent::new(EventType::NodeCompleted, process_id)).await;
        assert_eq!(
            *subscriber.seen.lock(),
            vec![EventType::TaskCompleted, EventType::NodeCompleted]
        );
    }

    #[tokio::test]
    async fn test_stream_tap_receives_events() {
        let publisher = publisher();
        let mut stream = publisher.subscribe_stream();
        let process_id = Uuid::new_v4();
        publisher.publish(WorkflowEvent::new(EventType::ProcessStarted, process_id)).await;

        let received = stream.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::ProcessStarted);
        assert_eq!(received.process_id, process_id);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let publisher = publisher();
        let subscriber = Arc::new(Recorder::default());
        publisher
            .register_subscriber("a", vec!["*".into()], subscriber.clone())
            .await
            .unwrap();
        assert!(publisher
            .register_subscriber("a", vec!["*".into()], subscriber)
            .await
            .is_err());
        assert!(publisher.unregister_subscriber("missing").await.is_err());
    }
}
