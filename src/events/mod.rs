//! # Workflow Events
//!
//! Typed notifications published on every transition. Subscribers register
//! through [`EventPublisher::register_subscriber`] with name patterns and get
//! at-least-once delivery; passive listeners can take a lossy broadcast tap
//! via [`EventPublisher::subscribe_stream`].

pub mod payload;
pub mod publisher;
pub mod subscriber;

pub use payload::{ErrorInfo, EventType, WorkflowEvent};
pub use publisher::{EventPublisher, EventPublisherStats};
pub use subscriber::{matches_pattern, EventSubscriber, SubscriberError, Subscription};
