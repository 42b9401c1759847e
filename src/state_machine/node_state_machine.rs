use chrono::{DateTime, Utc};

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::NodeEvent,
    states::NodeStatus,
};
use crate::models::Node;

/// Lifecycle transitions for a node instance
pub struct NodeStateMachine<'a> {
    node: &'a mut Node,
}

impl<'a> NodeStateMachine<'a> {
    pub fn new(node: &'a mut Node) -> Self {
        Self { node }
    }

    pub fn current_state(&self) -> NodeStatus {
        self.node.status
    }

    pub fn transition(
        &mut self,
        event: NodeEvent,
        now: DateTime<Utc>,
    ) -> StateMachineResult<NodeStatus> {
        let current = self.node.status;
        let target = determine_target_state(current, event).ok_or_else(|| {
            StateMachineError::InvalidTransition {
                entity: "node",
                id: self.node.node_id,
                from: current.to_string(),
                event: event.event_type().to_string(),
            }
        })?;

        let node = &mut *self.node;
        node.status = target;
        node.updated_at = now;
        match event {
            NodeEvent::Activate => {
                node.activated_at = Some(now);
                node.last_error = None;
            }
            NodeEvent::Complete => {
                node.completed_at = Some(now);
                node.last_error = None;
            }
            NodeEvent::Timeout | NodeEvent::Cancel => node.completed_at = Some(now),
        }

        Ok(target)
    }
}

/// Determine the target state based on current state and event
pub fn determine_target_state(current: NodeStatus, event: NodeEvent) -> Option<NodeStatus> {
    let target = match (current, event) {
        (NodeStatus::Pending, NodeEvent::Activate) => NodeStatus::Active,
        // A node only completes or times out after it has been Active
        (NodeStatus::Active, NodeEvent::Complete) => NodeStatus::Completed,
        (NodeStatus::Active, NodeEvent::Timeout) => NodeStatus::Timeout,
        (NodeStatus::Pending | NodeStatus::Active, NodeEvent::Cancel) => NodeStatus::Cancelled,
        _ => return None,
    };

    Some(target)
}
