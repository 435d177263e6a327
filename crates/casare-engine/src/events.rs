//! Execution events and the per-run event bus
//!
//! Events are the primary observability channel: every run publishes its
//! lifecycle onto a bounded broadcast channel that any number of
//! subscribers may join or leave. Publishing never blocks the scheduler;
//! when the queue is full, low-priority events are dropped and lifecycle
//! events are kept.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Counts per terminal node status, carried by `WorkflowCompleted`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Nodes that completed successfully (per visit)
    pub completed: u64,
    /// Nodes that failed terminally
    pub failed: u64,
    /// Retry attempts performed across all nodes
    pub retried: u64,
}

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutionEvent {
    #[serde(rename_all = "camelCase")]
    WorkflowStarted {
        run_id: String,
        workflow_id: String,
        start_time: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    WorkflowCompleted {
        run_id: String,
        duration_ms: u64,
        summary: RunSummary,
    },

    #[serde(rename_all = "camelCase")]
    WorkflowFailed {
        run_id: String,
        error_kind: String,
        message: String,
    },

    #[serde(rename_all = "camelCase")]
    NodeStarted {
        node_id: String,
        type_name: String,
        start_time: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    NodeCompleted {
        node_id: String,
        duration_ms: u64,
        /// Names of the data outputs the node produced
        outputs: Vec<String>,
    },

    #[serde(rename_all = "camelCase")]
    NodeFailed {
        node_id: String,
        error_kind: String,
        message: String,
        attempt: u32,
    },

    #[serde(rename_all = "camelCase")]
    NodeRetrying {
        node_id: String,
        attempt: u32,
        delay_ms: u64,
    },

    #[serde(rename_all = "camelCase")]
    VariableChanged {
        name: String,
        old: serde_json::Value,
        new: serde_json::Value,
    },

    #[serde(rename_all = "camelCase")]
    PauseRequested { run_id: String },

    #[serde(rename_all = "camelCase")]
    ResumeRequested { run_id: String },

    #[serde(rename_all = "camelCase")]
    CancelRequested { run_id: String },
}

impl ExecutionEvent {
    /// Whether the bus may drop this event under back-pressure
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::VariableChanged { .. } | ExecutionEvent::NodeRetrying { .. }
        )
    }

    /// The node this event concerns, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::NodeStarted { node_id, .. }
            | ExecutionEvent::NodeCompleted { node_id, .. }
            | ExecutionEvent::NodeFailed { node_id, .. }
            | ExecutionEvent::NodeRetrying { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// Bounded, lossy-for-low-priority broadcast bus for one run.
///
/// Cloning shares the underlying channel. Publishing succeeds whether or
/// not anyone is subscribed.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus with the given queue capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
        }
    }

    /// Publish an event.
    ///
    /// Lifecycle events are always sent; droppable events are skipped when
    /// the queue is at capacity so the scheduler never waits on a slow
    /// subscriber.
    pub fn publish(&self, event: ExecutionEvent) {
        if event.is_droppable() && self.sender.len() >= self.capacity {
            log::trace!("event bus full, dropping {:?}", event);
            return;
        }
        // A send error only means there are no subscribers right now
        let _ = self.sender.send(event);
    }

    /// Attach a new subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Attach a new subscriber as an async stream
    pub fn stream(&self) -> BroadcastStream<ExecutionEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(run_id: &str) -> ExecutionEvent {
        ExecutionEvent::WorkflowStarted {
            run_id: run_id.to_string(),
            workflow_id: "wf".to_string(),
            start_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(started("r1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(started("r1"));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ExecutionEvent::WorkflowStarted { .. }));
    }

    #[tokio::test]
    async fn test_droppable_events_skipped_when_full() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        // Fill the queue with lifecycle events
        bus.publish(started("r1"));
        bus.publish(started("r1"));
        // A droppable event must be skipped now
        bus.publish(ExecutionEvent::VariableChanged {
            name: "x".into(),
            old: serde_json::Value::Null,
            new: serde_json::json!(1),
        });
        // Lifecycle events still go through (the channel overwrites the
        // oldest entry for lagged receivers rather than blocking)
        bus.publish(started("r1"));

        let mut lifecycle = 0;
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    assert!(!event.is_droppable());
                    lifecycle += 1;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert!(lifecycle >= 1);
    }

    #[test]
    fn test_priorities() {
        assert!(ExecutionEvent::VariableChanged {
            name: "x".into(),
            old: serde_json::Value::Null,
            new: serde_json::Value::Null,
        }
        .is_droppable());
        assert!(!started("r").is_droppable());
    }
}
