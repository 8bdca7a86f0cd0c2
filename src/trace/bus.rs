//! Per-execution event channels.
//!
//! Each execution gets a bounded broadcast channel. Producers never block:
//! a subscriber that falls more than the buffer behind loses the oldest
//! events (`RecvError::Lagged`) instead of applying backpressure.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::ExecutionEvent;
use super::types::{ExecutionTrace, NodeStatus};

/// Buffered events per subscriber before the oldest are dropped.
pub const EVENT_BUFFER: usize = 256;

/// Many-producer many-consumer event bus keyed by execution id.
#[derive(Debug, Default)]
pub struct EventBus {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<ExecutionEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, execution_id: Uuid) -> broadcast::Sender<ExecutionEvent> {
        let mut channels = self.channels.lock().expect("bus lock poisoned");
        channels
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(EVENT_BUFFER).0)
            .clone()
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: ExecutionEvent) {
        let sender = self.sender(event.execution_id);
        let _ = sender.send(event);
    }

    /// Subscribe to live events for an execution.
    pub fn subscribe(&self, execution_id: Uuid) -> broadcast::Receiver<ExecutionEvent> {
        self.sender(execution_id).subscribe()
    }

    /// Subscribe, with a synthesized snapshot of already-terminal nodes so a
    /// late subscriber can reconstruct the tree so far.
    pub fn subscribe_with_snapshot(
        &self,
        trace: &ExecutionTrace,
    ) -> (Vec<ExecutionEvent>, broadcast::Receiver<ExecutionEvent>) {
        // Take the receiver first so events published while the snapshot is
        // assembled are not lost (they may be duplicated, never missing).
        let receiver = self.subscribe(trace.execution_id());
        (snapshot_events(trace), receiver)
    }

    /// Drop an execution's channel once it is terminal; pending receivers
    /// drain and then observe a closed stream.
    pub fn close(&self, execution_id: Uuid) {
        let mut channels = self.channels.lock().expect("bus lock poisoned");
        channels.remove(&execution_id);
    }
}

/// Adapt a receiver into a `futures` stream for SSE handlers. Lagged gaps
/// are skipped; the stream ends when the execution's channel closes.
pub fn event_stream(
    receiver: broadcast::Receiver<ExecutionEvent>,
) -> impl futures::Stream<Item = ExecutionEvent> {
    futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((event, receiver)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// Synthesize the event history implied by the trace's terminal nodes.
fn snapshot_events(trace: &ExecutionTrace) -> Vec<ExecutionEvent> {
    let execution = trace.execution();
    let mut events = vec![ExecutionEvent::execution_started(
        execution.id,
        &execution.query,
        execution.context_size,
        "",
    )];

    for node in trace.nodes() {
        events.push(ExecutionEvent::node_started(
            execution.id,
            node.id,
            node.parent_node_id,
            node.depth,
            node.sequence,
            node.node_type,
            &node.prompt,
        ));
        if let Some(code) = &node.generated_code {
            events.push(ExecutionEvent::node_code(execution.id, node.id, code));
        }
        match node.status {
            NodeStatus::Completed => events.push(ExecutionEvent::node_output(
                execution.id,
                node.id,
                node.output.as_deref().unwrap_or(""),
                node.input_tokens,
                node.output_tokens,
                node.cost_usd,
            )),
            NodeStatus::Failed | NodeStatus::Timeout => {
                events.push(ExecutionEvent::node_failed(
                    execution.id,
                    node.id,
                    node.error_kind.unwrap_or(crate::error::ErrorKind::Internal),
                    node.error_message.as_deref().unwrap_or(""),
                ));
            }
            NodeStatus::Running => {}
        }
    }

    match execution.status {
        super::types::ExecutionStatus::Completed => {
            events.push(ExecutionEvent::execution_completed(
                execution.id,
                execution.final_result.as_deref().unwrap_or(""),
                execution.total_input_tokens,
                execution.total_output_tokens,
                execution.total_cost_usd,
            ));
        }
        super::types::ExecutionStatus::Failed | super::types::ExecutionStatus::Cancelled => {
            events.push(ExecutionEvent::execution_failed(
                execution.id,
                execution.error_kind.unwrap_or(crate::error::ErrorKind::Internal),
                execution.error_message.as_deref().unwrap_or(""),
            ));
        }
        _ => {}
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::types::{Execution, NodeType};
    use crate::MemoryMap;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let mut rx = bus.subscribe(id);

        bus.publish(ExecutionEvent::execution_started(id, "q", 3, "m"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id, id);
        assert_eq!(event.kind.name(), "execution_started");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        bus.publish(ExecutionEvent::execution_started(id, "q", 3, "m"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let mut rx = bus.subscribe(id);

        for _ in 0..(EVENT_BUFFER + 10) {
            bus.publish(ExecutionEvent::execution_started(id, "q", 3, "m"));
        }

        match rx.recv().await {
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                assert!(skipped >= 10);
            }
            other => panic!("expected lag, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_snapshot_for_late_subscriber() {
        let bus = EventBus::new();
        let trace = ExecutionTrace::new(Execution::new("q", 10, None));
        trace.mark_running();
        let root = trace.begin_node(None, NodeType::Root, 0, "p", "m", MemoryMap::new());
        trace.set_code(root.id, "FINAL(1)");
        trace.complete_node(root.id, "1", MemoryMap::new());
        trace.mark_completed("1");

        let (snapshot, _rx) = bus.subscribe_with_snapshot(&trace);
        let kinds: Vec<_> = snapshot.iter().map(|e| e.kind.name()).collect();
        assert_eq!(
            kinds,
            vec![
                "execution_started",
                "node_started",
                "node_code",
                "node_output",
                "execution_completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_event_stream_ends_on_close() {
        use futures::StreamExt;

        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let rx = bus.subscribe(id);
        bus.publish(ExecutionEvent::execution_started(id, "q", 3, "m"));
        bus.close(id);

        let events: Vec<_> = event_stream(rx).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind.name(), "execution_started");
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let mut rx = bus.subscribe(id);
        bus.close(id);
        assert!(matches!(
            rx.recv().await,
            Err(tokio::sync::broadcast::error::RecvError::Closed)
        ));
    }
}
