//! Execution trace: records, streaming events, and tree assembly.
//!
//! The trace is the in-memory source of truth while an execution runs. The
//! event bus publishes progress to subscribers; repositories persist
//! snapshots on terminal transitions.

pub mod bus;
pub mod events;
pub mod tree;
pub mod types;

pub use bus::{event_stream, EventBus, EVENT_BUFFER};
pub use events::{
    preview, EventKind, ExecutionEvent, OUTPUT_PREVIEW_CHARS, PROMPT_PREVIEW_CHARS,
};
pub use tree::{materialize, replay_events, NodeTree};
pub use types::{
    Execution, ExecutionNode, ExecutionStatus, ExecutionTrace, ModelUsage, NodeStatus, NodeType,
};
