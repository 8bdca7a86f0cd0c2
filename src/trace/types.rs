//! Execution and node records, plus the in-memory per-execution trace.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::llm::TokenUsage;
use crate::MemoryMap;

use super::tree::NodeTree;

/// Lifecycle of one user-initiated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Transitions are monotone: pending -> running -> terminal.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Lifecycle of one LM invocation within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Root,
    Child,
}

/// One user-initiated run. Created by the orchestrator, mutated only
/// through the trace until terminal, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub session_id: Option<Uuid>,
    pub query: String,
    /// Original context size in characters.
    pub context_size: usize,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    /// Populated iff status is `completed`.
    pub final_result: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl Execution {
    pub fn new(query: impl Into<String>, context_size: usize, session_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            query: query.into(),
            context_size,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cost_usd: 0.0,
            final_result: None,
            error_kind: None,
            error_message: None,
        }
    }
}

/// One LM invocation. Token counts and cost cover exactly this node's call,
/// never its descendants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub id: Uuid,
    pub execution_id: Uuid,
    /// Null only for the single root node.
    pub parent_node_id: Option<Uuid>,
    pub node_type: NodeType,
    /// Root = 0; child = parent depth + 1.
    pub depth: u32,
    /// Sibling ordinal in issue order, starting at 0.
    pub sequence: u64,
    /// Prompt text actually sent to the LM.
    pub prompt: String,
    /// Extracted program source; only root responses are parsed as programs.
    pub generated_code: Option<String>,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    /// The node's return value to its caller.
    pub output: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub memory_before: MemoryMap,
    pub memory_after: Option<MemoryMap>,
}

/// Per-model usage rollup across an execution's nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub calls: u64,
}

/// In-memory trace of one execution: the execution record plus its flat
/// node collection. All mutation goes through one lock, which also
/// allocates sequence numbers and keeps the aggregate totals consistent
/// with the union of node counters.
#[derive(Debug)]
pub struct ExecutionTrace {
    inner: Mutex<TraceInner>,
}

#[derive(Debug)]
struct TraceInner {
    execution: Execution,
    nodes: HashMap<Uuid, ExecutionNode>,
    /// Insertion order, for stable listing.
    order: Vec<Uuid>,
    /// Next sequence number per parent.
    next_sequence: HashMap<Option<Uuid>, u64>,
}

impl ExecutionTrace {
    pub fn new(execution: Execution) -> Self {
        Self {
            inner: Mutex::new(TraceInner {
                execution,
                nodes: HashMap::new(),
                order: Vec::new(),
                next_sequence: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TraceInner> {
        self.inner.lock().expect("trace lock poisoned")
    }

    pub fn execution_id(&self) -> Uuid {
        self.lock().execution.id
    }

    /// Snapshot of the execution record.
    pub fn execution(&self) -> Execution {
        self.lock().execution.clone()
    }

    /// Snapshot of all nodes in insertion order.
    pub fn nodes(&self) -> Vec<ExecutionNode> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.nodes.get(id).cloned())
            .collect()
    }

    pub fn node(&self, id: Uuid) -> Option<ExecutionNode> {
        self.lock().nodes.get(&id).cloned()
    }

    /// Materialize the node tree.
    pub fn tree(&self) -> Option<NodeTree> {
        super::tree::materialize(&self.nodes())
    }

    /// Token and cost rollup per model, for usage statistics.
    pub fn usage_by_model(&self) -> HashMap<String, ModelUsage> {
        let inner = self.lock();
        let mut out: HashMap<String, ModelUsage> = HashMap::new();
        for node in inner.nodes.values() {
            let entry = out.entry(node.model.clone()).or_default();
            entry.input_tokens += node.input_tokens;
            entry.output_tokens += node.output_tokens;
            entry.cost_usd += node.cost_usd;
            entry.calls += 1;
        }
        out
    }

    // ---- execution transitions ----

    fn transition(&self, next: ExecutionStatus) -> bool {
        let mut inner = self.lock();
        if !inner.execution.status.can_transition_to(next) {
            return false;
        }
        inner.execution.status = next;
        if next.is_terminal() {
            inner.execution.completed_at = Some(Utc::now());
        }
        true
    }

    pub fn mark_running(&self) -> bool {
        self.transition(ExecutionStatus::Running)
    }

    pub fn mark_completed(&self, final_result: impl Into<String>) -> bool {
        if !self.transition(ExecutionStatus::Completed) {
            return false;
        }
        self.lock().execution.final_result = Some(final_result.into());
        true
    }

    pub fn mark_failed(&self, kind: ErrorKind, message: impl Into<String>) -> bool {
        if !self.transition(ExecutionStatus::Failed) {
            return false;
        }
        let mut inner = self.lock();
        inner.execution.error_kind = Some(kind);
        inner.execution.error_message = Some(message.into());
        true
    }

    pub fn mark_cancelled(&self, message: impl Into<String>) -> bool {
        if !self.transition(ExecutionStatus::Cancelled) {
            return false;
        }
        let mut inner = self.lock();
        inner.execution.error_kind = Some(ErrorKind::DeadlineExceeded);
        inner.execution.error_message = Some(message.into());
        true
    }

    // ---- node lifecycle ----

    /// Create a node in `running` status, allocating its sequence number
    /// under the execution lock.
    pub fn begin_node(
        &self,
        parent_node_id: Option<Uuid>,
        node_type: NodeType,
        depth: u32,
        prompt: impl Into<String>,
        model: impl Into<String>,
        memory_before: MemoryMap,
    ) -> ExecutionNode {
        let mut inner = self.lock();
        let sequence = {
            let counter = inner.next_sequence.entry(parent_node_id).or_insert(0);
            let seq = *counter;
            *counter += 1;
            seq
        };
        let node = ExecutionNode {
            id: Uuid::new_v4(),
            execution_id: inner.execution.id,
            parent_node_id,
            node_type,
            depth,
            sequence,
            prompt: prompt.into(),
            generated_code: None,
            status: NodeStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            output: None,
            error_kind: None,
            error_message: None,
            memory_before,
            memory_after: None,
        };
        inner.nodes.insert(node.id, node.clone());
        inner.order.push(node.id);
        node
    }

    /// Attach the extracted program source to a root node.
    pub fn set_code(&self, node_id: Uuid, code: impl Into<String>) {
        let mut inner = self.lock();
        if let Some(node) = inner.nodes.get_mut(&node_id) {
            node.generated_code = Some(code.into());
        }
    }

    /// Record the node's single LM call and fold it into the execution
    /// totals. A pricing warning is non-fatal and lands in `error_message`.
    pub fn record_usage(
        &self,
        node_id: Uuid,
        usage: TokenUsage,
        cost_usd: f64,
        pricing_warning: Option<String>,
    ) {
        let mut inner = self.lock();
        inner.execution.total_input_tokens += usage.input_tokens;
        inner.execution.total_output_tokens += usage.output_tokens;
        inner.execution.total_cost_usd += cost_usd;
        if let Some(node) = inner.nodes.get_mut(&node_id) {
            node.input_tokens = usage.input_tokens;
            node.output_tokens = usage.output_tokens;
            node.cost_usd = cost_usd;
            if let Some(warning) = pricing_warning {
                node.error_message = Some(warning);
            }
        }
    }

    fn finish_node<F>(&self, node_id: Uuid, apply: F)
    where
        F: FnOnce(&mut ExecutionNode),
    {
        let mut inner = self.lock();
        if let Some(node) = inner.nodes.get_mut(&node_id) {
            if node.status.is_terminal() {
                return;
            }
            apply(node);
            node.completed_at = Some(Utc::now());
        }
    }

    pub fn complete_node(
        &self,
        node_id: Uuid,
        output: impl Into<String>,
        memory_after: MemoryMap,
    ) {
        let output = output.into();
        self.finish_node(node_id, |node| {
            node.status = NodeStatus::Completed;
            node.output = Some(output);
            node.memory_after = Some(memory_after);
        });
    }

    pub fn fail_node(
        &self,
        node_id: Uuid,
        kind: ErrorKind,
        message: impl Into<String>,
        memory_after: Option<MemoryMap>,
    ) {
        let message = message.into();
        self.finish_node(node_id, |node| {
            node.status = NodeStatus::Failed;
            node.error_kind = Some(kind);
            node.error_message = Some(message);
            if memory_after.is_some() {
                node.memory_after = memory_after;
            }
        });
    }

    pub fn timeout_node(&self, node_id: Uuid, memory_after: Option<MemoryMap>) {
        self.finish_node(node_id, |node| {
            node.status = NodeStatus::Timeout;
            node.error_kind = Some(ErrorKind::DeadlineExceeded);
            node.error_message = Some("execution deadline exceeded".to_string());
            if memory_after.is_some() {
                node.memory_after = memory_after;
            }
        });
    }

    /// Mark every node still running as failed, so a terminal execution
    /// never leaves an open node record behind.
    pub fn fail_unfinished(&self, kind: ErrorKind, message: &str) {
        let mut inner = self.lock();
        for node in inner.nodes.values_mut() {
            if !node.status.is_terminal() {
                node.status = NodeStatus::Failed;
                node.error_kind = Some(kind);
                node.error_message = Some(message.to_string());
                node.completed_at = Some(Utc::now());
            }
        }
    }

    /// Mark every still-running ancestor of `node_id` as failed with
    /// `DeadlineExceeded`, walking the parent chain to the root.
    pub fn fail_ancestors_deadline(&self, node_id: Uuid) {
        let mut inner = self.lock();
        let mut current = inner
            .nodes
            .get(&node_id)
            .and_then(|node| node.parent_node_id);
        while let Some(id) = current {
            let Some(node) = inner.nodes.get_mut(&id) else {
                break;
            };
            if !node.status.is_terminal() {
                node.status = NodeStatus::Failed;
                node.error_kind = Some(ErrorKind::DeadlineExceeded);
                node.error_message = Some("execution deadline exceeded".to_string());
                node.completed_at = Some(Utc::now());
            }
            current = node.parent_node_id;
        }
    }
}
