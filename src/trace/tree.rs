//! Tree materialization and event replay.
//!
//! Nodes live in a flat collection keyed by id; the tree is built on demand
//! by grouping children by parent and ordering siblings by sequence number.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{EventKind, ExecutionEvent};
use super::types::{ExecutionNode, NodeStatus};
use crate::MemoryMap;

/// A node and its ordered children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTree {
    pub node: ExecutionNode,
    pub children: Vec<NodeTree>,
}

impl NodeTree {
    /// Total number of nodes in this subtree.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(NodeTree::size).sum::<usize>()
    }

    /// Maximum depth field found in this subtree.
    pub fn max_depth(&self) -> u32 {
        self.children
            .iter()
            .map(NodeTree::max_depth)
            .max()
            .unwrap_or(self.node.depth)
    }

    /// The `(id, parent, sequence)` triples of the subtree in depth-first
    /// order; two trees with equal shapes describe the same execution.
    pub fn shape(&self) -> Vec<(Uuid, Option<Uuid>, u64)> {
        let mut out = vec![(self.node.id, self.node.parent_node_id, self.node.sequence)];
        for child in &self.children {
            out.extend(child.shape());
        }
        out
    }
}

/// Materialize the tree from a flat node list. Returns `None` when there is
/// no root.
pub fn materialize(nodes: &[ExecutionNode]) -> Option<NodeTree> {
    let root = nodes.iter().find(|n| n.parent_node_id.is_none())?;

    let mut by_parent: HashMap<Uuid, Vec<&ExecutionNode>> = HashMap::new();
    for node in nodes {
        if let Some(parent) = node.parent_node_id {
            by_parent.entry(parent).or_default().push(node);
        }
    }
    for children in by_parent.values_mut() {
        children.sort_by_key(|n| n.sequence);
    }

    Some(build(root, &by_parent))
}

fn build(node: &ExecutionNode, by_parent: &HashMap<Uuid, Vec<&ExecutionNode>>) -> NodeTree {
    let children = by_parent
        .get(&node.id)
        .map(|children| children.iter().map(|c| build(c, by_parent)).collect())
        .unwrap_or_default();
    NodeTree {
        node: node.clone(),
        children,
    }
}

/// Reconstruct the tree of a terminal execution from its event stream.
///
/// Only event-visible fields are recovered (previews rather than full
/// texts); the shape matches the stored tree exactly.
pub fn replay_events(events: &[ExecutionEvent]) -> Option<NodeTree> {
    let mut nodes: Vec<ExecutionNode> = Vec::new();
    let mut index: HashMap<Uuid, usize> = HashMap::new();

    for event in events {
        match &event.kind {
            EventKind::NodeStarted {
                parent_id,
                depth,
                sequence,
                node_type,
                prompt_preview,
            } => {
                let node_id = event.node_id?;
                let node = ExecutionNode {
                    id: node_id,
                    execution_id: event.execution_id,
                    parent_node_id: *parent_id,
                    node_type: *node_type,
                    depth: *depth,
                    sequence: *sequence,
                    prompt: prompt_preview.clone(),
                    generated_code: None,
                    status: NodeStatus::Running,
                    started_at: event.timestamp,
                    completed_at: None,
                    model: String::new(),
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_usd: 0.0,
                    output: None,
                    error_kind: None,
                    error_message: None,
                    memory_before: MemoryMap::new(),
                    memory_after: None,
                };
                index.insert(node_id, nodes.len());
                nodes.push(node);
            }
            EventKind::NodeCode { code } => {
                if let Some(node) = event.node_id.and_then(|id| index.get(&id)) {
                    nodes[*node].generated_code = Some(code.clone());
                }
            }
            EventKind::NodeOutput {
                output_preview,
                input_tokens,
                output_tokens,
                cost_usd,
            } => {
                if let Some(&i) = event.node_id.and_then(|id| index.get(&id)) {
                    let node = &mut nodes[i];
                    node.status = NodeStatus::Completed;
                    node.output = Some(output_preview.clone());
                    node.input_tokens = *input_tokens;
                    node.output_tokens = *output_tokens;
                    node.cost_usd = *cost_usd;
                    node.completed_at = Some(event.timestamp);
                }
            }
            EventKind::NodeFailed {
                error_kind,
                error_message,
            } => {
                if let Some(&i) = event.node_id.and_then(|id| index.get(&id)) {
                    let node = &mut nodes[i];
                    node.status = NodeStatus::Failed;
                    node.error_kind = Some(*error_kind);
                    node.error_message = Some(error_message.clone());
                    node.completed_at = Some(event.timestamp);
                }
            }
            _ => {}
        }
    }

    materialize(&nodes)
}
