//! Streaming events emitted during an execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::trace::types::NodeType;

/// Prompt previews are clipped to this many characters.
pub const PROMPT_PREVIEW_CHARS: usize = 200;
/// Output previews are clipped to this many characters.
pub const OUTPUT_PREVIEW_CHARS: usize = 500;

/// An event on the per-execution stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Kind-specific payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    ExecutionStarted {
        query: String,
        context_size: usize,
        model: String,
    },
    NodeStarted {
        parent_id: Option<Uuid>,
        depth: u32,
        sequence: u64,
        node_type: NodeType,
        prompt_preview: String,
    },
    NodeCode {
        code: String,
    },
    NodeOutput {
        output_preview: String,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    },
    NodeFailed {
        error_kind: ErrorKind,
        error_message: String,
    },
    ExecutionCompleted {
        final_result_preview: String,
        total_input_tokens: u64,
        total_output_tokens: u64,
        total_cost_usd: f64,
    },
    ExecutionFailed {
        error_kind: ErrorKind,
        error_message: String,
    },
}

impl EventKind {
    /// Wire name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCode { .. } => "node_code",
            Self::NodeOutput { .. } => "node_output",
            Self::NodeFailed { .. } => "node_failed",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
        }
    }
}

/// Clip a string to at most `max` characters.
pub fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

impl ExecutionEvent {
    fn new(execution_id: Uuid, node_id: Option<Uuid>, kind: EventKind) -> Self {
        Self {
            execution_id,
            node_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn execution_started(
        execution_id: Uuid,
        query: &str,
        context_size: usize,
        model: &str,
    ) -> Self {
        Self::new(
            execution_id,
            None,
            EventKind::ExecutionStarted {
                query: query.to_string(),
                context_size,
                model: model.to_string(),
            },
        )
    }

    pub fn node_started(
        execution_id: Uuid,
        node_id: Uuid,
        parent_id: Option<Uuid>,
        depth: u32,
        sequence: u64,
        node_type: NodeType,
        prompt: &str,
    ) -> Self {
        Self::new(
            execution_id,
            Some(node_id),
            EventKind::NodeStarted {
                parent_id,
                depth,
                sequence,
                node_type,
                prompt_preview: preview(prompt, PROMPT_PREVIEW_CHARS),
            },
        )
    }

    pub fn node_code(execution_id: Uuid, node_id: Uuid, code: &str) -> Self {
        Self::new(
            execution_id,
            Some(node_id),
            EventKind::NodeCode {
                code: code.to_string(),
            },
        )
    }

    pub fn node_output(
        execution_id: Uuid,
        node_id: Uuid,
        output: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) -> Self {
        Self::new(
            execution_id,
            Some(node_id),
            EventKind::NodeOutput {
                output_preview: preview(output, OUTPUT_PREVIEW_CHARS),
                input_tokens,
                output_tokens,
                cost_usd,
            },
        )
    }

    pub fn node_failed(
        execution_id: Uuid,
        node_id: Uuid,
        error_kind: ErrorKind,
        error_message: &str,
    ) -> Self {
        Self::new(
            execution_id,
            Some(node_id),
            EventKind::NodeFailed {
                error_kind,
                error_message: error_message.to_string(),
            },
        )
    }

    pub fn execution_completed(
        execution_id: Uuid,
        final_result: &str,
        total_input_tokens: u64,
        total_output_tokens: u64,
        total_cost_usd: f64,
    ) -> Self {
        Self::new(
            execution_id,
            None,
            EventKind::ExecutionCompleted {
                final_result_preview: preview(final_result, OUTPUT_PREVIEW_CHARS),
                total_input_tokens,
                total_output_tokens,
                total_cost_usd,
            },
        )
    }

    pub fn execution_failed(
        execution_id: Uuid,
        error_kind: ErrorKind,
        error_message: &str,
    ) -> Self {
        Self::new(
            execution_id,
            None,
            EventKind::ExecutionFailed {
                error_kind,
                error_message: error_message.to_string(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_clips_on_char_boundary() {
        let text = "é".repeat(300);
        let clipped = preview(&text, PROMPT_PREVIEW_CHARS);
        assert_eq!(clipped.chars().count(), 200);
    }

    #[test]
    fn test_preview_short_text_untouched() {
        assert_eq!(preview("short", 200), "short");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = ExecutionEvent::node_failed(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ErrorKind::SandboxViolation,
            "import of 'os' is not allowed",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "node_failed");
        assert_eq!(json["error_kind"], "sandbox_violation");
    }

    #[test]
    fn test_event_round_trip() {
        let event = ExecutionEvent::node_started(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            0,
            0,
            NodeType::Root,
            "do the thing",
        );
        let json = serde_json::to_string(&event).unwrap();
        let parsed: ExecutionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_kind_names_match_wire_format() {
        let event = ExecutionEvent::execution_completed(Uuid::new_v4(), "r", 1, 2, 0.1);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], event.kind.name());
    }
}
