//! Server-Sent-Events wire formatting.
//!
//! The HTTP layer streams execution events as `text/event-stream`; this
//! module owns the framing so the handler stays a thin pipe from the event
//! bus to the socket.

use crate::trace::ExecutionEvent;

/// Format one event as an SSE frame: `event:` carries the kind, `data:`
/// the JSON payload. Newlines inside the payload are escaped by JSON, so a
/// single `data:` line always suffices.
pub fn event_to_sse(event: &ExecutionEvent) -> String {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {}\n\n", event.kind.name(), data)
}

/// Keep-alive comment frame for idle streams.
pub fn keep_alive_frame() -> &'static str {
    ": keep-alive\n\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_frame_layout() {
        let event = ExecutionEvent::execution_started(Uuid::new_v4(), "query", 12, "model");
        let frame = event_to_sse(&event);

        assert!(frame.starts_with("event: execution_started\n"));
        assert!(frame.contains("\ndata: {"));
        assert!(frame.ends_with("\n\n"));
        // Exactly one data line even with multi-line content.
        assert_eq!(frame.matches("data:").count(), 1);
    }

    #[test]
    fn test_multiline_output_stays_single_data_line() {
        let event = ExecutionEvent::node_output(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "line1\nline2\nline3",
            1,
            2,
            0.0,
        );
        let frame = event_to_sse(&event);
        // 3 lines total: event, data, terminator blank line.
        assert_eq!(frame.trim_end().lines().count(), 2);
    }

    #[test]
    fn test_frame_payload_parses_back() {
        let event = ExecutionEvent::node_code(Uuid::new_v4(), Uuid::new_v4(), "FINAL(1)");
        let frame = event_to_sse(&event);
        let data = frame
            .lines()
            .find(|l| l.starts_with("data: "))
            .unwrap()
            .trim_start_matches("data: ");
        let parsed: ExecutionEvent = serde_json::from_str(data).unwrap();
        assert_eq!(parsed, event);
    }
}
