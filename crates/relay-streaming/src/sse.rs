//! SSE wire framing.
//!
//! Frames are `data: <JSON>\n\n`, terminated by `data: [DONE]\n\n`. The
//! `/v1/responses` endpoint uses named events with an `event:` line.

use serde::Serialize;

/// Frame a JSON payload as an SSE data frame
#[must_use]
pub fn data_frame<T: Serialize>(payload: &T) -> String {
    match serde_json::to_string(payload) {
        Ok(json) => format!("data: {json}\n\n"),
        Err(_) => String::new(),
    }
}

/// The stream terminator
#[must_use]
pub fn done_frame() -> String {
    "data: [DONE]\n\n".to_string()
}

/// An error frame carried inside the SSE stream
#[must_use]
pub fn error_frame(
    message: &str,
    error_type: &str,
    provider: Option<&str>,
    model: Option<&str>,
) -> String {
    let payload = serde_json::json!({
        "error": {
            "message": message,
            "type": error_type,
            "provider": provider,
            "model": model,
        }
    });
    format!("data: {payload}\n\n")
}

/// A named event frame for the typed `/v1/responses` stream
#[must_use]
pub fn typed_event_frame<T: Serialize>(event: &str, payload: &T) -> String {
    match serde_json::to_string(payload) {
        Ok(json) => format!("event: {event}\ndata: {json}\n\n"),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_shape() {
        let frame = data_frame(&serde_json::json!({"a": 1}));
        assert_eq!(frame, "data: {\"a\":1}\n\n");
    }

    #[test]
    fn done_frame_shape() {
        assert_eq!(done_frame(), "data: [DONE]\n\n");
    }

    #[test]
    fn error_frame_carries_type_and_context() {
        let frame = error_frame(
            "Provider returned empty stream",
            "empty_stream_error",
            Some("openrouter"),
            Some("m-empty"),
        );
        assert!(frame.starts_with("data: "));
        assert!(frame.contains("\"type\":\"empty_stream_error\""));
        assert!(frame.contains("\"provider\":\"openrouter\""));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn typed_event_has_event_line() {
        let frame = typed_event_frame("response.created", &serde_json::json!({"sequence_number": 0}));
        assert!(frame.starts_with("event: response.created\ndata: "));
    }
}
