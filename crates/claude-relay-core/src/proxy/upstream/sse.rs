//! Incremental parser for the claude.ai completion SSE stream.

use serde_json::Value;

/// Parsed upstream stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    /// A piece of assistant text.
    Delta(String),
    /// Upstream reported an error mid-stream.
    Error(String),
}

/// Buffers raw bytes and yields events at line boundaries, so chunk
/// boundaries falling inside a `data:` line are handled.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<CompletionEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(event) = parse_data_line(line.trim_end()) {
                events.push(event);
            }
        }
        events
    }
}

/// Parses one `data: {...}` line. Non-data lines and heartbeats yield nothing.
fn parse_data_line(line: &str) -> Option<CompletionEvent> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }

    let value: Value = serde_json::from_str(payload).ok()?;

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upstream stream error")
            .to_string();
        return Some(CompletionEvent::Error(message));
    }

    let delta = value.get("completion").and_then(Value::as_str)?;
    if delta.is_empty() {
        return None;
    }
    Some(CompletionEvent::Delta(delta.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_completion_deltas() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: {\"type\":\"completion\",\"completion\":\"Hello\"}\n");
        assert_eq!(events, vec![CompletionEvent::Delta("Hello".to_string())]);
    }

    #[test]
    fn test_handles_split_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"completion\":\"Hel").is_empty());
        let events = parser.push(b"lo\"}\ndata: {\"completion\":\" there\"}\n");
        assert_eq!(
            events,
            vec![
                CompletionEvent::Delta("Hello".to_string()),
                CompletionEvent::Delta(" there".to_string())
            ]
        );
    }

    #[test]
    fn test_surfaces_stream_errors() {
        let mut parser = SseParser::new();
        let events =
            parser.push(b"data: {\"error\":{\"message\":\"overloaded\"}}\n");
        assert_eq!(events, vec![CompletionEvent::Error("overloaded".to_string())]);
    }

    #[test]
    fn test_ignores_heartbeats_and_empty_lines() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: ping\n\ndata: [DONE]\n");
        assert!(events.is_empty());
    }
}
