//! Line protocol spoken between the host and the guest runtime.
//!
//! One JSON object per line over the guest's stdin/stdout, tagged by `type`.
//! Anything on stdout that is not one of these objects is the script's own
//! console output.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcMessage {
    /// guest → host
    ToolCall {
        id: String,
        tool: String,
        #[serde(default)]
        params: Value,
    },
    /// host → guest, answers the `tool_call` with the same id
    ToolResult {
        id: String,
        content: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// guest → host, advisory
    ExecutionProgress {
        line: u64,
        #[serde(default)]
        total_lines: u64,
    },
    /// guest → host, advisory
    Update { message: String },
    /// guest → host, terminal
    Complete {
        #[serde(default)]
        output: String,
    },
    /// guest → host, terminal
    Error {
        message: String,
        #[serde(default)]
        traceback: Option<String>,
    },
}

impl RpcMessage {
    /// Serialize as one protocol line, newline included.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// A line read from the guest's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Message(RpcMessage),
    Text(String),
}

/// Sort a stdout line into a protocol message or console text.
///
/// Never fails: malformed JSON, JSON that is not an object, and objects with
/// an unknown or missing `type` are all console text.
pub fn classify(line: &str) -> Line {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let trimmed = line.trim_start();
    if trimmed.starts_with('{') {
        if let Ok(message) = serde_json::from_str::<RpcMessage>(trimmed) {
            return Line::Message(message);
        }
    }
    Line::Text(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_parses() {
        let line = r#"{"type":"tool_call","id":"a","tool":"t","params":{"x":1}}"#;
        assert_eq!(
            classify(line),
            Line::Message(RpcMessage::ToolCall {
                id: "a".into(),
                tool: "t".into(),
                params: json!({"x": 1}),
            })
        );
    }

    #[test]
    fn non_protocol_lines_are_text() {
        for line in [
            "hello",
            "",
            "{not json",
            r#"{"a": 1}"#,
            r#"{"type": "mystery"}"#,
            r#"[1, 2]"#,
            r#"{"type": "complete", "output": 5}"#,
        ] {
            assert_eq!(classify(line), Line::Text(line.to_string()), "{line}");
        }
    }

    #[test]
    fn carriage_return_is_dropped() {
        assert_eq!(classify("hi\r"), Line::Text("hi".into()));
    }

    #[test]
    fn tool_result_omits_absent_error() {
        let msg = RpcMessage::ToolResult {
            id: "call_1".into(),
            content: vec![json!({"type": "text", "text": "ok"})],
            error: None,
        };
        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "tool_result",
                "id": "call_1",
                "content": [{"type": "text", "text": "ok"}]
            })
        );
    }

    #[test]
    fn terminal_messages() {
        let complete = classify(r#"{"type":"complete","output":"2"}"#);
        let error = classify(r#"{"type":"error","message":"boom","traceback":"tb"}"#);
        let progress = classify(r#"{"type":"execution_progress","line":3,"total_lines":0}"#);

        assert_eq!(
            complete,
            Line::Message(RpcMessage::Complete {
                output: "2".into()
            })
        );
        assert_eq!(
            error,
            Line::Message(RpcMessage::Error {
                message: "boom".into(),
                traceback: Some("tb".into())
            })
        );
        assert_eq!(
            progress,
            Line::Message(RpcMessage::ExecutionProgress {
                line: 3,
                total_lines: 0
            })
        );
    }
}
