//! Wire protocol of the external agent process.
//!
//! The process emits newline-delimited JSON on stdout. The first event
//! must be `init` carrying the opaque provider session id (the resume
//! handle). Input to the process is also NDJSON, written to stdin.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// One event read from the agent's stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    /// Handshake; must arrive first.
    Init { provider_session_id: String },
    /// A message-content chunk.
    Assistant { message: Value },
    /// Tool-use notification.
    ToolUse {
        tool: String,
        #[serde(default)]
        input: Value,
    },
    /// Final result payload of a turn.
    Result {
        #[serde(default)]
        result: Value,
    },
    /// Announced normal termination.
    Exit {
        #[serde(default)]
        code: Option<i32>,
    },
}

impl AgentEvent {
    /// Human-readable text carried by the event, if any. Used for
    /// rate-limit scanning.
    pub fn text(&self) -> Option<String> {
        match self {
            AgentEvent::Assistant { message } => value_text(message),
            AgentEvent::Result { result } => value_text(result),
            _ => None,
        }
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("content")
            .or_else(|| map.get("text"))
            .and_then(value_text),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(value_text).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

/// Input lines written to the agent's stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AgentInput {
    UserMessage { content: String },
    Interrupt,
    Shutdown,
}

/// What session consumers receive: protocol events in production
/// order, then exactly one `ProcessExited`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Event(AgentEvent),
    ProcessExited { code: Option<i32> },
}

/// Read the stdout pipe to completion, decoding NDJSON into the
/// broadcast channel. Single producer; consumers subscribe to the
/// sender. Undecodable lines are logged and skipped.
pub async fn pump_events(
    stdout: tokio::process::ChildStdout,
    events: broadcast::Sender<SessionEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<AgentEvent>(line) {
                    Ok(event) => {
                        trace!(?event, "agent event");
                        // Send failure means no live receivers; keep
                        // draining so the child never blocks on a full
                        // pipe.
                        let _ = events.send(SessionEvent::Event(event));
                    }
                    Err(e) => {
                        warn!(line, "undecodable agent output: {e}");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("agent stdout read failed: {e}");
                break;
            }
        }
    }
    debug!("agent stdout closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_event_decodes_with_camel_case_fields() {
        let event: AgentEvent =
            serde_json::from_str(r#"{"type":"init","providerSessionId":"prov-1"}"#).unwrap();
        assert_eq!(
            event,
            AgentEvent::Init {
                provider_session_id: "prov-1".to_string()
            }
        );
    }

    #[test]
    fn assistant_text_extraction() {
        let event: AgentEvent = serde_json::from_str(
            r#"{"type":"assistant","message":{"content":"hello world"}}"#,
        )
        .unwrap();
        assert_eq!(event.text().as_deref(), Some("hello world"));

        let event: AgentEvent =
            serde_json::from_str(r#"{"type":"assistant","message":"bare string"}"#).unwrap();
        assert_eq!(event.text().as_deref(), Some("bare string"));
    }

    #[test]
    fn tool_use_and_exit_decode() {
        let event: AgentEvent = serde_json::from_str(
            r#"{"type":"tool-use","tool":"bash","input":{"command":"ls"}}"#,
        )
        .unwrap();
        assert!(matches!(event, AgentEvent::ToolUse { .. }));

        let event: AgentEvent = serde_json::from_str(r#"{"type":"exit","code":0}"#).unwrap();
        assert_eq!(event, AgentEvent::Exit { code: Some(0) });
    }

    #[test]
    fn input_lines_serialize_for_stdin() {
        let line = serde_json::to_string(&AgentInput::UserMessage {
            content: "continue".to_string(),
        })
        .unwrap();
        assert_eq!(line, r#"{"type":"user-message","content":"continue"}"#);

        let line = serde_json::to_string(&AgentInput::Interrupt).unwrap();
        assert_eq!(line, r#"{"type":"interrupt"}"#);
    }

    #[test]
    fn nested_content_arrays_flatten() {
        let event = AgentEvent::Assistant {
            message: json!({"content": [{"text": "a"}, {"text": "b"}]}),
        };
        assert_eq!(event.text().as_deref(), Some("a\nb"));
    }
}
