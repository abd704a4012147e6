//! Stream event taxonomy and wire types for the agent service (spec.md
//! §4.L4). All variants must be decodable even if some are ignored
//! downstream.

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    /// Heartbeat, ignored.
    Ping,
    /// Hidden from the room.
    Reasoning { text: String },
    /// Surfaced (progress message / live-edit body).
    ToolCall { tool_name: String, arguments: serde_json::Value },
    /// Surfaced.
    ToolReturn { tool_name: String, ok: bool, result: serde_json::Value },
    /// The only event that may become a permanent room message.
    Assistant { text: String },
    /// End of stream.
    Stop,
    /// Hidden.
    Usage { input_tokens: u64, output_tokens: u64 },
    /// Typed error, terminates the stream.
    Error { message: String },
    /// Surfaced as a prompt; pauses the stream until resolved out-of-band.
    ApprovalRequest { request_id: String, description: String },
}

impl AgentStreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStreamEvent::Stop | AgentStreamEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_every_taxonomy_member() {
        let samples = [
            serde_json::json!({"type": "ping"}),
            serde_json::json!({"type": "reasoning", "text": "thinking"}),
            serde_json::json!({"type": "tool_call", "tool_name": "search", "arguments": {}}),
            serde_json::json!({"type": "tool_return", "tool_name": "search", "ok": true, "result": {}}),
            serde_json::json!({"type": "assistant", "text": "hi"}),
            serde_json::json!({"type": "stop"}),
            serde_json::json!({"type": "usage", "input_tokens": 1, "output_tokens": 2}),
            serde_json::json!({"type": "error", "message": "boom"}),
            serde_json::json!({"type": "approval_request", "request_id": "r1", "description": "run rm"}),
        ];
        for sample in samples {
            let decoded: AgentStreamEvent = serde_json::from_value(sample).unwrap();
            let _ = decoded.is_terminal();
        }
    }
}
