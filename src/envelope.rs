//! Context envelope construction (spec.md §6), factored out of the router
//! so it is independently testable (SPEC_FULL.md §2).

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    Human,
    OtherAgent,
    OpencodeUser,
}

impl SenderType {
    /// Detected by sender mxid prefix (spec.md §6).
    pub fn detect(sender_mxid: &str, is_other_agent: bool) -> Self {
        if is_other_agent {
            SenderType::OtherAgent
        } else if sender_mxid.starts_with("@oc_") {
            SenderType::OpencodeUser
        } else {
            SenderType::Human
        }
    }

    /// The snake_case wire value the agent service parses (spec.md §6:
    /// `human`, `other_agent`, `opencode_user`).
    pub fn as_wire(&self) -> &'static str {
        match self {
            SenderType::Human => "human",
            SenderType::OtherAgent => "other_agent",
            SenderType::OpencodeUser => "opencode_user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    UserMessage,
    AgentMessage,
    PollVote,
}

impl Trigger {
    /// The snake_case wire value (spec.md §6: `user_message`,
    /// `agent_message`, `poll_vote`).
    pub fn as_wire(&self) -> &'static str {
        match self {
            Trigger::UserMessage => "user_message",
            Trigger::AgentMessage => "agent_message",
            Trigger::PollVote => "poll_vote",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceAgent {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeSender {
    pub user_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub sender_type: SenderType,
}

/// Structured preamble prepended to every user message sent to the agent
/// service (spec.md §6).
#[derive(Debug, Clone, Serialize)]
pub struct ContextEnvelope {
    pub channel: &'static str,
    pub chat_id: String,
    pub message_id: String,
    pub sender: EnvelopeSender,
    pub timestamp: DateTime<Utc>,
    pub format: &'static str,
    pub trigger: Trigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_instruction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_agent: Option<SourceAgent>,
}

impl ContextEnvelope {
    pub fn new(
        chat_id: impl Into<String>,
        message_id: impl Into<String>,
        sender: EnvelopeSender,
        trigger: Trigger,
    ) -> Self {
        let reply_instruction = if sender.sender_type == SenderType::OpencodeUser {
            Some(format!(
                "Include an @mention of {} in your reply.",
                sender.user_id
            ))
        } else {
            None
        };
        Self {
            channel: "matrix",
            chat_id: chat_id.into(),
            message_id: message_id.into(),
            sender,
            timestamp: Utc::now(),
            format: "markdown",
            trigger,
            reply_instruction,
            source_agent: None,
        }
    }

    pub fn with_source_agent(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.source_agent = Some(SourceAgent {
            id: id.into(),
            name: name.into(),
        });
        self
    }

    /// Renders the envelope as a `key: value` header block followed by the
    /// user body — the simplest framing consistent with "structured
    /// preamble followed by the user body" (SPEC_FULL.md §6, an Open
    /// Question resolution recorded in DESIGN.md).
    pub fn render(&self, body: &str) -> String {
        let mut header = format!(
            "channel: {}\nchat_id: {}\nmessage_id: {}\nsender.user_id: {}\nsender.name: {}\n\
             sender.type: {}\ntimestamp: {}\nformat: {}\ntrigger: {}\n",
            self.channel,
            self.chat_id,
            self.message_id,
            self.sender.user_id,
            self.sender.name,
            self.sender.sender_type.as_wire(),
            self.timestamp.to_rfc3339(),
            self.format,
            self.trigger.as_wire(),
        );
        if let Some(instr) = &self.reply_instruction {
            header.push_str(&format!("reply_instruction: {instr}\n"));
        }
        if let Some(src) = &self.source_agent {
            header.push_str(&format!(
                "source_agent.id: {}\nsource_agent.name: {}\n",
                src.id, src.name
            ));
        }
        format!("{header}---\n{body}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opencode_user_gets_reply_instruction() {
        let sender = EnvelopeSender {
            user_id: "@oc_alice:server".to_string(),
            name: "Alice".to_string(),
            sender_type: SenderType::detect("@oc_alice:server", false),
        };
        let envelope = ContextEnvelope::new("!room:server", "$evt:server", sender, Trigger::UserMessage);
        assert!(envelope.reply_instruction.is_some());
    }

    #[test]
    fn human_sender_has_no_reply_instruction() {
        let sender = EnvelopeSender {
            user_id: "@alice:server".to_string(),
            name: "Alice".to_string(),
            sender_type: SenderType::detect("@alice:server", false),
        };
        let envelope = ContextEnvelope::new("!room:server", "$evt:server", sender, Trigger::UserMessage);
        assert!(envelope.reply_instruction.is_none());
    }

    #[test]
    fn other_agent_carries_source_agent() {
        let sender = EnvelopeSender {
            user_id: "@agent_a:server".to_string(),
            name: "Agent A".to_string(),
            sender_type: SenderType::detect("@agent_a:server", true),
        };
        let envelope = ContextEnvelope::new("!room:server", "$evt:server", sender, Trigger::AgentMessage)
            .with_source_agent("agent-A1", "Agent A");
        let rendered = envelope.render("please look at this");
        assert!(rendered.contains("source_agent.id: agent-A1"));
        assert!(rendered.contains("---\nplease look at this"));
    }
}
