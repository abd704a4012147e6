//! Wire types for the subset of the Matrix client-server API this bridge
//! consumes (spec.md §6). Identifiers use `ruma-common`'s owned ID newtypes
//! for compile-time shape validation without pulling in the full SDK.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use ruma_common::{OwnedEventId, OwnedRoomId, OwnedUserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPreset {
    TrustedPrivateChat,
    PrivateChat,
    PublicChat,
}

impl RoomPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomPreset::TrustedPrivateChat => "trusted_private_chat",
            RoomPreset::PrivateChat => "private_chat",
            RoomPreset::PublicChat => "public_chat",
        }
    }
}

/// Spec for `create_room` (spec.md §4.L3): preset, name, topic, invitees,
/// initial power levels, and whether the room is a Space.
#[derive(Debug, Clone)]
pub struct CreateRoomSpec {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub preset: RoomPreset,
    pub invite: Vec<OwnedUserId>,
    pub is_space: bool,
    pub power_level_overrides: Option<Value>,
}

impl CreateRoomSpec {
    pub fn agent_room(name: &str, topic: &str, invite: Vec<OwnedUserId>) -> Self {
        Self {
            name: Some(name.to_string()),
            topic: Some(topic.to_string()),
            preset: RoomPreset::TrustedPrivateChat,
            invite,
            is_space: false,
            power_level_overrides: None,
        }
    }

    pub fn space(name: &str, topic: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            topic: Some(topic.to_string()),
            preset: RoomPreset::PrivateChat,
            invite: Vec::new(),
            is_space: true,
            power_level_overrides: None,
        }
    }
}

/// `m.space.child` state event body (spec.md §4.M1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceChildContent {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub via: Vec<String>,
    #[serde(default)]
    pub suggested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
}

/// `m.space.parent` state event body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceParentContent {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub via: Vec<String>,
    #[serde(default)]
    pub canonical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomNameContent {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomTopicContent {
    pub topic: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[serde(rename = "m.text")]
    Text,
    #[serde(rename = "m.notice")]
    Notice,
}

/// Reply relation (`m.relates_to.m.in_reply_to`) used when the bridge posts
/// an assistant reply (spec.md §4.C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InReplyTo {
    pub event_id: OwnedEventId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatesTo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<OwnedEventId>,
    #[serde(rename = "m.in_reply_to", skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<InReplyTo>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "m.new_content")]
    pub new_content: Option<Box<RoomMessageContent>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentionsContent {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<OwnedUserId>,
}

/// `m.room.message` content, generalized to carry the two bridge-private
/// flags `m.bridge_originated` and `m.letta_historical` the ingest filters
/// (spec.md §4.M3) key off of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMessageContent {
    pub msgtype: MessageType,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<RelatesTo>,
    #[serde(rename = "m.mentions", skip_serializing_if = "Option::is_none")]
    pub mentions: Option<MentionsContent>,
    #[serde(rename = "m.bridge_originated", skip_serializing_if = "Option::is_none")]
    pub bridge_originated: Option<bool>,
    #[serde(rename = "m.letta_historical", skip_serializing_if = "Option::is_none")]
    pub letta_historical: Option<bool>,
}

impl RoomMessageContent {
    pub fn plain(body: impl Into<String>) -> Self {
        Self {
            msgtype: MessageType::Text,
            body: body.into(),
            formatted_body: None,
            format: None,
            relates_to: None,
            mentions: None,
            bridge_originated: None,
            letta_historical: None,
        }
    }

    pub fn notice(body: impl Into<String>) -> Self {
        let mut content = Self::plain(body);
        content.msgtype = MessageType::Notice;
        content
    }

    pub fn bridge_originated(mut self) -> Self {
        self.bridge_originated = Some(true);
        self
    }

    pub fn historical(mut self) -> Self {
        self.letta_historical = Some(true);
        self
    }

    pub fn in_reply_to(mut self, event_id: OwnedEventId, sender: OwnedUserId) -> Self {
        self.relates_to = Some(RelatesTo {
            rel_type: None,
            event_id: None,
            in_reply_to: Some(InReplyTo { event_id }),
            new_content: None,
        });
        self.mentions = Some(MentionsContent {
            user_ids: vec![sender],
        });
        self
    }

    pub fn is_bridge_originated(&self) -> bool {
        self.bridge_originated.unwrap_or(false)
    }

    pub fn is_historical(&self) -> bool {
        self.letta_historical.unwrap_or(false)
    }
}

/// A minimal, permissive view of one timeline event as delivered by
/// `/sync`. `content` is kept as raw JSON and decoded lazily by filters
/// that need to inspect it (spec.md §4.M3) — this avoids a single giant
/// enum covering every Matrix event type the bridge never acts on.
#[derive(Debug, Clone, Deserialize)]
pub struct TimelineEvent {
    pub event_id: OwnedEventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: OwnedUserId,
    pub origin_server_ts: i64,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub state_key: Option<String>,
}

impl TimelineEvent {
    pub fn is_message(&self) -> bool {
        self.event_type == "m.room.message"
    }

    pub fn content_flag(&self, key: &str) -> bool {
        self.content
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvitedRoom {
    #[serde(default)]
    pub invite_state: InviteState,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InviteState {
    #[serde(default)]
    pub events: Vec<StrippedStateEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrippedStateEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: OwnedUserId,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: std::collections::HashMap<OwnedRoomId, JoinedRoom>,
    #[serde(default)]
    pub invite: std::collections::HashMap<OwnedRoomId, InvitedRoom>,
    #[serde(default)]
    pub leave: std::collections::HashMap<OwnedRoomId, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_content_sets_bridge_flag() {
        let content = RoomMessageContent::plain("hi").bridge_originated();
        assert!(content.is_bridge_originated());
        assert!(!content.is_historical());
    }

    #[test]
    fn timeline_event_reads_flags_from_raw_json() {
        let event: TimelineEvent = serde_json::from_value(serde_json::json!({
            "event_id": "$abc:server",
            "type": "m.room.message",
            "sender": "@agent_x:server",
            "origin_server_ts": 1000,
            "content": {"body": "hello", "m.bridge_originated": true}
        }))
        .unwrap();
        assert!(event.content_flag("m.bridge_originated"));
        assert_eq!(event.body(), Some("hello"));
    }
}
