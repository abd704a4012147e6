//! C1 — Message Router (spec.md §4.C1).
//!
//! Owns per-(room, agent) `ActiveTaskSlot`s, enforces per-agent FIFO,
//! builds the context envelope, and dispatches to the agent service and
//! response streamer. Per (room, agent) processing order is strict FIFO;
//! across pairs, slots run independently in parallel (spec.md §5).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{watch, Mutex};

use crate::agent_service::AgentServiceAdapter;
use crate::alert::AlertSink;
use crate::envelope::{ContextEnvelope, EnvelopeSender, SenderType, Trigger};
use crate::mapping::{ConversationBinding, ConversationStrategy, MappingStore};
use crate::matrix::client::new_txn_id;
use crate::matrix::{MatrixClient, OwnedRoomId, OwnedUserId, RoomMessageContent, TimelineEvent};
use crate::streamer::{DisplayMode, ResponseStreamer, StreamContext};

/// The resolved classification handed from the ingestor to the router
/// (spec.md §4.M3: "human, other_agent, bridge_origin_ok").
#[derive(Debug, Clone)]
pub enum SenderClass {
    Human,
    OtherAgent(String),
    BridgeOriginOk,
}

/// Default cap on a slot's queued backlog (spec.md §4.C1).
const DEFAULT_MAX_QUEUE: usize = 8;
/// "still processing" notices are throttled to once per minute per slot.
const NOTICE_THROTTLE: Duration = Duration::from_secs(60);

struct QueueEntry {
    room_id: OwnedRoomId,
    event: TimelineEvent,
    agent_id: String,
    sender_class: SenderClass,
}

struct Slot {
    queue: Mutex<VecDeque<QueueEntry>>,
    processing: AtomicBool,
    last_notice: Mutex<Option<Instant>>,
    cancel_tx: watch::Sender<bool>,
}

impl Slot {
    fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            queue: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
            last_notice: Mutex::new(None),
            cancel_tx,
        }
    }
}

pub struct MessageRouter {
    matrix: Arc<MatrixClient>,
    mapping: Arc<dyn MappingStore>,
    agent_service: Arc<dyn AgentServiceAdapter>,
    streamer: Arc<ResponseStreamer>,
    alerts: Arc<AlertSink>,
    slots: DashMap<(String, String), Arc<Slot>>,
    max_queue: usize,
    idle_timeout: Duration,
    total_timeout: Duration,
    streaming_enabled: bool,
}

impl MessageRouter {
    pub fn new(
        matrix: Arc<MatrixClient>,
        mapping: Arc<dyn MappingStore>,
        agent_service: Arc<dyn AgentServiceAdapter>,
        display_mode: DisplayMode,
        alerts: Arc<AlertSink>,
        max_queue: usize,
        idle_timeout: Duration,
        total_timeout: Duration,
        streaming_enabled: bool,
    ) -> Self {
        Self {
            streamer: Arc::new(ResponseStreamer::new(matrix.clone(), display_mode)),
            matrix,
            mapping,
            agent_service,
            alerts,
            slots: DashMap::new(),
            max_queue,
            idle_timeout,
            total_timeout,
            streaming_enabled,
        }
    }

    fn slot_for(&self, room_id: &str, agent_id: &str) -> Arc<Slot> {
        self.slots
            .entry((room_id.to_string(), agent_id.to_string()))
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    /// Public contract: `enqueue(room_id, event, resolved_agent_id,
    /// sender_type) -> ack` (spec.md §4.C1). Implemented as fire-and-track:
    /// the caller (ingestor) does not block on processing completion.
    pub async fn enqueue(
        &self,
        room_id: OwnedRoomId,
        event: TimelineEvent,
        agent_id: String,
        sender_class: SenderClass,
    ) {
        let slot = self.slot_for(room_id.as_str(), &agent_id);
        let entry = QueueEntry { room_id: room_id.clone(), event, agent_id: agent_id.clone(), sender_class };

        let should_start = {
            let mut queue = slot.queue.lock().await;
            if !slot.processing.load(Ordering::SeqCst) {
                slot.processing.store(true, Ordering::SeqCst);
                queue.push_back(entry);
                true
            } else if queue.len() < self.max_queue {
                queue.push_back(entry);
                self.maybe_notify_queued(&slot, &room_id).await;
                false
            } else {
                self.reject_full_queue(&room_id, &agent_id).await;
                false
            }
        };

        if should_start {
            self.drain_slot(slot, room_id, agent_id).await;
        }
    }

    async fn maybe_notify_queued(&self, slot: &Slot, room_id: &OwnedRoomId) {
        let mut last = slot.last_notice.lock().await;
        let now = Instant::now();
        if last.map(|t| now.duration_since(t) >= NOTICE_THROTTLE).unwrap_or(true) {
            *last = Some(now);
            tracing::info!(room_id = %room_id, "slot busy, message queued (notice throttled)");
        }
    }

    async fn reject_full_queue(&self, room_id: &OwnedRoomId, agent_id: &str) {
        tracing::warn!(room_id = %room_id, agent_id, "slot queue full, dropping message");
        self.alerts
            .fire(
                &format!("queue-full-{room_id}-{agent_id}"),
                &format!("message dropped: queue full for agent {agent_id} in room {room_id}"),
            )
            .await;
        if let Ok(Some(mapping)) = self.mapping.get_by_agent_id(agent_id).await {
            if let Ok(user_id) = OwnedUserId::try_from(mapping.matrix_user_id.as_str()) {
                if let Ok(token) = self.matrix.ensure_token(&user_id, &mapping.matrix_password).await {
                    let content = RoomMessageContent::notice(
                        "too many pending messages for this agent; this one was dropped",
                    )
                    .bridge_originated();
                    let _ = self
                        .matrix
                        .send_message(room_id, &content, &token, &new_txn_id())
                        .await;
                }
            }
        }
    }

    /// Drains the slot's FIFO queue in arrival order (spec.md §4.C1 step
    /// 4; P4).
    async fn drain_slot(&self, slot: Arc<Slot>, mut room_id: OwnedRoomId, mut agent_id: String) {
        loop {
            // `pop_front` and the `processing` flip to `false` must happen
            // under the same lock acquisition as `enqueue`'s check-then-push,
            // or a message pushed between the pop and the flip is stranded
            // with processing still true and nobody left to drain it (P3, P4).
            let entry = {
                let mut queue = slot.queue.lock().await;
                match queue.pop_front() {
                    Some(entry) => Some(entry),
                    None => {
                        slot.processing.store(false, Ordering::SeqCst);
                        None
                    }
                }
            };
            let Some(entry) = entry else {
                return;
            };
            room_id = entry.room_id.clone();
            agent_id = entry.agent_id.clone();
            if let Err(e) = self.process_entry(&slot, entry).await {
                tracing::warn!(room_id = %room_id, agent_id, error = %e, "message processing failed, slot continues draining");
            }
        }
    }

    async fn process_entry(
        &self,
        slot: &Slot,
        entry: QueueEntry,
    ) -> Result<(), crate::error::BridgeError> {
        let QueueEntry { room_id, event, agent_id, sender_class } = entry;
        let mapping = self
            .mapping
            .get_by_agent_id(&agent_id)
            .await?
            .ok_or_else(|| crate::error::BridgeError::Internal(format!("no mapping for {agent_id}")))?;
        let agent_user_id = OwnedUserId::try_from(mapping.matrix_user_id.as_str())
            .map_err(|_| crate::error::BridgeError::Internal("malformed agent mxid".to_string()))?;
        let agent_token = self
            .matrix
            .ensure_token(&agent_user_id, &mapping.matrix_password)
            .await?;

        let members = self.matrix.joined_members(&room_id, &agent_token).await.unwrap_or_default();
        let strategy = ConversationStrategy::for_member_count(members.len().max(2));
        let user_mxid = if strategy == ConversationStrategy::PerUser {
            Some(event.sender.to_string())
        } else {
            None
        };

        let conversation_id = self.get_or_create_conversation(&room_id, &agent_id, user_mxid.as_deref()).await?;

        let trigger = match &sender_class {
            SenderClass::Human | SenderClass::BridgeOriginOk => Trigger::UserMessage,
            SenderClass::OtherAgent(_) => Trigger::AgentMessage,
        };
        let is_other_agent = matches!(sender_class, SenderClass::OtherAgent(_));
        let sender_type = SenderType::detect(event.sender.as_str(), is_other_agent);
        let sender = EnvelopeSender {
            user_id: event.sender.to_string(),
            name: event.sender.to_string(),
            sender_type,
        };
        let mut envelope = ContextEnvelope::new(room_id.to_string(), event.event_id.to_string(), sender, trigger);
        if let SenderClass::OtherAgent(source_agent_id) = &sender_class {
            if let Ok(Some(source_mapping)) = self.mapping.get_by_agent_id(source_agent_id).await {
                envelope = envelope.with_source_agent(source_agent_id.clone(), source_mapping.agent_name);
            }
        }
        let body = event.body().unwrap_or_default();
        let rendered = envelope.render(body);

        let ctx = StreamContext {
            room_id: room_id.clone(),
            agent_user_id: agent_user_id.clone(),
            agent_token: agent_token.clone(),
            original_event_id: event.event_id.clone(),
            original_sender: event.sender.clone(),
        };

        let result = if self.streaming_enabled {
            match self
                .agent_service
                .send_streaming(&agent_id, Some(&conversation_id), &rendered)
                .await
            {
                Ok(stream) => {
                    self.streamer
                        .stream_reply(&ctx, stream, self.idle_timeout, self.total_timeout, slot.cancel_tx.subscribe())
                        .await
                }
                Err(e) => Err(crate::streamer::StreamError::AgentService(e)),
            }
        } else {
            match self
                .agent_service
                .send_nonstreaming(&agent_id, Some(&conversation_id), &rendered)
                .await
            {
                Ok(text) => {
                    let content = RoomMessageContent::plain(text)
                        .bridge_originated()
                        .in_reply_to(event.event_id.clone(), event.sender.clone());
                    self.matrix
                        .send_message(&room_id, &content, &agent_token, &new_txn_id())
                        .await
                        .map_err(crate::streamer::StreamError::from)
                }
                Err(e) => Err(crate::streamer::StreamError::AgentService(e)),
            }
        };

        if let Err(e) = result {
            self.alerts
                .fire(
                    &format!("process-error-{room_id}-{agent_id}"),
                    &format!("processing failed for agent {agent_id} in {room_id}: {e}"),
                )
                .await;
        }
        Ok(())
    }

    async fn get_or_create_conversation(
        &self,
        room_id: &OwnedRoomId,
        agent_id: &str,
        user_mxid: Option<&str>,
    ) -> Result<String, crate::error::BridgeError> {
        if let Some(existing) = self.mapping.get_conversation(room_id.as_str(), agent_id, user_mxid).await? {
            if self.agent_service.verify_conversation(agent_id, &existing.conversation_id).await.unwrap_or(true) {
                return Ok(existing.conversation_id);
            }
            // 404 on send/verify: drop the stale binding and rebuild once (spec.md §7).
            self.mapping.drop_conversation(room_id.as_str(), agent_id, user_mxid).await?;
        }
        let conversation_id = self.agent_service.create_conversation(agent_id, &[]).await?;
        let now = Utc::now();
        let strategy = if user_mxid.is_some() { ConversationStrategy::PerUser } else { ConversationStrategy::PerRoom };
        self.mapping
            .set_conversation(&ConversationBinding {
                room_id: room_id.to_string(),
                agent_id: agent_id.to_string(),
                user_mxid: user_mxid.map(String::from),
                conversation_id: conversation_id.clone(),
                strategy,
                created_at: now,
                last_message_at: now,
            })
            .await?;
        Ok(conversation_id)
    }

    /// Cancels every in-flight slot; used during shutdown sequencing
    /// (spec.md §5).
    pub fn cancel_all(&self) {
        for entry in self.slots.iter() {
            let _ = entry.value().cancel_tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_default_cap_matches_spec() {
        assert_eq!(DEFAULT_MAX_QUEUE, 8);
    }

    #[tokio::test]
    async fn slot_starts_empty_and_not_processing() {
        let slot = Slot::new();
        assert!(!slot.processing.load(Ordering::SeqCst));
        assert!(slot.queue.lock().await.is_empty());
    }
}
