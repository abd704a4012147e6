//! C2 — Response Streamer (spec.md §4.C2).
//!
//! Consumes the agent-service stream and renders it into the room under
//! one of two display modes, selected once at boot.

use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::watch;

use crate::agent_service::{AgentServiceError, AgentStreamEvent, EventStream};
use crate::error::ErrorKind;
use crate::matrix::client::new_txn_id;
use crate::matrix::{MatrixClient, MatrixError, OwnedEventId, OwnedRoomId, OwnedUserId, RoomMessageContent};

/// Edits are coalesced on this debounce to avoid per-token thrashing
/// (spec.md §4.C2).
const LIVE_EDIT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    LiveEdit,
    ProgressThenDelete,
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error(transparent)]
    AgentService(#[from] AgentServiceError),
    #[error("agent reported error: {0}")]
    AgentError(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("bridge restarting")]
    Cancelled,
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::Matrix(e) => e.kind(),
            StreamError::AgentService(e) => e.kind(),
            StreamError::AgentError(_) => ErrorKind::MalformedInput,
            StreamError::Timeout(_) => ErrorKind::TransientNetwork,
            StreamError::Cancelled => ErrorKind::Fatal,
        }
    }
}

pub struct StreamContext {
    pub room_id: OwnedRoomId,
    pub agent_user_id: OwnedUserId,
    pub agent_token: String,
    pub original_event_id: OwnedEventId,
    pub original_sender: OwnedUserId,
}

pub struct ResponseStreamer {
    matrix: std::sync::Arc<MatrixClient>,
    mode: DisplayMode,
}

enum ProgressState {
    LiveEdit { working_event_id: Option<OwnedEventId>, last_edit: Option<std::time::Instant> },
    ProgressThenDelete { last_progress_event_id: Option<OwnedEventId> },
}

impl ResponseStreamer {
    pub fn new(matrix: std::sync::Arc<MatrixClient>, mode: DisplayMode) -> Self {
        Self { matrix, mode }
    }

    async fn post_error(&self, ctx: &StreamContext, message: &str) -> Result<(), MatrixError> {
        let content = RoomMessageContent::notice(message).bridge_originated();
        self.matrix
            .send_message(&ctx.room_id, &content, &ctx.agent_token, &new_txn_id())
            .await?;
        Ok(())
    }

    /// Drives one request's worth of stream events into the room. Returns
    /// once the stream reaches `stop`/`error`, the deadlines expire, or
    /// `cancel` is set (spec.md §4.C1, §4.C2).
    pub async fn stream_reply(
        &self,
        ctx: &StreamContext,
        mut stream: EventStream,
        idle_timeout: Duration,
        total_timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), StreamError> {
        let mut state = match self.mode {
            DisplayMode::LiveEdit => ProgressState::LiveEdit { working_event_id: None, last_edit: None },
            DisplayMode::ProgressThenDelete => ProgressState::ProgressThenDelete { last_progress_event_id: None },
        };
        let total_deadline = tokio::time::sleep(total_timeout);
        tokio::pin!(total_deadline);

        loop {
            tokio::select! {
                _ = &mut total_deadline => {
                    let _ = self.post_error(ctx, "agent service timed out after 120 seconds").await;
                    return Err(StreamError::Timeout(total_timeout));
                }
                changed = cancel.changed() => {
                    if changed.is_ok() && *cancel.borrow() {
                        let _ = self.post_error(ctx, "bridge restarting").await;
                        return Err(StreamError::Cancelled);
                    }
                }
                next = tokio::time::timeout(idle_timeout, stream.next()) => {
                    let next = match next {
                        Err(_) => {
                            let _ = self.post_error(ctx, "agent service timed out after 120 seconds").await;
                            return Err(StreamError::Timeout(idle_timeout));
                        }
                        Ok(None) => return Ok(()),
                        Ok(Some(event)) => event?,
                    };
                    if self.handle_event(ctx, &mut state, event).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns `Ok(true)` when the stream is finished.
    async fn handle_event(
        &self,
        ctx: &StreamContext,
        state: &mut ProgressState,
        event: AgentStreamEvent,
    ) -> Result<bool, StreamError> {
        match event {
            AgentStreamEvent::Ping | AgentStreamEvent::Reasoning { .. } | AgentStreamEvent::Usage { .. } => {
                Ok(false)
            }
            AgentStreamEvent::ToolCall { tool_name, .. } => {
                self.surface_progress(ctx, state, &format!("{tool_name}…")).await?;
                Ok(false)
            }
            AgentStreamEvent::ToolReturn { tool_name, ok, .. } => {
                let mark = if ok { "✓" } else { "✗" };
                self.surface_progress(ctx, state, &format!("{tool_name} {mark}")).await?;
                Ok(false)
            }
            AgentStreamEvent::ApprovalRequest { description, .. } => {
                self.surface_progress(ctx, state, &format!("approval requested: {description}")).await?;
                Ok(false)
            }
            AgentStreamEvent::Assistant { text } => {
                self.finalize_assistant(ctx, state, &text).await?;
                Ok(false)
            }
            AgentStreamEvent::Stop => Ok(true),
            AgentStreamEvent::Error { message } => {
                self.post_error(ctx, &format!("agent service error: {message}")).await?;
                Err(StreamError::AgentError(message))
            }
        }
    }

    async fn surface_progress(
        &self,
        ctx: &StreamContext,
        state: &mut ProgressState,
        body: &str,
    ) -> Result<(), StreamError> {
        match state {
            ProgressState::LiveEdit { working_event_id, last_edit } => {
                let content = RoomMessageContent::plain(body).bridge_originated();
                match working_event_id {
                    None => {
                        let id = self
                            .matrix
                            .send_message(&ctx.room_id, &content, &ctx.agent_token, &new_txn_id())
                            .await?;
                        *working_event_id = Some(id);
                        *last_edit = Some(std::time::Instant::now());
                    }
                    Some(existing) => {
                        let should_edit = last_edit
                            .map(|t| t.elapsed() >= LIVE_EDIT_DEBOUNCE)
                            .unwrap_or(true);
                        if should_edit {
                            self.matrix
                                .edit_message(&ctx.room_id, existing, content, &ctx.agent_token, &new_txn_id())
                                .await?;
                            *last_edit = Some(std::time::Instant::now());
                        }
                    }
                }
            }
            ProgressState::ProgressThenDelete { last_progress_event_id } => {
                if let Some(prev) = last_progress_event_id.take() {
                    let _ = self.matrix.redact(&ctx.room_id, &prev, &ctx.agent_token, &new_txn_id()).await;
                }
                let content = RoomMessageContent::plain(body).bridge_originated();
                let id = self
                    .matrix
                    .send_message(&ctx.room_id, &content, &ctx.agent_token, &new_txn_id())
                    .await?;
                *last_progress_event_id = Some(id);
            }
        }
        Ok(())
    }

    async fn finalize_assistant(
        &self,
        ctx: &StreamContext,
        state: &mut ProgressState,
        text: &str,
    ) -> Result<(), StreamError> {
        let content = RoomMessageContent::plain(text)
            .bridge_originated()
            .in_reply_to(ctx.original_event_id.clone(), ctx.original_sender.clone());
        match state {
            ProgressState::LiveEdit { working_event_id, .. } => match working_event_id {
                Some(existing) => {
                    self.matrix
                        .edit_message(&ctx.room_id, existing, content, &ctx.agent_token, &new_txn_id())
                        .await?;
                }
                None => {
                    self.matrix
                        .send_message(&ctx.room_id, &content, &ctx.agent_token, &new_txn_id())
                        .await?;
                }
            },
            ProgressState::ProgressThenDelete { last_progress_event_id } => {
                self.matrix
                    .send_message(&ctx.room_id, &content, &ctx.agent_token, &new_txn_id())
                    .await?;
                if let Some(prev) = last_progress_event_id.take() {
                    let _ = self.matrix.redact(&ctx.room_id, &prev, &ctx.agent_token, &new_txn_id()).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_errors_map_to_transient_network_kind() {
        let err = StreamError::Timeout(Duration::from_secs(120));
        assert_eq!(err.kind(), ErrorKind::TransientNetwork);
    }

    #[test]
    fn cancelled_is_fatal_to_the_in_flight_task() {
        assert_eq!(StreamError::Cancelled.kind(), ErrorKind::Fatal);
    }
}
