//! HTTP client for the agent service (spec.md §4.L4).

use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;

use crate::error::{Backoff, ErrorKind};

use super::types::{AgentStreamEvent, AgentSummary};

#[derive(Error, Debug)]
pub enum AgentServiceError {
    #[error("agent service returned {status}: {message}")]
    Api { status: StatusCode, message: String },

    #[error("agent service transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("agent service response decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("agent service busy, exhausted retries")]
    Busy,

    #[error("conversation {0} not found")]
    ConversationNotFound(String),
}

impl AgentServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentServiceError::Api { status, .. } if *status == StatusCode::CONFLICT => {
                ErrorKind::RateLimited
            }
            AgentServiceError::Api { status, .. } if *status == StatusCode::NOT_FOUND => {
                ErrorKind::NotFound
            }
            AgentServiceError::Api { status, .. } if status.is_server_error() => ErrorKind::Fatal,
            AgentServiceError::Api { .. } => ErrorKind::MalformedInput,
            AgentServiceError::Transport(_) => ErrorKind::TransientNetwork,
            AgentServiceError::Decode(_) => ErrorKind::MalformedInput,
            AgentServiceError::Busy => ErrorKind::RateLimited,
            AgentServiceError::ConversationNotFound(_) => ErrorKind::NotFound,
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<AgentStreamEvent, AgentServiceError>> + Send>>;

/// Closed set of backend variants behind this trait's operation set
/// (spec.md §9 — "not open-for-extension; adding a new backend is a code
/// change, not a plug-in").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentBackend {
    Letta,
    GenericHttp,
}

#[async_trait::async_trait]
pub trait AgentServiceAdapter: Send + Sync {
    async fn list_agents(&self, limit: usize) -> Result<Vec<AgentSummary>, AgentServiceError>;
    async fn create_conversation(
        &self,
        agent_id: &str,
        isolated_block_labels: &[String],
    ) -> Result<String, AgentServiceError>;
    async fn verify_conversation(
        &self,
        agent_id: &str,
        conversation_id: &str,
    ) -> Result<bool, AgentServiceError>;
    async fn send_streaming(
        &self,
        agent_id: &str,
        conversation_id: Option<&str>,
        user_text: &str,
    ) -> Result<EventStream, AgentServiceError>;
    async fn send_nonstreaming(
        &self,
        agent_id: &str,
        conversation_id: Option<&str>,
        user_text: &str,
    ) -> Result<String, AgentServiceError>;
    /// Most recent `limit` message bodies for an agent, oldest first, for
    /// the provisioner's bounded history-import (spec.md §4.M1).
    async fn get_recent_messages(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<String>, AgentServiceError>;
}

pub struct AgentServiceClient {
    http: Client,
    base_url: String,
    token: String,
    backend: AgentBackend,
}

impl AgentServiceClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client builds"),
            base_url: base_url.into(),
            token: token.into(),
            backend: AgentBackend::Letta,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn backend(&self) -> AgentBackend {
        self.backend
    }

    async fn decode_error(resp: reqwest::Response) -> AgentServiceError {
        let status = resp.status();
        let message = resp
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        AgentServiceError::Api { status, message }
    }

    /// `409 BUSY` → exponential backoff (~1s, 2s, 4s, capped 8s), 3
    /// attempts, then surfaced (spec.md §4.L4).
    async fn send_with_busy_retry(
        &self,
        agent_id: &str,
        conversation_id: Option<&str>,
        user_text: &str,
        stream: bool,
    ) -> Result<reqwest::Response, AgentServiceError> {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        loop {
            let mut body = json!({
                "user_text": user_text,
                "stream": stream,
            });
            if let Some(cid) = conversation_id {
                body["conversation_id"] = json!(cid);
            }
            let resp = self
                .http
                .post(self.url(&format!("/agents/{agent_id}/messages")))
                .bearer_auth(&self.token)
                .json(&body)
                .send()
                .await?;
            if resp.status() == StatusCode::CONFLICT {
                if backoff.attempts() >= 3 {
                    return Err(AgentServiceError::Busy);
                }
                tokio::time::sleep(backoff.next_delay()).await;
                continue;
            }
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(AgentServiceError::ConversationNotFound(
                    conversation_id.unwrap_or_default().to_string(),
                ));
            }
            if !resp.status().is_success() {
                return Err(Self::decode_error(resp).await);
            }
            return Ok(resp);
        }
    }
}

#[async_trait::async_trait]
impl AgentServiceAdapter for AgentServiceClient {
    /// Iterates all pages before returning (the source's 50-agent cap was
    /// a latent bug; spec.md §4.L4, B1).
    async fn list_agents(&self, limit: usize) -> Result<Vec<AgentSummary>, AgentServiceError> {
        let mut agents = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut url = self.url(&format!("/agents?limit={limit}"));
            if let Some(c) = &cursor {
                url.push_str(&format!("&cursor={c}"));
            }
            let resp = self.http.get(url).bearer_auth(&self.token).send().await?;
            if !resp.status().is_success() {
                return Err(Self::decode_error(resp).await);
            }
            let body: Value = resp.json().await?;
            let page = body["agents"].as_array().cloned().unwrap_or_default();
            if page.is_empty() {
                break;
            }
            for item in &page {
                agents.push(AgentSummary {
                    id: item["id"].as_str().unwrap_or_default().to_string(),
                    name: item["name"].as_str().unwrap_or_default().to_string(),
                });
            }
            cursor = body["next_cursor"].as_str().map(String::from);
            if cursor.is_none() || page.len() < limit {
                break;
            }
        }
        Ok(agents)
    }

    async fn create_conversation(
        &self,
        agent_id: &str,
        isolated_block_labels: &[String],
    ) -> Result<String, AgentServiceError> {
        let resp = self
            .http
            .post(self.url(&format!("/agents/{agent_id}/conversations")))
            .bearer_auth(&self.token)
            .json(&json!({ "isolated_block_labels": isolated_block_labels }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::decode_error(resp).await);
        }
        let body: Value = resp.json().await?;
        Ok(body["conversation_id"].as_str().unwrap_or_default().to_string())
    }

    async fn verify_conversation(
        &self,
        agent_id: &str,
        conversation_id: &str,
    ) -> Result<bool, AgentServiceError> {
        let resp = self
            .http
            .get(self.url(&format!(
                "/agents/{agent_id}/conversations/{conversation_id}"
            )))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(Self::decode_error(resp).await);
        }
        Ok(true)
    }

    async fn send_streaming(
        &self,
        agent_id: &str,
        conversation_id: Option<&str>,
        user_text: &str,
    ) -> Result<EventStream, AgentServiceError> {
        let resp = self
            .send_with_busy_retry(agent_id, conversation_id, user_text, true)
            .await?;
        let byte_stream = resp.bytes_stream();
        // Newline-delimited JSON framing over the chunked body.
        let stream = byte_stream.scan(Vec::new(), |buf, chunk| {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => return futures::future::ready(Some(vec![Err(AgentServiceError::from(e))])),
            };
            buf.extend_from_slice(&chunk);
            let mut events = Vec::new();
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                let decoded = serde_json::from_slice::<AgentStreamEvent>(line)
                    .map_err(AgentServiceError::from);
                events.push(decoded);
            }
            futures::future::ready(Some(events))
        });
        let flattened = stream.flat_map(futures::stream::iter);
        Ok(Box::pin(flattened))
    }

    /// Drains the stream and concatenates `assistant` text — one code
    /// path is authoritative for the event taxonomy (spec.md §4.L4).
    async fn send_nonstreaming(
        &self,
        agent_id: &str,
        conversation_id: Option<&str>,
        user_text: &str,
    ) -> Result<String, AgentServiceError> {
        let mut stream = self.send_streaming(agent_id, conversation_id, user_text).await?;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                AgentStreamEvent::Assistant { text: t } => text.push_str(&t),
                AgentStreamEvent::Error { message } => {
                    return Err(AgentServiceError::Api {
                        status: StatusCode::INTERNAL_SERVER_ERROR,
                        message,
                    })
                }
                AgentStreamEvent::Stop => break,
                _ => {}
            }
        }
        Ok(text)
    }

    async fn get_recent_messages(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<String>, AgentServiceError> {
        let resp = self
            .http
            .get(self.url(&format!("/agents/{agent_id}/messages?limit={limit}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(Self::decode_error(resp).await);
        }
        let body: Value = resp.json().await?;
        let messages = body["messages"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter_map(|m| m["text"].as_str().map(String::from))
            .take(limit)
            .collect();
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_status_maps_to_rate_limited_kind() {
        let err = AgentServiceError::Api {
            status: StatusCode::CONFLICT,
            message: "busy".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    #[test]
    fn busy_exhaustion_maps_to_rate_limited_kind() {
        assert_eq!(AgentServiceError::Busy.kind(), ErrorKind::RateLimited);
    }

    #[test]
    fn server_error_is_fatal() {
        let err = AgentServiceError::Api {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "oops".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }
}
