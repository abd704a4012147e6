//! The Matrix client-server HTTP client (spec.md §4.L3).
//!
//! Every call fails with a typed [`MatrixError`] carrying the HTTP status
//! and the homeserver's `errcode` where one was returned. Tokens are
//! cached per user id in a `DashMap` (spec.md §5: "CAS-style updates; on
//! 401, whoever gets the lock re-logs-in").

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;

use crate::error::{Backoff, ErrorKind};
use crate::matrix::types::*;

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("matrix homeserver returned {status} {errcode}: {error}")]
    Api {
        status: StatusCode,
        errcode: String,
        error: String,
    },

    #[error("matrix transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("matrix response decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("authentication expired for {0}")]
    AuthExpired(String),
}

impl MatrixError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MatrixError::Api { errcode, .. } if errcode == "M_LIMIT_EXCEEDED" => {
                ErrorKind::RateLimited
            }
            MatrixError::Api { status, .. } if *status == StatusCode::UNAUTHORIZED => {
                ErrorKind::AuthExpired
            }
            MatrixError::Api { status, .. } if *status == StatusCode::NOT_FOUND => {
                ErrorKind::NotFound
            }
            MatrixError::Api { status, .. } if *status == StatusCode::CONFLICT => {
                ErrorKind::Conflict
            }
            MatrixError::Api { .. } => ErrorKind::MalformedInput,
            MatrixError::Transport(_) => ErrorKind::TransientNetwork,
            MatrixError::Decode(_) => ErrorKind::MalformedInput,
            MatrixError::RateLimited { .. } => ErrorKind::RateLimited,
            MatrixError::AuthExpired(_) => ErrorKind::AuthExpired,
        }
    }

    pub fn errcode(&self) -> Option<&str> {
        match self {
            MatrixError::Api { errcode, .. } => Some(errcode),
            _ => None,
        }
    }

    fn is_user_in_use(&self) -> bool {
        self.errcode() == Some("M_USER_IN_USE")
    }
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub device_id: Option<String>,
}

/// Outcome of `sync` surfaced as the incremental delta plus the cursor
/// callers must pass back in as `since` (spec.md §4.L3).
pub struct SyncResult {
    pub next_batch: String,
    pub rooms: SyncRooms,
}

pub struct MatrixClient {
    http: Client,
    homeserver_url: String,
    tokens: DashMap<OwnedUserId, CachedToken>,
}

impl MatrixClient {
    pub fn new(homeserver_url: impl Into<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client builds"),
            homeserver_url: homeserver_url.into(),
            tokens: DashMap::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.homeserver_url.trim_end_matches('/'), path)
    }

    pub fn cached_token(&self, user_id: &OwnedUserId) -> Option<CachedToken> {
        self.tokens.get(user_id).map(|t| t.clone())
    }

    pub fn cache_token(&self, user_id: OwnedUserId, token: CachedToken) {
        self.tokens.insert(user_id, token);
    }

    pub fn clear_token(&self, user_id: &OwnedUserId) {
        self.tokens.remove(user_id);
    }

    async fn decode_error(resp: reqwest::Response) -> MatrixError {
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("retry_after_ms").and_then(Value::as_u64))
                .unwrap_or(1000);
            return MatrixError::RateLimited { retry_after_ms };
        }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let errcode = body
            .get("errcode")
            .and_then(Value::as_str)
            .unwrap_or("M_UNKNOWN")
            .to_string();
        let error = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        if errcode == "M_LIMIT_EXCEEDED" {
            let retry_after_ms = body.get("retry_after_ms").and_then(Value::as_u64).unwrap_or(1000);
            return MatrixError::RateLimited { retry_after_ms };
        }
        MatrixError::Api {
            status,
            errcode,
            error,
        }
    }

    /// Executes `f` (one attempt), retrying on `M_LIMIT_EXCEEDED` with
    /// capped exponential backoff plus jitter (spec.md §4.L3).
    async fn with_rate_limit_retry<T, F, Fut>(&self, mut f: F) -> Result<T, MatrixError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, MatrixError>>,
    {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        loop {
            match f().await {
                Err(MatrixError::RateLimited { retry_after_ms }) => {
                    tracing::warn!(retry_after_ms, "matrix rate-limited, backing off");
                    if backoff.attempts() >= 3 {
                        return Err(MatrixError::RateLimited { retry_after_ms });
                    }
                    let delay = backoff.next_delay().max(Duration::from_millis(retry_after_ms));
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    pub async fn login(
        &self,
        user: &str,
        password: &str,
    ) -> Result<(String, String), MatrixError> {
        let resp = self
            .http
            .post(self.url("/_matrix/client/v3/login"))
            .json(&json!({
                "type": "m.login.password",
                "identifier": {"type": "m.id.user", "user": user},
                "password": password,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::decode_error(resp).await);
        }
        let body: Value = resp.json().await?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| {
                MatrixError::Decode(<serde_json::Error as serde::de::Error>::custom(
                    "missing access_token",
                ))
            })?
            .to_string();
        let device_id = body["device_id"].as_str().unwrap_or_default().to_string();
        Ok((access_token, device_id))
    }

    /// Idempotent: `M_USER_IN_USE` is treated as success-with-login
    /// fallback (spec.md §4.L3).
    pub async fn register(&self, user: &str, password: &str) -> Result<String, MatrixError> {
        let resp = self
            .http
            .post(self.url("/_matrix/client/v3/register"))
            .json(&json!({
                "username": user,
                "password": password,
                "auth": {"type": "m.login.dummy"},
                "inhibit_login": false,
            }))
            .send()
            .await?;
        if resp.status().is_success() {
            let body: Value = resp.json().await?;
            return Ok(body["access_token"].as_str().unwrap_or_default().to_string());
        }
        let err = Self::decode_error(resp).await;
        if err.is_user_in_use() {
            let (token, _device) = self.login(user, password).await?;
            return Ok(token);
        }
        Err(err)
    }

    pub async fn whoami(&self, token: &str) -> Result<OwnedUserId, MatrixError> {
        let resp = self
            .http
            .get(self.url("/_matrix/client/v3/account/whoami"))
            .bearer_auth(token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::decode_error(resp).await);
        }
        let body: Value = resp.json().await?;
        let user_id = body["user_id"].as_str().unwrap_or_default();
        OwnedUserId::try_from(user_id)
            .map_err(|_| MatrixError::Api {
                status: StatusCode::OK,
                errcode: "M_MALFORMED".to_string(),
                error: "malformed user_id in whoami response".to_string(),
            })
    }

    pub async fn create_room(
        &self,
        spec: &CreateRoomSpec,
        token: &str,
    ) -> Result<OwnedRoomId, MatrixError> {
        let mut body = json!({
            "preset": spec.preset.as_str(),
            "invite": spec.invite.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
        });
        if let Some(name) = &spec.name {
            body["name"] = json!(name);
        }
        if let Some(topic) = &spec.topic {
            body["topic"] = json!(topic);
        }
        if spec.is_space {
            body["creation_content"] = json!({"type": "m.space"});
        }
        if let Some(pl) = &spec.power_level_overrides {
            body["power_level_content_override"] = pl.clone();
        }
        self.with_rate_limit_retry(|| async {
            let resp = self
                .http
                .post(self.url("/_matrix/client/v3/createRoom"))
                .bearer_auth(token)
                .json(&body)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(Self::decode_error(resp).await);
            }
            let decoded: Value = resp.json().await?;
            let room_id = decoded["room_id"].as_str().unwrap_or_default();
            OwnedRoomId::try_from(room_id).map_err(|_| MatrixError::Api {
                status: StatusCode::OK,
                errcode: "M_MALFORMED".to_string(),
                error: "malformed room_id in createRoom response".to_string(),
            })
        })
        .await
    }

    pub async fn put_state(
        &self,
        room: &OwnedRoomId,
        event_type: &str,
        state_key: &str,
        body: &Value,
        token: &str,
    ) -> Result<(), MatrixError> {
        self.with_rate_limit_retry(|| async {
            let resp = self
                .http
                .put(self.url(&format!(
                    "/_matrix/client/v3/rooms/{room}/state/{event_type}/{state_key}"
                )))
                .bearer_auth(token)
                .json(body)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(Self::decode_error(resp).await);
            }
            Ok(())
        })
        .await
    }

    pub async fn get_state(
        &self,
        room: &OwnedRoomId,
        event_type: &str,
        state_key: &str,
        token: &str,
    ) -> Result<Option<Value>, MatrixError> {
        let resp = self
            .http
            .get(self.url(&format!(
                "/_matrix/client/v3/rooms/{room}/state/{event_type}/{state_key}"
            )))
            .bearer_auth(token)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::decode_error(resp).await);
        }
        Ok(Some(resp.json().await?))
    }

    pub async fn joined_members(
        &self,
        room: &OwnedRoomId,
        token: &str,
    ) -> Result<Vec<OwnedUserId>, MatrixError> {
        let resp = self
            .http
            .get(self.url(&format!("/_matrix/client/v3/rooms/{room}/joined_members")))
            .bearer_auth(token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::decode_error(resp).await);
        }
        let body: Value = resp.json().await?;
        let joined = body["joined"].as_object().cloned().unwrap_or_default();
        Ok(joined
            .keys()
            .filter_map(|k| OwnedUserId::try_from(k.as_str()).ok())
            .collect())
    }

    pub async fn invite(
        &self,
        room: &OwnedRoomId,
        user: &OwnedUserId,
        token: &str,
    ) -> Result<(), MatrixError> {
        self.with_rate_limit_retry(|| async {
            let resp = self
                .http
                .post(self.url(&format!("/_matrix/client/v3/rooms/{room}/invite")))
                .bearer_auth(token)
                .json(&json!({"user_id": user.to_string()}))
                .send()
                .await?;
            if resp.status().is_success() {
                return Ok(());
            }
            let err = Self::decode_error(resp).await;
            // Already invited/joined is idempotent success (spec.md §7 Conflict).
            if err.kind() == ErrorKind::Conflict {
                return Ok(());
            }
            Err(err)
        })
        .await
    }

    pub async fn join(&self, room: &OwnedRoomId, token: &str) -> Result<(), MatrixError> {
        self.with_rate_limit_retry(|| async {
            let resp = self
                .http
                .post(self.url(&format!("/_matrix/client/v3/rooms/{room}/join")))
                .bearer_auth(token)
                .json(&json!({}))
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(Self::decode_error(resp).await);
            }
            Ok(())
        })
        .await
    }

    pub async fn leave(&self, room: &OwnedRoomId, token: &str) -> Result<(), MatrixError> {
        let resp = self
            .http
            .post(self.url(&format!("/_matrix/client/v3/rooms/{room}/leave")))
            .bearer_auth(token)
            .json(&json!({}))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::decode_error(resp).await);
        }
        Ok(())
    }

    /// `txn_id` MUST be stable across retries for idempotence (spec.md §4.L3,
    /// R2): the same logical send with the same `txn_id` yields one event.
    pub async fn send_message(
        &self,
        room: &OwnedRoomId,
        content: &RoomMessageContent,
        token: &str,
        txn_id: &str,
    ) -> Result<OwnedEventId, MatrixError> {
        self.with_rate_limit_retry(|| async {
            let resp = self
                .http
                .put(self.url(&format!(
                    "/_matrix/client/v3/rooms/{room}/send/m.room.message/{txn_id}"
                )))
                .bearer_auth(token)
                .json(content)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(Self::decode_error(resp).await);
            }
            let body: Value = resp.json().await?;
            let event_id = body["event_id"].as_str().unwrap_or_default();
            OwnedEventId::try_from(event_id).map_err(|_| MatrixError::Api {
                status: StatusCode::OK,
                errcode: "M_MALFORMED".to_string(),
                error: "malformed event_id in send response".to_string(),
            })
        })
        .await
    }

    /// Encoded as `m.relates_to { rel_type: m.replace }` (spec.md §4.L3).
    pub async fn edit_message(
        &self,
        room: &OwnedRoomId,
        original_event_id: &OwnedEventId,
        new_content: RoomMessageContent,
        token: &str,
        txn_id: &str,
    ) -> Result<OwnedEventId, MatrixError> {
        let mut fallback = new_content.clone();
        fallback.body = format!("* {}", fallback.body);
        let wrapper = RoomMessageContent {
            relates_to: Some(RelatesTo {
                rel_type: Some("m.replace".to_string()),
                event_id: Some(original_event_id.clone()),
                in_reply_to: None,
                new_content: Some(Box::new(new_content)),
            }),
            ..fallback
        };
        self.send_message(room, &wrapper, token, txn_id).await
    }

    pub async fn redact(
        &self,
        room: &OwnedRoomId,
        event_id: &OwnedEventId,
        token: &str,
        txn_id: &str,
    ) -> Result<(), MatrixError> {
        let resp = self
            .http
            .put(self.url(&format!(
                "/_matrix/client/v3/rooms/{room}/redact/{event_id}/{txn_id}"
            )))
            .bearer_auth(token)
            .json(&json!({}))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::decode_error(resp).await);
        }
        Ok(())
    }

    /// Long-poll; blocks up to `timeout_ms` (spec.md §5).
    pub async fn sync(
        &self,
        since: Option<&str>,
        timeout_ms: u64,
        token: &str,
    ) -> Result<SyncResult, MatrixError> {
        let mut url = self.url(&format!("/_matrix/client/v3/sync?timeout={timeout_ms}"));
        if let Some(since) = since {
            url.push_str(&format!("&since={since}"));
        }
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .timeout(Duration::from_millis(timeout_ms + 10_000))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::decode_error(resp).await);
        }
        let decoded: SyncResponse = resp.json().await?;
        Ok(SyncResult {
            next_batch: decoded.next_batch,
            rooms: decoded.rooms,
        })
    }

    pub async fn upload(
        &self,
        bytes: Vec<u8>,
        mime: &str,
        token: &str,
    ) -> Result<String, MatrixError> {
        let resp = self
            .http
            .post(self.url("/_matrix/media/v3/upload"))
            .bearer_auth(token)
            .header("Content-Type", mime)
            .body(bytes)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::decode_error(resp).await);
        }
        let body: Value = resp.json().await?;
        Ok(body["content_uri"].as_str().unwrap_or_default().to_string())
    }

    pub async fn profile_set_displayname(
        &self,
        user: &OwnedUserId,
        name: &str,
        token: &str,
    ) -> Result<(), MatrixError> {
        let resp = self
            .http
            .put(self.url(&format!("/_matrix/client/v3/profile/{user}/displayname")))
            .bearer_auth(token)
            .json(&json!({"displayname": name}))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::decode_error(resp).await);
        }
        Ok(())
    }

    /// Ensures a cached, validated token for `user`: uses the cached token
    /// if present; on `401` clears the cache, re-logs-in, retries once
    /// (spec.md §4.L3, §7 AuthExpired).
    pub async fn ensure_token(
        &self,
        user: &OwnedUserId,
        password: &str,
    ) -> Result<String, MatrixError> {
        if let Some(cached) = self.cached_token(user) {
            return Ok(cached.access_token);
        }
        let (token, device_id) = self.login(user.as_str(), password).await?;
        self.cache_token(
            user.clone(),
            CachedToken {
                access_token: token.clone(),
                device_id: Some(device_id),
            },
        );
        Ok(token)
    }
}

pub fn new_txn_id() -> String {
    format!("{}-{}", uuid::Uuid::new_v4(), chrono::Utc::now().timestamp_millis())
}
