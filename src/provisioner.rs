//! M1 — User/Room/Space Provisioner (spec.md §4.M1).
//!
//! Takes one (possibly incomplete) `AgentMapping` row and converges it to
//! fully provisioned: Matrix user registered, display name set, room
//! created with the right preset/topic/state, agent invited and
//! auto-joined, Space linked bidirectionally, and a bounded history import
//! posted. Every step checks current state before acting so a partially
//! provisioned row converges in at most one further reconcile pass.

use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;
use thiserror::Error;

use crate::agent_service::{AgentServiceAdapter, AgentServiceError};
use crate::error::ErrorKind;
use crate::mapping::{AgentMapping, InviteStatus, MappingError, MappingStore};
use crate::matrix::client::new_txn_id;
use crate::matrix::{
    CreateRoomSpec, MatrixClient, MatrixError, OwnedRoomId, OwnedUserId, RoomMessageContent,
    SpaceChildContent, SpaceParentContent,
};

/// Number of historical agent-service messages imported into a freshly
/// created room (spec.md §4.M1: "a bounded history-import").
const HISTORY_IMPORT_LIMIT: usize = 20;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    AgentService(#[from] AgentServiceError),
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::Matrix(e) => e.kind(),
            ProvisionError::Mapping(e) => e.kind(),
            ProvisionError::AgentService(e) => e.kind(),
        }
    }
}

/// Deterministic from the immutable `agent_id`, never from the mutable
/// name — renames must not orphan users or rooms (spec.md §4.M1). Every
/// non-alphanumeric character becomes `_`; case is preserved to match the
/// literal mxid spec.md §8 E2E-Discovery pins (`agent-A1` -> `agent_A1`).
pub fn derive_matrix_user_local_part(agent_id: &str) -> String {
    let sanitized: String = agent_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("agent_{sanitized}")
}

fn generate_password() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct Provisioner {
    matrix: Arc<MatrixClient>,
    mapping: Arc<dyn MappingStore>,
    agent_service: Arc<dyn AgentServiceAdapter>,
    server_name: String,
    admin_user: OwnedUserId,
    admin_password: String,
    core_invitee_mxids: Vec<OwnedUserId>,
}

/// The canonical Space's room id, stored separately from agent mappings
/// (spec.md §3: "Space Descriptor — a single record").
#[derive(Debug, Clone)]
pub struct SpaceDescriptor {
    pub space_room_id: OwnedRoomId,
}

impl Provisioner {
    pub fn new(
        matrix: Arc<MatrixClient>,
        mapping: Arc<dyn MappingStore>,
        agent_service: Arc<dyn AgentServiceAdapter>,
        server_name: String,
        admin_user: OwnedUserId,
        admin_password: String,
        core_invitee_mxids: Vec<OwnedUserId>,
    ) -> Self {
        Self {
            matrix,
            mapping,
            agent_service,
            server_name,
            admin_user,
            admin_password,
            core_invitee_mxids,
        }
    }

    async fn admin_token(&self) -> Result<String, ProvisionError> {
        Ok(self
            .matrix
            .ensure_token(&self.admin_user, &self.admin_password)
            .await?)
    }

    /// Ensures the canonical Space exists, creating it once if absent.
    pub async fn ensure_space(&self) -> Result<SpaceDescriptor, ProvisionError> {
        let token = self.admin_token().await?;
        if let Some(existing) = self.mapping.get_by_agent_id("__space__").await? {
            if let Some(room_id) = existing.room_id {
                return Ok(SpaceDescriptor {
                    space_room_id: OwnedRoomId::try_from(room_id.as_str())
                        .expect("stored room id is well-formed"),
                });
            }
        }
        let spec = CreateRoomSpec::space("Agents", "Agent fleet space");
        let room_id = self.matrix.create_room(&spec, &token).await?;
        let now = Utc::now();
        self.mapping
            .upsert(&AgentMapping {
                agent_id: "__space__".to_string(),
                agent_name: "__space__".to_string(),
                matrix_user_id: self.admin_user.to_string(),
                matrix_password: String::new(),
                room_id: Some(room_id.to_string()),
                room_created: true,
                created_at: now,
                updated_at: now,
                removed_at: None,
            })
            .await?;
        Ok(SpaceDescriptor {
            space_room_id: room_id,
        })
    }

    /// Converges one mapping row toward fully provisioned. Idempotent:
    /// safe to call repeatedly as the reconciler does on every cycle.
    #[tracing::instrument(skip(self, space), fields(agent_id = %mapping.agent_id))]
    pub async fn provision(
        &self,
        mapping: &mut AgentMapping,
        space: &SpaceDescriptor,
    ) -> Result<(), ProvisionError> {
        let local_part = derive_matrix_user_local_part(&mapping.agent_id);
        let matrix_user_id = format!("@{local_part}:{}", self.server_name);
        if mapping.matrix_password.is_empty() {
            mapping.matrix_password = generate_password();
        }
        mapping.matrix_user_id = matrix_user_id.clone();
        let user_id = OwnedUserId::try_from(matrix_user_id.as_str())
            .map_err(|_| MatrixError::Api {
                status: reqwest::StatusCode::BAD_REQUEST,
                errcode: "M_MALFORMED".to_string(),
                error: format!("derived user id {matrix_user_id} is not a valid mxid"),
            })?;

        // Register is idempotent (M_USER_IN_USE -> login fallback).
        let agent_token = self
            .matrix
            .register(&local_part, &mapping.matrix_password)
            .await?;
        self.matrix.cache_token(
            user_id.clone(),
            crate::matrix::client::CachedToken {
                access_token: agent_token.clone(),
                device_id: None,
            },
        );

        self.matrix
            .profile_set_displayname(&user_id, &mapping.agent_name, &agent_token)
            .await?;

        let admin_token = self.admin_token().await?;

        let freshly_created_room = mapping.room_id.is_none();
        if freshly_created_room {
            let room_name = format!("{} - Letta Agent Chat", mapping.agent_name);
            let topic = format!("Conversation with agent {}", mapping.agent_name);
            let spec = CreateRoomSpec::agent_room(&room_name, &topic, vec![user_id.clone()]);
            let room_id = self.matrix.create_room(&spec, &admin_token).await?;
            mapping.room_id = Some(room_id.to_string());
            mapping.room_created = true;
        } else {
            // Rename path: keep display name / room name state in sync.
            let room_id = OwnedRoomId::try_from(mapping.room_id.as_ref().unwrap().as_str())
                .expect("stored room id is well-formed");
            self.sync_room_name(&room_id, &mapping.agent_name, &admin_token)
                .await?;
        }

        let room_id = OwnedRoomId::try_from(mapping.room_id.as_ref().unwrap().as_str())
            .expect("stored room id is well-formed");

        self.ensure_agent_joined(&room_id, &user_id, &agent_token, &admin_token)
            .await?;
        self.ensure_space_linkage(&room_id, space, &admin_token).await?;
        self.ensure_core_invitees(&mapping.agent_id, &room_id, &admin_token)
            .await?;

        if freshly_created_room {
            match self
                .agent_service
                .get_recent_messages(&mapping.agent_id, HISTORY_IMPORT_LIMIT)
                .await
            {
                Ok(messages) if !messages.is_empty() => {
                    self.import_history(mapping, &agent_token, messages).await?;
                }
                Ok(_) => {}
                Err(e) => {
                    // A fresh room with no history is not fatal to provisioning.
                    tracing::warn!(agent_id = %mapping.agent_id, error = %e, "history import skipped");
                }
            }
        }

        if !mapping.room_created {
            mapping.room_created = true;
        }

        mapping.updated_at = Utc::now();
        self.mapping.upsert(mapping).await?;
        Ok(())
    }

    async fn sync_room_name(
        &self,
        room_id: &OwnedRoomId,
        agent_name: &str,
        admin_token: &str,
    ) -> Result<(), ProvisionError> {
        let room_name = format!("{agent_name} - Letta Agent Chat");
        let current = self
            .matrix
            .get_state(room_id, "m.room.name", "", admin_token)
            .await?;
        let needs_update = current
            .and_then(|v| v.get("name").and_then(|n| n.as_str().map(String::from)))
            .map(|n| n != room_name)
            .unwrap_or(true);
        if needs_update {
            self.matrix
                .put_state(
                    room_id,
                    "m.room.name",
                    "",
                    &serde_json::to_value(crate::matrix::RoomNameContent { name: room_name })
                        .unwrap(),
                    admin_token,
                )
                .await?;
            let topic = format!("Conversation with agent {agent_name}");
            self.matrix
                .put_state(
                    room_id,
                    "m.room.topic",
                    "",
                    &serde_json::to_value(crate::matrix::RoomTopicContent { topic }).unwrap(),
                    admin_token,
                )
                .await?;
        }
        Ok(())
    }

    async fn ensure_agent_joined(
        &self,
        room_id: &OwnedRoomId,
        user_id: &OwnedUserId,
        agent_token: &str,
        admin_token: &str,
    ) -> Result<(), ProvisionError> {
        let members = self.matrix.joined_members(room_id, admin_token).await?;
        if members.contains(user_id) {
            return Ok(());
        }
        self.matrix.invite(room_id, user_id, admin_token).await?;
        self.matrix.join(room_id, agent_token).await?;
        Ok(())
    }

    /// Sets `m.space.child`/`m.space.parent` both ways. If either fails,
    /// the provisioner retries on the next reconcile (spec.md §4.M1).
    async fn ensure_space_linkage(
        &self,
        room_id: &OwnedRoomId,
        space: &SpaceDescriptor,
        admin_token: &str,
    ) -> Result<(), ProvisionError> {
        let child = self
            .matrix
            .get_state(&space.space_room_id, "m.space.child", room_id.as_str(), admin_token)
            .await?;
        if child.is_none() {
            let content = SpaceChildContent {
                via: vec![self.server_name.clone()],
                suggested: true,
                order: None,
            };
            self.matrix
                .put_state(
                    &space.space_room_id,
                    "m.space.child",
                    room_id.as_str(),
                    &serde_json::to_value(content).unwrap(),
                    admin_token,
                )
                .await?;
        }

        let parent = self
            .matrix
            .get_state(room_id, "m.space.parent", space.space_room_id.as_str(), admin_token)
            .await?;
        if parent.is_none() {
            let content = SpaceParentContent {
                via: vec![self.server_name.clone()],
                canonical: true,
            };
            self.matrix
                .put_state(
                    room_id,
                    "m.space.parent",
                    space.space_room_id.as_str(),
                    &serde_json::to_value(content).unwrap(),
                    admin_token,
                )
                .await?;
        }
        Ok(())
    }

    /// Removes `m.space.child` on hard-delete (spec.md P6).
    pub async fn unlink_from_space(
        &self,
        room_id: &OwnedRoomId,
        space: &SpaceDescriptor,
    ) -> Result<(), ProvisionError> {
        let admin_token = self.admin_token().await?;
        self.matrix
            .put_state(
                &space.space_room_id,
                "m.space.child",
                room_id.as_str(),
                &serde_json::json!({}),
                &admin_token,
            )
            .await?;
        Ok(())
    }

    /// Invites and auto-joins the configured core users, consulting
    /// `InvitationStatus` first so an already-joined user is never
    /// re-invited on every reconcile (spec.md §4.M1, §9 "200 logins/s" bug).
    async fn ensure_core_invitees(
        &self,
        agent_id: &str,
        room_id: &OwnedRoomId,
        admin_token: &str,
    ) -> Result<(), ProvisionError> {
        if self.core_invitee_mxids.is_empty() {
            return Ok(());
        }
        let members = self.matrix.joined_members(room_id, admin_token).await?;
        for invitee in &self.core_invitee_mxids {
            if members.contains(invitee) {
                self.mapping
                    .set_invitation(agent_id, invitee.as_str(), InviteStatus::Joined)
                    .await?;
                continue;
            }
            if let Some(status) = self.mapping.get_invitation(agent_id, invitee.as_str()).await? {
                if status.status == InviteStatus::Joined {
                    continue;
                }
            }
            match self.matrix.invite(room_id, invitee, admin_token).await {
                Ok(()) => {
                    self.mapping
                        .set_invitation(agent_id, invitee.as_str(), InviteStatus::Pending)
                        .await?;
                }
                Err(e) => {
                    tracing::warn!(invitee = %invitee, error = %e, "failed to invite core user");
                    self.mapping
                        .set_invitation(agent_id, invitee.as_str(), InviteStatus::Failed)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Posts the last `HISTORY_IMPORT_LIMIT` agent-service messages into a
    /// freshly created room, each marked `m.letta_historical = true`
    /// (spec.md §4.M1).
    pub async fn import_history(
        &self,
        mapping: &AgentMapping,
        agent_token: &str,
        messages: Vec<String>,
    ) -> Result<(), ProvisionError> {
        let room_id = match &mapping.room_id {
            Some(r) => OwnedRoomId::try_from(r.as_str()).expect("stored room id is well-formed"),
            None => return Ok(()),
        };
        for body in messages.into_iter().take(HISTORY_IMPORT_LIMIT) {
            let content = RoomMessageContent::plain(body).bridge_originated().historical();
            self.matrix
                .send_message(&room_id, &content, agent_token, &new_txn_id())
                .await?;
        }
        Ok(())
    }
}
