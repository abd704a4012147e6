//! L2 — Mapping Store (spec.md §4.L2, §3).
//!
//! Durable `agent_id -> {matrix_user, password, room_id, ...}` mapping plus
//! per-(room, agent[, user]) conversation bindings and per-invitee join
//! status. Backed by `sqlx::AnyPool` so the same queries run against
//! Postgres in production and SQLite in tests (spec.md §6).

use chrono::{DateTime, Utc};
use sqlx::{AnyPool, Row};
use thiserror::Error;

use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMapping {
    pub agent_id: String,
    pub agent_name: String,
    pub matrix_user_id: String,
    pub matrix_password: String,
    pub room_id: Option<String>,
    pub room_created: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl AgentMapping {
    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }
}

/// Password-free projection (spec.md §4.L2: "MUST NOT expose passwords
/// through any listing call that an HTTP endpoint can reach").
#[derive(Debug, Clone, serde::Serialize)]
pub struct MappingSummary {
    pub agent_id: String,
    pub agent_name: String,
    pub matrix_user_id: String,
    pub room_id: Option<String>,
    pub room_created: bool,
    pub created_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl From<&AgentMapping> for MappingSummary {
    fn from(m: &AgentMapping) -> Self {
        Self {
            agent_id: m.agent_id.clone(),
            agent_name: m.agent_name.clone(),
            matrix_user_id: m.matrix_user_id.clone(),
            room_id: m.room_id.clone(),
            room_created: m.room_created,
            created_at: m.created_at,
            removed_at: m.removed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum InviteStatus {
    Pending,
    Joined,
    Failed,
}

impl InviteStatus {
    fn as_str(&self) -> &'static str {
        match self {
            InviteStatus::Pending => "pending",
            InviteStatus::Joined => "joined",
            InviteStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "joined" => InviteStatus::Joined,
            "failed" => InviteStatus::Failed,
            _ => InviteStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvitationStatus {
    pub agent_id: String,
    pub invitee_mxid: String,
    pub status: InviteStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStrategy {
    PerRoom,
    PerUser,
}

impl ConversationStrategy {
    /// DM rooms (exactly two members) isolate context per user; group
    /// rooms share one conversation per agent (spec.md §3).
    pub fn for_member_count(member_count: usize) -> Self {
        if member_count == 2 {
            ConversationStrategy::PerUser
        } else {
            ConversationStrategy::PerRoom
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationBinding {
    pub room_id: String,
    pub agent_id: String,
    pub user_mxid: Option<String>,
    pub conversation_id: String,
    pub strategy: ConversationStrategy,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("mapping store connectivity error: {0}")]
    Connectivity(#[from] sqlx::Error),

    #[error("data integrity violation: duplicate room_id {0}")]
    DuplicateRoomId(String),

    #[error("no mapping for agent {0}")]
    NotFound(String),
}

impl MappingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MappingError::Connectivity(_) => ErrorKind::TransientNetwork,
            MappingError::DuplicateRoomId(_) => ErrorKind::Fatal,
            MappingError::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

#[async_trait::async_trait]
pub trait MappingStore: Send + Sync {
    async fn get_by_agent_id(&self, agent_id: &str) -> Result<Option<AgentMapping>, MappingError>;
    async fn get_by_matrix_user(&self, mxid: &str) -> Result<Option<AgentMapping>, MappingError>;
    async fn get_by_room(&self, room_id: &str) -> Result<Option<AgentMapping>, MappingError>;
    async fn list_active(&self) -> Result<Vec<AgentMapping>, MappingError>;
    async fn list_with_removed_at_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AgentMapping>, MappingError>;
    async fn upsert(&self, mapping: &AgentMapping) -> Result<(), MappingError>;
    async fn soft_delete(&self, agent_id: &str, at: DateTime<Utc>) -> Result<(), MappingError>;
    async fn undelete(&self, agent_id: &str) -> Result<(), MappingError>;
    async fn hard_delete(&self, agent_id: &str) -> Result<(), MappingError>;

    async fn get_invitation(
        &self,
        agent_id: &str,
        invitee: &str,
    ) -> Result<Option<InvitationStatus>, MappingError>;
    async fn set_invitation(
        &self,
        agent_id: &str,
        invitee: &str,
        status: InviteStatus,
    ) -> Result<(), MappingError>;

    async fn get_conversation(
        &self,
        room_id: &str,
        agent_id: &str,
        user_mxid: Option<&str>,
    ) -> Result<Option<ConversationBinding>, MappingError>;
    async fn set_conversation(&self, binding: &ConversationBinding) -> Result<(), MappingError>;
    async fn drop_conversation(
        &self,
        room_id: &str,
        agent_id: &str,
        user_mxid: Option<&str>,
    ) -> Result<(), MappingError>;
}

pub struct SqlMappingStore {
    pool: AnyPool,
}

impl SqlMappingStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    fn row_to_mapping(row: &sqlx::any::AnyRow) -> Result<AgentMapping, MappingError> {
        Ok(AgentMapping {
            agent_id: row.try_get("agent_id")?,
            agent_name: row.try_get("agent_name")?,
            matrix_user_id: row.try_get("matrix_user_id")?,
            matrix_password: row.try_get("matrix_password")?,
            room_id: row.try_get("room_id")?,
            room_created: row.try_get::<i64, _>("room_created")? != 0,
            created_at: DateTime::from_timestamp(row.try_get("created_at")?, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(row.try_get("updated_at")?, 0).unwrap_or_default(),
            removed_at: row
                .try_get::<Option<i64>, _>("removed_at")?
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        })
    }
}

#[async_trait::async_trait]
impl MappingStore for SqlMappingStore {
    async fn get_by_agent_id(&self, agent_id: &str) -> Result<Option<AgentMapping>, MappingError> {
        let row = sqlx::query("SELECT * FROM agent_mappings WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_mapping).transpose()
    }

    async fn get_by_matrix_user(&self, mxid: &str) -> Result<Option<AgentMapping>, MappingError> {
        let row = sqlx::query("SELECT * FROM agent_mappings WHERE matrix_user_id = ?")
            .bind(mxid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_mapping).transpose()
    }

    async fn get_by_room(&self, room_id: &str) -> Result<Option<AgentMapping>, MappingError> {
        let row = sqlx::query("SELECT * FROM agent_mappings WHERE room_id = ?")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_mapping).transpose()
    }

    async fn list_active(&self) -> Result<Vec<AgentMapping>, MappingError> {
        let rows = sqlx::query("SELECT * FROM agent_mappings WHERE removed_at IS NULL")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_mapping).collect()
    }

    async fn list_with_removed_at_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AgentMapping>, MappingError> {
        let rows = sqlx::query(
            "SELECT * FROM agent_mappings WHERE removed_at IS NOT NULL AND removed_at < ?",
        )
        .bind(cutoff.timestamp())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_mapping).collect()
    }

    async fn upsert(&self, mapping: &AgentMapping) -> Result<(), MappingError> {
        if let Some(room_id) = &mapping.room_id {
            if let Some(existing) = self.get_by_room(room_id).await? {
                if existing.agent_id != mapping.agent_id {
                    return Err(MappingError::DuplicateRoomId(room_id.clone()));
                }
            }
        }
        sqlx::query(
            "INSERT INTO agent_mappings \
                (agent_id, agent_name, matrix_user_id, matrix_password, room_id, room_created, \
                 created_at, updated_at, removed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (agent_id) DO UPDATE SET \
                agent_name = excluded.agent_name, \
                matrix_user_id = excluded.matrix_user_id, \
                matrix_password = excluded.matrix_password, \
                room_id = excluded.room_id, \
                room_created = excluded.room_created, \
                updated_at = excluded.updated_at, \
                removed_at = excluded.removed_at",
        )
        .bind(&mapping.agent_id)
        .bind(&mapping.agent_name)
        .bind(&mapping.matrix_user_id)
        .bind(&mapping.matrix_password)
        .bind(&mapping.room_id)
        .bind(mapping.room_created as i64)
        .bind(mapping.created_at.timestamp())
        .bind(mapping.updated_at.timestamp())
        .bind(mapping.removed_at.map(|t| t.timestamp()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn soft_delete(&self, agent_id: &str, at: DateTime<Utc>) -> Result<(), MappingError> {
        sqlx::query("UPDATE agent_mappings SET removed_at = ?, updated_at = ? WHERE agent_id = ?")
            .bind(at.timestamp())
            .bind(at.timestamp())
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn undelete(&self, agent_id: &str) -> Result<(), MappingError> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE agent_mappings SET removed_at = NULL, updated_at = ? WHERE agent_id = ?")
            .bind(now)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn hard_delete(&self, agent_id: &str) -> Result<(), MappingError> {
        sqlx::query("DELETE FROM invitation_status WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM conversation_bindings WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM agent_mappings WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_invitation(
        &self,
        agent_id: &str,
        invitee: &str,
    ) -> Result<Option<InvitationStatus>, MappingError> {
        let row = sqlx::query(
            "SELECT agent_id, invitee_mxid, status, updated_at FROM invitation_status \
             WHERE agent_id = ? AND invitee_mxid = ?",
        )
        .bind(agent_id)
        .bind(invitee)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            None => None,
            Some(row) => Some(InvitationStatus {
                agent_id: row.try_get("agent_id")?,
                invitee_mxid: row.try_get("invitee_mxid")?,
                status: InviteStatus::parse(&row.try_get::<String, _>("status")?),
                updated_at: DateTime::from_timestamp(row.try_get("updated_at")?, 0).unwrap_or_default(),
            }),
        })
    }

    async fn set_invitation(
        &self,
        agent_id: &str,
        invitee: &str,
        status: InviteStatus,
    ) -> Result<(), MappingError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO invitation_status (agent_id, invitee_mxid, status, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (agent_id, invitee_mxid) DO UPDATE SET \
                status = excluded.status, updated_at = excluded.updated_at",
        )
        .bind(agent_id)
        .bind(invitee)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_conversation(
        &self,
        room_id: &str,
        agent_id: &str,
        user_mxid: Option<&str>,
    ) -> Result<Option<ConversationBinding>, MappingError> {
        let row = match user_mxid {
            Some(user) => {
                sqlx::query(
                    "SELECT * FROM conversation_bindings \
                     WHERE room_id = ? AND agent_id = ? AND user_mxid = ?",
                )
                .bind(room_id)
                .bind(agent_id)
                .bind(user)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM conversation_bindings \
                     WHERE room_id = ? AND agent_id = ? AND user_mxid IS NULL",
                )
                .bind(room_id)
                .bind(agent_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(match row {
            None => None,
            Some(row) => Some(ConversationBinding {
                room_id: row.try_get("room_id")?,
                agent_id: row.try_get("agent_id")?,
                user_mxid: row.try_get("user_mxid")?,
                conversation_id: row.try_get("conversation_id")?,
                strategy: if row.try_get::<String, _>("strategy")? == "per_user" {
                    ConversationStrategy::PerUser
                } else {
                    ConversationStrategy::PerRoom
                },
                created_at: DateTime::from_timestamp(row.try_get("created_at")?, 0).unwrap_or_default(),
                last_message_at: DateTime::from_timestamp(row.try_get("last_message_at")?, 0)
                    .unwrap_or_default(),
            }),
        })
    }

    async fn set_conversation(&self, binding: &ConversationBinding) -> Result<(), MappingError> {
        let strategy = match binding.strategy {
            ConversationStrategy::PerRoom => "per_room",
            ConversationStrategy::PerUser => "per_user",
        };
        sqlx::query(
            "INSERT INTO conversation_bindings \
                (room_id, agent_id, user_mxid, conversation_id, strategy, created_at, last_message_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (room_id, agent_id, user_mxid) DO UPDATE SET \
                conversation_id = excluded.conversation_id, \
                strategy = excluded.strategy, \
                last_message_at = excluded.last_message_at",
        )
        .bind(&binding.room_id)
        .bind(&binding.agent_id)
        .bind(&binding.user_mxid)
        .bind(&binding.conversation_id)
        .bind(strategy)
        .bind(binding.created_at.timestamp())
        .bind(binding.last_message_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn drop_conversation(
        &self,
        room_id: &str,
        agent_id: &str,
        user_mxid: Option<&str>,
    ) -> Result<(), MappingError> {
        match user_mxid {
            Some(user) => {
                sqlx::query(
                    "DELETE FROM conversation_bindings \
                     WHERE room_id = ? AND agent_id = ? AND user_mxid = ?",
                )
                .bind(room_id)
                .bind(agent_id)
                .bind(user)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "DELETE FROM conversation_bindings \
                     WHERE room_id = ? AND agent_id = ? AND user_mxid IS NULL",
                )
                .bind(room_id)
                .bind(agent_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqlMappingStore {
        let pool = AnyPool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE agent_mappings ( \
                agent_id TEXT PRIMARY KEY, \
                agent_name TEXT NOT NULL, \
                matrix_user_id TEXT NOT NULL UNIQUE, \
                matrix_password TEXT NOT NULL, \
                room_id TEXT UNIQUE, \
                room_created INTEGER NOT NULL DEFAULT 0, \
                created_at INTEGER NOT NULL, \
                updated_at INTEGER NOT NULL, \
                removed_at INTEGER \
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE invitation_status ( \
                agent_id TEXT NOT NULL, \
                invitee_mxid TEXT NOT NULL, \
                status TEXT NOT NULL, \
                updated_at INTEGER NOT NULL, \
                PRIMARY KEY (agent_id, invitee_mxid) \
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE conversation_bindings ( \
                room_id TEXT NOT NULL, \
                agent_id TEXT NOT NULL, \
                user_mxid TEXT, \
                conversation_id TEXT NOT NULL, \
                strategy TEXT NOT NULL, \
                created_at INTEGER NOT NULL, \
                last_message_at INTEGER NOT NULL, \
                PRIMARY KEY (room_id, agent_id, user_mxid) \
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        SqlMappingStore::new(pool)
    }

    fn sample_mapping(agent_id: &str, name: &str) -> AgentMapping {
        let now = Utc::now();
        AgentMapping {
            agent_id: agent_id.to_string(),
            agent_name: name.to_string(),
            matrix_user_id: format!("@agent_{agent_id}:server"),
            matrix_password: "secret".to_string(),
            room_id: None,
            room_created: false,
            created_at: now,
            updated_at: now,
            removed_at: None,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = memory_store().await;
        let mapping = sample_mapping("agent-A1", "Meridian");
        store.upsert(&mapping).await.unwrap();
        let fetched = store.get_by_agent_id("agent-A1").await.unwrap().unwrap();
        assert_eq!(fetched.agent_name, "Meridian");
        assert!(fetched.is_active());
    }

    #[tokio::test]
    async fn rename_preserves_identity() {
        let store = memory_store().await;
        let mut mapping = sample_mapping("agent-A1", "Meridian");
        mapping.room_id = Some("!room:server".to_string());
        mapping.room_created = true;
        store.upsert(&mapping).await.unwrap();

        mapping.agent_name = "Meridian-v2".to_string();
        store.upsert(&mapping).await.unwrap();

        let fetched = store.get_by_agent_id("agent-A1").await.unwrap().unwrap();
        assert_eq!(fetched.agent_name, "Meridian-v2");
        assert_eq!(fetched.matrix_user_id, mapping.matrix_user_id);
        assert_eq!(fetched.room_id, Some("!room:server".to_string()));
    }

    #[tokio::test]
    async fn soft_delete_then_undelete_clears_removed_at() {
        let store = memory_store().await;
        let mapping = sample_mapping("agent-A1", "Meridian");
        store.upsert(&mapping).await.unwrap();

        let t0 = Utc::now();
        store.soft_delete("agent-A1", t0).await.unwrap();
        let fetched = store.get_by_agent_id("agent-A1").await.unwrap().unwrap();
        assert!(fetched.removed_at.is_some());

        store.undelete("agent-A1").await.unwrap();
        let fetched = store.get_by_agent_id("agent-A1").await.unwrap().unwrap();
        assert!(fetched.removed_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_room_id_is_rejected() {
        let store = memory_store().await;
        let mut a = sample_mapping("agent-A1", "A");
        a.room_id = Some("!shared:server".to_string());
        store.upsert(&a).await.unwrap();

        let mut b = sample_mapping("agent-B1", "B");
        b.room_id = Some("!shared:server".to_string());
        let err = store.upsert(&b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn conversation_bindings_are_isolated_per_room() {
        let store = memory_store().await;
        let now = Utc::now();
        let a = ConversationBinding {
            room_id: "!roomA:server".to_string(),
            agent_id: "agent-X".to_string(),
            user_mxid: None,
            conversation_id: "conv-a".to_string(),
            strategy: ConversationStrategy::PerRoom,
            created_at: now,
            last_message_at: now,
        };
        let b = ConversationBinding {
            room_id: "!roomB:server".to_string(),
            ..a.clone()
        };
        store.set_conversation(&a).await.unwrap();
        store.set_conversation(&b).await.unwrap();

        let fetched_a = store
            .get_conversation("!roomA:server", "agent-X", None)
            .await
            .unwrap()
            .unwrap();
        let fetched_b = store
            .get_conversation("!roomB:server", "agent-X", None)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(fetched_a.conversation_id, "");
        assert_eq!(fetched_a.room_id, "!roomA:server");
        assert_eq!(fetched_b.room_id, "!roomB:server");
    }

    #[test]
    fn conversation_strategy_follows_member_count() {
        assert_eq!(
            ConversationStrategy::for_member_count(2),
            ConversationStrategy::PerUser
        );
        assert_eq!(
            ConversationStrategy::for_member_count(3),
            ConversationStrategy::PerRoom
        );
    }
}
