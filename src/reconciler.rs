//! M2 — Lifecycle Reconciler (spec.md §4.M2).
//!
//! Periodic control loop (plus webhook-triggered immediate runs) that
//! diffs the agent-service registry against the Mapping Store and
//! provisions/renames/soft-deletes accordingly. Reconcile cycles are
//! serialized: one at a time regardless of how many triggers arrive
//! (spec.md §5), enforced here with a `tokio::sync::Mutex` around the
//! cycle body.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::agent_service::AgentServiceAdapter;
use crate::alert::AlertSink;
use crate::mapping::{AgentMapping, MappingStore};
use crate::provisioner::{Provisioner, SpaceDescriptor};

/// An agent fails this many consecutive reconcile cycles before an alert
/// fires (spec.md §4.M2: "An alert fires if the same agent fails N
/// consecutive cycles").
const CONSECUTIVE_FAILURE_ALERT_THRESHOLD: u32 = 3;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileStats {
    pub provisioned: u32,
    pub renamed: u32,
    pub soft_deleted: u32,
    pub undeleted: u32,
    pub hard_deleted: u32,
    pub errors: u32,
}

pub struct Reconciler {
    agent_service: Arc<dyn AgentServiceAdapter>,
    mapping: Arc<dyn MappingStore>,
    provisioner: Arc<Provisioner>,
    alerts: Arc<AlertSink>,
    soft_delete_grace: Duration,
    disabled_agent_ids: HashSet<String>,
    consecutive_failures: DashMap<String, u32>,
    cycle_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        agent_service: Arc<dyn AgentServiceAdapter>,
        mapping: Arc<dyn MappingStore>,
        provisioner: Arc<Provisioner>,
        alerts: Arc<AlertSink>,
        soft_delete_grace: Duration,
        disabled_agent_ids: Vec<String>,
    ) -> Self {
        Self {
            agent_service,
            mapping,
            provisioner,
            alerts,
            soft_delete_grace,
            disabled_agent_ids: disabled_agent_ids.into_iter().collect(),
            consecutive_failures: DashMap::new(),
            cycle_lock: Mutex::new(()),
        }
    }

    /// Spawns the periodic reconcile loop. Returns the join handle so the
    /// caller can abort it as part of shutdown sequencing (spec.md §5).
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.reconcile_once().await {
                    tracing::error!(error = %e, "reconcile cycle failed");
                }
            }
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn reconcile_once(&self) -> Result<ReconcileStats, crate::error::BridgeError> {
        let _guard = self.cycle_lock.lock().await;
        let mut stats = ReconcileStats::default();

        let registry = self.agent_service.list_agents(50).await?;
        let registry: HashMap<String, String> = registry
            .into_iter()
            .filter(|a| !self.disabled_agent_ids.contains(&a.id))
            .map(|a| (a.id, a.name))
            .collect();

        let mappings = self.mapping.list_active().await?;
        let mut by_agent: HashMap<String, AgentMapping> = mappings
            .into_iter()
            .filter(|m| m.agent_id != "__space__")
            .map(|m| (m.agent_id.clone(), m))
            .collect();

        // Tie-break: if two mappings somehow share a room_id, the one
        // created first wins; the other is logged, never silently dropped
        // (spec.md §4.M2).
        self.detect_room_id_collisions(&by_agent).await;

        let space = self.provisioner.ensure_space().await?;

        // Discovered agents: provision.
        for (agent_id, agent_name) in &registry {
            if !by_agent.contains_key(agent_id) {
                let now = Utc::now();
                let mut mapping = AgentMapping {
                    agent_id: agent_id.clone(),
                    agent_name: agent_name.clone(),
                    matrix_user_id: String::new(),
                    matrix_password: String::new(),
                    room_id: None,
                    room_created: false,
                    created_at: now,
                    updated_at: now,
                    removed_at: None,
                };
                match self.provisioner.provision(&mut mapping, &space).await {
                    Ok(()) => {
                        stats.provisioned += 1;
                        self.consecutive_failures.remove(agent_id);
                    }
                    Err(e) => self.record_failure(agent_id, &e.to_string(), &mut stats).await,
                }
                by_agent.insert(agent_id.clone(), mapping);
                continue;
            }
        }

        // Rediscovered agents: clear removed_at.
        for (agent_id, mapping) in by_agent.iter_mut() {
            if registry.contains_key(agent_id) && mapping.removed_at.is_some() {
                self.mapping.undelete(agent_id).await?;
                mapping.removed_at = None;
                stats.undeleted += 1;
            }
        }

        // Vanished agents: soft-delete.
        for (agent_id, mapping) in by_agent.iter_mut() {
            if !registry.contains_key(agent_id) && mapping.removed_at.is_none() {
                let now = Utc::now();
                self.mapping.soft_delete(agent_id, now).await?;
                mapping.removed_at = Some(now);
                stats.soft_deleted += 1;
                tracing::info!(agent_id, "agent missing from registry, soft-deleted");
            }
        }

        // Renames.
        for (agent_id, agent_name) in &registry {
            if let Some(mapping) = by_agent.get_mut(agent_id) {
                if &mapping.agent_name != agent_name {
                    mapping.agent_name = agent_name.clone();
                    match self.provisioner.provision(mapping, &space).await {
                        Ok(()) => stats.renamed += 1,
                        Err(e) => self.record_failure(agent_id, &e.to_string(), &mut stats).await,
                    }
                }
            }
        }

        // Ensure every active mapping is fully provisioned (idempotent).
        for (agent_id, mapping) in by_agent.iter_mut() {
            if mapping.removed_at.is_none() {
                if let Err(e) = self.provisioner.provision(mapping, &space).await {
                    self.record_failure(agent_id, &e.to_string(), &mut stats).await;
                }
            }
        }

        // Hard-delete past grace window.
        let cutoff = Utc::now() - chrono::Duration::from_std(self.soft_delete_grace).unwrap();
        let expired = self.mapping.list_with_removed_at_before(cutoff).await?;
        for mapping in expired {
            if mapping.agent_id == "__space__" {
                continue;
            }
            if let Some(room_id) = &mapping.room_id {
                if let Ok(room_id) = crate::matrix::OwnedRoomId::try_from(room_id.as_str()) {
                    if let Err(e) = self.provisioner.unlink_from_space(&room_id, &space).await {
                        tracing::warn!(agent_id = %mapping.agent_id, error = %e, "failed to unlink hard-deleted room from space");
                    }
                }
            }
            self.mapping.hard_delete(&mapping.agent_id).await?;
            stats.hard_deleted += 1;
            tracing::info!(agent_id = %mapping.agent_id, "agent hard-deleted after grace window");
        }

        tracing::info!(
            provisioned = stats.provisioned,
            renamed = stats.renamed,
            soft_deleted = stats.soft_deleted,
            undeleted = stats.undeleted,
            hard_deleted = stats.hard_deleted,
            errors = stats.errors,
            "reconcile cycle complete"
        );
        Ok(stats)
    }

    async fn record_failure(&self, agent_id: &str, detail: &str, stats: &mut ReconcileStats) {
        stats.errors += 1;
        tracing::warn!(agent_id, detail, "per-agent reconcile error, continuing loop");
        let count = {
            let mut entry = self.consecutive_failures.entry(agent_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count >= CONSECUTIVE_FAILURE_ALERT_THRESHOLD {
            self.alerts
                .fire(
                    &format!("reconcile-failure-{agent_id}"),
                    &format!("agent {agent_id} failed {count} consecutive reconcile cycles: {detail}"),
                )
                .await;
        }
    }

    async fn detect_room_id_collisions(&self, by_agent: &HashMap<String, AgentMapping>) {
        let mut seen: HashMap<&str, &AgentMapping> = HashMap::new();
        for mapping in by_agent.values() {
            let Some(room_id) = mapping.room_id.as_deref() else { continue };
            match seen.get(room_id) {
                None => {
                    seen.insert(room_id, mapping);
                }
                Some(existing) => {
                    let (winner, loser) = if existing.created_at <= mapping.created_at {
                        (existing, mapping)
                    } else {
                        (mapping, existing)
                    };
                    tracing::error!(
                        room_id,
                        winner = %winner.agent_id,
                        loser = %loser.agent_id,
                        "two mappings share a room_id; earliest-created wins, operator attention needed"
                    );
                    self.alerts
                        .fire(
                            &format!("room-id-collision-{room_id}"),
                            &format!(
                                "agents {} and {} both claim room {room_id}",
                                winner.agent_id, loser.agent_id
                            ),
                        )
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_service::{AgentServiceError, AgentSummary, EventStream};
    use crate::mapping::SqlMappingStore;
    use crate::matrix::MatrixClient;
    use async_trait::async_trait;
    use sqlx::AnyPool;

    struct FakeAgentService {
        agents: std::sync::Mutex<Vec<AgentSummary>>,
    }

    #[async_trait]
    impl AgentServiceAdapter for FakeAgentService {
        async fn list_agents(&self, _limit: usize) -> Result<Vec<AgentSummary>, AgentServiceError> {
            Ok(self.agents.lock().unwrap().clone())
        }
        async fn create_conversation(
            &self,
            _agent_id: &str,
            _labels: &[String],
        ) -> Result<String, AgentServiceError> {
            Ok("conv".to_string())
        }
        async fn verify_conversation(
            &self,
            _agent_id: &str,
            _conversation_id: &str,
        ) -> Result<bool, AgentServiceError> {
            Ok(true)
        }
        async fn send_streaming(
            &self,
            _agent_id: &str,
            _conversation_id: Option<&str>,
            _user_text: &str,
        ) -> Result<EventStream, AgentServiceError> {
            unimplemented!("not exercised by reconciler tests")
        }
        async fn send_nonstreaming(
            &self,
            _agent_id: &str,
            _conversation_id: Option<&str>,
            _user_text: &str,
        ) -> Result<String, AgentServiceError> {
            unimplemented!("not exercised by reconciler tests")
        }
        async fn get_recent_messages(
            &self,
            _agent_id: &str,
            _limit: usize,
        ) -> Result<Vec<String>, AgentServiceError> {
            Ok(Vec::new())
        }
    }

    async fn memory_mapping_store() -> Arc<dyn MappingStore> {
        let pool = AnyPool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE agent_mappings ( \
                agent_id TEXT PRIMARY KEY, agent_name TEXT NOT NULL, \
                matrix_user_id TEXT NOT NULL, matrix_password TEXT NOT NULL, \
                room_id TEXT, room_created INTEGER NOT NULL DEFAULT 0, \
                created_at INTEGER NOT NULL, updated_at INTEGER NOT NULL, removed_at INTEGER)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE invitation_status (agent_id TEXT NOT NULL, invitee_mxid TEXT NOT NULL, \
             status TEXT NOT NULL, updated_at INTEGER NOT NULL, PRIMARY KEY (agent_id, invitee_mxid))",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE conversation_bindings (room_id TEXT NOT NULL, agent_id TEXT NOT NULL, \
             user_mxid TEXT, conversation_id TEXT NOT NULL, strategy TEXT NOT NULL, \
             created_at INTEGER NOT NULL, last_message_at INTEGER NOT NULL, \
             PRIMARY KEY (room_id, agent_id, user_mxid))",
        )
        .execute(&pool)
        .await
        .unwrap();
        Arc::new(SqlMappingStore::new(pool))
    }

    fn consecutive_failures_threshold_is_three() {
        assert_eq!(CONSECUTIVE_FAILURE_ALERT_THRESHOLD, 3);
    }

    #[tokio::test]
    async fn disabled_agent_ids_are_filtered_out_of_the_registry_diff() {
        let mapping = memory_mapping_store().await;
        let agent_service: Arc<dyn AgentServiceAdapter> = Arc::new(FakeAgentService {
            agents: std::sync::Mutex::new(vec![
                AgentSummary { id: "a1".into(), name: "A1".into() },
                AgentSummary { id: "a2".into(), name: "A2".into() },
            ]),
        });
        let matrix = Arc::new(MatrixClient::new("http://localhost:1"));
        let provisioner = Arc::new(Provisioner::new(
            matrix,
            mapping.clone(),
            agent_service.clone(),
            "server".to_string(),
            crate::matrix::OwnedUserId::try_from("@admin:server").unwrap(),
            "pw".to_string(),
            vec![],
        ));
        let alerts = Arc::new(AlertSink::new(None, None));
        let reconciler = Reconciler::new(
            agent_service,
            mapping,
            provisioner,
            alerts,
            Duration::from_secs(7200),
            vec!["a2".to_string()],
        );
        assert!(reconciler.disabled_agent_ids.contains("a2"));
        assert!(!reconciler.disabled_agent_ids.contains("a1"));
        consecutive_failures_threshold_is_three();
    }
}
