//! Bidirectional bridge between a Matrix homeserver and a fleet of AI
//! agents managed by an external agent service (spec.md §1).
//!
//! Each module owns one component from spec.md §2: `dedupe` (L1),
//! `mapping` (L2), `matrix` (L3), `agent_service` (L4), `provisioner`
//! (M1), `reconciler` (M2), `ingestor` (M3), `router` (C1), `streamer`
//! (C2), `http` (X1). `config`, `error`, `alert`, `envelope`, and
//! `context` are the ambient modules this crate adds around them
//! (SPEC_FULL.md §2).

pub mod agent_service;
pub mod alert;
pub mod config;
pub mod context;
pub mod dedupe;
pub mod envelope;
pub mod error;
pub mod http;
pub mod ingestor;
pub mod mapping;
pub mod matrix;
pub mod provisioner;
pub mod reconciler;
pub mod router;
pub mod streamer;

pub use config::Config;
pub use context::Context;
pub use error::{BridgeError, Result};

use std::sync::Arc;
use std::time::Duration;

use sqlx::AnyPool;

use crate::agent_service::{AgentServiceAdapter, AgentServiceClient};
use crate::alert::AlertSink;
use crate::dedupe::{EventDedupeStore, SqlDedupeStore};
use crate::http::HttpState;
use crate::ingestor::SyncIngestor;
use crate::mapping::{MappingStore, SqlMappingStore};
use crate::matrix::{MatrixClient, OwnedUserId};
use crate::provisioner::Provisioner;
use crate::reconciler::Reconciler;
use crate::router::MessageRouter;
use crate::streamer::DisplayMode;
use dashmap::DashMap;

/// Applies the embedded schema (`agent_mappings`, `invitation_status`,
/// `conversation_bindings`, `event_dedupe`) to whichever backend
/// `DATABASE_URL` points at (spec.md §6, SPEC_FULL.md §3).
pub async fn connect_and_migrate(database_url: &str) -> Result<AnyPool> {
    sqlx::any::install_default_drivers();
    let pool = AnyPool::connect(database_url)
        .await
        .map_err(|e| BridgeError::Config(format!("failed to connect to DATABASE_URL: {e}")))?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| BridgeError::Config(format!("migration failed: {e}")))?;
    Ok(pool)
}

/// Coordinates all components: the reconciler, the sync ingestor, the
/// HTTP control plane, and the collaborators they share. Constructed once
/// in `main.rs` and run until a shutdown signal fires (spec.md §9: no
/// global mutable state, collaborators passed by value).
pub struct Bridge {
    context: Context,
    config: Config,
    mapping: Arc<dyn MappingStore>,
    dedupe: Arc<dyn EventDedupeStore>,
    matrix: Arc<MatrixClient>,
    reconciler: Arc<Reconciler>,
    ingestor: Arc<SyncIngestor>,
    http_state: HttpState,
}

impl Bridge {
    pub async fn new(config: Config) -> Result<Self> {
        let context = Context::new();
        let pool = connect_and_migrate(&config.database_url).await?;

        let mapping: Arc<dyn MappingStore> = Arc::new(SqlMappingStore::new(pool.clone()));
        let dedupe: Arc<dyn EventDedupeStore> =
            Arc::new(SqlDedupeStore::new(pool, config.dedupe_ttl));

        let matrix = Arc::new(MatrixClient::new(config.matrix_homeserver_url.clone()));
        let agent_service: Arc<dyn AgentServiceAdapter> = Arc::new(AgentServiceClient::new(
            config.agent_service_url.clone(),
            config.agent_service_token.clone(),
        ));
        let alerts = Arc::new(AlertSink::new(config.alert_url.clone(), config.alert_topic.clone()));

        let admin_user = OwnedUserId::try_from(config.matrix_admin_user.as_str())
            .map_err(|_| BridgeError::Config("MATRIX_ADMIN_USER is not a valid mxid".to_string()))?;
        let bot_user = OwnedUserId::try_from(config.matrix_bot_user.as_str())
            .map_err(|_| BridgeError::Config("MATRIX_BOT_USER is not a valid mxid".to_string()))?;
        let core_invitees: Vec<OwnedUserId> = config
            .core_invitee_mxids
            .iter()
            .filter_map(|m| OwnedUserId::try_from(m.as_str()).ok())
            .collect();

        let server_name = config
            .matrix_homeserver_url
            .rsplit('/')
            .next()
            .unwrap_or(&config.matrix_homeserver_url)
            .to_string();

        let provisioner = Arc::new(Provisioner::new(
            matrix.clone(),
            mapping.clone(),
            agent_service.clone(),
            server_name,
            admin_user.clone(),
            config.matrix_admin_password.clone(),
            core_invitees,
        ));

        let reconciler = Arc::new(Reconciler::new(
            agent_service.clone(),
            mapping.clone(),
            provisioner,
            alerts.clone(),
            config.soft_delete_grace,
            config.disabled_agent_ids.clone(),
        ));

        let display_mode = if config.live_edit_mode {
            DisplayMode::LiveEdit
        } else {
            DisplayMode::ProgressThenDelete
        };
        let router = Arc::new(MessageRouter::new(
            matrix.clone(),
            mapping.clone(),
            agent_service,
            display_mode,
            alerts,
            config.max_queue,
            config.idle_timeout,
            config.total_timeout,
            config.streaming_enabled,
        ));

        let bot_token = matrix
            .ensure_token(&bot_user, &config.matrix_bot_password)
            .await?;

        let ingestor = Arc::new(SyncIngestor::new(
            matrix.clone(),
            dedupe.clone(),
            mapping.clone(),
            router,
            bot_user,
            config.matrix_bot_password.clone(),
            bot_token,
            admin_user,
            config.sync_timeout,
        ));

        let http_state = HttpState {
            mapping: mapping.clone(),
            reconciler: reconciler.clone(),
            webhook_secret: config.webhook_secret.clone(),
            require_webhook_signature: config.require_webhook_signature,
            webhook_audit: Arc::new(DashMap::new()),
        };

        Ok(Self {
            context,
            config,
            mapping,
            dedupe,
            matrix,
            reconciler,
            ingestor,
            http_state,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Runs the bridge until `trigger_shutdown` is called, following the
    /// shutdown order of spec.md §5: ingestor closes first, router drains
    /// (bounded by `router_drain_timeout`), reconciler aborts, HTTP server
    /// drains, stores close.
    pub async fn run(self) -> Result<()> {
        dedupe::SqlDedupeStore::spawn_sweeper(self.dedupe.clone(), Duration::from_secs(60));

        let reconciler_handle = self.reconciler.clone().spawn(self.config.reconcile_interval);

        let ingestor = self.ingestor.clone();
        let ingestor_shutdown = self.context.shutdown_signal();
        let ingestor_handle = tokio::spawn(async move {
            ingestor.run(ingestor_shutdown).await;
        });

        let http_shutdown = self.context.shutdown_signal();
        let http_result = crate::http::serve(&self.config.bind_addr, self.http_state, http_shutdown).await;

        // HTTP serve returns once its own shutdown future resolves; join
        // the ingestor (it exits on the same signal) and tear down the
        // reconcile loop.
        let _ = ingestor_handle.await;
        reconciler_handle.abort();

        if let Err(e) = http_result {
            tracing::error!(error = %e, "HTTP control plane exited with error");
        }

        // Dropping `self.mapping`/`self.matrix` here closes pooled
        // connections; nothing else to explicitly flush.
        let _ = &self.mapping;
        let _ = &self.matrix;
        Ok(())
    }
}
