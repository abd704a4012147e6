//! Typed configuration loaded from environment variables (spec.md §6).
//!
//! Follows the teacher's `load_server_config` pattern in `main.rs`: read
//! each key with `env::var`, fall back to a documented default, and log
//! the resolved (secret-redacted) configuration once at startup.

use std::env;
use std::time::Duration;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub matrix_homeserver_url: String,
    pub matrix_bot_user: String,
    pub matrix_bot_password: String,
    pub matrix_admin_user: String,
    pub matrix_admin_password: String,

    pub agent_service_url: String,
    pub agent_service_token: String,

    pub reconcile_interval: Duration,
    pub soft_delete_grace: Duration,
    pub dedupe_ttl: Duration,

    pub streaming_enabled: bool,
    pub live_edit_mode: bool,

    pub total_timeout: Duration,
    pub idle_timeout: Duration,

    pub database_url: String,
    pub webhook_secret: Option<String>,

    pub alert_url: Option<String>,
    pub alert_topic: Option<String>,

    pub disabled_agent_ids: Vec<String>,

    /// The configured set of MXIDs invited into every agent room as core
    /// observers (admin, bridge bot, optional auxiliary bridges; spec.md
    /// §4.M1). Not itself an env key in spec.md §6's table, but required
    /// for the Provisioner to know who to invite.
    pub core_invitee_mxids: Vec<String>,

    pub max_queue: usize,
    pub sync_timeout: Duration,
    pub bind_addr: String,
    pub require_webhook_signature: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let require = |key: &str| -> Result<String> {
            env::var(key).map_err(|_| {
                BridgeError::Config(format!("missing required environment variable {key}"))
            })
        };
        let opt_str = |key: &str| -> Option<String> { env::var(key).ok() };
        let with_default = |key: &str, default: &str| -> String {
            env::var(key).unwrap_or_else(|_| default.to_string())
        };
        let secs_default = |key: &str, default: u64| -> Duration {
            env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(default))
        };
        let bool_default = |key: &str, default: bool| -> bool {
            env::var(key)
                .ok()
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or(default)
        };

        let config = Config {
            matrix_homeserver_url: require("MATRIX_HOMESERVER_URL")?,
            matrix_bot_user: require("MATRIX_BOT_USER")?,
            matrix_bot_password: require("MATRIX_BOT_PASSWORD")?,
            matrix_admin_user: require("MATRIX_ADMIN_USER")?,
            matrix_admin_password: require("MATRIX_ADMIN_PASSWORD")?,

            agent_service_url: require("AGENT_SERVICE_URL")?,
            agent_service_token: require("AGENT_SERVICE_TOKEN")?,

            reconcile_interval: secs_default("RECONCILE_INTERVAL_S", 60),
            soft_delete_grace: secs_default("SOFT_DELETE_GRACE_S", 7200),
            dedupe_ttl: secs_default("DEDUPE_TTL_S", 3600),

            streaming_enabled: bool_default("STREAMING_ENABLED", true),
            live_edit_mode: bool_default("LIVE_EDIT_MODE", false),

            total_timeout: secs_default("TOTAL_TIMEOUT_S", 120),
            idle_timeout: secs_default("IDLE_TIMEOUT_S", 120),

            database_url: with_default("DATABASE_URL", "sqlite::memory:"),
            webhook_secret: opt_str("WEBHOOK_SECRET"),

            alert_url: opt_str("ALERT_URL"),
            alert_topic: opt_str("ALERT_TOPIC"),

            disabled_agent_ids: opt_str("DISABLED_AGENT_IDS")
                .map(|s| s.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect())
                .unwrap_or_default(),

            core_invitee_mxids: opt_str("CORE_INVITEE_MXIDS")
                .map(|s| s.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect())
                .unwrap_or_default(),

            max_queue: 8,
            sync_timeout: Duration::from_secs(30),
            bind_addr: with_default("BIND_ADDRESS", "0.0.0.0:8090"),
            require_webhook_signature: bool_default("REQUIRE_WEBHOOK_SIGNATURE", false),
        };

        Ok(config)
    }

    /// Secret-redacted summary for startup logging.
    pub fn describe(&self) -> String {
        format!(
            "homeserver={} agent_service={} reconcile_interval={:?} soft_delete_grace={:?} \
             dedupe_ttl={:?} streaming_enabled={} live_edit_mode={} bind_addr={} webhook_secret={}",
            self.matrix_homeserver_url,
            self.agent_service_url,
            self.reconcile_interval,
            self.soft_delete_grace,
            self.dedupe_ttl,
            self.streaming_enabled,
            self.live_edit_mode,
            self.bind_addr,
            if self.webhook_secret.is_some() { "set" } else { "unset" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_required_env() {
        env::set_var("MATRIX_HOMESERVER_URL", "https://matrix.example.org");
        env::set_var("MATRIX_BOT_USER", "bridgebot");
        env::set_var("MATRIX_BOT_PASSWORD", "pw");
        env::set_var("MATRIX_ADMIN_USER", "admin");
        env::set_var("MATRIX_ADMIN_PASSWORD", "pw2");
        env::set_var("AGENT_SERVICE_URL", "https://agents.example.org");
        env::set_var("AGENT_SERVICE_TOKEN", "tok");
    }

    #[test]
    fn from_env_applies_defaults() {
        set_required_env();
        env::remove_var("RECONCILE_INTERVAL_S");
        let config = Config::from_env().unwrap();
        assert_eq!(config.reconcile_interval, Duration::from_secs(60));
        assert_eq!(config.soft_delete_grace, Duration::from_secs(7200));
        assert!(!config.live_edit_mode);
        assert!(config.streaming_enabled);
    }

    #[test]
    fn from_env_missing_required_errors() {
        env::remove_var("MATRIX_HOMESERVER_URL");
        let result = Config::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn disabled_agent_ids_parses_csv() {
        set_required_env();
        env::set_var("DISABLED_AGENT_IDS", "a1, a2 ,a3");
        let config = Config::from_env().unwrap();
        assert_eq!(config.disabled_agent_ids, vec!["a1", "a2", "a3"]);
        env::remove_var("DISABLED_AGENT_IDS");
    }

    #[test]
    fn describe_never_includes_passwords() {
        set_required_env();
        let config = Config::from_env().unwrap();
        let desc = config.describe();
        assert!(!desc.contains("pw"));
    }
}
