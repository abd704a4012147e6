//! Alert sink (spec.md §4, §7): optional push-alert endpoint, deduplicated
//! in a 5-minute window per alert key. Treated as an external collaborator
//! per spec.md §1 — if `ALERT_URL`/`ALERT_TOPIC` are unset, alerts are
//! logged at `error` only.

use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use serde_json::json;
use tokio::time::Instant;

const DEDUPE_WINDOW: Duration = Duration::from_secs(300);

pub struct AlertSink {
    http: Client,
    alert_url: Option<String>,
    alert_topic: Option<String>,
    recent: DashMap<String, Instant>,
}

impl AlertSink {
    pub fn new(alert_url: Option<String>, alert_topic: Option<String>) -> Self {
        Self {
            http: Client::new(),
            alert_url,
            alert_topic,
            recent: DashMap::new(),
        }
    }

    /// Fires an alert unless the same `key` fired within the last 5
    /// minutes.
    pub async fn fire(&self, key: &str, message: &str) {
        let now = Instant::now();
        if let Some(last) = self.recent.get(key) {
            if now.duration_since(*last) < DEDUPE_WINDOW {
                tracing::debug!(alert_key = key, "alert suppressed by dedupe window");
                return;
            }
        }
        self.recent.insert(key.to_string(), now);
        tracing::error!(alert_key = key, message, "alert");

        let Some(url) = &self.alert_url else { return };
        let body = json!({
            "topic": self.alert_topic,
            "key": key,
            "message": message,
        });
        if let Err(e) = self.http.post(url).json(&body).send().await {
            tracing::warn!(error = %e, "failed to deliver alert to ALERT_URL");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_alert_within_window_is_suppressed_not_sent_twice() {
        let sink = AlertSink::new(None, None);
        sink.fire("agent-a1-failures", "first").await;
        assert!(sink.recent.contains_key("agent-a1-failures"));
        // Second fire within the window updates nothing observable beyond
        // the log; exercised here for the no-panic / idempotent path.
        sink.fire("agent-a1-failures", "second").await;
        assert_eq!(sink.recent.len(), 1);
    }
}
