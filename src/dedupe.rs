//! L1 — Event Dedupe Store (spec.md §4.L1).
//!
//! A persistent set of seen Matrix event IDs with TTL eviction. `record`
//! is atomic across concurrent callers and processes sharing the same
//! backing database: the first caller observes `New`, everyone else
//! within the TTL observes `Duplicate`.

use std::time::Duration;

use sqlx::AnyPool;
use thiserror::Error;

use crate::error::ErrorKind;

#[derive(Error, Debug)]
pub enum DedupeError {
    #[error("dedupe store connectivity error: {0}")]
    Connectivity(#[from] sqlx::Error),
}

impl DedupeError {
    pub fn kind(&self) -> ErrorKind {
        // Backing-store errors here are fatal: a silently dropped dedupe
        // risks the response storms spec.md §4.L1 warns about.
        ErrorKind::Fatal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    New,
    Duplicate,
}

#[async_trait::async_trait]
pub trait EventDedupeStore: Send + Sync {
    async fn record(&self, event_id: &str) -> Result<RecordOutcome, DedupeError>;
    async fn sweep(&self) -> Result<u64, DedupeError>;
}

pub struct SqlDedupeStore {
    pool: AnyPool,
    ttl: Duration,
}

impl SqlDedupeStore {
    pub fn new(pool: AnyPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    /// Spawns the periodic sweep task. Callers need not invoke `sweep`
    /// themselves — it runs on a timer, per spec.md §4.L1.
    pub fn spawn_sweeper(store: std::sync::Arc<dyn EventDedupeStore>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match store.sweep().await {
                    Ok(n) if n > 0 => tracing::debug!(evicted = n, "dedupe sweep evicted entries"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "dedupe sweep failed"),
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl EventDedupeStore for SqlDedupeStore {
    async fn record(&self, event_id: &str) -> Result<RecordOutcome, DedupeError> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO event_dedupe (event_id, inserted_at) VALUES (?, ?) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(RecordOutcome::New)
        } else {
            Ok(RecordOutcome::Duplicate)
        }
    }

    async fn sweep(&self) -> Result<u64, DedupeError> {
        let cutoff = chrono::Utc::now().timestamp() - self.ttl.as_secs() as i64;
        let result = sqlx::query("DELETE FROM event_dedupe WHERE inserted_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// In-process fake used by unit tests and by modules that only need
/// dedupe semantics without a database round-trip.
#[cfg(test)]
pub struct InMemoryDedupeStore {
    seen: std::sync::Mutex<std::collections::HashMap<String, i64>>,
    ttl: Duration,
}

#[cfg(test)]
impl InMemoryDedupeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: std::sync::Mutex::new(std::collections::HashMap::new()),
            ttl,
        }
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl EventDedupeStore for InMemoryDedupeStore {
    async fn record(&self, event_id: &str) -> Result<RecordOutcome, DedupeError> {
        let mut seen = self.seen.lock().unwrap();
        if seen.contains_key(event_id) {
            Ok(RecordOutcome::Duplicate)
        } else {
            seen.insert(event_id.to_string(), chrono::Utc::now().timestamp());
            Ok(RecordOutcome::New)
        }
    }

    async fn sweep(&self) -> Result<u64, DedupeError> {
        let cutoff = chrono::Utc::now().timestamp() - self.ttl.as_secs() as i64;
        let mut seen = self.seen.lock().unwrap();
        let before = seen.len();
        seen.retain(|_, inserted_at| *inserted_at >= cutoff);
        Ok((before - seen.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_is_new_then_duplicate() {
        let store = InMemoryDedupeStore::new(Duration::from_secs(3600));
        assert_eq!(store.record("$abc:server").await.unwrap(), RecordOutcome::New);
        assert_eq!(
            store.record("$abc:server").await.unwrap(),
            RecordOutcome::Duplicate
        );
        assert_eq!(
            store.record("$abc:server").await.unwrap(),
            RecordOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn concurrent_record_has_single_winner() {
        let store = std::sync::Arc::new(InMemoryDedupeStore::new(Duration::from_secs(3600)));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.record("$race:server").await.unwrap() }));
        }
        let mut new_count = 0;
        for h in handles {
            if h.await.unwrap() == RecordOutcome::New {
                new_count += 1;
            }
        }
        assert_eq!(new_count, 1, "exactly one caller should observe New");
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired_entries() {
        let store = InMemoryDedupeStore::new(Duration::from_secs(0));
        store.record("$old:server").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let evicted = store.sweep().await.unwrap();
        assert_eq!(evicted, 1);
    }
}
