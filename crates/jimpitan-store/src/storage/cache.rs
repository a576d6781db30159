//! Persistent TTL cache stored in the `cache` table

use crate::error::{Result, StoreError};
use crate::storage::db::StorageGateway;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Key/value cache with expiry, shared with the contribution database
pub struct TtlCache {
    gateway: Arc<StorageGateway>,
    default_ttl: Duration,
}

impl TtlCache {
    pub fn new(gateway: Arc<StorageGateway>, default_ttl: Duration) -> Self {
        Self {
            gateway,
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Set a value with the default TTL
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.set_with_ttl(key, value, self.default_ttl).await
    }

    /// Set a value with TTL, replacing any existing entry
    pub async fn set_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let value = serde_json::to_string(value)?;
        let stored_at = now_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires = stored_at.saturating_add(ttl_ms);

        let pool = self.gateway.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO cache (key, value, expires, stored_at) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires = excluded.expires,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(expires)
        .bind(stored_at)
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Write(format!("Failed to cache {}: {}", key, e)))?;

        Ok(())
    }

    /// Get a value from cache.
    ///
    /// Expired entries are removed in the background and read as a miss, as are
    /// entries that no longer deserialize into `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let pool = self.gateway.pool().await?;
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT value, expires FROM cache WHERE key = ?1")
                .bind(key)
                .fetch_optional(&pool)
                .await?;

        let Some((value, expires)) = row else {
            return Ok(None);
        };

        let now = now_millis();
        if expires < now {
            debug!(key, "Cache entry expired");
            let gateway = Arc::clone(&self.gateway);
            let key = key.to_string();
            tokio::spawn(async move {
                if let Err(e) = evict_expired(&gateway, &key, now).await {
                    debug!(key = %key, "Failed to evict expired cache entry: {}", e);
                }
            });
            return Ok(None);
        }

        match serde_json::from_str(&value) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, "Ignoring unreadable cache entry: {}", e);
                Ok(None)
            }
        }
    }

    /// Delete a key from cache
    pub async fn clear(&self, key: &str) -> Result<()> {
        delete_entry(&self.gateway, key).await.map(|_| ())
    }

    /// Remove every entry that expired before now, returning how many went
    pub async fn sweep(&self) -> Result<usize> {
        let now = now_millis();
        let pool = self.gateway.pool().await?;
        let expired: Vec<String> = sqlx::query_scalar("SELECT key FROM cache WHERE expires < ?1")
            .bind(now)
            .fetch_all(&pool)
            .await?;

        let mut removed = 0;
        for key in &expired {
            match evict_expired(&self.gateway, key, now).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => debug!(key = %key, "Failed to sweep cache entry: {}", e),
            }
        }

        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
        Ok(removed)
    }

    /// Sweep every `period`, starting one period from now. Failures are ignored.
    pub fn start_sweeper(self: &Arc<Self>, period: Duration) -> SweeperHandle {
        let cache = Arc::clone(self);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                if let Err(e) = cache.sweep().await {
                    debug!("Cache sweep failed: {}", e);
                }
            }
        });

        SweeperHandle { task }
    }
}

/// Background sweep task. Stopped when the handle is stopped or dropped.
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn delete_entry(gateway: &StorageGateway, key: &str) -> Result<bool> {
    let pool = gateway.pool().await?;
    let result = sqlx::query("DELETE FROM cache WHERE key = ?1")
        .bind(key)
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Write(format!("Failed to delete cache entry {}: {}", key, e)))?;

    Ok(result.rows_affected() > 0)
}

/// Delete `key` only while it still holds an entry that expired before `now`.
/// A value set again in the meantime is kept.
async fn evict_expired(gateway: &StorageGateway, key: &str, now: i64) -> Result<bool> {
    let pool = gateway.pool().await?;
    let result = sqlx::query("DELETE FROM cache WHERE key = ?1 AND expires < ?2")
        .bind(key)
        .bind(now)
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Write(format!("Failed to evict cache entry {}: {}", key, e)))?;

    Ok(result.rows_affected() > 0)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
