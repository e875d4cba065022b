//! Two-kind persistent cache with an in-process front tier.
//!
//! The sqlite `cache` table is authoritative so restarts keep warm entries;
//! moka sits in front to spare the pool on repeat lookups within a process
//! lifetime. A backend failure degrades to cache-miss, never to a stalled
//! pipeline.

use anyhow::Result;
use chrono::{DateTime, Utc};
use moka::future::Cache as MokaCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Pool, Sqlite};
use std::time::Duration;
use tracing::{debug, warn};

/// Cache namespaces with independent TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Enrichment,
    Oracle,
}

impl CacheKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::Enrichment => "enrichment",
            CacheKind::Oracle => "oracle",
        }
    }
}

#[derive(Clone)]
pub struct PersistentCache {
    pool: Pool<Sqlite>,
    enrichment_ttl: Duration,
    oracle_ttl: Duration,
    enrichment_front: MokaCache<String, String>,
    oracle_front: MokaCache<String, String>,
}

impl PersistentCache {
    pub fn new(pool: Pool<Sqlite>, enrichment_ttl: Duration, oracle_ttl: Duration) -> Self {
        let enrichment_front = MokaCache::builder()
            .max_capacity(10_000)
            .time_to_live(enrichment_ttl)
            .build();
        let oracle_front = MokaCache::builder()
            .max_capacity(10_000)
            .time_to_live(oracle_ttl)
            .build();
        Self {
            pool,
            enrichment_ttl,
            oracle_ttl,
            enrichment_front,
            oracle_front,
        }
    }

    fn front(&self, kind: CacheKind) -> &MokaCache<String, String> {
        match kind {
            CacheKind::Enrichment => &self.enrichment_front,
            CacheKind::Oracle => &self.oracle_front,
        }
    }

    fn ttl(&self, kind: CacheKind) -> Duration {
        match kind {
            CacheKind::Enrichment => self.enrichment_ttl,
            CacheKind::Oracle => self.oracle_ttl,
        }
    }

    /// `None` when absent, expired, or undeserializable.
    pub async fn get<T: DeserializeOwned>(&self, kind: CacheKind, key: &str) -> Option<T> {
        if let Some(json) = self.front(kind).get(key).await {
            return serde_json::from_str(&json).ok();
        }

        let row: Option<(String, DateTime<Utc>)> = match sqlx::query_as(
            "SELECT value, expires_at FROM cache WHERE kind = ? AND key = ?;",
        )
        .bind(kind.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        {
            Ok(row) => row,
            Err(e) => {
                warn!("cache backend read failed, degrading to miss: {e}");
                return None;
            }
        };

        let (json, expires_at) = row?;
        if expires_at <= Utc::now() {
            debug!("cache entry expired: {}/{key}", kind.as_str());
            return None;
        }

        self.front(kind).insert(key.to_string(), json.clone()).await;
        serde_json::from_str(&json).ok()
    }

    /// Write-through: sqlite first, front tier second.
    pub async fn set<T: Serialize>(&self, kind: CacheKind, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl(kind)).unwrap_or(chrono::Duration::hours(1));

        if let Err(e) = sqlx::query(
            r#"
            INSERT INTO cache (kind, key, value, expires_at) VALUES (?, ?, ?, ?)
            ON CONFLICT (kind, key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at;
            "#,
        )
        .bind(kind.as_str())
        .bind(key)
        .bind(&json)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        {
            warn!("cache backend write failed, keeping front tier only: {e}");
        }

        self.front(kind).insert(key.to_string(), json).await;
        Ok(())
    }

    /// Drop expired rows. Called from the maintenance loop.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache WHERE expires_at <= ?;")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        let swept = result.rows_affected();
        if swept > 0 {
            debug!("swept {swept} expired cache rows");
        }
        Ok(swept)
    }
}
