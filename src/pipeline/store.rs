//! Persistent store: pool, schema, and the subscriber/filter read side.
//!
//! The pipeline only reads subscribers and filters; the front-end owns the
//! write side. Schema is created on connect so a fresh database file is
//! immediately usable.

use crate::error::SentinelError;
use crate::types::{Filter, LawType, Subscriber, TenderType, Tier};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use nonempty::NonEmpty;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use tracing::{info, warn};

#[derive(FromRow)]
struct SubscriberRow {
    id: i64,
    chat_id: i64,
    tier: String,
    quiet_start: Option<String>,
    quiet_end: Option<String>,
    tz: String,
    delivery_blocked: bool,
    data: String,
}

#[derive(FromRow)]
struct FilterRow {
    id: i64,
    subscriber_id: i64,
    name: String,
    is_active: bool,
    deleted_at: Option<DateTime<Utc>>,
    keywords: String,
    exclude_keywords: String,
    primary_keywords: String,
    secondary_keywords: String,
    regions: String,
    price_min: Option<f64>,
    price_max: Option<f64>,
    tender_types: String,
    law_type: String,
    ai_intent: String,
    ai_intent_version: i64,
    expanded_keywords: String,
    min_deadline_days: i64,
    notify_chat_ids: String,
}

/// Shared connection pool plus the read queries the pipeline needs.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        // An in-memory database exists per connection; keep exactly one so
        // every component sees the same data.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to sqlite database")?;

        Self::create_schema(&pool).await?;
        info!("Store initialized and connected to {database_url}");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriber (
                id INTEGER PRIMARY KEY,
                chat_id INTEGER NOT NULL,
                tier TEXT NOT NULL DEFAULT 'trial',
                quiet_start TEXT,
                quiet_end TEXT,
                tz TEXT NOT NULL DEFAULT 'Europe/Moscow',
                delivery_blocked BOOLEAN NOT NULL DEFAULT FALSE,
                data TEXT NOT NULL DEFAULT '{}'
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create subscriber table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS filter (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subscriber_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                deleted_at TEXT,
                keywords TEXT NOT NULL,
                exclude_keywords TEXT NOT NULL DEFAULT '[]',
                primary_keywords TEXT NOT NULL DEFAULT '[]',
                secondary_keywords TEXT NOT NULL DEFAULT '[]',
                regions TEXT NOT NULL DEFAULT '[]',
                price_min REAL,
                price_max REAL,
                tender_types TEXT NOT NULL DEFAULT '[]',
                law_type TEXT NOT NULL DEFAULT 'any',
                ai_intent TEXT NOT NULL DEFAULT '',
                ai_intent_version INTEGER NOT NULL DEFAULT 1,
                expanded_keywords TEXT NOT NULL DEFAULT '[]',
                min_deadline_days INTEGER NOT NULL DEFAULT 0,
                notify_chat_ids TEXT NOT NULL DEFAULT '[]',
                FOREIGN KEY (subscriber_id) REFERENCES subscriber (id)
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create filter table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delivery (
                subscriber_id INTEGER NOT NULL,
                filter_id INTEGER NOT NULL,
                tender_id TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'tentative',
                reserved_at TEXT NOT NULL,
                sent_at TEXT,
                PRIMARY KEY (subscriber_id, filter_id, tender_id)
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create delivery table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache (
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (kind, key)
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create cache table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota (
                subscriber_id INTEGER NOT NULL,
                resource TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                reset_on TEXT NOT NULL,
                PRIMARY KEY (subscriber_id, resource)
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create quota table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feedback (
                subscriber_id INTEGER NOT NULL,
                tender_id TEXT NOT NULL,
                filter_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create feedback table")?;

        Ok(())
    }

    /// All filters the pipeline may consult this cycle: active and not
    /// soft-deleted, with a loadable owner. Rows that fail validation are
    /// skipped with a warning instead of aborting the cycle.
    pub async fn load_active_filters(&self) -> Result<Vec<(Subscriber, Filter)>> {
        let rows: Vec<FilterRow> = sqlx::query_as(
            r#"
            SELECT * FROM filter
            WHERE is_active = TRUE AND deleted_at IS NULL
            ORDER BY subscriber_id, id;
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load active filters")?;

        let mut out = Vec::new();
        for row in rows {
            let filter_id = row.id;
            let subscriber = match self.load_subscriber(row.subscriber_id).await? {
                Some(s) => s,
                None => {
                    warn!("filter {filter_id} references missing subscriber {}", row.subscriber_id);
                    continue;
                }
            };
            match parse_filter(row) {
                Ok(filter) => out.push((subscriber, filter)),
                Err(e) => warn!("skipping filter {filter_id}: {e}"),
            }
        }
        Ok(out)
    }

    pub async fn load_subscriber(&self, id: i64) -> Result<Option<Subscriber>> {
        let row: Option<SubscriberRow> =
            sqlx::query_as("SELECT * FROM subscriber WHERE id = ?;")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to load subscriber")?;
        row.map(parse_subscriber).transpose()
    }

    /// Deactivate every filter of a subscriber whose recipient became
    /// unreachable, remembering the ids in the data pouch so liveness can
    /// restore exactly those.
    pub async fn deactivate_filters_for_blocked(&self, subscriber_id: i64) -> Result<()> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM filter WHERE subscriber_id = ? AND is_active = TRUE;",
        )
        .bind(subscriber_id)
        .fetch_all(&self.pool)
        .await?;
        let ids: Vec<i64> = ids.into_iter().map(|(id,)| id).collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE filter SET is_active = FALSE WHERE subscriber_id = ? AND is_active = TRUE;")
            .bind(subscriber_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE subscriber SET data = json_set(data, '$.suspended_filters', json(?)) WHERE id = ?;",
        )
        .bind(serde_json::to_string(&ids)?)
        .bind(subscriber_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Restore the filters suspended by `deactivate_filters_for_blocked`.
    pub async fn restore_suspended_filters(&self, subscriber_id: i64) -> Result<()> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT data FROM subscriber WHERE id = ?;")
                .bind(subscriber_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((data,)) = row else { return Ok(()) };
        let pouch: serde_json::Value = serde_json::from_str(&data).unwrap_or_default();
        let Some(ids) = pouch.get("suspended_filters").and_then(|v| v.as_array()) else {
            return Ok(());
        };
        let ids: Vec<i64> = ids.iter().filter_map(|v| v.as_i64()).collect();

        let mut tx = self.pool.begin().await?;
        for id in &ids {
            sqlx::query("UPDATE filter SET is_active = TRUE WHERE id = ? AND subscriber_id = ?;")
                .bind(id)
                .bind(subscriber_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "UPDATE subscriber SET data = json_remove(data, '$.suspended_filters') WHERE id = ?;",
        )
        .bind(subscriber_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Soft-delete a filter; restorable until hard-expired by the front-end.
    pub async fn soft_delete_filter(&self, filter_id: i64) -> Result<()> {
        sqlx::query("UPDATE filter SET deleted_at = ? WHERE id = ?;")
            .bind(Utc::now())
            .bind(filter_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Restore a soft-deleted filter. Already-delivered tenders stay in the
    /// delivery ledger, so restoration cannot re-send them.
    pub async fn restore_filter(&self, filter_id: i64) -> Result<()> {
        sqlx::query("UPDATE filter SET deleted_at = NULL WHERE id = ?;")
            .bind(filter_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bump the intent version after a matching-input edit so cached oracle
    /// confidences for the old intent expire with it.
    pub async fn bump_intent_version(&self, filter_id: i64, new_intent: &str) -> Result<()> {
        sqlx::query(
            "UPDATE filter SET ai_intent = ?, ai_intent_version = ai_intent_version + 1 WHERE id = ?;",
        )
        .bind(new_intent)
        .bind(filter_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record an inline-action callback for later analysis.
    pub async fn record_feedback(
        &self,
        subscriber_id: i64,
        filter_id: i64,
        tender_id: &str,
        action: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO feedback (subscriber_id, tender_id, filter_id, action, at) VALUES (?, ?, ?, ?, ?);",
        )
        .bind(subscriber_id)
        .bind(tender_id)
        .bind(filter_id)
        .bind(action)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_subscriber(row: SubscriberRow) -> Result<Subscriber> {
    let tier = Tier::from_str(&row.tier).map_err(SentinelError::InputRejected)?;
    let tz = Tz::from_str(&row.tz).unwrap_or_else(|_| {
        warn!("subscriber {}: unknown timezone {:?}, falling back to Europe/Moscow", row.id, row.tz);
        chrono_tz::Europe::Moscow
    });
    Ok(Subscriber {
        id: row.id,
        chat_id: row.chat_id,
        tier,
        quiet_start: row.quiet_start.as_deref().and_then(parse_local_time),
        quiet_end: row.quiet_end.as_deref().and_then(parse_local_time),
        tz,
        delivery_blocked: row.delivery_blocked,
        data: serde_json::from_str(&row.data).unwrap_or_default(),
    })
}

fn parse_local_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

fn parse_filter(row: FilterRow) -> Result<Filter> {
    let keywords: Vec<String> =
        serde_json::from_str(&row.keywords).context("keywords column is not a JSON array")?;
    let keywords = NonEmpty::from_vec(keywords).ok_or_else(|| {
        SentinelError::InputRejected(format!("filter {} has no keywords", row.id))
    })?;

    let law_type = match row.law_type.as_str() {
        "44-FZ" | "44-фз" | "44" => LawType::Fz44,
        "223-FZ" | "223-фз" | "223" => LawType::Fz223,
        _ => LawType::Any,
    };

    let tender_types: Vec<TenderType> =
        serde_json::from_str(&row.tender_types).unwrap_or_default();

    // Front-end-provided synonyms win; otherwise derive from the built-in
    // groups so the matcher always has an expanded set to work with.
    let mut expanded_keywords: Vec<String> =
        serde_json::from_str(&row.expanded_keywords).unwrap_or_default();
    if expanded_keywords.is_empty() {
        let all: Vec<String> = keywords.iter().cloned().collect();
        expanded_keywords = crate::matcher::expand_keywords(&all);
    }

    Ok(Filter {
        id: row.id,
        subscriber_id: row.subscriber_id,
        name: row.name,
        is_active: row.is_active,
        deleted_at: row.deleted_at,
        keywords,
        exclude_keywords: serde_json::from_str(&row.exclude_keywords).unwrap_or_default(),
        primary_keywords: serde_json::from_str(&row.primary_keywords).unwrap_or_default(),
        secondary_keywords: serde_json::from_str(&row.secondary_keywords).unwrap_or_default(),
        regions: serde_json::from_str(&row.regions).unwrap_or_default(),
        price_min: row.price_min,
        price_max: row.price_max,
        tender_types,
        law_type,
        ai_intent: row.ai_intent,
        ai_intent_version: row.ai_intent_version,
        expanded_keywords,
        min_deadline_days: row.min_deadline_days,
        notify_chat_ids: serde_json::from_str(&row.notify_chat_ids).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        Store::connect("sqlite::memory:").await.expect("in-memory store")
    }

    async fn seed_subscriber(store: &Store, id: i64) {
        sqlx::query(
            "INSERT INTO subscriber (id, chat_id, tier, tz) VALUES (?, ?, 'basic', 'Europe/Moscow');",
        )
        .bind(id)
        .bind(id * 100)
        .execute(store.pool())
        .await
        .expect("seed subscriber");
    }

    async fn seed_filter(store: &Store, id: i64, subscriber_id: i64, keywords: &str) {
        sqlx::query(
            "INSERT INTO filter (id, subscriber_id, name, keywords) VALUES (?, ?, 'f', ?);",
        )
        .bind(id)
        .bind(subscriber_id)
        .bind(keywords)
        .execute(store.pool())
        .await
        .expect("seed filter");
    }

    #[tokio::test]
    async fn loads_active_filters_with_owners() {
        let store = memory_store().await;
        seed_subscriber(&store, 1).await;
        seed_filter(&store, 10, 1, r#"["ноутбук"]"#).await;

        let filters = store.load_active_filters().await.unwrap();
        assert_eq!(filters.len(), 1);
        let (subscriber, filter) = &filters[0];
        assert_eq!(subscriber.id, 1);
        assert_eq!(subscriber.tier, Tier::Basic);
        assert_eq!(filter.keywords.first(), "ноутбук");
    }

    #[tokio::test]
    async fn skips_empty_keyword_filters() {
        let store = memory_store().await;
        seed_subscriber(&store, 1).await;
        seed_filter(&store, 10, 1, r#"[]"#).await;

        let filters = store.load_active_filters().await.unwrap();
        assert!(filters.is_empty());
    }

    #[tokio::test]
    async fn soft_deleted_filters_are_invisible_until_restored() {
        let store = memory_store().await;
        seed_subscriber(&store, 1).await;
        seed_filter(&store, 10, 1, r#"["ноутбук"]"#).await;

        store.soft_delete_filter(10).await.unwrap();
        assert!(store.load_active_filters().await.unwrap().is_empty());

        store.restore_filter(10).await.unwrap();
        assert_eq!(store.load_active_filters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn suspend_and_restore_filters_round_trip() {
        let store = memory_store().await;
        seed_subscriber(&store, 1).await;
        seed_filter(&store, 10, 1, r#"["ноутбук"]"#).await;
        seed_filter(&store, 11, 1, r#"["сервер"]"#).await;

        store.deactivate_filters_for_blocked(1).await.unwrap();
        assert!(store.load_active_filters().await.unwrap().is_empty());

        store.restore_suspended_filters(1).await.unwrap();
        assert_eq!(store.load_active_filters().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn feedback_is_recorded() {
        let store = memory_store().await;
        seed_subscriber(&store, 1).await;
        seed_filter(&store, 10, 1, r#"["ноутбук"]"#).await;

        store.record_feedback(1, 10, "0372-1", "interested").await.unwrap();
        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT subscriber_id, tender_id, action FROM feedback;")
                .fetch_all(store.pool())
                .await
                .unwrap();
        assert_eq!(rows, vec![(1, "0372-1".to_string(), "interested".to_string())]);
    }

    #[tokio::test]
    async fn intent_version_bumps_on_edit() {
        let store = memory_store().await;
        seed_subscriber(&store, 1).await;
        seed_filter(&store, 10, 1, r#"["ноутбук"]"#).await;

        store.bump_intent_version(10, "ноутбуки для офиса").await.unwrap();
        let filters = store.load_active_filters().await.unwrap();
        assert_eq!(filters[0].1.ai_intent_version, 2);
        assert_eq!(filters[0].1.ai_intent, "ноутбуки для офиса");
    }
}
