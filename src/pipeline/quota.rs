//! Per-subscriber daily accounting for notifications and oracle calls.
//!
//! Counters are monotonic within a subscriber-local day and reset exactly
//! once when the local date advances. The check-and-increment runs inside a
//! single transaction; it never spans an external call.

use crate::types::Subscriber;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Pool, Sqlite};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaResource {
    Notifications,
    OracleCalls,
}

impl QuotaResource {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaResource::Notifications => "notifications",
            QuotaResource::OracleCalls => "oracle_calls",
        }
    }
}

#[derive(Clone)]
pub struct QuotaGate {
    pool: Pool<Sqlite>,
}

impl QuotaGate {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Increment the counter iff the result stays within `cap`. Returns
    /// whether the unit was granted.
    pub async fn try_consume(
        &self,
        subscriber: &Subscriber,
        resource: QuotaResource,
        cap: u32,
    ) -> Result<bool> {
        self.try_consume_at(subscriber, resource, cap, Utc::now()).await
    }

    /// Clock-injectable variant; `now` is converted to the subscriber's
    /// local date for the reset decision.
    pub async fn try_consume_at(
        &self,
        subscriber: &Subscriber,
        resource: QuotaResource,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let local_date = now.with_timezone(&subscriber.tz).date_naive();

        let mut tx = self.pool.begin().await.context("quota transaction")?;

        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT count, reset_on FROM quota WHERE subscriber_id = ? AND resource = ?;",
        )
        .bind(subscriber.id)
        .bind(resource.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let current = match row {
            Some((count, reset_on)) => {
                let reset_on = reset_on
                    .parse::<NaiveDate>()
                    .unwrap_or(NaiveDate::MIN);
                if reset_on < local_date {
                    0
                } else {
                    count
                }
            }
            None => 0,
        };

        if current as u64 + 1 > cap as u64 {
            tx.rollback().await.ok();
            debug!(
                "quota exhausted for subscriber {} {}: {current}/{cap}",
                subscriber.id,
                resource.as_str()
            );
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO quota (subscriber_id, resource, count, reset_on) VALUES (?, ?, ?, ?)
            ON CONFLICT (subscriber_id, resource)
            DO UPDATE SET count = excluded.count, reset_on = excluded.reset_on;
            "#,
        )
        .bind(subscriber.id)
        .bind(resource.as_str())
        .bind(current + 1)
        .bind(local_date.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Return one unit consumed earlier in the same local day. Used when a
    /// send fails after the unit was taken: quota is charged only on
    /// successful delivery.
    pub async fn refund(
        &self,
        subscriber: &Subscriber,
        resource: QuotaResource,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let local_date = now.with_timezone(&subscriber.tz).date_naive();
        sqlx::query(
            r#"
            UPDATE quota SET count = MAX(count - 1, 0)
            WHERE subscriber_id = ? AND resource = ? AND reset_on = ?;
            "#,
        )
        .bind(subscriber.id)
        .bind(resource.as_str())
        .bind(local_date.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Current usage for the subscriber's local day.
    pub async fn usage(&self, subscriber: &Subscriber, resource: QuotaResource) -> Result<u32> {
        self.usage_at(subscriber, resource, Utc::now()).await
    }

    pub async fn usage_at(
        &self,
        subscriber: &Subscriber,
        resource: QuotaResource,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let local_date = now.with_timezone(&subscriber.tz).date_naive();
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT count, reset_on FROM quota WHERE subscriber_id = ? AND resource = ?;",
        )
        .bind(subscriber.id)
        .bind(resource.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((count, reset_on)) => {
                let reset_on = reset_on.parse::<NaiveDate>().unwrap_or(NaiveDate::MIN);
                if reset_on < local_date {
                    0
                } else {
                    count as u32
                }
            }
            None => 0,
        })
    }
}
