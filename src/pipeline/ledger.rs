//! Delivery ledger: the at-most-once machinery.
//!
//! One row per (subscriber, filter, tender). `reserve` is an
//! `INSERT ... ON CONFLICT DO NOTHING`; losing the race is not an error, it
//! is the dedup signal. Rows are tentative until the sink acknowledged the
//! send, and tentative rows left behind by a crash are swept back out so the
//! tender can retry.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Handle to a tentative row. Every path through the pipeline must end it
/// with `confirm` or `abandon`.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub subscriber_id: i64,
    pub filter_id: i64,
    pub tender_id: String,
}

#[derive(Debug)]
pub enum ReserveOutcome {
    Reserved(Reservation),
    AlreadyDelivered,
}

/// Why a reservation was released without a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonCause {
    QuietHours,
    QuotaExhausted,
    SinkTransient,
    RecipientBlocked,
    Shutdown,
    Expired,
}

impl fmt::Display for AbandonCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbandonCause::QuietHours => "quiet-hours",
            AbandonCause::QuotaExhausted => "quota",
            AbandonCause::SinkTransient => "sink-transient",
            AbandonCause::RecipientBlocked => "recipient-blocked",
            AbandonCause::Shutdown => "shutdown",
            AbandonCause::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone)]
pub struct DeliveryLedger {
    pool: Pool<Sqlite>,
}

impl DeliveryLedger {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Atomically claim the (subscriber, filter, tender) triple. A blocked
    /// subscriber claims nothing; an existing row of either state means the
    /// tender was already handled.
    pub async fn reserve(
        &self,
        subscriber_id: i64,
        filter_id: i64,
        tender_id: &str,
    ) -> Result<ReserveOutcome> {
        if self.is_blocked(subscriber_id).await? {
            return Ok(ReserveOutcome::AlreadyDelivered);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO delivery (subscriber_id, filter_id, tender_id, state, reserved_at)
            VALUES (?, ?, ?, 'tentative', ?)
            ON CONFLICT (subscriber_id, filter_id, tender_id) DO NOTHING;
            "#,
        )
        .bind(subscriber_id)
        .bind(filter_id)
        .bind(tender_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to reserve delivery")?;

        if result.rows_affected() == 0 {
            return Ok(ReserveOutcome::AlreadyDelivered);
        }

        Ok(ReserveOutcome::Reserved(Reservation {
            subscriber_id,
            filter_id,
            tender_id: tender_id.to_string(),
        }))
    }

    /// Mark the reservation delivered. Idempotent on already-confirmed rows.
    pub async fn confirm(&self, reservation: &Reservation) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery SET state = 'confirmed', sent_at = ?
            WHERE subscriber_id = ? AND filter_id = ? AND tender_id = ?;
            "#,
        )
        .bind(Utc::now())
        .bind(reservation.subscriber_id)
        .bind(reservation.filter_id)
        .bind(&reservation.tender_id)
        .execute(&self.pool)
        .await
        .context("Failed to confirm delivery")?;
        Ok(())
    }

    /// Release a tentative row so a later cycle can retry the tender.
    /// Confirmed rows are never touched.
    pub async fn abandon(&self, reservation: &Reservation, cause: AbandonCause) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM delivery
            WHERE subscriber_id = ? AND filter_id = ? AND tender_id = ? AND state = 'tentative';
            "#,
        )
        .bind(reservation.subscriber_id)
        .bind(reservation.filter_id)
        .bind(&reservation.tender_id)
        .execute(&self.pool)
        .await
        .context("Failed to abandon reservation")?;

        if result.rows_affected() > 0 {
            debug!(
                "abandoned reservation ({}, {}, {}): {cause}",
                reservation.subscriber_id, reservation.filter_id, reservation.tender_id
            );
        }
        Ok(())
    }

    pub async fn is_blocked(&self, subscriber_id: i64) -> Result<bool> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT delivery_blocked FROM subscriber WHERE id = ?;")
                .bind(subscriber_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(b,)| b).unwrap_or(false))
    }

    /// Flag a recipient the sink reported as unreachable.
    pub async fn mark_blocked(&self, subscriber_id: i64) -> Result<()> {
        sqlx::query("UPDATE subscriber SET delivery_blocked = TRUE WHERE id = ?;")
            .bind(subscriber_id)
            .execute(&self.pool)
            .await?;
        info!("subscriber {subscriber_id} marked delivery-blocked");
        Ok(())
    }

    /// Clear the flag on a liveness signal (any inbound interaction).
    pub async fn clear_blocked(&self, subscriber_id: i64) -> Result<()> {
        sqlx::query("UPDATE subscriber SET delivery_blocked = FALSE WHERE id = ?;")
            .bind(subscriber_id)
            .execute(&self.pool)
            .await?;
        info!("subscriber {subscriber_id} delivery-block cleared");
        Ok(())
    }

    /// Remove tentative rows older than `max_age` so a crash strictly before
    /// the send does not permanently suppress a tender.
    pub async fn sweep_tentative(&self, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::minutes(5));
        let result = sqlx::query(
            "DELETE FROM delivery WHERE state = 'tentative' AND reserved_at < ?;",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let swept = result.rows_affected();
        if swept > 0 {
            info!("swept {swept} stale tentative reservations");
        }
        Ok(swept)
    }

    /// Confirmed deliveries for a subscriber, newest first. Diagnostics and
    /// tests.
    pub async fn confirmed_deliveries(
        &self,
        subscriber_id: i64,
    ) -> Result<Vec<(i64, String, Option<DateTime<Utc>>)>> {
        let rows: Vec<(i64, String, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT filter_id, tender_id, sent_at FROM delivery
            WHERE subscriber_id = ? AND state = 'confirmed'
            ORDER BY sent_at DESC;
            "#,
        )
        .bind(subscriber_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::store::Store;

    async fn ledger_with_subscriber() -> DeliveryLedger {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        sqlx::query("INSERT INTO subscriber (id, chat_id) VALUES (1, 100);")
            .execute(store.pool())
            .await
            .unwrap();
        DeliveryLedger::new(store.pool().clone())
    }

    #[tokio::test]
    async fn second_reserve_returns_already_delivered() {
        let ledger = ledger_with_subscriber().await;

        let first = ledger.reserve(1, 10, "t-1").await.unwrap();
        assert!(matches!(first, ReserveOutcome::Reserved(_)));

        let second = ledger.reserve(1, 10, "t-1").await.unwrap();
        assert!(matches!(second, ReserveOutcome::AlreadyDelivered));
    }

    #[tokio::test]
    async fn abandon_allows_retry_but_confirm_does_not() {
        let ledger = ledger_with_subscriber().await;

        let ReserveOutcome::Reserved(reservation) = ledger.reserve(1, 10, "t-1").await.unwrap()
        else {
            panic!("expected reservation");
        };
        ledger
            .abandon(&reservation, AbandonCause::SinkTransient)
            .await
            .unwrap();

        let retry = ledger.reserve(1, 10, "t-1").await.unwrap();
        let ReserveOutcome::Reserved(reservation) = retry else {
            panic!("abandoned triple must be reservable again");
        };
        ledger.confirm(&reservation).await.unwrap();

        // Confirmed rows survive abandon and refuse re-reservation.
        ledger
            .abandon(&reservation, AbandonCause::SinkTransient)
            .await
            .unwrap();
        assert!(matches!(
            ledger.reserve(1, 10, "t-1").await.unwrap(),
            ReserveOutcome::AlreadyDelivered
        ));
        assert_eq!(ledger.confirmed_deliveries(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn distinct_filters_reserve_independently() {
        let ledger = ledger_with_subscriber().await;

        assert!(matches!(
            ledger.reserve(1, 10, "t-1").await.unwrap(),
            ReserveOutcome::Reserved(_)
        ));
        assert!(matches!(
            ledger.reserve(1, 11, "t-1").await.unwrap(),
            ReserveOutcome::Reserved(_)
        ));
    }

    #[tokio::test]
    async fn blocked_subscriber_reserves_nothing() {
        let ledger = ledger_with_subscriber().await;

        ledger.mark_blocked(1).await.unwrap();
        assert!(matches!(
            ledger.reserve(1, 10, "t-1").await.unwrap(),
            ReserveOutcome::AlreadyDelivered
        ));

        ledger.clear_blocked(1).await.unwrap();
        assert!(matches!(
            ledger.reserve(1, 10, "t-1").await.unwrap(),
            ReserveOutcome::Reserved(_)
        ));
    }

    #[tokio::test]
    async fn sweep_reclaims_only_stale_tentative_rows() {
        let ledger = ledger_with_subscriber().await;

        let ReserveOutcome::Reserved(confirmed) = ledger.reserve(1, 10, "t-1").await.unwrap()
        else {
            panic!()
        };
        ledger.confirm(&confirmed).await.unwrap();
        let ReserveOutcome::Reserved(_stale) = ledger.reserve(1, 10, "t-2").await.unwrap()
        else {
            panic!()
        };

        // Everything tentative is older than a zero-length window.
        let swept = ledger.sweep_tentative(Duration::from_secs(0)).await.unwrap();
        assert_eq!(swept, 1);

        // The confirmed row stayed; the swept tender can be claimed again.
        assert!(matches!(
            ledger.reserve(1, 10, "t-1").await.unwrap(),
            ReserveOutcome::AlreadyDelivered
        ));
        assert!(matches!(
            ledger.reserve(1, 10, "t-2").await.unwrap(),
            ReserveOutcome::Reserved(_)
        ));
    }
}
