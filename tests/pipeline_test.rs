//! End-to-end pipeline tests over mock collaborators and an in-memory
//! database: match-and-send, dedup across cycles, region and null-region
//! policies, quota exhaustion and daily reset, blocked recipients, quiet
//! hours, the archive guard, and the no-boost rule for UNKNOWN verdicts.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tender_sentinel::config::EngineConfig;
use tender_sentinel::pipeline::{
    FeedQuery, FeedSource, NotificationMessage, NotificationSink, OracleAssessment,
    PipelineEngine, QuotaGate, QuotaResource, RelevanceOracle, SendOutcome, Store,
};
use tender_sentinel::types::{EnrichedTender, LawType, RawTender, TenderType};

// --- Mock collaborators ---

#[derive(Default)]
struct MockEnrichment {
    price: Option<f64>,
    region: Option<String>,
    deadline: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MockFeed {
    tenders: Mutex<Vec<RawTender>>,
    enrichments: Mutex<HashMap<String, MockEnrichment>>,
}

impl MockFeed {
    fn set_tenders(&self, tenders: Vec<RawTender>) {
        *self.tenders.lock().unwrap() = tenders;
    }

    fn set_enrichment(&self, id: &str, enrichment: MockEnrichment) {
        self.enrichments.lock().unwrap().insert(id.to_string(), enrichment);
    }
}

#[async_trait]
impl FeedSource for MockFeed {
    async fn poll(&self, _query: &FeedQuery) -> anyhow::Result<Vec<RawTender>> {
        Ok(self.tenders.lock().unwrap().clone())
    }

    async fn enrich(&self, raw: &RawTender) -> EnrichedTender {
        let map = self.enrichments.lock().unwrap();
        match map.get(&raw.id) {
            Some(e) => EnrichedTender {
                raw: raw.clone(),
                price: e.price.or(raw.price),
                customer_region: e.region.clone(),
                deadline: e.deadline.or(raw.deadline),
                detail_title: None,
                fingerprint: None,
            },
            None => EnrichedTender::partial(raw.clone()),
        }
    }
}

struct MockOracle {
    confidence: Option<u8>,
    calls: AtomicU64,
    config: EngineConfig,
}

impl MockOracle {
    fn new(confidence: Option<u8>, config: &EngineConfig) -> Self {
        Self {
            confidence,
            calls: AtomicU64::new(0),
            config: config.clone(),
        }
    }

    fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelevanceOracle for MockOracle {
    async fn assess(&self, _tender: &EnrichedTender, _intent: &str) -> OracleAssessment {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.confidence {
            Some(c) => OracleAssessment::from_confidence(c, &self.config),
            None => OracleAssessment::unknown(),
        }
    }
}

#[derive(Default)]
struct MockSink {
    attempts: Mutex<Vec<(i64, String, SendOutcome)>>,
    scripted: Mutex<VecDeque<SendOutcome>>,
}

impl MockSink {
    fn script_outcome(&self, outcome: SendOutcome) {
        self.scripted.lock().unwrap().push_back(outcome);
    }

    fn sent(&self) -> Vec<(i64, String)> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, o)| *o == SendOutcome::Sent)
            .map(|(chat, text, _)| (*chat, text.clone()))
            .collect()
    }

    fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationSink for MockSink {
    async fn send(&self, chat_id: i64, message: &NotificationMessage) -> SendOutcome {
        let outcome = self
            .scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendOutcome::Sent);
        self.attempts
            .lock()
            .unwrap()
            .push((chat_id, message.text.clone(), outcome));
        outcome
    }
}

// --- Harness ---

struct Harness {
    store: Store,
    feed: Arc<MockFeed>,
    oracle: Arc<MockOracle>,
    sink: Arc<MockSink>,
    engine: PipelineEngine,
}

async fn harness_with(config: EngineConfig, oracle_confidence: Option<u8>) -> Harness {
    let store = Store::connect("sqlite::memory:").await.expect("store");
    let feed = Arc::new(MockFeed::default());
    let oracle = Arc::new(MockOracle::new(oracle_confidence, &config));
    let sink = Arc::new(MockSink::default());
    let engine = PipelineEngine::new(
        config,
        store.clone(),
        feed.clone(),
        oracle.clone(),
        sink.clone(),
    );
    Harness {
        store,
        feed,
        oracle,
        sink,
        engine,
    }
}

async fn harness() -> Harness {
    harness_with(EngineConfig::default(), Some(72)).await
}

async fn seed_subscriber(store: &Store, id: i64, tier: &str, quiet: Option<(&str, &str)>) {
    let (quiet_start, quiet_end) = match quiet {
        Some((s, e)) => (Some(s), Some(e)),
        None => (None, None),
    };
    sqlx::query(
        "INSERT INTO subscriber (id, chat_id, tier, quiet_start, quiet_end, tz) VALUES (?, ?, ?, ?, ?, 'Europe/Moscow');",
    )
    .bind(id)
    .bind(id * 100)
    .bind(tier)
    .bind(quiet_start)
    .bind(quiet_end)
    .execute(store.pool())
    .await
    .expect("seed subscriber");
}

#[allow(clippy::too_many_arguments)]
async fn seed_filter(
    store: &Store,
    id: i64,
    subscriber_id: i64,
    keywords: &[&str],
    regions: &[&str],
    price_min: Option<f64>,
    price_max: Option<f64>,
    tender_types: &[&str],
    law_type: &str,
    min_deadline_days: i64,
) {
    sqlx::query(
        r#"
        INSERT INTO filter
            (id, subscriber_id, name, keywords, regions, price_min, price_max,
             tender_types, law_type, ai_intent, min_deadline_days)
        VALUES (?, ?, 'test filter', ?, ?, ?, ?, ?, ?, 'релевантные закупки', ?);
        "#,
    )
    .bind(id)
    .bind(subscriber_id)
    .bind(serde_json::to_string(keywords).unwrap())
    .bind(serde_json::to_string(regions).unwrap())
    .bind(price_min)
    .bind(price_max)
    .bind(serde_json::to_string(tender_types).unwrap())
    .bind(law_type)
    .bind(min_deadline_days)
    .execute(store.pool())
    .await
    .expect("seed filter");
}

fn tender(id: &str, title: &str, price: f64, published_at: DateTime<Utc>) -> RawTender {
    RawTender {
        id: id.to_string(),
        customer: "ГБУ г. Москва".to_string(),
        customer_inn: None,
        title: title.to_string(),
        description: None,
        price: Some(price),
        tender_type: Some(TenderType::Goods),
        law_type: Some(LawType::Fz44),
        published_at,
        deadline: None,
        region_hint: None,
        url: format!("https://zakupki.gov.ru/t/{id}"),
    }
}

fn moscow(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    chrono_tz::Europe::Moscow
        .with_ymd_and_hms(y, m, d, h, min, 0)
        .unwrap()
        .with_timezone(&Utc)
}

async fn notifications_used(store: &Store, subscriber_id: i64, now: DateTime<Utc>) -> u32 {
    let gate = QuotaGate::new(store.pool().clone());
    let subscriber = store
        .load_subscriber(subscriber_id)
        .await
        .unwrap()
        .expect("subscriber");
    gate.usage_at(&subscriber, QuotaResource::Notifications, now)
        .await
        .unwrap()
}

// --- Scenarios ---

/// S1: a matching tender produces exactly one send, one quota unit, and a
/// confirmed delivery record.
#[tokio::test]
async fn basic_match_and_send() {
    let h = harness().await;
    seed_subscriber(&h.store, 1, "basic", Some(("22:00", "09:00"))).await;
    seed_filter(
        &h.store,
        1,
        1,
        &["ноутбук"],
        &["Москва"],
        Some(500_000.0),
        Some(2_000_000.0),
        &["goods"],
        "44-FZ",
        5,
    )
    .await;

    let now = moscow(2026, 7, 1, 12, 0);
    h.feed
        .set_tenders(vec![tender("0372-1", "Поставка ноутбуков", 1_200_000.0, now - Duration::days(2))]);
    h.feed.set_enrichment(
        "0372-1",
        MockEnrichment {
            price: Some(1_200_000.0),
            region: Some("Москва".to_string()),
            deadline: Some(now + Duration::days(10)),
        },
    );

    let metrics = h.engine.run_cycle(now).await.unwrap();

    assert_eq!(metrics.sent, 1);
    let sent = h.sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, 100); // U1's chat
    assert!(sent[0].1.contains("Поставка ноутбуков"));

    assert_eq!(notifications_used(&h.store, 1, now).await, 1);

    let row: (String,) = sqlx::query_as(
        "SELECT state FROM delivery WHERE subscriber_id = 1 AND filter_id = 1 AND tender_id = '0372-1';",
    )
    .fetch_one(h.store.pool())
    .await
    .unwrap();
    assert_eq!(row.0, "confirmed");
}

/// S2: re-running the same cycle against the same feed response sends
/// nothing new.
#[tokio::test]
async fn dedup_across_cycles() {
    let h = harness().await;
    seed_subscriber(&h.store, 1, "basic", None).await;
    seed_filter(
        &h.store,
        1,
        1,
        &["ноутбук"],
        &["Москва"],
        Some(500_000.0),
        Some(2_000_000.0),
        &["goods"],
        "44-FZ",
        5,
    )
    .await;

    let now = moscow(2026, 7, 1, 12, 0);
    h.feed
        .set_tenders(vec![tender("0372-1", "Поставка ноутбуков", 1_200_000.0, now - Duration::days(2))]);
    h.feed.set_enrichment(
        "0372-1",
        MockEnrichment {
            price: Some(1_200_000.0),
            region: Some("Москва".to_string()),
            deadline: Some(now + Duration::days(10)),
        },
    );

    h.engine.run_cycle(now).await.unwrap();
    let repeat = h.engine.run_cycle(now + Duration::minutes(5)).await.unwrap();

    assert_eq!(repeat.sent, 0);
    assert_eq!(repeat.deduplicated, 1);
    assert_eq!(h.sink.sent().len(), 1);
    assert_eq!(notifications_used(&h.store, 1, now).await, 1);

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM delivery;")
        .fetch_one(h.store.pool())
        .await
        .unwrap();
    assert_eq!(count.0, 1);
}

/// S3: a tender from the wrong region is hard-rejected before the oracle is
/// ever consulted.
#[tokio::test]
async fn region_mismatch_rejects_without_oracle() {
    let h = harness().await;
    seed_subscriber(&h.store, 1, "basic", None).await;
    seed_filter(
        &h.store,
        1,
        1,
        &["ноутбук"],
        &["Москва"],
        None,
        None,
        &["goods"],
        "44-FZ",
        0,
    )
    .await;

    let now = moscow(2026, 7, 1, 12, 0);
    let mut t2 = tender("0372-2", "Поставка ноутбуков для школ", 1_200_000.0, now - Duration::days(1));
    t2.customer = "Администрация Казани".to_string();
    h.feed.set_tenders(vec![t2]);
    h.feed.set_enrichment(
        "0372-2",
        MockEnrichment {
            price: Some(1_200_000.0),
            region: Some("Республика Татарстан".to_string()),
            deadline: Some(now + Duration::days(10)),
        },
    );

    let metrics = h.engine.run_cycle(now).await.unwrap();

    assert_eq!(metrics.sent, 0);
    assert_eq!(metrics.full_score_dropped, 1);
    assert_eq!(h.oracle.call_count(), 0);
    assert_eq!(h.sink.attempt_count(), 0);
    assert_eq!(notifications_used(&h.store, 1, now).await, 0);
}

/// S4: a tender whose region cannot be resolved follows the configured
/// null-region policy.
#[tokio::test]
async fn null_region_policy_decides() {
    for (policy, expect_send) in [("reject", false), ("penalise", true), ("pass", true)] {
        let mut config = EngineConfig::default();
        config.null_region_policy = policy.parse().unwrap();
        let h = harness_with(config, Some(72)).await;

        seed_subscriber(&h.store, 1, "basic", None).await;
        seed_filter(
            &h.store,
            1,
            1,
            &["ноутбук", "компьютер"],
            &["Москва"],
            Some(500_000.0),
            Some(2_000_000.0),
            &["goods"],
            "44-FZ",
            0,
        )
        .await;

        let now = moscow(2026, 7, 1, 12, 0);
        let mut t3 = tender("0372-3", "Поставка: ноутбук и компьютер", 1_200_000.0, now - Duration::days(1));
        t3.customer = "ООО Ромашка".to_string();
        h.feed.set_tenders(vec![t3]);
        h.feed.set_enrichment(
            "0372-3",
            MockEnrichment {
                price: Some(1_200_000.0),
                region: None,
                deadline: Some(now + Duration::days(10)),
            },
        );

        let metrics = h.engine.run_cycle(now).await.unwrap();
        assert_eq!(
            metrics.sent,
            u64::from(expect_send),
            "policy {policy} produced the wrong outcome"
        );
    }
}

/// S5: quota exhaustion mid-cycle, then the reset at the subscriber-local
/// midnight releases the remaining tender.
#[tokio::test]
async fn quota_exhaustion_and_daily_reset() {
    let h = harness().await;
    seed_subscriber(&h.store, 2, "basic", None).await;
    seed_filter(
        &h.store,
        1,
        2,
        &["ноутбук"],
        &[],
        None,
        None,
        &["goods"],
        "44-FZ",
        0,
    )
    .await;

    let day1 = moscow(2026, 7, 1, 12, 0);
    // 49 of the basic cap of 50 already used today.
    sqlx::query("INSERT INTO quota (subscriber_id, resource, count, reset_on) VALUES (2, 'notifications', 49, ?);")
        .bind(day1.with_timezone(&chrono_tz::Europe::Moscow).date_naive().to_string())
        .execute(h.store.pool())
        .await
        .unwrap();

    let t4 = tender("0372-4", "Поставка ноутбуков для колледжа", 900_000.0, day1 - Duration::days(1));
    let t5 = tender("0372-5", "Поставка ноутбуков для лицея", 900_000.0, day1 - Duration::days(1));
    for id in ["0372-4", "0372-5"] {
        h.feed.set_enrichment(
            id,
            MockEnrichment {
                price: Some(900_000.0),
                region: Some("Москва".to_string()),
                deadline: Some(day1 + Duration::days(30)),
            },
        );
    }
    h.feed.set_tenders(vec![t4, t5]);

    // Cycle 1: only the first tender in feed order fits the remaining unit.
    let metrics = h.engine.run_cycle(day1).await.unwrap();
    assert_eq!(metrics.sent, 1);
    assert_eq!(metrics.quota_dropped, 1);
    let sent = h.sink.sent();
    assert!(sent[0].1.contains("колледжа"));

    // Cycle 2, same local day: the delivered one dedups, the other is still
    // over quota.
    let metrics = h.engine.run_cycle(day1 + Duration::hours(1)).await.unwrap();
    assert_eq!(metrics.sent, 0);
    assert_eq!(metrics.deduplicated, 1);
    assert_eq!(metrics.quota_dropped, 1);

    // Cycle 3, after local midnight: the remaining tender goes out.
    let day2 = moscow(2026, 7, 2, 0, 30);
    let metrics = h.engine.run_cycle(day2).await.unwrap();
    assert_eq!(metrics.sent, 1);
    assert!(h.sink.sent()[1].1.contains("лицея"));
}

/// S6: a blocked recipient gets no sink calls and no ledger rows; liveness
/// restores delivery.
#[tokio::test]
async fn blocked_recipient_and_liveness() {
    let h = harness().await;
    seed_subscriber(&h.store, 3, "basic", None).await;
    sqlx::query("UPDATE subscriber SET delivery_blocked = TRUE WHERE id = 3;")
        .execute(h.store.pool())
        .await
        .unwrap();
    seed_filter(
        &h.store,
        1,
        3,
        &["ноутбук"],
        &[],
        None,
        None,
        &["goods"],
        "44-FZ",
        0,
    )
    .await;

    let now = moscow(2026, 7, 1, 12, 0);
    h.feed
        .set_tenders(vec![tender("0372-6", "Поставка ноутбуков", 700_000.0, now - Duration::days(1))]);
    h.feed.set_enrichment(
        "0372-6",
        MockEnrichment {
            price: Some(700_000.0),
            region: Some("Москва".to_string()),
            deadline: Some(now + Duration::days(20)),
        },
    );

    let metrics = h.engine.run_cycle(now).await.unwrap();
    assert_eq!(metrics.sent, 0);
    assert_eq!(h.sink.attempt_count(), 0);
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM delivery;")
        .fetch_one(h.store.pool())
        .await
        .unwrap();
    assert_eq!(count.0, 0);

    // Inbound interaction clears the block; the next cycle delivers.
    h.engine.handle_inbound(3).await.unwrap();
    let metrics = h.engine.run_cycle(now + Duration::minutes(10)).await.unwrap();
    assert_eq!(metrics.sent, 1);
    assert_eq!(h.sink.sent().len(), 1);
}

/// A permanent sink failure suspends the subscriber's filters until an
/// inbound interaction restores them.
#[tokio::test]
async fn permanent_sink_failure_blocks_until_liveness() {
    let h = harness().await;
    seed_subscriber(&h.store, 1, "basic", None).await;
    seed_filter(
        &h.store,
        1,
        1,
        &["ноутбук"],
        &[],
        None,
        None,
        &["goods"],
        "44-FZ",
        0,
    )
    .await;

    let now = moscow(2026, 7, 1, 12, 0);
    h.feed
        .set_tenders(vec![tender("0372-7", "Поставка ноутбуков", 700_000.0, now - Duration::days(1))]);
    h.feed.set_enrichment(
        "0372-7",
        MockEnrichment {
            price: Some(700_000.0),
            region: None,
            deadline: Some(now + Duration::days(20)),
        },
    );

    h.sink.script_outcome(SendOutcome::Permanent);
    let metrics = h.engine.run_cycle(now).await.unwrap();
    assert_eq!(metrics.sink_permanent, 1);
    assert_eq!(metrics.sent, 0);

    // Filters are suspended: the next cycle processes nothing.
    let metrics = h.engine.run_cycle(now + Duration::minutes(10)).await.unwrap();
    assert_eq!(metrics.filters_processed, 0);

    // Liveness restores the filter and the send succeeds.
    h.engine.handle_inbound(1).await.unwrap();
    let metrics = h.engine.run_cycle(now + Duration::minutes(20)).await.unwrap();
    assert_eq!(metrics.sent, 1);
}

/// A transient sink failure releases the reservation; the next cycle
/// retries and succeeds without a duplicate.
#[tokio::test]
async fn transient_sink_failure_retries_next_cycle() {
    let h = harness().await;
    seed_subscriber(&h.store, 1, "basic", None).await;
    seed_filter(
        &h.store,
        1,
        1,
        &["ноутбук"],
        &[],
        None,
        None,
        &["goods"],
        "44-FZ",
        0,
    )
    .await;

    let now = moscow(2026, 7, 1, 12, 0);
    h.feed
        .set_tenders(vec![tender("0372-8", "Поставка ноутбуков", 700_000.0, now - Duration::days(1))]);
    h.feed.set_enrichment(
        "0372-8",
        MockEnrichment {
            price: Some(700_000.0),
            region: None,
            deadline: Some(now + Duration::days(20)),
        },
    );

    h.sink.script_outcome(SendOutcome::Transient);
    let metrics = h.engine.run_cycle(now).await.unwrap();
    assert_eq!(metrics.sink_transient, 1);
    assert_eq!(metrics.sent, 0);
    // A failed send never charges quota.
    assert_eq!(notifications_used(&h.store, 1, now).await, 0);

    let metrics = h.engine.run_cycle(now + Duration::minutes(10)).await.unwrap();
    assert_eq!(metrics.sent, 1);
    assert_eq!(h.sink.sent().len(), 1);
}

/// Quiet hours defer the notification to the first cycle after the window
/// without charging quota.
#[tokio::test]
async fn quiet_hours_defer_delivery() {
    let h = harness().await;
    seed_subscriber(&h.store, 1, "basic", Some(("22:00", "09:00"))).await;
    seed_filter(
        &h.store,
        1,
        1,
        &["ноутбук"],
        &[],
        None,
        None,
        &["goods"],
        "44-FZ",
        0,
    )
    .await;

    let late_evening = moscow(2026, 7, 1, 23, 0);
    h.feed.set_tenders(vec![tender(
        "0372-9",
        "Поставка ноутбуков",
        700_000.0,
        late_evening - Duration::days(1),
    )]);
    h.feed.set_enrichment(
        "0372-9",
        MockEnrichment {
            price: Some(700_000.0),
            region: None,
            deadline: Some(late_evening + Duration::days(20)),
        },
    );

    let metrics = h.engine.run_cycle(late_evening).await.unwrap();
    assert_eq!(metrics.quiet_deferred, 1);
    assert_eq!(metrics.sent, 0);
    assert_eq!(notifications_used(&h.store, 1, late_evening).await, 0);

    // First cycle after the window ends.
    let next_morning = moscow(2026, 7, 2, 9, 30);
    let metrics = h.engine.run_cycle(next_morning).await.unwrap();
    assert_eq!(metrics.sent, 1);
}

/// Tenders published more than 90 days ago never reach enrichment.
#[tokio::test]
async fn archive_guard_drops_old_tenders() {
    let h = harness().await;
    seed_subscriber(&h.store, 1, "basic", None).await;
    seed_filter(
        &h.store,
        1,
        1,
        &["ноутбук"],
        &[],
        None,
        None,
        &["goods"],
        "44-FZ",
        0,
    )
    .await;

    let now = moscow(2026, 7, 1, 12, 0);
    h.feed.set_tenders(vec![tender(
        "0372-10",
        "Поставка ноутбуков",
        700_000.0,
        now - Duration::days(100),
    )]);

    let metrics = h.engine.run_cycle(now).await.unwrap();
    assert_eq!(metrics.archived_dropped, 1);
    assert_eq!(metrics.enriched, 0);
    assert_eq!(metrics.sent, 0);
}

/// An expiring submission deadline blocks delivery under the filter's
/// safety margin.
#[tokio::test]
async fn deadline_guard_blocks_expiring_tenders() {
    let h = harness().await;
    seed_subscriber(&h.store, 1, "basic", None).await;
    seed_filter(
        &h.store,
        1,
        1,
        &["ноутбук"],
        &[],
        None,
        None,
        &["goods"],
        "44-FZ",
        5,
    )
    .await;

    let now = moscow(2026, 7, 1, 12, 0);
    h.feed
        .set_tenders(vec![tender("0372-11", "Поставка ноутбуков", 700_000.0, now - Duration::days(1))]);
    h.feed.set_enrichment(
        "0372-11",
        MockEnrichment {
            price: Some(700_000.0),
            region: None,
            deadline: Some(now + Duration::days(2)),
        },
    );

    let metrics = h.engine.run_cycle(now).await.unwrap();
    assert_eq!(metrics.full_score_dropped, 1);
    assert_eq!(metrics.sent, 0);
}

/// With the oracle quota exhausted the verdict is UNKNOWN: no boost is
/// added, so a borderline tender stays below the notification threshold.
#[tokio::test]
async fn unknown_oracle_verdict_never_boosts() {
    // Title scores 50 from two exact keywords, minus 20 from four negative
    // patterns: full score 30, below the send threshold of 35 unless the
    // oracle boost lands.
    let title = "ноутбук компьютер фундамент котлован штукатурка облицовка";

    for (oracle_cap, expect_sent) in [(0u32, 0u64), (100, 1)] {
        let mut config = EngineConfig::default();
        config
            .tier_caps
            .get_mut(&tender_sentinel::types::Tier::Basic)
            .unwrap()
            .oracle_calls_per_day = oracle_cap;
        let h = harness_with(config, Some(72)).await;

        seed_subscriber(&h.store, 1, "basic", None).await;
        seed_filter(
            &h.store,
            1,
            1,
            &["ноутбук", "компьютер"],
            &[],
            None,
            None,
            &["goods"],
            "44-FZ",
            0,
        )
        .await;

        let now = moscow(2026, 7, 1, 12, 0);
        let mut t12 = tender("0372-12", title, 700_000.0, now - Duration::days(1));
        // No price signal: the score must sit just below the send threshold.
        t12.price = None;
        h.feed.set_tenders(vec![t12]);

        let metrics = h.engine.run_cycle(now).await.unwrap();
        assert_eq!(
            metrics.sent, expect_sent,
            "oracle cap {oracle_cap} produced the wrong outcome"
        );
        if oracle_cap == 0 {
            assert_eq!(h.oracle.call_count(), 0);
        }
    }
}

/// Confidences are cached per intent version; a repeat cycle consults the
/// cache, not the oracle.
#[tokio::test]
async fn oracle_confidence_is_cached_per_intent_version() {
    let h = harness().await;
    seed_subscriber(&h.store, 1, "basic", None).await;
    seed_filter(
        &h.store,
        1,
        1,
        &["ноутбук"],
        &[],
        None,
        None,
        &["goods"],
        "44-FZ",
        0,
    )
    .await;

    let now = moscow(2026, 7, 1, 12, 0);
    h.feed
        .set_tenders(vec![tender("0372-13", "Поставка ноутбуков", 700_000.0, now - Duration::days(1))]);
    h.feed.set_enrichment(
        "0372-13",
        MockEnrichment {
            price: Some(700_000.0),
            region: None,
            deadline: Some(now + Duration::days(20)),
        },
    );

    h.engine.run_cycle(now).await.unwrap();
    assert_eq!(h.oracle.call_count(), 1);

    // Same tender next cycle: cache hit, no new oracle call, no new send.
    let metrics = h.engine.run_cycle(now + Duration::minutes(10)).await.unwrap();
    assert_eq!(h.oracle.call_count(), 1);
    assert_eq!(metrics.oracle_cache_hits, 1);

    // An intent edit bumps the version and invalidates the cached verdict.
    h.store.bump_intent_version(1, "другая формулировка").await.unwrap();
    sqlx::query("DELETE FROM delivery;")
        .execute(h.store.pool())
        .await
        .unwrap();
    h.engine.run_cycle(now + Duration::minutes(20)).await.unwrap();
    assert_eq!(h.oracle.call_count(), 2);
}

/// Group routing: extra chats receive the message, quota is charged once to
/// the owning subscriber.
#[tokio::test]
async fn group_chats_share_owner_quota() {
    let h = harness().await;
    seed_subscriber(&h.store, 1, "basic", None).await;
    seed_filter(
        &h.store,
        1,
        1,
        &["ноутбук"],
        &[],
        None,
        None,
        &["goods"],
        "44-FZ",
        0,
    )
    .await;
    sqlx::query("UPDATE filter SET notify_chat_ids = '[-500, -501]' WHERE id = 1;")
        .execute(h.store.pool())
        .await
        .unwrap();

    let now = moscow(2026, 7, 1, 12, 0);
    h.feed
        .set_tenders(vec![tender("0372-14", "Поставка ноутбуков", 700_000.0, now - Duration::days(1))]);
    h.feed.set_enrichment(
        "0372-14",
        MockEnrichment {
            price: Some(700_000.0),
            region: None,
            deadline: Some(now + Duration::days(20)),
        },
    );

    let metrics = h.engine.run_cycle(now).await.unwrap();
    assert_eq!(metrics.sent, 1);
    let sent = h.sink.sent();
    assert_eq!(sent.len(), 3);
    let chats: Vec<i64> = sent.iter().map(|(chat, _)| *chat).collect();
    assert!(chats.contains(&100) && chats.contains(&-500) && chats.contains(&-501));
    assert_eq!(notifications_used(&h.store, 1, now).await, 1);
}
