//! Pipeline orchestrator.
//!
//! One coordinator task runs the cycle clock; the inside of each cycle fans
//! filters out onto a bounded worker pool. The cadence is measured from the
//! end of one cycle to the start of the next, so cycles never overlap.
//!
//! Per tender the steps are strictly ordered: pre-score, enrich, full-score,
//! oracle, reserve, send, confirm. Every reservation taken in this module is
//! ended on every path, success or not.

use crate::config::EngineConfig;
use crate::error::SentinelError;
use crate::matcher::SmartMatcher;
use crate::pipeline::cache::{CacheKind, PersistentCache};
use crate::pipeline::feed::{FeedQuery, FeedSource};
use crate::pipeline::ledger::{AbandonCause, DeliveryLedger, ReserveOutcome};
use crate::pipeline::oracle::{oracle_cache_key, OracleAssessment, RelevanceOracle};
use crate::pipeline::quota::{QuotaGate, QuotaResource};
use crate::pipeline::sink::{render_notification, NotificationSink, SendOutcome};
use crate::pipeline::store::Store;
use crate::types::{EnrichedTender, Filter, MatchVerdict, RawTender, ScoreReport, Subscriber};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Engine lifecycle. `Stopping` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Polling,
    Draining,
    Stopping,
}

/// Counters for one cycle, logged when the cycle ends.
#[derive(Debug, Default, Clone)]
pub struct CycleMetrics {
    pub filters_processed: u64,
    pub polled: u64,
    pub archived_dropped: u64,
    pub pre_score_dropped: u64,
    pub enriched: u64,
    pub enrichment_cache_hits: u64,
    pub full_score_dropped: u64,
    pub oracle_calls: u64,
    pub oracle_cache_hits: u64,
    pub below_threshold: u64,
    pub deduplicated: u64,
    pub quiet_deferred: u64,
    pub quota_dropped: u64,
    pub sent: u64,
    pub sink_transient: u64,
    pub sink_permanent: u64,
}

/// Signals the coordinator to drain and exit.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

pub struct PipelineEngine {
    config: Arc<EngineConfig>,
    store: Store,
    worker: FilterWorker,
    state: Arc<Mutex<EngineState>>,
    stop_flag: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

/// Everything a spawned per-filter task needs, cheap to clone.
#[derive(Clone)]
struct FilterWorker {
    config: Arc<EngineConfig>,
    cache: PersistentCache,
    quota: QuotaGate,
    ledger: DeliveryLedger,
    matcher: SmartMatcher,
    feed: Arc<dyn FeedSource>,
    oracle: Arc<dyn RelevanceOracle>,
    sink: Arc<dyn NotificationSink>,
    store: Store,
    enrich_global: Arc<Semaphore>,
    stop_flag: Arc<AtomicBool>,
}

impl PipelineEngine {
    pub fn new(
        config: EngineConfig,
        store: Store,
        feed: Arc<dyn FeedSource>,
        oracle: Arc<dyn RelevanceOracle>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let config = Arc::new(config);
        let cache = PersistentCache::new(
            store.pool().clone(),
            Duration::from_secs(config.enrichment_ttl_secs),
            Duration::from_secs(config.oracle_ttl_secs),
        );
        let quota = QuotaGate::new(store.pool().clone());
        let ledger = DeliveryLedger::new(store.pool().clone());
        let stop_flag = Arc::new(AtomicBool::new(false));

        let worker = FilterWorker {
            config: config.clone(),
            cache,
            quota,
            ledger,
            matcher: SmartMatcher::new(),
            feed,
            oracle,
            sink,
            store: store.clone(),
            enrich_global: Arc::new(Semaphore::new(config.max_enrichments_global)),
            stop_flag: stop_flag.clone(),
        };

        Self {
            config,
            store,
            worker,
            state: Arc::new(Mutex::new(EngineState::Idle)),
            stop_flag,
            stop_notify: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.stop_flag.clone(),
            notify: self.stop_notify.clone(),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().expect("state lock")
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().expect("state lock") = state;
        debug!("engine state: {state:?}");
    }

    /// Liveness signal from the front-end: an inbound interaction clears the
    /// delivery block and restores the filters it suspended.
    pub async fn handle_inbound(&self, subscriber_id: i64) -> Result<()> {
        self.worker.ledger.clear_blocked(subscriber_id).await?;
        self.store.restore_suspended_filters(subscriber_id).await?;
        Ok(())
    }

    /// Coordinator loop: cycle, maintenance, sleep, repeat. The interval is
    /// measured from cycle end, never start-to-start.
    pub async fn run(&self) {
        info!(
            "pipeline engine starting: {}s cadence, {} filters in flight",
            self.config.poll_interval_secs, self.config.max_filters_in_flight
        );

        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }

            match self.run_cycle(Utc::now()).await {
                Ok(metrics) => {
                    info!(
                        "cycle done: {} filters, {} polled, {} enriched, {} oracle calls, {} sent, {} deduped",
                        metrics.filters_processed,
                        metrics.polled,
                        metrics.enriched,
                        metrics.oracle_calls,
                        metrics.sent,
                        metrics.deduplicated,
                    );
                }
                Err(e) => {
                    let fatal = SentinelError::Fatal(format!("{e:#}"));
                    error!("{fatal}; engine refuses further cycles, operator required");
                    self.set_state(EngineState::Stopping);
                    return;
                }
            }

            self.run_maintenance().await;

            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
                _ = self.stop_notify.notified() => {}
            }
        }

        self.set_state(EngineState::Stopping);
        info!("pipeline engine stopped");
    }

    /// One poll cycle over every active filter. Errors only on loss of the
    /// persistent backend; external failures are contained per filter.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleMetrics> {
        self.set_state(EngineState::Polling);
        let metrics = Arc::new(Mutex::new(CycleMetrics::default()));

        let pairs = self.store.load_active_filters().await?;
        debug!("cycle over {} active filters", pairs.len());

        let filter_slots = Arc::new(Semaphore::new(self.config.max_filters_in_flight));
        let mut tasks = JoinSet::new();

        for (subscriber, filter) in pairs {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            let permit = filter_slots
                .clone()
                .acquire_owned()
                .await
                .expect("filter semaphore closed");
            let worker = self.worker.clone();
            let metrics = metrics.clone();
            tasks.spawn(async move {
                worker.process_filter(&subscriber, &filter, now, &metrics).await;
                drop(permit);
            });
        }

        self.set_state(EngineState::Draining);
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("filter task panicked: {e}");
            }
        }

        self.set_state(EngineState::Idle);
        let metrics = metrics.lock().expect("metrics lock").clone();
        Ok(metrics)
    }

    /// Cache sweep plus reclamation of tentative reservations older than one
    /// cycle, so a crash strictly before a send cannot suppress a tender
    /// forever.
    pub async fn run_maintenance(&self) {
        if let Err(e) = self.worker.cache.sweep_expired().await {
            warn!("cache sweep failed: {e}");
        }
        let max_age = Duration::from_secs(self.config.poll_interval_secs);
        if let Err(e) = self.worker.ledger.sweep_tentative(max_age).await {
            warn!("tentative sweep failed: {e}");
        }
    }
}

impl FilterWorker {
    #[instrument(skip_all, fields(filter = filter.id, subscriber = subscriber.id))]
    async fn process_filter(
        &self,
        subscriber: &Subscriber,
        filter: &Filter,
        now: DateTime<Utc>,
        metrics: &Arc<Mutex<CycleMetrics>>,
    ) {
        let query = FeedQuery {
            keywords: filter.keywords.iter().cloned().collect(),
            price_min: filter.price_min,
            price_max: filter.price_max,
            law_type: filter.law_type,
            tender_types: filter.tender_types.clone(),
        };

        let candidates = match self.feed.poll(&query).await {
            Ok(candidates) => candidates,
            Err(e) => {
                // Transient feed failures wait for the next cycle.
                warn!("feed poll failed for filter {}: {e}", filter.id);
                return;
            }
        };

        {
            let mut m = metrics.lock().expect("metrics lock");
            m.filters_processed += 1;
            m.polled += candidates.len() as u64;
        }

        // Archive guard, then the cheap pass; both run before any HTTP.
        let archive_cutoff = now - ChronoDuration::days(self.config.archive_max_age_days);
        let mut survivors = Vec::new();
        for tender in candidates {
            if tender.published_at < archive_cutoff {
                metrics.lock().expect("metrics lock").archived_dropped += 1;
                continue;
            }
            let report = self.matcher.pre_score(&tender, filter);
            if report.reject_cause.is_some()
                || (report.score as i32) < self.config.pre_score_threshold
            {
                metrics.lock().expect("metrics lock").pre_score_dropped += 1;
                continue;
            }
            survivors.push(tender);
        }

        let enriched = self.enrich_batch(survivors, metrics).await;

        // Full-score pass; feed order is preserved from here to the sink.
        let mut scored: Vec<(EnrichedTender, ScoreReport)> = Vec::new();
        for tender in enriched {
            let report =
                self.matcher
                    .full_score(&tender, filter, now, self.config.null_region_policy);
            if report.verdict == MatchVerdict::Reject
                || report.score < self.config.pre_notify_score
            {
                metrics.lock().expect("metrics lock").full_score_dropped += 1;
                continue;
            }
            scored.push((tender, report));
        }
        if scored.len() > self.config.max_candidates_per_filter {
            debug!(
                "filter {}: trimming {} candidates to cap {}",
                filter.id,
                scored.len(),
                self.config.max_candidates_per_filter
            );
            scored.truncate(self.config.max_candidates_per_filter);
        }

        for (tender, mut report) in scored {
            if self.stop_flag.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = self
                .deliver_candidate(subscriber, filter, &tender, &mut report, now, metrics)
                .await
            {
                warn!(
                    "delivery path failed for tender {} filter {}: {e:#}",
                    tender.raw.id, filter.id
                );
            }
        }
    }

    /// Enrich with bounded parallelism, consulting the persistent cache
    /// first. Feed order is restored after the parallel fetches.
    async fn enrich_batch(
        &self,
        tenders: Vec<RawTender>,
        metrics: &Arc<Mutex<CycleMetrics>>,
    ) -> Vec<EnrichedTender> {
        let per_filter = Arc::new(Semaphore::new(self.config.max_enrichments_per_filter));
        let mut tasks = JoinSet::new();

        for (index, tender) in tenders.into_iter().enumerate() {
            let per_filter = per_filter.clone();
            let global = self.enrich_global.clone();
            let cache = self.cache.clone();
            let feed = self.feed.clone();
            let metrics = metrics.clone();
            tasks.spawn(async move {
                let _filter_permit = per_filter.acquire_owned().await.expect("semaphore");
                let _global_permit = global.acquire_owned().await.expect("semaphore");

                if let Some(cached) = cache.get::<EnrichedTender>(CacheKind::Enrichment, &tender.id).await
                {
                    metrics.lock().expect("metrics lock").enrichment_cache_hits += 1;
                    return (index, cached);
                }

                let enriched = feed.enrich(&tender).await;
                if let Err(e) = cache.set(CacheKind::Enrichment, &tender.id, &enriched).await {
                    warn!("enrichment cache write failed for {}: {e}", tender.id);
                }
                metrics.lock().expect("metrics lock").enriched += 1;
                (index, enriched)
            });
        }

        let mut out: Vec<(usize, EnrichedTender)> = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(pair) => out.push(pair),
                Err(e) => warn!("enrichment task panicked: {e}"),
            }
        }
        out.sort_by_key(|(index, _)| *index);
        out.into_iter().map(|(_, tender)| tender).collect()
    }

    /// Steps (d) through (i): oracle, composite gate, reserve, quiet hours,
    /// quota, send, confirm. The reservation is ended on every path.
    async fn deliver_candidate(
        &self,
        subscriber: &Subscriber,
        filter: &Filter,
        tender: &EnrichedTender,
        report: &mut ScoreReport,
        now: DateTime<Utc>,
        metrics: &Arc<Mutex<CycleMetrics>>,
    ) -> Result<()> {
        let assessment = self
            .assess_with_quota(subscriber, filter, tender, now, metrics)
            .await?;
        report.oracle_confidence = assessment.confidence;

        let composite =
            (report.score as u16 + assessment.boost(&self.config) as u16).min(100) as u8;
        if composite < self.config.min_score_for_notification {
            metrics.lock().expect("metrics lock").below_threshold += 1;
            return Ok(());
        }

        let reservation = match self
            .ledger
            .reserve(subscriber.id, filter.id, &tender.raw.id)
            .await?
        {
            ReserveOutcome::Reserved(reservation) => reservation,
            ReserveOutcome::AlreadyDelivered => {
                metrics.lock().expect("metrics lock").deduplicated += 1;
                return Ok(());
            }
        };

        // Quiet hours are checked in the subscriber's zone; the tender is
        // deferred to the first cycle after the window ends.
        if in_quiet_hours(subscriber, now) {
            metrics.lock().expect("metrics lock").quiet_deferred += 1;
            self.ledger.abandon(&reservation, AbandonCause::QuietHours).await?;
            return Ok(());
        }

        let caps = self.config.caps_for(subscriber.tier);
        let granted = self
            .quota
            .try_consume_at(
                subscriber,
                QuotaResource::Notifications,
                caps.notifications_per_day,
                now,
            )
            .await?;
        if !granted {
            metrics.lock().expect("metrics lock").quota_dropped += 1;
            self.ledger
                .abandon(&reservation, AbandonCause::QuotaExhausted)
                .await?;
            return Ok(());
        }

        let mut final_report = report.clone();
        final_report.score = composite;
        let message = render_notification(tender, &final_report);

        match self.sink.send(subscriber.chat_id, &message).await {
            SendOutcome::Sent => {
                self.ledger.confirm(&reservation).await?;
                metrics.lock().expect("metrics lock").sent += 1;
                info!(
                    "sent tender {} to subscriber {} (filter {}, score {composite})",
                    tender.raw.id, subscriber.id, filter.id
                );
                // Group routing is best-effort and shares the quota charge
                // already taken above.
                for chat_id in &filter.notify_chat_ids {
                    if let SendOutcome::Transient | SendOutcome::Permanent =
                        self.sink.send(*chat_id, &message).await
                    {
                        warn!("group chat {chat_id} send failed for tender {}", tender.raw.id);
                    }
                }
            }
            SendOutcome::Transient => {
                metrics.lock().expect("metrics lock").sink_transient += 1;
                self.ledger
                    .abandon(&reservation, AbandonCause::SinkTransient)
                    .await?;
                // Charged only on successful delivery.
                self.quota
                    .refund(subscriber, QuotaResource::Notifications, now)
                    .await?;
            }
            SendOutcome::Permanent => {
                metrics.lock().expect("metrics lock").sink_permanent += 1;
                self.ledger
                    .abandon(&reservation, AbandonCause::RecipientBlocked)
                    .await?;
                self.quota
                    .refund(subscriber, QuotaResource::Notifications, now)
                    .await?;
                self.ledger.mark_blocked(subscriber.id).await?;
                self.store.deactivate_filters_for_blocked(subscriber.id).await?;
                warn!(
                    "subscriber {} unreachable, filters suspended until liveness returns",
                    subscriber.id
                );
            }
        }

        Ok(())
    }

    /// Oracle consultation under the oracle-call quota. Cached confidences
    /// are free; UNKNOWN is never cached and never boosted.
    async fn assess_with_quota(
        &self,
        subscriber: &Subscriber,
        filter: &Filter,
        tender: &EnrichedTender,
        now: DateTime<Utc>,
        metrics: &Arc<Mutex<CycleMetrics>>,
    ) -> Result<OracleAssessment> {
        let key = oracle_cache_key(&tender.raw.id, filter.id, filter.ai_intent_version);

        if let Some(confidence) = self.cache.get::<u8>(CacheKind::Oracle, &key).await {
            metrics.lock().expect("metrics lock").oracle_cache_hits += 1;
            return Ok(OracleAssessment::from_confidence(confidence, &self.config));
        }

        let caps = self.config.caps_for(subscriber.tier);
        let granted = self
            .quota
            .try_consume_at(
                subscriber,
                QuotaResource::OracleCalls,
                caps.oracle_calls_per_day,
                now,
            )
            .await?;
        if !granted {
            debug!(
                "oracle quota exhausted for subscriber {}, treating as UNKNOWN",
                subscriber.id
            );
            return Ok(OracleAssessment::unknown());
        }

        metrics.lock().expect("metrics lock").oracle_calls += 1;
        let assessment = self.oracle.assess(tender, &filter.ai_intent).await;

        if let Some(confidence) = assessment.confidence {
            if let Err(e) = self.cache.set(CacheKind::Oracle, &key, &confidence).await {
                warn!("oracle cache write failed for {key}: {e}");
            }
        }

        Ok(assessment)
    }
}

/// Whether `now` falls inside the subscriber's quiet window, computed in
/// their IANA zone. Windows may cross midnight.
pub fn in_quiet_hours(subscriber: &Subscriber, now: DateTime<Utc>) -> bool {
    let (Some(start), Some(end)) = (subscriber.quiet_start, subscriber.quiet_end) else {
        return false;
    };
    if start == end {
        return false;
    }
    let local = now.with_timezone(&subscriber.tz).time();
    if start < end {
        local >= start && local < end
    } else {
        local >= start || local < end
    }
}
