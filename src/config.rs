//! Engine configuration.
//!
//! Defaults first, environment overrides second. Secrets (sink token, oracle
//! key) only ever live in the environment, never in persisted state.

use crate::types::{NullRegionPolicy, Tier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

/// Daily caps for one tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierCaps {
    pub notifications_per_day: u32,
    pub oracle_calls_per_day: u32,
}

/// Every tunable parameter of the pipeline.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// sqlite connection string, e.g. `sqlite:./sentinel.db?mode=rwc`.
    pub database_url: String,

    /// Feed RSS endpoint the poll queries are issued against.
    pub feed_base_url: String,
    /// Outbound requests per second against the feed host.
    pub feed_rate_limit_rps: u32,
    /// Hard timeout for every feed / detail-page request, seconds.
    pub http_timeout_secs: u64,
    /// Retry attempts for a detail-page fetch before degrading to a
    /// partial record.
    pub enrich_retry_attempts: usize,

    /// Relevance oracle endpoint and model name.
    pub oracle_url: String,
    pub oracle_model: String,
    pub oracle_api_key: Option<String>,

    /// Notification sink bot token.
    pub sink_token: String,
    pub sink_base_url: String,

    /// Seconds between cycle end and the next cycle start.
    pub poll_interval_secs: u64,
    pub max_filters_in_flight: usize,
    pub max_enrichments_per_filter: usize,
    pub max_enrichments_global: usize,
    /// Candidates retained per filter per cycle after full-score.
    pub max_candidates_per_filter: usize,

    /// Tenders older than this never enter enrichment.
    pub archive_max_age_days: i64,

    /// Pre-score gate for attempting enrichment.
    pub pre_score_threshold: i32,
    /// Full-score gate for consulting the oracle.
    pub pre_notify_score: u8,
    /// Composite gate for reserving a delivery.
    pub min_score_for_notification: u8,

    pub null_region_policy: NullRegionPolicy,

    /// Oracle verdict thresholds and the boosts the pipeline applies.
    pub oracle_accept_confidence: u8,
    pub oracle_reject_confidence: u8,
    pub oracle_strong_boost: u8,
    pub oracle_weak_boost: u8,

    /// Cache TTLs, seconds.
    pub enrichment_ttl_secs: u64,
    pub oracle_ttl_secs: u64,

    pub tier_caps: HashMap<Tier, TierCaps>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut tier_caps = HashMap::new();
        tier_caps.insert(
            Tier::Trial,
            TierCaps {
                notifications_per_day: 20,
                oracle_calls_per_day: 20,
            },
        );
        tier_caps.insert(
            Tier::Basic,
            TierCaps {
                notifications_per_day: 50,
                oracle_calls_per_day: 100,
            },
        );
        tier_caps.insert(
            Tier::Premium,
            TierCaps {
                notifications_per_day: 100,
                oracle_calls_per_day: 10_000,
            },
        );

        Self {
            database_url: "sqlite:./sentinel.db?mode=rwc".to_string(),
            feed_base_url: "https://zakupki.gov.ru/epz/order/extendedsearch/rss.html".to_string(),
            feed_rate_limit_rps: 5,
            http_timeout_secs: 10,
            enrich_retry_attempts: 2,
            oracle_url: "https://api.openai.com/v1/chat/completions".to_string(),
            oracle_model: "gpt-4o-mini".to_string(),
            oracle_api_key: None,
            sink_token: String::new(),
            sink_base_url: "https://api.telegram.org".to_string(),
            poll_interval_secs: 300,
            max_filters_in_flight: 4,
            max_enrichments_per_filter: 8,
            max_enrichments_global: 16,
            max_candidates_per_filter: 50,
            archive_max_age_days: 90,
            pre_score_threshold: 1,
            pre_notify_score: 30,
            min_score_for_notification: 35,
            null_region_policy: NullRegionPolicy::Penalise,
            oracle_accept_confidence: 40,
            oracle_reject_confidence: 25,
            oracle_strong_boost: 15,
            oracle_weak_boost: 10,
            enrichment_ttl_secs: 7 * 24 * 3600,
            oracle_ttl_secs: 24 * 3600,
            tier_caps,
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Ok(v) = env::var("FEED_BASE_URL") {
            cfg.feed_base_url = v;
        }
        if let Ok(v) = env::var("ORACLE_URL") {
            cfg.oracle_url = v;
        }
        if let Ok(v) = env::var("ORACLE_MODEL") {
            cfg.oracle_model = v;
        }
        cfg.oracle_api_key = env::var("ORACLE_API_KEY").ok().or(cfg.oracle_api_key);
        if let Ok(v) = env::var("SINK_TOKEN") {
            cfg.sink_token = v;
        }
        if let Ok(v) = env::var("SINK_BASE_URL") {
            cfg.sink_base_url = v;
        }

        cfg.poll_interval_secs = env_num("POLL_INTERVAL_SECS", cfg.poll_interval_secs);
        cfg.http_timeout_secs = env_num("HTTP_TIMEOUT_SECS", cfg.http_timeout_secs);
        cfg.feed_rate_limit_rps = env_num("FEED_RATE_LIMIT_RPS", cfg.feed_rate_limit_rps);
        cfg.max_filters_in_flight = env_num("MAX_FILTERS_IN_FLIGHT", cfg.max_filters_in_flight);
        cfg.max_enrichments_per_filter =
            env_num("MAX_ENRICHMENTS_PER_FILTER", cfg.max_enrichments_per_filter);
        cfg.max_enrichments_global =
            env_num("MAX_ENRICHMENTS_GLOBAL", cfg.max_enrichments_global);
        cfg.max_candidates_per_filter =
            env_num("MAX_CANDIDATES_PER_FILTER", cfg.max_candidates_per_filter);
        cfg.archive_max_age_days = env_num("ARCHIVE_MAX_AGE_DAYS", cfg.archive_max_age_days);
        cfg.pre_notify_score = env_num("PRE_NOTIFY_SCORE", cfg.pre_notify_score);
        cfg.min_score_for_notification =
            env_num("MIN_SCORE_FOR_NOTIFICATION", cfg.min_score_for_notification);
        cfg.enrichment_ttl_secs = env_num("ENRICHMENT_TTL_SECS", cfg.enrichment_ttl_secs);
        cfg.oracle_ttl_secs = env_num("ORACLE_TTL_SECS", cfg.oracle_ttl_secs);

        if let Ok(v) = env::var("NULL_REGION_POLICY") {
            match v.parse::<NullRegionPolicy>() {
                Ok(policy) => cfg.null_region_policy = policy,
                Err(e) => tracing::warn!("ignoring NULL_REGION_POLICY: {e}"),
            }
        }

        cfg
    }

    pub fn caps_for(&self, tier: Tier) -> TierCaps {
        self.tier_caps.get(&tier).copied().unwrap_or(TierCaps {
            notifications_per_day: 0,
            oracle_calls_per_day: 0,
        })
    }
}

fn env_num<T: FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tier_table() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.caps_for(Tier::Trial).notifications_per_day, 20);
        assert_eq!(cfg.caps_for(Tier::Basic).oracle_calls_per_day, 100);
        assert_eq!(cfg.caps_for(Tier::Premium).oracle_calls_per_day, 10_000);
        assert_eq!(cfg.poll_interval_secs, 300);
        assert_eq!(cfg.null_region_policy, NullRegionPolicy::Penalise);
    }
}
