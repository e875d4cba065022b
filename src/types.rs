//! Core domain types shared across the pipeline.
//!
//! Subscribers and filters are produced by the front-end and only read here;
//! tenders enter through the feed and are never mutated after enrichment.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Subscription tier. Caps for each tier live in `EngineConfig::tier_caps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Trial,
    Basic,
    Premium,
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trial" => Ok(Tier::Trial),
            "basic" => Ok(Tier::Basic),
            "premium" => Ok(Tier::Premium),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Trial => write!(f, "trial"),
            Tier::Basic => write!(f, "basic"),
            Tier::Premium => write!(f, "premium"),
        }
    }
}

/// A notification recipient. Quiet hours and quota days are computed in the
/// subscriber's own IANA timezone, never a fixed offset.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: i64,
    pub chat_id: i64,
    pub tier: Tier,
    pub quiet_start: Option<NaiveTime>,
    pub quiet_end: Option<NaiveTime>,
    pub tz: Tz,
    pub delivery_blocked: bool,
    /// Migration compatibility shim for less-structured flags. Not part of
    /// the pipeline contract; typed fields above are authoritative.
    pub data: serde_json::Value,
}

/// Procurement type declared on a tender or requested by a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenderType {
    Goods,
    Services,
    Works,
}

/// Legal regime of the procurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LawType {
    #[serde(rename = "44-FZ")]
    Fz44,
    #[serde(rename = "223-FZ")]
    Fz223,
    #[serde(rename = "any")]
    Any,
}

impl LawType {
    /// Whether a filter requesting `self` accepts a tender published under
    /// `declared` (a feed entry with no regime metadata is accepted).
    pub fn accepts(self, declared: Option<LawType>) -> bool {
        match (self, declared) {
            (LawType::Any, _) => true,
            (_, None) => true,
            (want, Some(got)) => want == got || got == LawType::Any,
        }
    }
}

/// A subscriber-owned matching specification.
#[derive(Debug, Clone)]
pub struct Filter {
    pub id: i64,
    pub subscriber_id: i64,
    pub name: String,
    pub is_active: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Ordered and non-empty; an empty keyword list is rejected at the
    /// storage boundary before a filter can reach the pipeline.
    pub keywords: NonEmpty<String>,
    pub exclude_keywords: Vec<String>,
    /// Weighted x2 in scoring.
    pub primary_keywords: Vec<String>,
    pub secondary_keywords: Vec<String>,
    /// Canonical region names; empty means any region.
    pub regions: Vec<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub tender_types: Vec<TenderType>,
    pub law_type: LawType,
    /// Free-text intent handed to the relevance oracle.
    pub ai_intent: String,
    /// Bumped whenever matching inputs change; part of the oracle cache key.
    pub ai_intent_version: i64,
    /// Derived synonyms for the keyword set.
    pub expanded_keywords: Vec<String>,
    pub min_deadline_days: i64,
    /// Additional chats the notification is routed to. Quota stays charged
    /// to the owning subscriber.
    pub notify_chat_ids: Vec<i64>,
}

/// A tender exactly as the feed surfaced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTender {
    /// Procurement number; unique upstream.
    pub id: String,
    pub customer: String,
    pub customer_inn: Option<String>,
    pub title: String,
    pub description: Option<String>,
    /// Declared price; may be coarse or absent at feed level.
    pub price: Option<f64>,
    pub tender_type: Option<TenderType>,
    pub law_type: Option<LawType>,
    pub published_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    /// Free-text performance-region hint from the feed, if any.
    pub region_hint: Option<String>,
    pub url: String,
}

/// A tender after the detail page was consulted. Fields stay `None` when the
/// detail fetch timed out or the page did not carry them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedTender {
    pub raw: RawTender,
    /// Precise starting price from the detail page, if extracted.
    pub price: Option<f64>,
    /// Canonical federal subject, or `None` when unresolvable.
    pub customer_region: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub detail_title: Option<String>,
    /// Fingerprint of the raw detail page the fields were extracted from.
    pub fingerprint: Option<String>,
}

impl EnrichedTender {
    /// Partial record carrying only feed-level fields; used when the detail
    /// fetch fails so the pipeline can continue on what it has.
    pub fn partial(raw: RawTender) -> Self {
        Self {
            price: raw.price,
            deadline: raw.deadline,
            raw,
            customer_region: None,
            detail_title: None,
            fingerprint: None,
        }
    }

    /// Best-known price: detail page wins over the feed figure.
    pub fn effective_price(&self) -> Option<f64> {
        self.price.or(self.raw.price)
    }

    /// Best-known submission deadline.
    pub fn effective_deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline.or(self.raw.deadline)
    }
}

/// Classification a score maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchVerdict {
    Reject,
    Consider,
    Accept,
}

/// Why the matcher short-circuited a tender to score 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCause {
    ExcludeKeyword,
    Region,
    TenderType,
    LawType,
    Deadline,
    NoSignal,
}

impl fmt::Display for RejectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectCause::ExcludeKeyword => "exclude-keyword",
            RejectCause::Region => "region",
            RejectCause::TenderType => "tender-type",
            RejectCause::LawType => "law-type",
            RejectCause::Deadline => "deadline",
            RejectCause::NoSignal => "no-signal",
        };
        write!(f, "{s}")
    }
}

/// Deterministic scoring result for one (tender, filter) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreReport {
    /// Composite deterministic score, clipped to [0, 100].
    pub score: u8,
    pub verdict: MatchVerdict,
    pub matched_keywords: Vec<String>,
    /// Per-signal contributions before clipping, for diagnostics.
    pub components: HashMap<String, i32>,
    pub reject_cause: Option<RejectCause>,
    /// Filled in by the pipeline after the oracle was consulted.
    pub oracle_confidence: Option<u8>,
}

impl ScoreReport {
    pub fn rejected(cause: RejectCause) -> Self {
        Self {
            score: 0,
            verdict: MatchVerdict::Reject,
            matched_keywords: Vec::new(),
            components: HashMap::new(),
            reject_cause: Some(cause),
            oracle_confidence: None,
        }
    }
}

/// Pipeline decision rule for tenders whose region could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullRegionPolicy {
    Pass,
    Penalise,
    Reject,
}

impl FromStr for NullRegionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" | "pass-through" => Ok(NullRegionPolicy::Pass),
            "penalise" | "penalize" => Ok(NullRegionPolicy::Penalise),
            "reject" => Ok(NullRegionPolicy::Reject),
            other => Err(format!("unknown null-region policy: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parses_case_insensitively() {
        assert_eq!("Premium".parse::<Tier>().unwrap(), Tier::Premium);
        assert_eq!("trial".parse::<Tier>().unwrap(), Tier::Trial);
        assert!("gold".parse::<Tier>().is_err());
    }

    #[test]
    fn law_type_accepts_matrix() {
        assert!(LawType::Any.accepts(Some(LawType::Fz44)));
        assert!(LawType::Fz44.accepts(None));
        assert!(LawType::Fz44.accepts(Some(LawType::Fz44)));
        assert!(!LawType::Fz44.accepts(Some(LawType::Fz223)));
    }

    #[test]
    fn partial_enrichment_keeps_feed_fields() {
        let raw = RawTender {
            id: "0372-1".to_string(),
            customer: "ГБУ Тест".to_string(),
            customer_inn: None,
            title: "Поставка ноутбуков".to_string(),
            description: None,
            price: Some(1_200_000.0),
            tender_type: Some(TenderType::Goods),
            law_type: Some(LawType::Fz44),
            published_at: Utc::now(),
            deadline: None,
            region_hint: None,
            url: "https://example.test/1".to_string(),
        };
        let enriched = EnrichedTender::partial(raw);
        assert_eq!(enriched.effective_price(), Some(1_200_000.0));
        assert!(enriched.customer_region.is_none());
    }
}
