//! Semantic relevance verification behind an abstract oracle.
//!
//! The oracle only ever sees a small JSON payload; the pipeline owns the
//! thresholds, the boost, and the cache. A transport failure or an exhausted
//! quota is UNKNOWN: no boost, no cache entry, never a default confidence.

use crate::config::EngineConfig;
use crate::types::EnrichedTender;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OracleDecision {
    Accept,
    Recheck,
    Reject,
    /// Quota exhausted or transport failure. Treated as "no signal".
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OracleAssessment {
    pub confidence: Option<u8>,
    pub decision: OracleDecision,
}

impl OracleAssessment {
    pub fn unknown() -> Self {
        Self {
            confidence: None,
            decision: OracleDecision::Unknown,
        }
    }

    /// Map a confidence to a decision with the configured thresholds.
    pub fn from_confidence(confidence: u8, config: &EngineConfig) -> Self {
        let decision = if confidence >= config.oracle_accept_confidence {
            OracleDecision::Accept
        } else if confidence < config.oracle_reject_confidence {
            OracleDecision::Reject
        } else {
            // RECHECK counts as a rejection for notification purposes;
            // re-runs with a stronger model are out of scope.
            OracleDecision::Recheck
        };
        Self {
            confidence: Some(confidence),
            decision,
        }
    }

    /// Score boost the pipeline adds on top of the deterministic score.
    /// UNKNOWN contributes nothing.
    pub fn boost(&self, config: &EngineConfig) -> u8 {
        match self.confidence {
            Some(c) if c >= 60 => config.oracle_strong_boost,
            Some(c) if c >= config.oracle_accept_confidence => config.oracle_weak_boost,
            _ => 0,
        }
    }
}

/// Cache key for one (tender, filter-intent) pair. The intent version is
/// part of the key so edited filters invalidate stale confidences.
pub fn oracle_cache_key(tender_id: &str, filter_id: i64, intent_version: i64) -> String {
    format!("f{filter_id}:v{intent_version}:{tender_id}")
}

/// Abstract semantic verifier.
#[async_trait]
pub trait RelevanceOracle: Send + Sync {
    /// Assess how well a tender matches a filter intent. Implementations
    /// return UNKNOWN on any failure; they never error the pipeline.
    async fn assess(&self, tender: &EnrichedTender, intent: &str) -> OracleAssessment;
}

/// Production oracle over an OpenAI-compatible chat-completion endpoint.
pub struct HttpRelevanceOracle {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
    config: EngineConfig,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ConfidencePayload {
    confidence: u8,
    #[serde(default)]
    #[allow(dead_code)]
    reasoning: Option<String>,
}

impl HttpRelevanceOracle {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("Failed to build oracle HTTP client")?;
        Ok(Self {
            client,
            url: config.oracle_url.clone(),
            model: config.oracle_model.clone(),
            api_key: config.oracle_api_key.clone(),
            config: config.clone(),
        })
    }

    async fn request_confidence(&self, tender: &EnrichedTender, intent: &str) -> Result<u8> {
        let payload = json!({
            "model": self.model,
            "response_format": {"type": "json_object"},
            "messages": [
                {
                    "role": "system",
                    "content": "Ты оцениваешь релевантность госзакупки запросу пользователя. \
                                Ответь JSON-объектом {\"confidence\": 0..100, \"reasoning\": \"...\"}."
                },
                {
                    "role": "user",
                    "content": json!({
                        "tender": {
                            "title": tender.raw.title,
                            "description": tender.raw.description,
                            "customer": tender.raw.customer,
                            "region": tender.customer_region,
                        },
                        "intent": intent,
                    }).to_string()
                }
            ],
        });

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.context("Oracle request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Oracle returned status {}", response.status());
        }

        let completion: CompletionResponse =
            response.json().await.context("Oracle response parse failed")?;
        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();
        let parsed: ConfidencePayload =
            serde_json::from_str(content).context("Oracle verdict parse failed")?;

        Ok(parsed.confidence.min(100))
    }
}

#[async_trait]
impl RelevanceOracle for HttpRelevanceOracle {
    #[instrument(skip(self, tender, intent), fields(tender = %tender.raw.id))]
    async fn assess(&self, tender: &EnrichedTender, intent: &str) -> OracleAssessment {
        match self.request_confidence(tender, intent).await {
            Ok(confidence) => {
                let assessment = OracleAssessment::from_confidence(confidence, &self.config);
                debug!(
                    "oracle confidence {confidence} for tender {}: {:?}",
                    tender.raw.id, assessment.decision
                );
                assessment
            }
            Err(e) => {
                warn!("oracle unavailable for tender {}: {e}", tender.raw.id);
                OracleAssessment::unknown()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_map_to_decisions() {
        let config = EngineConfig::default();
        assert_eq!(
            OracleAssessment::from_confidence(72, &config).decision,
            OracleDecision::Accept
        );
        assert_eq!(
            OracleAssessment::from_confidence(40, &config).decision,
            OracleDecision::Accept
        );
        assert_eq!(
            OracleAssessment::from_confidence(30, &config).decision,
            OracleDecision::Recheck
        );
        assert_eq!(
            OracleAssessment::from_confidence(24, &config).decision,
            OracleDecision::Reject
        );
    }

    #[test]
    fn boost_bands() {
        let config = EngineConfig::default();
        assert_eq!(OracleAssessment::from_confidence(72, &config).boost(&config), 15);
        assert_eq!(OracleAssessment::from_confidence(60, &config).boost(&config), 15);
        assert_eq!(OracleAssessment::from_confidence(55, &config).boost(&config), 10);
        assert_eq!(OracleAssessment::from_confidence(40, &config).boost(&config), 10);
        assert_eq!(OracleAssessment::from_confidence(39, &config).boost(&config), 0);
    }

    #[test]
    fn unknown_never_boosts() {
        let config = EngineConfig::default();
        assert_eq!(OracleAssessment::unknown().boost(&config), 0);
        assert_eq!(OracleAssessment::unknown().confidence, None);
    }

    #[test]
    fn cache_key_changes_with_intent_version() {
        let v1 = oracle_cache_key("t-1", 10, 1);
        let v2 = oracle_cache_key("t-1", 10, 2);
        assert_ne!(v1, v2);
        assert_ne!(oracle_cache_key("t-1", 10, 1), oracle_cache_key("t-1", 11, 1));
    }
}
