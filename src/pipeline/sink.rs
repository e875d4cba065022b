//! Notification rendering and delivery.
//!
//! The sink reports three outcomes: sent, transient (retry next cycle), and
//! permanent (recipient gone; block until liveness returns). It never throws
//! into the pipeline.

use crate::config::EngineConfig;
use crate::types::{EnrichedTender, ScoreReport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Rate limit, timeout, 5xx. The reservation is released and the tender
    /// retries next cycle.
    Transient,
    /// Recipient blocked, deleted, or invalid. The subscriber is flagged.
    Permanent,
}

/// A rendered notification with its inline actions.
#[derive(Debug, Clone)]
pub struct NotificationMessage {
    pub text: String,
    /// (label, callback-data) pairs for the front-end to route.
    pub actions: Vec<(String, String)>,
}

/// Build the short rich-text message for one matched tender.
pub fn render_notification(tender: &EnrichedTender, report: &ScoreReport) -> NotificationMessage {
    let mut text = format!("<b>{}</b>\n", escape_html(&tender.raw.title));

    if !tender.raw.customer.is_empty() {
        text.push_str(&format!("Заказчик: {}\n", escape_html(&tender.raw.customer)));
    }
    if let Some(region) = &tender.customer_region {
        text.push_str(&format!("Регион: {region}\n"));
    }
    if let Some(price) = tender.effective_price() {
        text.push_str(&format!("НМЦК: {} ₽\n", format_amount(price)));
    }
    if let Some(deadline) = tender.effective_deadline() {
        text.push_str(&format!("Подача заявок до: {}\n", deadline.format("%d.%m.%Y")));
    }
    text.push_str(&format!("Релевантность: {}", report.score));
    if let Some(confidence) = report.oracle_confidence {
        text.push_str(&format!(" (AI: {confidence})"));
    }
    if !report.matched_keywords.is_empty() {
        text.push_str(&format!(
            "\nСовпадения: {}",
            escape_html(&report.matched_keywords.join(", "))
        ));
    }

    let tender_id = &tender.raw.id;
    NotificationMessage {
        text,
        actions: vec![
            ("Открыть".to_string(), tender.raw.url.clone()),
            ("Интересно".to_string(), format!("fb:interested:{tender_id}")),
            ("Пропустить".to_string(), format!("fb:skip:{tender_id}")),
            ("Скрыть".to_string(), format!("fb:hide:{tender_id}")),
        ],
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn format_amount(amount: f64) -> String {
    let whole = amount.round() as i64;
    let digits = whole.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(ch);
    }
    out
}

/// Abstract sender.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, chat_id: i64, message: &NotificationMessage) -> SendOutcome;
}

/// Production sink over the Telegram Bot API.
pub struct TelegramSink {
    client: Client,
    base_url: String,
    token: String,
}

impl TelegramSink {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("Failed to build sink HTTP client")?;
        Ok(Self {
            client,
            base_url: config.sink_base_url.clone(),
            token: config.sink_token.clone(),
        })
    }

    fn classify_status(status: StatusCode, body: &str) -> SendOutcome {
        match status {
            StatusCode::FORBIDDEN => SendOutcome::Permanent,
            StatusCode::BAD_REQUEST if body.contains("chat not found") => SendOutcome::Permanent,
            StatusCode::TOO_MANY_REQUESTS => SendOutcome::Transient,
            s if s.is_server_error() => SendOutcome::Transient,
            s if s.is_success() => SendOutcome::Sent,
            _ => SendOutcome::Transient,
        }
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    #[instrument(skip(self, message), fields(chat = chat_id))]
    async fn send(&self, chat_id: i64, message: &NotificationMessage) -> SendOutcome {
        let keyboard: Vec<Vec<serde_json::Value>> = message
            .actions
            .iter()
            .map(|(label, data)| {
                let button = if data.starts_with("http") {
                    json!({"text": label, "url": data})
                } else {
                    json!({"text": label, "callback_data": data})
                };
                vec![button]
            })
            .collect();

        let payload = json!({
            "chat_id": chat_id,
            "text": message.text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
            "reply_markup": {"inline_keyboard": keyboard},
        });

        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let response = match self.client.post(&url).json(&payload).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("sink transport error for chat {chat_id}: {e}");
                return SendOutcome::Transient;
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let outcome = Self::classify_status(status, &body);
        debug!("sink send to chat {chat_id}: {status} -> {outcome:?}");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnrichedTender, MatchVerdict, RawTender};
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn sample_tender() -> EnrichedTender {
        let raw = RawTender {
            id: "0372-1".to_string(),
            customer: "ГБУ г. Москва".to_string(),
            customer_inn: None,
            title: "Поставка ноутбуков".to_string(),
            description: None,
            price: None,
            tender_type: None,
            law_type: None,
            published_at: Utc::now(),
            deadline: None,
            region_hint: None,
            url: "https://zakupki.gov.ru/t/0372-1".to_string(),
        };
        EnrichedTender {
            raw,
            price: Some(1_200_000.0),
            customer_region: Some("Москва".to_string()),
            deadline: Some(Utc.with_ymd_and_hms(2026, 9, 15, 10, 0, 0).unwrap()),
            detail_title: None,
            fingerprint: None,
        }
    }

    fn sample_report() -> ScoreReport {
        ScoreReport {
            score: 55,
            verdict: MatchVerdict::Accept,
            matched_keywords: vec!["ноутбук".to_string()],
            components: HashMap::new(),
            reject_cause: None,
            oracle_confidence: Some(72),
        }
    }

    #[test]
    fn renders_all_known_fields() {
        let message = render_notification(&sample_tender(), &sample_report());
        assert!(message.text.contains("Поставка ноутбуков"));
        assert!(message.text.contains("Регион: Москва"));
        assert!(message.text.contains("1 200 000"));
        assert!(message.text.contains("15.09.2026"));
        assert!(message.text.contains("Релевантность: 55"));
        assert!(message.text.contains("AI: 72"));
        assert_eq!(message.actions.len(), 4);
        assert!(message.actions[0].1.starts_with("https://"));
    }

    #[test]
    fn escapes_html_in_titles() {
        let mut tender = sample_tender();
        tender.raw.title = "Поставка <серверов> & ПО".to_string();
        let message = render_notification(&tender, &sample_report());
        assert!(message.text.contains("&lt;серверов&gt; &amp; ПО"));
    }

    #[test]
    fn amount_grouping() {
        assert_eq!(format_amount(1_200_000.0), "1 200 000");
        assert_eq!(format_amount(999.0), "999");
        assert_eq!(format_amount(1_000.0), "1 000");
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            TelegramSink::classify_status(StatusCode::OK, ""),
            SendOutcome::Sent
        );
        assert_eq!(
            TelegramSink::classify_status(StatusCode::FORBIDDEN, "bot was blocked"),
            SendOutcome::Permanent
        );
        assert_eq!(
            TelegramSink::classify_status(StatusCode::BAD_REQUEST, "Bad Request: chat not found"),
            SendOutcome::Permanent
        );
        assert_eq!(
            TelegramSink::classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            SendOutcome::Transient
        );
        assert_eq!(
            TelegramSink::classify_status(StatusCode::BAD_GATEWAY, ""),
            SendOutcome::Transient
        );
    }
}
