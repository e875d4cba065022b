//! Feed access: parameterised RSS polling and detail-page enrichment.
//!
//! The upstream is tolerated, not trusted: archived entries, missing type
//! metadata, and absent regions all pass through and are handled downstream.
//! Every request carries a hard timeout; a failed detail fetch degrades to a
//! partial record instead of failing the cycle.

use crate::config::EngineConfig;
use crate::error::SentinelError;
use crate::regions::RegionRegistry;
use crate::types::{EnrichedTender, LawType, RawTender, TenderType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroU32;
use std::sync::LazyLock;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{debug, instrument, warn};

/// One poll's worth of query parameters, derived from a filter.
#[derive(Debug, Clone)]
pub struct FeedQuery {
    pub keywords: Vec<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub law_type: LawType,
    pub tender_types: Vec<TenderType>,
}

/// Abstract feed. `poll` yields a finite batch of raw tenders; `enrich`
/// consults the detail page and never fails the pipeline.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn poll(&self, query: &FeedQuery) -> Result<Vec<RawTender>>;
    async fn enrich(&self, raw: &RawTender) -> EnrichedTender;
}

/// Production feed over the public procurement RSS and its detail pages.
pub struct ZakupkiFeed {
    client: Client,
    base_url: String,
    regions: RegionRegistry,
    limiter: DefaultDirectRateLimiter,
    retry_attempts: usize,
}

impl ZakupkiFeed {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .user_agent("tender-sentinel/0.1")
            .build()
            .context("Failed to build feed HTTP client")?;

        let quota = Quota::per_second(
            NonZeroU32::new(config.feed_rate_limit_rps).unwrap_or(NonZeroU32::new(1).unwrap()),
        );

        Ok(Self {
            client,
            base_url: config.feed_base_url.clone(),
            regions: RegionRegistry::new(),
            limiter: RateLimiter::direct(quota),
            retry_attempts: config.enrich_retry_attempts,
        })
    }

    fn poll_url(&self, query: &FeedQuery) -> String {
        let mut url = format!(
            "{}?sortBy=UPDATE_DATE&searchString={}",
            self.base_url,
            urlencoding::encode(&query.keywords.join(" ")),
        );
        if let Some(min) = query.price_min {
            url.push_str(&format!("&priceFromGeneral={}", min as i64));
        }
        if let Some(max) = query.price_max {
            url.push_str(&format!("&priceToGeneral={}", max as i64));
        }
        match query.law_type {
            LawType::Fz44 => url.push_str("&fz44=on"),
            LawType::Fz223 => url.push_str("&fz223=on"),
            LawType::Any => url.push_str("&fz44=on&fz223=on"),
        }
        url
    }
}

#[async_trait]
impl FeedSource for ZakupkiFeed {
    #[instrument(skip(self, query), fields(keywords = %query.keywords.join(",")))]
    async fn poll(&self, query: &FeedQuery) -> Result<Vec<RawTender>> {
        self.limiter.until_ready().await;

        let url = self.poll_url(query);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Feed request failed")?;

        if !response.status().is_success() {
            return Err(
                SentinelError::Transient(format!("feed returned status {}", response.status()))
                    .into(),
            );
        }

        let body = response.text().await.context("Feed body read failed")?;
        let envelope: RssEnvelope =
            quick_xml::de::from_str(&body).context("Feed RSS parse failed")?;

        let mut tenders = Vec::new();
        for item in envelope.channel.items {
            let Some(tender) = parse_feed_item(&item) else {
                debug!("unparseable feed item: {:?}", item.title);
                continue;
            };
            // The feed does not honour type filtering server-side: a goods
            // query still returns transport-service entries whose type field
            // is empty. Skip them here.
            if query.tender_types.contains(&TenderType::Goods)
                && tender.tender_type.is_none()
                && title_opens_with_delivery(&tender.title)
            {
                debug!("skipping service-like entry in goods query: {}", tender.title);
                continue;
            }
            if !query.law_type.accepts(tender.law_type) {
                continue;
            }
            tenders.push(tender);
        }

        debug!("poll returned {} tenders", tenders.len());
        Ok(tenders)
    }

    /// Fetch the detail page and extract the precise price, customer region,
    /// and submission deadline. Timeouts and non-2xx degrade to a partial
    /// record with feed-level fields.
    #[instrument(skip(self, raw), fields(tender = %raw.id))]
    async fn enrich(&self, raw: &RawTender) -> EnrichedTender {
        self.limiter.until_ready().await;

        let retry_strategy = ExponentialBackoff::from_millis(200)
            .max_delay(Duration::from_secs(2))
            .take(self.retry_attempts);

        let page = Retry::start(retry_strategy, || async {
            let response = self
                .client
                .get(&raw.url)
                .send()
                .await
                .context("Detail page request failed")?;
            if !response.status().is_success() {
                anyhow::bail!("Detail page returned status {}", response.status());
            }
            response.text().await.context("Detail page body read failed")
        })
        .await;

        let page = match page {
            Ok(page) => page,
            Err(e) => {
                warn!("enrichment degraded to partial record for {}: {e}", raw.id);
                return EnrichedTender::partial(raw.clone());
            }
        };

        let text = strip_tags(&page);
        let price = extract_price(&text);
        let deadline = extract_deadline(&text);
        let customer_region = derive_region(
            &self.regions,
            &raw.customer,
            raw.customer_inn.as_deref(),
            Some(&text),
        )
        .or_else(|| {
            raw.region_hint
                .as_deref()
                .and_then(|hint| self.regions.normalise(hint))
        });

        EnrichedTender {
            raw: raw.clone(),
            price: price.or(raw.price),
            customer_region: customer_region.map(|s| s.to_string()),
            deadline: deadline.or(raw.deadline),
            detail_title: extract_detail_title(&page),
            fingerprint: Some(fingerprint(&page)),
        }
    }
}

// --- RSS envelope ---

#[derive(Debug, Deserialize)]
struct RssEnvelope {
    channel: RssChannel,
}

#[derive(Debug, Default, Deserialize)]
struct RssChannel {
    #[serde(default, rename = "item")]
    items: Vec<RssItem>,
}

#[derive(Debug, Default, Deserialize)]
struct RssItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "pubDate")]
    pub_date: String,
}

static PROCUREMENT_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"№\s*(\d{11,25})").expect("procurement number regex"));
static REG_NUMBER_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"regNumber=(\d+)").expect("regNumber regex"));
static DESCRIPTION_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*([^:<>\n]{3,60}):\s*(.+?)\s*$").expect("description field regex")
});

/// Amount after a price marker, digits with space/nbsp grouping and an
/// optional decimal part.
static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:начальная(?:\s+\(максимальная\))?\s+цена(?:\s+контракта)?|нмцк|цена\s+контракта)\D{0,40}?([\d\s\u{a0}]{1,20}(?:[.,]\d{1,2})?)",
    )
    .expect("price regex")
});

static DEADLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:окончани[ея]\s+(?:срока\s+)?подачи\s+заяв\w+|дата\s+и\s+время\s+окончания)\D{0,40}?(\d{2}\.\d{2}\.\d{4})(?:\s+(\d{2}:\d{2}))?",
    )
    .expect("deadline regex")
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag regex"));

fn strip_tags(html: &str) -> String {
    TAG_RE.replace_all(html, " ").replace("&nbsp;", " ")
}

/// Parse one RSS item into a raw tender. Items without a recognisable
/// procurement number are dropped.
fn parse_feed_item(item: &RssItem) -> Option<RawTender> {
    let id = REG_NUMBER_PARAM_RE
        .captures(&item.link)
        .or_else(|| PROCUREMENT_NUMBER_RE.captures(&item.title))
        .map(|c| c[1].to_string())?;

    let fields = parse_description_fields(&item.description);
    let lookup = |names: &[&str]| -> Option<String> {
        fields
            .iter()
            .find(|(k, _)| names.iter().any(|n| k.to_lowercase().contains(n)))
            .map(|(_, v)| v.clone())
    };

    let customer = lookup(&["заказчик", "организация"]).unwrap_or_default();
    let price = lookup(&["цена", "нмцк", "стоимость"])
        .and_then(|v| parse_amount(&v));
    let law_type = lookup(&["закон", "фз"]).and_then(|v| parse_law_type(&v));
    let tender_type = lookup(&["тип закупки", "вид закупки", "предмет"])
        .and_then(|v| parse_tender_type(&v))
        .or_else(|| infer_tender_type(&item.title));

    let title = item
        .title
        .split('№')
        .next()
        .unwrap_or(&item.title)
        .trim()
        .trim_end_matches('.')
        .to_string();

    Some(RawTender {
        id,
        customer,
        customer_inn: lookup(&["инн"]).map(|v| v.trim().to_string()),
        title: if title.is_empty() { item.title.clone() } else { title },
        description: Some(item.description.clone()).filter(|d| !d.is_empty()),
        price,
        tender_type,
        law_type,
        published_at: parse_pub_date(&item.pub_date).unwrap_or_else(Utc::now),
        deadline: None,
        region_hint: lookup(&["регион", "место поставки"]),
        url: item.link.clone(),
    })
}

fn parse_description_fields(description: &str) -> Vec<(String, String)> {
    let text = strip_tags(&description.replace("<br>", "\n").replace("<br/>", "\n"))
        .replace(';', "\n");
    DESCRIPTION_FIELD_RE
        .captures_iter(&text)
        .map(|c| (c[1].trim().to_string(), c[2].trim().to_string()))
        .collect()
}

/// "1 200 000,50" and "1200000.50" both parse; currency tails are ignored.
fn parse_amount(s: &str) -> Option<f64> {
    let cleaned: String = s
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ' ' || *c == '\u{a0}' || *c == ',' || *c == '.')
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    // Keep only the last dot as the decimal separator.
    let parts: Vec<&str> = cleaned.split('.').collect();
    let normalized = if parts.len() > 2 {
        format!(
            "{}.{}",
            parts[..parts.len() - 1].concat(),
            parts[parts.len() - 1]
        )
    } else {
        cleaned
    };
    normalized.parse::<f64>().ok().filter(|v| *v > 0.0)
}

fn parse_law_type(s: &str) -> Option<LawType> {
    let lowered = s.to_lowercase();
    if lowered.contains("44") {
        Some(LawType::Fz44)
    } else if lowered.contains("223") {
        Some(LawType::Fz223)
    } else {
        None
    }
}

fn parse_tender_type(s: &str) -> Option<TenderType> {
    let lowered = s.to_lowercase();
    if lowered.contains("товар") || lowered.contains("поставка") {
        Some(TenderType::Goods)
    } else if lowered.contains("услуг") {
        Some(TenderType::Services)
    } else if lowered.contains("работ") {
        Some(TenderType::Works)
    } else {
        None
    }
}

/// Infer type from the title opener when the feed omitted the field.
fn infer_tender_type(title: &str) -> Option<TenderType> {
    let lowered = title.to_lowercase();
    let first = lowered.split_whitespace().next()?;
    match first {
        "поставка" | "приобретение" | "закупка" => Some(TenderType::Goods),
        "оказание" | "предоставление" => Some(TenderType::Services),
        "выполнение" | "строительство" | "ремонт" => Some(TenderType::Works),
        _ => None,
    }
}

fn title_opens_with_delivery(title: &str) -> bool {
    let lowered = title.to_lowercase();
    matches!(
        lowered.split_whitespace().next(),
        Some("доставка") | Some("перевозка") | Some("транспортировка") | Some("экспедирование")
    )
}

/// RFC 2822 first (the RSS standard), then the date formats the feed
/// actually emits.
fn parse_pub_date(s: &str) -> Option<DateTime<Utc>> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%d.%m.%Y %H:%M", "%Y-%m-%dT%H:%M:%S", "%d.%m.%Y"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&dt));
        }
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}

/// Starting price from detail-page text.
pub fn extract_price(text: &str) -> Option<f64> {
    PRICE_RE
        .captures(text)
        .and_then(|c| parse_amount(&c[1]))
}

/// Submission deadline from detail-page text. Times are read as Moscow
/// time, the feed's publication zone.
pub fn extract_deadline(text: &str) -> Option<DateTime<Utc>> {
    let captures = DEADLINE_RE.captures(text)?;
    let date = NaiveDate::parse_from_str(&captures[1], "%d.%m.%Y").ok()?;
    let time = captures
        .get(2)
        .and_then(|m| chrono::NaiveTime::parse_from_str(m.as_str(), "%H:%M").ok())
        .unwrap_or_else(|| chrono::NaiveTime::from_hms_opt(23, 59, 0).unwrap());
    chrono_tz::Europe::Moscow
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn extract_detail_title(page: &str) -> Option<String> {
    let start = page.find("<title>")? + "<title>".len();
    let end = page[start..].find("</title>")? + start;
    let title = page[start..end].trim();
    Some(title.to_string()).filter(|t| !t.is_empty())
}

/// Customer region: name tail first, INN prefix second, explicit address
/// text third.
pub fn derive_region(
    registry: &RegionRegistry,
    customer: &str,
    inn: Option<&str>,
    address_text: Option<&str>,
) -> Option<&'static str> {
    if let Some(region) = registry.normalise(customer) {
        return Some(region);
    }
    if let Some(inn) = inn {
        if let Some(region) = registry.from_inn(inn) {
            return Some(region);
        }
    }
    if let Some(text) = address_text {
        if let Some(line) = find_address_line(text) {
            return registry.normalise(line);
        }
    }
    None
}

fn find_address_line(text: &str) -> Option<&str> {
    let marker_pos = ["Место нахождения", "Почтовый адрес", "Адрес"]
        .iter()
        .filter_map(|m| text.find(m))
        .min()?;
    let tail = &text[marker_pos..];
    let line_end = tail.find('\n').unwrap_or_else(|| {
        tail.char_indices()
            .nth(200)
            .map(|(i, _)| i)
            .unwrap_or(tail.len())
    });
    Some(&tail[..line_end])
}

fn fingerprint(page: &str) -> String {
    let mut hasher = DefaultHasher::new();
    page.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
