//! Deterministic tender-versus-filter scoring.
//!
//! The same algorithm runs twice per tender in a typical cycle: a pre-score
//! pass over feed-level fields that gates enrichment, and a full pass once
//! the detail page contributed price, region, and deadline.

use crate::regions::RegionRegistry;
use crate::types::{
    EnrichedTender, Filter, LawType, MatchVerdict, NullRegionPolicy, RawTender, RejectCause,
    ScoreReport, TenderType,
};
use aho_corasick::AhoCorasick;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::LazyLock;

const COMPOUND_PHRASE_SCORE: i32 = 35;
const EXACT_KEYWORD_SCORE: i32 = 25;
const ROOT_MATCH_SCORE: i32 = 18;
const SYNONYM_SCORE: i32 = 20;
const PRICE_IN_BAND_SCORE: i32 = 20;
const PRICE_NEAR_BAND_SCORE: i32 = 10;
const PRICE_OUT_OF_BAND_PENALTY: i32 = -20;
const REGION_BONUS: i32 = 10;
const NULL_REGION_PENALTY: i32 = -20;
const NEGATIVE_PATTERN_PENALTY: i32 = -5;
const NEGATIVE_PATTERN_FLOOR: i32 = -30;
const STRICT_MODE_FACTOR: f64 = 0.6;
const STRICT_MODE_MIN_KEYWORDS: usize = 8;
const STRICT_MODE_MIN_MATCH_RATIO: f64 = 0.10;
const MIN_ROOT_CHARS: usize = 5;

/// Generic procurement nouns that never score on their own.
const STOP_WORDS: &[&str] = &[
    "поставка",
    "закупка",
    "услуга",
    "услуги",
    "работа",
    "работы",
    "товар",
    "товары",
    "оказание",
    "выполнение",
    "приобретение",
    "покупка",
    "система",
    "комплекс",
    "обеспечение",
    "организация",
    "проведение",
];

/// Short keywords allowed through the length gate. Exact word-boundary
/// matches only; these must never match as the root of a longer word.
const SHORT_KEYWORD_WHITELIST: &[&str] = &[
    "по", "it", "ит", "ибп", "ас", "бд", "ос", "пк", "схд", "мфу", "эвм", "си",
];

/// Title openers that mean a service entry leaked into a goods query.
const DELIVERY_SERVICE_OPENERS: &[&str] =
    &["доставка", "перевозка", "транспортировка", "экспедирование"];

/// Niche phrases that correlate with irrelevant verticals. Each distinct hit
/// costs 5 points, floored at -30.
const NEGATIVE_PATTERNS: &[&str] = &[
    // Military
    "вооружение",
    "боеприпас",
    "военная техника",
    "военного назначения",
    "бронетехника",
    "стрелковое оружие",
    "гособоронзаказ",
    "бронежилет",
    "камуфляж",
    "противогаз",
    "полигон",
    "радиационной защиты",
    "химической защиты",
    "мобилизационн",
    // Medical
    "лекарственн",
    "медикамент",
    "вакцина",
    "шприц",
    "катетер",
    "эндоскоп",
    "томограф",
    "рентген",
    "стоматологич",
    "хирургическ",
    "инсулин",
    "имплант",
    "протезирован",
    "дезинфицирующ",
    "перчатки смотровые",
    "медицинских изделий",
    "реактивы для лаборатории",
    "санитарный транспорт",
    // Construction niche
    "капитальный ремонт",
    "строительно монтажные",
    "благоустройство территории",
    "асфальтирование",
    "дорожное покрытие",
    "кровельные работы",
    "фундамент",
    "железобетон",
    "кирпичная кладка",
    "штукатурк",
    "облицовк",
    "демонтаж здания",
    "снос здания",
    "земляные работы",
    "котлован",
    "забивка свай",
    "мостовое полотно",
    "путепровод",
    "теплотрасс",
    "наружный водопровод",
    "канализационных сетей",
    "газопровод",
    "ремонт лифтов",
    "остекление фасад",
    // Commodity and municipal-service noise
    "утилизация отходов",
    "вывоз мусора",
    "твердых коммунальных отходов",
    "охранные услуги",
    "клининг",
    "уборка помещений",
    "питание обучающихся",
    "продукты питания",
    "горюче смазочные",
    "бензин",
    "дизельное топливо",
    "уголь каменный",
    "автозапчасти",
    "шины автомобильные",
    "ритуальные услуги",
    "аренда помещений",
    "страхование",
    "почтовые услуги",
];

static NEGATIVE_SCANNER: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::new(NEGATIVE_PATTERNS).expect("negative pattern automaton")
});

/// Built-in domain synonyms, used to derive a filter's expanded keyword set
/// when the front-end has not populated one.
const SYNONYM_GROUPS: &[&[&str]] = &[
    &["ноутбук", "лэптоп", "портативный компьютер"],
    &["компьютер", "пк", "персональный компьютер", "эвм"],
    &["сервер", "серверное оборудование"],
    &["принтер", "мфу", "печатающее устройство"],
    &["по", "программное обеспечение", "софт"],
    &["монитор", "дисплей"],
    &["планшет", "планшетный компьютер"],
    &["коммутатор", "свитч"],
    &["маршрутизатор", "роутер"],
    &["ибп", "источник бесперебойного питания"],
    &["схд", "система хранения данных"],
    &["картридж", "тонер"],
    &["видеонаблюдение", "система видеонаблюдения", "камера наблюдения"],
    &["мебель", "офисная мебель"],
    &["канцтовары", "канцелярские товары"],
];

/// Derive synonyms for a keyword list from the built-in groups. The input
/// keywords themselves are not repeated in the output.
pub fn expand_keywords(keywords: &[String]) -> Vec<String> {
    let normalized: Vec<String> = keywords.iter().map(|k| normalize_phrase(k)).collect();
    let mut out = Vec::new();
    for group in SYNONYM_GROUPS {
        if group.iter().any(|member| normalized.iter().any(|k| k == member)) {
            for member in *group {
                if !normalized.iter().any(|k| k == member)
                    && !out.iter().any(|o: &String| o == member)
                {
                    out.push((*member).to_string());
                }
            }
        }
    }
    out
}

/// Lowercase, fold ё, split into alphanumeric words.
fn normalize_words(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase().replace('ё', "е");
    let mut words = Vec::new();
    let mut current = String::new();
    for ch in lowered.chars() {
        if ch.is_alphanumeric() {
            current.push(ch);
        } else if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn normalize_phrase(text: &str) -> String {
    normalize_words(text).join(" ")
}

/// Strip a common inflection ending, keeping at least `MIN_ROOT_CHARS`
/// characters. `None` when the word is too short to carry a stable root.
fn root_of(word: &str) -> Option<String> {
    const ENDINGS: &[&str] = &[
        "иями", "ями", "ами", "иях", "иям", "ием", "ого", "его", "ому", "ему", "ыми", "ими",
        "ешь", "ет", "ем", "ете", "ут", "ют", "ат", "ят", "ах", "ях", "ам", "ям", "ов", "ев",
        "ей", "ом", "ой", "ый", "ий", "ая", "яя", "ое", "ее", "ие", "ые", "ью", "у", "ю", "а",
        "я", "о", "е", "ы", "и", "ь",
    ];
    let chars: Vec<char> = word.chars().collect();
    for ending in ENDINGS {
        let ending_chars: Vec<char> = ending.chars().collect();
        if chars.len() > ending_chars.len()
            && chars[chars.len() - ending_chars.len()..] == ending_chars[..]
        {
            let stem_len = chars.len() - ending_chars.len();
            if stem_len >= MIN_ROOT_CHARS {
                return Some(chars[..stem_len].iter().collect());
            }
        }
    }
    if chars.len() >= MIN_ROOT_CHARS {
        Some(word.to_string())
    } else {
        None
    }
}

/// Tender text prepared once per scoring pass.
struct ScoringText {
    words: Vec<String>,
    /// Space-padded word stream for boundary-safe phrase search.
    padded: String,
}

impl ScoringText {
    fn new(parts: &[Option<&str>]) -> Self {
        let combined = parts
            .iter()
            .flatten()
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        let words = normalize_words(&combined);
        let padded = format!(" {} ", words.join(" "));
        Self { words, padded }
    }

    fn has_exact_word(&self, word: &str) -> bool {
        self.words.iter().any(|w| w == word)
    }

    fn has_phrase(&self, phrase: &str) -> bool {
        self.padded.contains(&format!(" {phrase} "))
    }

    fn has_root(&self, root: &str) -> bool {
        self.words.iter().any(|w| w.starts_with(root))
    }
}

/// How one keyword landed.
enum KeywordHit {
    Compound,
    Exact,
    Root,
    Miss,
}

fn match_keyword(text: &ScoringText, keyword: &str) -> KeywordHit {
    let normalized = normalize_phrase(keyword);
    if normalized.is_empty() {
        return KeywordHit::Miss;
    }

    if normalized.contains(' ') {
        if text.has_phrase(&normalized) {
            return KeywordHit::Compound;
        }
        // A compound phrase may still land word-by-word through its roots.
        let all_roots_present = normalized.split(' ').all(|part| {
            root_of(part)
                .map(|root| text.has_root(&root))
                .unwrap_or_else(|| text.has_exact_word(part))
        });
        if all_roots_present {
            return KeywordHit::Root;
        }
        return KeywordHit::Miss;
    }

    let char_len = normalized.chars().count();
    if char_len < 3 {
        // Short keywords pass only through the whitelist and only as exact
        // word-boundary matches, never as roots.
        if SHORT_KEYWORD_WHITELIST.contains(&normalized.as_str())
            && text.has_exact_word(&normalized)
        {
            return KeywordHit::Exact;
        }
        return KeywordHit::Miss;
    }

    if STOP_WORDS.contains(&normalized.as_str()) {
        return KeywordHit::Miss;
    }

    if text.has_exact_word(&normalized) {
        return KeywordHit::Exact;
    }
    if let Some(root) = root_of(&normalized) {
        if text.has_root(&root) {
            return KeywordHit::Root;
        }
    }
    KeywordHit::Miss
}

/// Deterministic scorer. Stateless apart from the shared region registry and
/// the prebuilt negative-pattern automaton.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmartMatcher {
    regions: RegionRegistry,
}

impl SmartMatcher {
    pub fn new() -> Self {
        Self {
            regions: RegionRegistry::new(),
        }
    }

    /// Feed-level pass: keyword and title signals only. Gates enrichment.
    pub fn pre_score(&self, tender: &RawTender, filter: &Filter) -> ScoreReport {
        if let Some(cause) = self.structural_reject(
            tender.title.as_str(),
            tender.tender_type,
            tender.law_type,
            filter,
        ) {
            return ScoreReport::rejected(cause);
        }

        let text = ScoringText::new(&[Some(tender.title.as_str()), tender.description.as_deref()]);
        self.score_text(&text, filter, None, None, None)
    }

    /// Full pass over the enriched record: keyword signals plus price,
    /// region, and deadline decisions.
    pub fn full_score(
        &self,
        tender: &EnrichedTender,
        filter: &Filter,
        now: DateTime<Utc>,
        null_region_policy: NullRegionPolicy,
    ) -> ScoreReport {
        if let Some(cause) = self.structural_reject(
            tender.raw.title.as_str(),
            tender.raw.tender_type,
            tender.raw.law_type,
            filter,
        ) {
            return ScoreReport::rejected(cause);
        }

        if let Some(deadline) = tender.effective_deadline() {
            let days_left = (deadline.date_naive() - now.date_naive()).num_days();
            if days_left < filter.min_deadline_days {
                return ScoreReport::rejected(RejectCause::Deadline);
            }
        }

        let text = ScoringText::new(&[
            Some(tender.raw.title.as_str()),
            tender.raw.description.as_deref(),
            tender.detail_title.as_deref(),
        ]);

        let region_signal = self.region_signal(tender, filter, null_region_policy);
        if let RegionSignal::Reject = region_signal {
            return ScoreReport::rejected(RejectCause::Region);
        }

        self.score_text(
            &text,
            filter,
            tender.effective_price(),
            Some(region_signal),
            Some(now),
        )
    }

    /// Hard gates shared by both passes: exclusions, procurement type, and
    /// legal regime.
    fn structural_reject(
        &self,
        title: &str,
        tender_type: Option<TenderType>,
        law_type: Option<LawType>,
        filter: &Filter,
    ) -> Option<RejectCause> {
        let text = ScoringText::new(&[Some(title)]);

        if !filter.law_type.accepts(law_type) {
            return Some(RejectCause::LawType);
        }

        // A declared type outside the filter's set hard-rejects, and an
        // empty set admits no declared type at all. Only tenders whose type
        // metadata is missing pass through, subject to the opener guard.
        match tender_type {
            Some(declared) if !filter.tender_types.contains(&declared) => {
                return Some(RejectCause::TenderType);
            }
            None => {
                // The feed drops type metadata on some entries. A goods
                // filter must still skip entries whose title opens with a
                // transport-service word.
                if filter.tender_types.contains(&TenderType::Goods) {
                    if let Some(first) = text.words.first() {
                        if DELIVERY_SERVICE_OPENERS.contains(&first.as_str()) {
                            return Some(RejectCause::TenderType);
                        }
                    }
                }
            }
            _ => {}
        }

        None
    }

    fn region_signal(
        &self,
        tender: &EnrichedTender,
        filter: &Filter,
        policy: NullRegionPolicy,
    ) -> RegionSignal {
        if filter.regions.is_empty() {
            return RegionSignal::NotApplicable;
        }
        let wanted = self.regions.resolve_filter_regions(&filter.regions);
        match tender.customer_region.as_deref() {
            Some(region) if wanted.contains(&region) => RegionSignal::Bonus,
            Some(_) => RegionSignal::Reject,
            None => match policy {
                NullRegionPolicy::Pass => RegionSignal::NotApplicable,
                NullRegionPolicy::Penalise => RegionSignal::Penalty,
                NullRegionPolicy::Reject => RegionSignal::Reject,
            },
        }
    }

    fn score_text(
        &self,
        text: &ScoringText,
        filter: &Filter,
        price: Option<f64>,
        region: Option<RegionSignal>,
        _now: Option<DateTime<Utc>>,
    ) -> ScoreReport {
        let mut components: HashMap<String, i32> = HashMap::new();
        let mut matched_keywords = Vec::new();

        // Exclusions first: one hit rejects outright.
        for exclude in &filter.exclude_keywords {
            if !matches!(match_keyword(text, exclude), KeywordHit::Miss) {
                return ScoreReport::rejected(RejectCause::ExcludeKeyword);
            }
        }

        let primary: Vec<String> = filter
            .primary_keywords
            .iter()
            .map(|k| normalize_phrase(k))
            .collect();

        let mut keyword_pool: Vec<&String> = filter.keywords.iter().collect();
        for extra in filter.primary_keywords.iter().chain(&filter.secondary_keywords) {
            if !keyword_pool.iter().any(|k| *k == extra) {
                keyword_pool.push(extra);
            }
        }

        let mut positive: i32 = 0;
        let mut keywords_considered = 0usize;
        let mut keywords_matched = 0usize;

        for keyword in &keyword_pool {
            keywords_considered += 1;
            let base = match match_keyword(text, keyword) {
                KeywordHit::Compound => COMPOUND_PHRASE_SCORE,
                KeywordHit::Exact => EXACT_KEYWORD_SCORE,
                KeywordHit::Root => ROOT_MATCH_SCORE,
                KeywordHit::Miss => continue,
            };
            keywords_matched += 1;
            let weighted = if primary.contains(&normalize_phrase(keyword)) {
                base * 2
            } else {
                base
            };
            positive += weighted;
            matched_keywords.push((*keyword).clone());
        }

        components.insert("keywords".to_string(), positive);

        for synonym in &filter.expanded_keywords {
            if matches!(match_keyword(text, synonym), KeywordHit::Miss) {
                continue;
            }
            if matched_keywords.iter().any(|m| m == synonym) {
                continue;
            }
            positive += SYNONYM_SCORE;
            matched_keywords.push(synonym.clone());
            *components.entry("synonym".to_string()).or_insert(0) += SYNONYM_SCORE;
        }

        // Strict mode: a broad filter that barely matched is weakened before
        // penalties land.
        if keywords_considered >= STRICT_MODE_MIN_KEYWORDS {
            let ratio = keywords_matched as f64 / keywords_considered as f64;
            if ratio < STRICT_MODE_MIN_MATCH_RATIO {
                let reduced = (positive as f64 * STRICT_MODE_FACTOR).round() as i32;
                components.insert("strict_penalty".to_string(), reduced - positive);
                positive = reduced;
            }
        }

        let mut score = positive;

        if let Some(price) = price {
            let contribution = price_signal(price, filter.price_min, filter.price_max);
            if contribution != 0 {
                components.insert("price".to_string(), contribution);
                score += contribution;
            }
        }

        match region {
            Some(RegionSignal::Bonus) => {
                components.insert("region".to_string(), REGION_BONUS);
                score += REGION_BONUS;
            }
            Some(RegionSignal::Penalty) => {
                components.insert("region".to_string(), NULL_REGION_PENALTY);
                score += NULL_REGION_PENALTY;
            }
            _ => {}
        }

        let negative_hits = count_negative_patterns(&text.padded);
        if negative_hits > 0 {
            let penalty =
                (negative_hits as i32 * NEGATIVE_PATTERN_PENALTY).max(NEGATIVE_PATTERN_FLOOR);
            components.insert("negative_patterns".to_string(), penalty);
            score += penalty;
        }

        let clipped = score.clamp(0, 100) as u8;
        let verdict = if clipped == 0 {
            MatchVerdict::Reject
        } else if clipped >= 50 {
            MatchVerdict::Accept
        } else {
            MatchVerdict::Consider
        };

        ScoreReport {
            score: clipped,
            verdict,
            matched_keywords,
            components,
            reject_cause: if clipped == 0 {
                Some(RejectCause::NoSignal)
            } else {
                None
            },
            oracle_confidence: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RegionSignal {
    NotApplicable,
    Bonus,
    Penalty,
    Reject,
}

fn price_signal(price: f64, min: Option<f64>, max: Option<f64>) -> i32 {
    let below = min.map(|m| price < m).unwrap_or(false);
    let above = max.map(|m| price > m).unwrap_or(false);
    if !below && !above {
        return PRICE_IN_BAND_SCORE;
    }
    let overshoot = if below {
        let m = min.unwrap();
        (m - price) / m
    } else {
        let m = max.unwrap();
        (price - m) / m
    };
    if overshoot <= 0.20 {
        PRICE_NEAR_BAND_SCORE
    } else {
        PRICE_OUT_OF_BAND_PENALTY
    }
}

fn count_negative_patterns(padded_text: &str) -> usize {
    let mut seen = vec![false; NEGATIVE_PATTERNS.len()];
    for hit in NEGATIVE_SCANNER.find_iter(padded_text) {
        seen[hit.pattern().as_usize()] = true;
    }
    seen.iter().filter(|s| **s).count()
}
