//! Canonical region registry for the 85 federal subjects.
//!
//! All lookups are pure and infallible: unmappable input yields `None`,
//! never raw garbage. The pipeline stores on a tender only names drawn from
//! the canonical set below.

use std::collections::HashMap;
use std::sync::LazyLock;

/// (tax-registration code, canonical subject name). The code doubles as the
/// first two digits of an INN issued in that subject.
const REGION_CODES: &[(&str, &str)] = &[
    ("01", "Республика Адыгея"),
    ("02", "Республика Башкортостан"),
    ("03", "Республика Бурятия"),
    ("04", "Республика Алтай"),
    ("05", "Республика Дагестан"),
    ("06", "Республика Ингушетия"),
    ("07", "Кабардино-Балкарская Республика"),
    ("08", "Республика Калмыкия"),
    ("09", "Карачаево-Черкесская Республика"),
    ("10", "Республика Карелия"),
    ("11", "Республика Коми"),
    ("12", "Республика Марий Эл"),
    ("13", "Республика Мордовия"),
    ("14", "Республика Саха (Якутия)"),
    ("15", "Республика Северная Осетия - Алания"),
    ("16", "Республика Татарстан"),
    ("17", "Республика Тыва"),
    ("18", "Удмуртская Республика"),
    ("19", "Республика Хакасия"),
    ("20", "Чеченская Республика"),
    ("21", "Чувашская Республика"),
    ("22", "Алтайский край"),
    ("23", "Краснодарский край"),
    ("24", "Красноярский край"),
    ("25", "Приморский край"),
    ("26", "Ставропольский край"),
    ("27", "Хабаровский край"),
    ("28", "Амурская область"),
    ("29", "Архангельская область"),
    ("30", "Астраханская область"),
    ("31", "Белгородская область"),
    ("32", "Брянская область"),
    ("33", "Владимирская область"),
    ("34", "Волгоградская область"),
    ("35", "Вологодская область"),
    ("36", "Воронежская область"),
    ("37", "Ивановская область"),
    ("38", "Иркутская область"),
    ("39", "Калининградская область"),
    ("40", "Калужская область"),
    ("41", "Камчатский край"),
    ("42", "Кемеровская область"),
    ("43", "Кировская область"),
    ("44", "Костромская область"),
    ("45", "Курганская область"),
    ("46", "Курская область"),
    ("47", "Ленинградская область"),
    ("48", "Липецкая область"),
    ("49", "Магаданская область"),
    ("50", "Московская область"),
    ("51", "Мурманская область"),
    ("52", "Нижегородская область"),
    ("53", "Новгородская область"),
    ("54", "Новосибирская область"),
    ("55", "Омская область"),
    ("56", "Оренбургская область"),
    ("57", "Орловская область"),
    ("58", "Пензенская область"),
    ("59", "Пермский край"),
    ("60", "Псковская область"),
    ("61", "Ростовская область"),
    ("62", "Рязанская область"),
    ("63", "Самарская область"),
    ("64", "Саратовская область"),
    ("65", "Сахалинская область"),
    ("66", "Свердловская область"),
    ("67", "Смоленская область"),
    ("68", "Тамбовская область"),
    ("69", "Тверская область"),
    ("70", "Томская область"),
    ("71", "Тульская область"),
    ("72", "Тюменская область"),
    ("73", "Ульяновская область"),
    ("74", "Челябинская область"),
    ("75", "Забайкальский край"),
    ("76", "Ярославская область"),
    ("77", "Москва"),
    ("78", "Санкт-Петербург"),
    ("79", "Еврейская автономная область"),
    ("83", "Ненецкий автономный округ"),
    ("86", "Ханты-Мансийский автономный округ - Югра"),
    ("87", "Чукотский автономный округ"),
    ("89", "Ямало-Ненецкий автономный округ"),
    ("91", "Республика Крым"),
    ("92", "Севастополь"),
];

/// Extra INN prefixes: merged former okrugs and the alternate codes the tax
/// service issues for the federal cities.
const INN_EXTRA_CODES: &[(&str, &str)] = &[
    ("80", "Забайкальский край"),
    ("81", "Пермский край"),
    ("82", "Республика Крым"),
    ("84", "Красноярский край"),
    ("85", "Иркутская область"),
    ("88", "Красноярский край"),
    ("90", "Московская область"),
    ("95", "Чеченская Республика"),
    ("97", "Москва"),
    ("98", "Санкт-Петербург"),
    ("99", "Москва"),
];

/// Federal districts and their member subjects.
const FEDERAL_DISTRICTS: &[(&str, &[&str])] = &[
    (
        "Центральный федеральный округ",
        &[
            "Белгородская область",
            "Брянская область",
            "Владимирская область",
            "Воронежская область",
            "Ивановская область",
            "Калужская область",
            "Костромская область",
            "Курская область",
            "Липецкая область",
            "Московская область",
            "Орловская область",
            "Рязанская область",
            "Смоленская область",
            "Тамбовская область",
            "Тверская область",
            "Тульская область",
            "Ярославская область",
            "Москва",
        ],
    ),
    (
        "Северо-Западный федеральный округ",
        &[
            "Республика Карелия",
            "Республика Коми",
            "Архангельская область",
            "Вологодская область",
            "Калининградская область",
            "Ленинградская область",
            "Мурманская область",
            "Новгородская область",
            "Псковская область",
            "Ненецкий автономный округ",
            "Санкт-Петербург",
        ],
    ),
    (
        "Южный федеральный округ",
        &[
            "Республика Адыгея",
            "Республика Калмыкия",
            "Республика Крым",
            "Краснодарский край",
            "Астраханская область",
            "Волгоградская область",
            "Ростовская область",
            "Севастополь",
        ],
    ),
    (
        "Северо-Кавказский федеральный округ",
        &[
            "Республика Дагестан",
            "Республика Ингушетия",
            "Кабардино-Балкарская Республика",
            "Карачаево-Черкесская Республика",
            "Республика Северная Осетия - Алания",
            "Чеченская Республика",
            "Ставропольский край",
        ],
    ),
    (
        "Приволжский федеральный округ",
        &[
            "Республика Башкортостан",
            "Республика Марий Эл",
            "Республика Мордовия",
            "Республика Татарстан",
            "Удмуртская Республика",
            "Чувашская Республика",
            "Пермский край",
            "Кировская область",
            "Нижегородская область",
            "Оренбургская область",
            "Пензенская область",
            "Самарская область",
            "Саратовская область",
            "Ульяновская область",
        ],
    ),
    (
        "Уральский федеральный округ",
        &[
            "Курганская область",
            "Свердловская область",
            "Тюменская область",
            "Челябинская область",
            "Ханты-Мансийский автономный округ - Югра",
            "Ямало-Ненецкий автономный округ",
        ],
    ),
    (
        "Сибирский федеральный округ",
        &[
            "Республика Алтай",
            "Республика Тыва",
            "Республика Хакасия",
            "Алтайский край",
            "Красноярский край",
            "Иркутская область",
            "Кемеровская область",
            "Новосибирская область",
            "Омская область",
            "Томская область",
        ],
    ),
    (
        "Дальневосточный федеральный округ",
        &[
            "Республика Бурятия",
            "Республика Саха (Якутия)",
            "Забайкальский край",
            "Камчатский край",
            "Приморский край",
            "Хабаровский край",
            "Амурская область",
            "Магаданская область",
            "Сахалинская область",
            "Еврейская автономная область",
            "Чукотский автономный округ",
        ],
    ),
];

/// Hand-maintained aliases: abbreviations, informal names, administrative
/// centres (nominative and the genitive forms customer names carry), and the
/// typos the feed actually produces.
const ALIASES: &[(&str, &str)] = &[
    // Federal cities
    ("мск", "Москва"),
    ("масква", "Москва"),
    ("москвы", "Москва"),
    ("москве", "Москва"),
    ("зеленоград", "Москва"),
    ("спб", "Санкт-Петербург"),
    ("питер", "Санкт-Петербург"),
    ("петербург", "Санкт-Петербург"),
    ("петербурга", "Санкт-Петербург"),
    ("ленинград", "Санкт-Петербург"),
    ("севастополя", "Севастополь"),
    // Informal republic names
    ("башкирия", "Республика Башкортостан"),
    ("якутия", "Республика Саха (Якутия)"),
    ("саха", "Республика Саха (Якутия)"),
    ("чувашия", "Чувашская Республика"),
    ("удмуртия", "Удмуртская Республика"),
    ("чечня", "Чеченская Республика"),
    ("тува", "Республика Тыва"),
    ("северная осетия", "Республика Северная Осетия - Алания"),
    ("осетия", "Республика Северная Осетия - Алания"),
    ("алания", "Республика Северная Осетия - Алания"),
    ("кбр", "Кабардино-Балкарская Республика"),
    ("кабардино балкария", "Кабардино-Балкарская Республика"),
    ("кчр", "Карачаево-Черкесская Республика"),
    ("карачаево черкесия", "Карачаево-Черкесская Республика"),
    ("крым", "Республика Крым"),
    // Okrug shorthands
    ("хмао", "Ханты-Мансийский автономный округ - Югра"),
    ("югра", "Ханты-Мансийский автономный округ - Югра"),
    ("янао", "Ямало-Ненецкий автономный округ"),
    ("нао", "Ненецкий автономный округ"),
    ("еао", "Еврейская автономная область"),
    // Oblast shorthands
    ("подмосковье", "Московская область"),
    ("мособласть", "Московская область"),
    ("ленобласть", "Ленинградская область"),
    ("кузбасс", "Кемеровская область"),
    // Administrative centres, nominative and genitive
    ("екатеринбург", "Свердловская область"),
    ("екатеринбурга", "Свердловская область"),
    ("казань", "Республика Татарстан"),
    ("казани", "Республика Татарстан"),
    ("новосибирск", "Новосибирская область"),
    ("новосибирска", "Новосибирская область"),
    ("нижний новгород", "Нижегородская область"),
    ("нижнего новгорода", "Нижегородская область"),
    ("челябинск", "Челябинская область"),
    ("челябинска", "Челябинская область"),
    ("магнитогорск", "Челябинская область"),
    ("омск", "Омская область"),
    ("омска", "Омская область"),
    ("самара", "Самарская область"),
    ("самары", "Самарская область"),
    ("тольятти", "Самарская область"),
    ("ростов на дону", "Ростовская область"),
    ("ростова на дону", "Ростовская область"),
    ("уфа", "Республика Башкортостан"),
    ("уфы", "Республика Башкортостан"),
    ("красноярск", "Красноярский край"),
    ("красноярска", "Красноярский край"),
    ("норильск", "Красноярский край"),
    ("пермь", "Пермский край"),
    ("перми", "Пермский край"),
    ("воронеж", "Воронежская область"),
    ("воронежа", "Воронежская область"),
    ("волгоград", "Волгоградская область"),
    ("волгограда", "Волгоградская область"),
    ("краснодар", "Краснодарский край"),
    ("краснодара", "Краснодарский край"),
    ("сочи", "Краснодарский край"),
    ("саратов", "Саратовская область"),
    ("саратова", "Саратовская область"),
    ("тюмень", "Тюменская область"),
    ("тюмени", "Тюменская область"),
    ("ижевск", "Удмуртская Республика"),
    ("ижевска", "Удмуртская Республика"),
    ("барнаул", "Алтайский край"),
    ("барнаула", "Алтайский край"),
    ("иркутск", "Иркутская область"),
    ("иркутска", "Иркутская область"),
    ("хабаровск", "Хабаровский край"),
    ("хабаровска", "Хабаровский край"),
    ("ярославль", "Ярославская область"),
    ("ярославля", "Ярославская область"),
    ("владивосток", "Приморский край"),
    ("владивостока", "Приморский край"),
    ("махачкала", "Республика Дагестан"),
    ("махачкалы", "Республика Дагестан"),
    ("томск", "Томская область"),
    ("томска", "Томская область"),
    ("оренбург", "Оренбургская область"),
    ("оренбурга", "Оренбургская область"),
    ("кемерово", "Кемеровская область"),
    ("новокузнецк", "Кемеровская область"),
    ("рязань", "Рязанская область"),
    ("рязани", "Рязанская область"),
    ("астрахань", "Астраханская область"),
    ("астрахани", "Астраханская область"),
    ("пенза", "Пензенская область"),
    ("пензы", "Пензенская область"),
    ("липецк", "Липецкая область"),
    ("липецка", "Липецкая область"),
    ("киров", "Кировская область"),
    ("кирова", "Кировская область"),
    ("чебоксары", "Чувашская Республика"),
    ("чебоксар", "Чувашская Республика"),
    ("тула", "Тульская область"),
    ("тулы", "Тульская область"),
    ("калининград", "Калининградская область"),
    ("калининграда", "Калининградская область"),
    ("курск", "Курская область"),
    ("курска", "Курская область"),
    ("улан удэ", "Республика Бурятия"),
    ("ставрополь", "Ставропольский край"),
    ("ставрополя", "Ставропольский край"),
    ("тверь", "Тверская область"),
    ("твери", "Тверская область"),
    ("белгород", "Белгородская область"),
    ("белгорода", "Белгородская область"),
    ("якутск", "Республика Саха (Якутия)"),
    ("якутска", "Республика Саха (Якутия)"),
    ("сургут", "Ханты-Мансийский автономный округ - Югра"),
    ("владимир", "Владимирская область"),
    ("владимира", "Владимирская область"),
    ("архангельск", "Архангельская область"),
    ("архангельска", "Архангельская область"),
    ("калуга", "Калужская область"),
    ("калуги", "Калужская область"),
    ("смоленск", "Смоленская область"),
    ("смоленска", "Смоленская область"),
    ("курган", "Курганская область"),
    ("кургана", "Курганская область"),
    ("чита", "Забайкальский край"),
    ("читы", "Забайкальский край"),
    ("грозный", "Чеченская Республика"),
    ("грозного", "Чеченская Республика"),
    ("симферополь", "Республика Крым"),
    ("симферополя", "Республика Крым"),
    ("мурманск", "Мурманская область"),
    ("мурманска", "Мурманская область"),
    ("вологда", "Вологодская область"),
    ("вологды", "Вологодская область"),
    ("петрозаводск", "Республика Карелия"),
    ("петрозаводска", "Республика Карелия"),
    ("сыктывкар", "Республика Коми"),
    ("сыктывкара", "Республика Коми"),
    ("саранск", "Республика Мордовия"),
    ("саранска", "Республика Мордовия"),
    // District shorthands
    ("цфо", "Центральный федеральный округ"),
    ("сзфо", "Северо-Западный федеральный округ"),
    ("юфо", "Южный федеральный округ"),
    ("скфо", "Северо-Кавказский федеральный округ"),
    ("пфо", "Приволжский федеральный округ"),
    ("уфо", "Уральский федеральный округ"),
    ("урфо", "Уральский федеральный округ"),
    ("сфо", "Сибирский федеральный округ"),
    ("дфо", "Дальневосточный федеральный округ"),
    ("дво", "Дальневосточный федеральный округ"),
];

/// Address-line tokens that never carry region information.
const ADDRESS_NOISE: &[&str] = &[
    "ул",
    "улица",
    "г",
    "гор",
    "город",
    "пр",
    "просп",
    "проспект",
    "пер",
    "переулок",
    "пл",
    "площадь",
    "ш",
    "шоссе",
    "наб",
    "набережная",
    "б-р",
    "бульвар",
    "дом",
    "д",
    "корп",
    "корпус",
    "стр",
    "строение",
    "офис",
    "оф",
    "кв",
    "квартира",
    "район",
    "р-н",
    "пос",
    "поселок",
    "посёлок",
    "село",
    "с",
    "деревня",
    "дер",
    "рф",
    "россия",
    "российская",
    "федерация",
];

/// Generic words that are only meaningful as part of a full subject name.
/// A bare "область" token must never resolve on its own.
const GENERIC_TOKENS: &[&str] = &["область", "обл", "край", "республика", "респ", "ао", "округ"];

static DISTRICT_MAP: LazyLock<HashMap<String, &'static [&'static str]>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for (district, members) in FEDERAL_DISTRICTS {
        map.insert(clean(district), *members);
    }
    map
});

static ALIAS_MAP: LazyLock<HashMap<String, &'static str>> = LazyLock::new(|| {
    let mut map: HashMap<String, &'static str> = HashMap::new();

    for &(_, canonical) in REGION_CODES {
        let cleaned = clean(canonical);
        map.insert(cleaned.clone(), canonical);

        // Adjective shorthand: "тверская" for "Тверская область",
        // "красноярский" for "Красноярский край". Generic nouns alone stay
        // out of the table.
        let meaningful: Vec<&str> = cleaned
            .split(' ')
            .filter(|t| !GENERIC_TOKENS.contains(t))
            .collect();
        if !meaningful.is_empty() && meaningful.len() < cleaned.split(' ').count() {
            map.entry(meaningful.join(" ")).or_insert(canonical);
        }

        // Inverted word order: "бурятия республика".
        let tokens: Vec<&str> = cleaned.split(' ').collect();
        if tokens.len() >= 2 {
            let mut inverted = tokens.clone();
            inverted.rotate_left(1);
            map.entry(inverted.join(" ")).or_insert(canonical);
        }

        // Abbreviated forms: "тверская обл", "респ татарстан".
        let abbreviated = cleaned
            .replace("область", "обл")
            .replace("республика", "респ");
        map.entry(abbreviated).or_insert(canonical);
    }

    for &(district, _) in FEDERAL_DISTRICTS {
        map.insert(clean(district), district);
    }

    for &(alias, canonical) in ALIASES {
        map.insert(alias.to_string(), canonical);
    }

    map
});

static INN_MAP: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for (code, canonical) in REGION_CODES.iter().chain(INN_EXTRA_CODES) {
        map.insert(*code, *canonical);
    }
    map
});

/// Lowercase, fold ё, drop punctuation and digits, strip address noise,
/// collapse whitespace.
fn clean(raw: &str) -> String {
    let lowered = raw.to_lowercase().replace('ё', "е");
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in lowered.chars() {
        if ch.is_alphabetic() || ch == '-' {
            current.push(ch);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
        .into_iter()
        .map(|t| t.trim_matches('-').to_string())
        .filter(|t| !t.is_empty() && !ADDRESS_NOISE.contains(&t.as_str()))
        .map(|t| t.replace('-', " "))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical region lookups: text normalisation, INN fallback, and
/// federal-district expansion.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegionRegistry;

impl RegionRegistry {
    pub fn new() -> Self {
        Self
    }

    /// The 85 canonical subject names.
    pub fn canonical_subjects(&self) -> impl Iterator<Item = &'static str> {
        REGION_CODES.iter().map(|(_, name)| *name)
    }

    pub fn is_canonical(&self, name: &str) -> bool {
        REGION_CODES.iter().any(|(_, n)| *n == name)
    }

    /// Resolve free text (a customer-name tail, an address line, a feed
    /// region hint) to a canonical subject. Returns `None` for anything that
    /// does not resolve; callers store that `None` as-is.
    pub fn normalise(&self, raw: &str) -> Option<&'static str> {
        let cleaned = clean(raw);
        if cleaned.is_empty() {
            return None;
        }

        if let Some(hit) = ALIAS_MAP.get(&cleaned).copied() {
            return self.reject_districts(hit);
        }

        // Longest-first n-gram scan over the cleaned tokens. Only exact
        // alias-table entries match, so a district or street component like
        // "коркинский" falls through while the subject name beside it hits.
        let tokens: Vec<&str> = cleaned.split(' ').collect();
        for len in (1..=3.min(tokens.len())).rev() {
            for window in tokens.windows(len) {
                let candidate = window.join(" ");
                if GENERIC_TOKENS.contains(&candidate.as_str()) {
                    continue;
                }
                if let Some(hit) = ALIAS_MAP.get(&candidate).copied() {
                    if let Some(subject) = self.reject_districts(hit) {
                        return Some(subject);
                    }
                }
            }
        }

        None
    }

    /// `normalise` never yields a district name; districts only come out of
    /// `expand_district`.
    fn reject_districts(&self, hit: &'static str) -> Option<&'static str> {
        if DISTRICT_MAP.contains_key(&clean(hit)) {
            None
        } else {
            Some(hit)
        }
    }

    /// Map the first two digits of a 10- or 12-digit INN to a subject.
    pub fn from_inn(&self, inn: &str) -> Option<&'static str> {
        let digits: String = inn.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() != 10 && digits.len() != 12 {
            return None;
        }
        INN_MAP.get(&digits[..2]).copied()
    }

    /// Expand a federal-district name to its member subjects. Non-district
    /// input yields an empty list.
    pub fn expand_district(&self, name: &str) -> Vec<&'static str> {
        let cleaned = clean(name);
        if let Some(members) = DISTRICT_MAP.get(&cleaned) {
            return members.to_vec();
        }
        // District shorthands resolve through the alias table first.
        if let Some(hit) = ALIAS_MAP.get(&cleaned) {
            if let Some(members) = DISTRICT_MAP.get(&clean(hit)) {
                return members.to_vec();
            }
        }
        Vec::new()
    }

    /// Resolve a filter's region list to canonical subjects, expanding any
    /// federal districts. Unresolvable entries are dropped.
    pub fn resolve_filter_regions(&self, regions: &[String]) -> Vec<&'static str> {
        let mut out = Vec::new();
        for region in regions {
            let expanded = self.expand_district(region);
            if !expanded.is_empty() {
                for subject in expanded {
                    if !out.contains(&subject) {
                        out.push(subject);
                    }
                }
            } else if let Some(subject) = self.normalise(region) {
                if !out.contains(&subject) {
                    out.push(subject);
                }
            }
        }
        out
    }
}
