//! 实体抽取与增量合并
//!
//! EntityExtractor 是可替换的策略接口；PatternExtractor 用正则与地名表抽取
//! location / bedrooms / budget / currency / category / place_type。
//! merge_entities 负责 collected_info 的增量语义：新键插入，旧键仅在显式重新提及时替换。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

use crate::core::state::EntityMap;

/// 一次抽取得到的实体
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedEntity {
    pub key: String,
    pub value: Value,
    /// 用户在本句中明确说出（推断得到的默认值为 false）
    pub explicit: bool,
}

impl ExtractedEntity {
    pub fn explicit(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            explicit: true,
        }
    }

    pub fn inferred(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            explicit: false,
        }
    }
}

/// 实体抽取策略
pub trait EntityExtractor: Send + Sync {
    /// 从文本中抽取实体；existing 为已收集实体，用于决定是否需要推断默认值
    fn extract(&self, text: &str, existing: &EntityMap) -> Vec<ExtractedEntity>;
}

/// 合并结果（用于日志与测试）
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeOutcome {
    pub inserted: Vec<String>,
    pub replaced: Vec<String>,
    pub kept: Vec<String>,
}

/// 增量合并：不存在的键插入；已存在的键只有显式提及且值不同才替换
pub fn merge_entities(existing: &mut EntityMap, extracted: Vec<ExtractedEntity>) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    for entity in extracted {
        match existing.get(&entity.key) {
            None => {
                outcome.inserted.push(entity.key.clone());
                existing.insert(entity.key, entity.value);
            }
            Some(current) if entity.explicit && *current != entity.value => {
                outcome.replaced.push(entity.key.clone());
                existing.insert(entity.key, entity.value);
            }
            Some(_) => outcome.kept.push(entity.key),
        }
    }
    outcome
}

/// 从 existing 复制一份，合并本句抽取结果后返回（智能体返回值用）
pub fn absorb(extractor: &dyn EntityExtractor, text: &str, existing: &EntityMap) -> EntityMap {
    let mut updated = existing.clone();
    let extracted = extractor.extract(text, existing);
    let outcome = merge_entities(&mut updated, extracted);
    if !outcome.replaced.is_empty() {
        tracing::debug!(replaced = ?outcome.replaced, "entities re-mentioned explicitly");
    }
    updated
}

/// 地名：规范名 + 别名（英文 / 土耳其语 / 希腊语转写）
const PLACES: &[(&str, &[&str])] = &[
    ("Girne", &["girne", "kyrenia"]),
    ("Lefkoşa", &["lefkoşa", "lefkosa", "nicosia"]),
    ("Gazimağusa", &["gazimağusa", "gazimagusa", "famagusta", "magusa"]),
    ("İskele", &["iskele", "trikomo"]),
    ("Güzelyurt", &["güzelyurt", "guzelyurt", "morphou"]),
    ("Lapta", &["lapta", "lapithos"]),
    ("Alsancak", &["alsancak"]),
    ("Çatalköy", &["çatalköy", "catalkoy"]),
    ("Esentepe", &["esentepe"]),
    ("Bellapais", &["bellapais", "beylerbeyi"]),
];

const CATEGORIES: &[(&str, &[&str])] = &[
    ("furniture", &["furniture", "sofa", "couch", "table", "chair", "wardrobe", "bed frame"]),
    ("electronics", &["electronics", "phone", "laptop", "tv", "television", "fridge"]),
    ("vehicles", &["car", "scooter", "motorbike", "bicycle", "bike"]),
    ("clothing", &["clothes", "clothing", "dress", "shoes", "jacket"]),
];

const PLACE_TYPES: &[(&str, &[&str])] = &[
    ("pharmacy", &["pharmacy", "pharmacies", "chemist", "eczane"]),
    ("hospital", &["hospital", "clinic", "doctor"]),
    ("restaurant", &["restaurant", "restaurants", "place to eat", "dinner"]),
    ("supermarket", &["supermarket", "grocery", "market"]),
    ("atm", &["atm", "cash machine", "bank"]),
    ("beach", &["beach", "beaches"]),
    ("cafe", &["cafe", "coffee"]),
];

const NUMBER_WORDS: &[(&str, u64)] = &[
    ("one", 1),
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("six", 6),
];

fn bedrooms_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d+|one|two|three|four|five|six)\s*-?\s*(?:bed(?:room)?s?|br|bd)\b")
            .expect("static pattern")
    })
}

fn budget_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([£$€]|\b(?:gbp|usd|eur|tl)\s?)\s?(\d[\d,]*(?:\.\d+)?)\s*(k\b)?")
            .expect("static pattern")
    })
}

fn budget_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d[\d,]*(?:\.\d+)?)\s*(k\b)?\s*(pounds?|gbp|euros?|eur|dollars?|usd|lira|tl)\b")
            .expect("static pattern")
    })
}

fn budget_keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:under|below|max(?:imum)?|budget(?:\s+(?:of|is))?|up\s+to)\s+(\d[\d,]*(?:\.\d+)?)\s*(k\b)?")
            .expect("static pattern")
    })
}

/// 基于规则的实体抽取器
#[derive(Debug, Clone, Default)]
pub struct PatternExtractor {
    /// 未提及币种时推断的默认币种
    default_currency: String,
}

impl PatternExtractor {
    pub fn new() -> Self {
        Self {
            default_currency: "GBP".to_string(),
        }
    }

    pub fn with_default_currency(mut self, currency: impl Into<String>) -> Self {
        self.default_currency = currency.into();
        self
    }

    fn extract_location(lower: &str) -> Option<&'static str> {
        PLACES
            .iter()
            .find(|(_, aliases)| aliases.iter().any(|a| contains_word(lower, a)))
            .map(|(canonical, _)| *canonical)
    }

    fn extract_bedrooms(lower: &str) -> Option<u64> {
        let caps = bedrooms_re().captures(lower)?;
        let raw = caps.get(1)?.as_str();
        raw.parse::<u64>().ok().or_else(|| {
            NUMBER_WORDS
                .iter()
                .find(|(w, _)| *w == raw)
                .map(|(_, n)| *n)
        })
    }

    /// 返回 (金额, 显式币种)
    fn extract_budget(lower: &str) -> Option<(u64, Option<&'static str>)> {
        if let Some(caps) = budget_prefix_re().captures(lower) {
            let amount = parse_amount(caps.get(2)?.as_str(), caps.get(3).is_some())?;
            return Some((amount, currency_code(caps.get(1)?.as_str().trim())));
        }
        if let Some(caps) = budget_suffix_re().captures(lower) {
            let amount = parse_amount(caps.get(1)?.as_str(), caps.get(2).is_some())?;
            return Some((amount, currency_code(caps.get(3)?.as_str())));
        }
        let caps = budget_keyword_re().captures(lower)?;
        let amount = parse_amount(caps.get(1)?.as_str(), caps.get(2).is_some())?;
        Some((amount, None))
    }
}

impl EntityExtractor for PatternExtractor {
    fn extract(&self, text: &str, existing: &EntityMap) -> Vec<ExtractedEntity> {
        let lower = fold_case(text);
        let mut out = Vec::new();

        if let Some(location) = Self::extract_location(&lower) {
            out.push(ExtractedEntity::explicit("location", json!(location)));
        }
        if let Some(bedrooms) = Self::extract_bedrooms(&lower) {
            out.push(ExtractedEntity::explicit("bedrooms", json!(bedrooms)));
        }
        if let Some((amount, currency)) = Self::extract_budget(&lower) {
            out.push(ExtractedEntity::explicit("budget", json!(amount)));
            match currency {
                Some(code) => out.push(ExtractedEntity::explicit("currency", json!(code))),
                None if !existing.contains_key("currency") => out.push(
                    ExtractedEntity::inferred("currency", json!(self.default_currency)),
                ),
                None => {}
            }
        }
        if let Some(category) = lookup(CATEGORIES, &lower) {
            out.push(ExtractedEntity::explicit("category", json!(category)));
        }
        if let Some(place_type) = lookup(PLACE_TYPES, &lower) {
            out.push(ExtractedEntity::explicit("place_type", json!(place_type)));
        }
        out
    }
}

/// 小写化并去掉组合点（U+0307）：`İ` 小写后是 `i̇`，不去掉就匹配不到 `iskele`
fn fold_case(text: &str) -> String {
    text.to_lowercase().replace('\u{307}', "")
}

fn lookup(table: &[(&'static str, &[&str])], lower: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(_, words)| words.iter().any(|w| contains_word(lower, w)))
        .map(|(canonical, _)| *canonical)
}

/// 整词包含（两侧不能是字母数字）
fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.match_indices(word).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + word.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn parse_amount(raw: &str, thousands: bool) -> Option<u64> {
    let value: f64 = raw.replace(',', "").parse().ok()?;
    let value = if thousands { value * 1000.0 } else { value };
    if value.is_finite() && value >= 0.0 {
        Some(value.round() as u64)
    } else {
        None
    }
}

fn currency_code(token: &str) -> Option<&'static str> {
    match token {
        "£" | "gbp" | "pound" | "pounds" => Some("GBP"),
        "€" | "eur" | "euro" | "euros" => Some("EUR"),
        "$" | "usd" | "dollar" | "dollars" => Some("USD"),
        "tl" | "lira" => Some("TRY"),
        _ => None,
    }
}
