//! 意图分类：为每个智能体打分并给出最佳候选
//!
//! 规则匹配不调用模型；强关键词（如 apartment / pharmacy）权重 2，弱关键词权重 1。
//! 低于置信下限视为「无法判断」，低于强信号阈值视为模糊输入，交给连续性守卫裁决。

use std::collections::BTreeMap;

use crate::agents::HandlerKind;

/// 分类结果
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    /// 最高分智能体（低于置信下限时为 None）
    pub best: Option<HandlerKind>,
    pub score: f32,
    /// 是否为强信号（明确指向某个智能体）
    pub strong: bool,
    pub scores: BTreeMap<HandlerKind, f32>,
}

impl Classification {
    pub fn is_ambiguous(&self) -> bool {
        !self.strong
    }
}

/// 意图分类器接口
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, user_input: &str) -> Classification;
}

/// 关键词打分分类器
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    /// 最低置信分，低于则 best = None
    confidence_floor: f32,
    /// 强信号阈值
    strong_score: f32,
}

const STRONG: f32 = 2.0;
const WEAK: f32 = 1.0;

fn keywords(kind: HandlerKind) -> &'static [(&'static str, f32)] {
    match kind {
        HandlerKind::Property => &[
            ("apartment", STRONG),
            ("flat", STRONG),
            ("villa", STRONG),
            ("bedroom", STRONG),
            ("studio", STRONG),
            ("rent", STRONG),
            ("rental", STRONG),
            ("property", STRONG),
            ("house", STRONG),
            ("penthouse", STRONG),
            ("lease", STRONG),
            ("viewing", WEAK),
            ("furnished", WEAK),
            ("sea view", WEAK),
            ("pool", WEAK),
        ],
        HandlerKind::Marketplace => &[
            ("marketplace", STRONG),
            ("second hand", STRONG),
            ("second-hand", STRONG),
            ("sell", STRONG),
            ("selling", STRONG),
            ("for sale", STRONG),
            ("sofa", STRONG),
            ("furniture", STRONG),
            ("laptop", STRONG),
            ("phone", WEAK),
            ("used", WEAK),
            ("buy", WEAK),
            ("item", WEAK),
        ],
        HandlerKind::LocalInfo => &[
            ("pharmacy", STRONG),
            ("hospital", STRONG),
            ("restaurant", STRONG),
            ("supermarket", STRONG),
            ("atm", STRONG),
            ("beach", STRONG),
            ("bus", STRONG),
            ("nearest", WEAK),
            ("where is", WEAK),
            ("where's", WEAK),
            ("open now", WEAK),
            ("cafe", WEAK),
        ],
        HandlerKind::General => &[
            ("hello", WEAK),
            ("hi", WEAK),
            ("thanks", WEAK),
            ("thank you", WEAK),
            ("help", WEAK),
            ("who are you", STRONG),
            ("what can you do", STRONG),
        ],
    }
}

impl KeywordClassifier {
    pub fn new(confidence_floor: f32, strong_score: f32) -> Self {
        Self {
            confidence_floor,
            strong_score,
        }
    }

    fn score(kind: HandlerKind, lower: &str) -> f32 {
        keywords(kind)
            .iter()
            .filter(|(word, _)| contains_phrase(lower, word))
            .map(|(_, weight)| weight)
            .sum()
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(1.0, 2.0)
    }
}

impl IntentClassifier for KeywordClassifier {
    fn classify(&self, user_input: &str) -> Classification {
        let lower = user_input.to_lowercase();
        let scores: BTreeMap<HandlerKind, f32> = HandlerKind::ALL
            .iter()
            .map(|kind| (*kind, Self::score(*kind, &lower)))
            .collect();

        // 同分时取 HandlerKind::ALL 中靠前者，保证确定性
        let (top_kind, top_score) = HandlerKind::ALL
            .iter()
            .map(|kind| (*kind, scores[kind]))
            .fold((HandlerKind::General, f32::MIN), |best, cur| {
                if cur.1 > best.1 {
                    cur
                } else {
                    best
                }
            });

        let best = (top_score >= self.confidence_floor).then_some(top_kind);
        Classification {
            best,
            score: top_score.max(0.0),
            strong: best.is_some() && top_score >= self.strong_score,
            scores,
        }
    }
}

/// 短语整词匹配
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    haystack.match_indices(phrase).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + phrase.len()..].chars().next();
        // 允许复数 s 结尾（apartments / pharmacies 由单独词条覆盖）
        let after_ok = match after {
            None => true,
            Some('s') => haystack[start + phrase.len() + 1..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_alphanumeric()),
            Some(c) => !c.is_alphanumeric(),
        };
        !before.is_some_and(char::is_alphanumeric) && after_ok
    })
}
