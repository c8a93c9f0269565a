//! 连续性守卫：模糊输入是否允许切换智能体
//!
//! 只对「非强信号」的输入生效。规则按顺序检查：
//! 1. 当前智能体处于关键阶段（presenting / refinement / transaction）→ 留下；
//! 2. 当前智能体已收集足够多实体 → 留下；
//! 3. 输入过短或命中追问短语 → 留下；
//! 4. 否则交给分类器的最高分结果。

use tracing::debug;

use crate::agents::{Classification, HandlerKind};
use crate::core::state::{AgentContext, SessionState};

/// 默认追问短语（小写匹配）
pub const DEFAULT_REFINEMENT_PHRASES: &[&str] = &[
    "show me more",
    "more options",
    "any other",
    "anything else",
    "something else",
    "cheaper",
    "bigger",
    "smaller",
    "closer",
    "what about",
    "how about",
    "the first one",
    "the second one",
    "that one",
    "next",
];

/// 守卫裁决
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardDecision {
    /// 留在当前智能体，附带原因（如 `critical_stage:presenting`）
    Stay { reason: String },
    /// 交给分类器
    Defer,
}

/// 最终路由
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Handler { kind: HandlerKind, reason: String },
    /// 没有活跃智能体且分类低于置信下限
    Clarify,
}

#[derive(Debug, Clone)]
pub struct ContinuityGuard {
    short_input_max_words: usize,
    significant_entities: usize,
    refinement_phrases: Vec<String>,
}

impl ContinuityGuard {
    pub fn new(
        short_input_max_words: usize,
        significant_entities: usize,
        refinement_phrases: Vec<String>,
    ) -> Self {
        Self {
            short_input_max_words,
            significant_entities,
            refinement_phrases: refinement_phrases
                .into_iter()
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }

    /// 对当前智能体上下文应用规则 1–4
    pub fn evaluate(&self, active: &AgentContext, user_input: &str) -> GuardDecision {
        let stage = active.conversation_stage;
        if stage.is_critical() {
            return GuardDecision::Stay {
                reason: format!("critical_stage:{stage}"),
            };
        }

        let n = active.collected_info.len();
        if n >= self.significant_entities {
            return GuardDecision::Stay {
                reason: format!("significant_context:{n}_entities"),
            };
        }

        let words = user_input.split_whitespace().count();
        if words <= self.short_input_max_words {
            return GuardDecision::Stay {
                reason: format!("short_input:{words}_words"),
            };
        }

        let lower = user_input.to_lowercase();
        if let Some(phrase) = self.refinement_phrases.iter().find(|p| lower.contains(p.as_str())) {
            return GuardDecision::Stay {
                reason: format!("refinement_phrase:{phrase}"),
            };
        }

        GuardDecision::Defer
    }

    /// 综合分类结果与守卫规则，决定本轮目标智能体
    pub fn route(&self, state: &SessionState, classification: &Classification, user_input: &str) -> Route {
        let Some(active) = state.active_handler else {
            return match classification.best {
                Some(kind) => Route::Handler {
                    kind,
                    reason: "classifier".to_string(),
                },
                None => Route::Clarify,
            };
        };

        match classification.best {
            Some(best) if best == active => {
                return Route::Handler {
                    kind: active,
                    reason: "classifier".to_string(),
                }
            }
            Some(best) if classification.strong => {
                return Route::Handler {
                    kind: best,
                    reason: "strong_signal".to_string(),
                }
            }
            _ => {}
        }

        let fallback;
        let ctx = match state.agent_contexts.get(&active) {
            Some(ctx) => ctx,
            None => {
                fallback = AgentContext::new(state.updated_at);
                &fallback
            }
        };

        match self.evaluate(ctx, user_input) {
            GuardDecision::Stay { reason } => {
                debug!(
                    thread_id = %state.thread_id,
                    handler = %active,
                    candidate = ?classification.best,
                    reason = %reason,
                    "continuity guard kept active handler"
                );
                Route::Handler { kind: active, reason }
            }
            GuardDecision::Defer => match classification.best {
                Some(kind) => Route::Handler {
                    kind,
                    reason: "classifier".to_string(),
                },
                None => Route::Handler {
                    kind: active,
                    reason: "no_signal".to_string(),
                },
            },
        }
    }
}

impl Default for ContinuityGuard {
    fn default() -> Self {
        Self::new(
            3,
            3,
            DEFAULT_REFINEMENT_PHRASES.iter().map(|p| p.to_string()).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{IntentClassifier, KeywordClassifier};
    use crate::core::state::ConversationStage;
    use chrono::Utc;
    use serde_json::json;

    fn state_with(stage: ConversationStage, entities: usize) -> SessionState {
        let mut state = SessionState::new("t1", 20);
        state.active_handler = Some(HandlerKind::Property);
        let ctx = state.context_mut(HandlerKind::Property, Utc::now());
        ctx.conversation_stage = stage;
        for i in 0..entities {
            ctx.collected_info.insert(format!("k{i}"), json!(i));
        }
        state
    }

    #[test]
    fn test_critical_stage_stays() {
        let guard = ContinuityGuard::default();
        let state = state_with(ConversationStage::Presenting, 0);
        let ctx = &state.agent_contexts[&HandlerKind::Property];
        assert_eq!(
            guard.evaluate(ctx, "maybe something used for the kitchen instead"),
            GuardDecision::Stay {
                reason: "critical_stage:presenting".into()
            }
        );
    }

    #[test]
    fn test_significant_context_stays() {
        let guard = ContinuityGuard::default();
        let state = state_with(ConversationStage::Discovery, 3);
        let ctx = &state.agent_contexts[&HandlerKind::Property];
        assert_eq!(
            guard.evaluate(ctx, "maybe something used for the kitchen instead"),
            GuardDecision::Stay {
                reason: "significant_context:3_entities".into()
            }
        );
    }

    #[test]
    fn test_short_and_refinement_inputs_stay() {
        let guard = ContinuityGuard::default();
        let state = state_with(ConversationStage::Discovery, 1);
        let ctx = &state.agent_contexts[&HandlerKind::Property];
        assert!(matches!(guard.evaluate(ctx, "ok thanks"), GuardDecision::Stay { .. }));
        assert!(matches!(
            guard.evaluate(ctx, "could you show me more of those please"),
            GuardDecision::Stay { reason } if reason == "refinement_phrase:show me more"
        ));
        assert_eq!(
            guard.evaluate(ctx, "is there a used phone for sale somewhere"),
            GuardDecision::Defer
        );
    }

    #[test]
    fn test_presenting_ignores_weak_classifier_signal() {
        let guard = ContinuityGuard::default();
        let classifier = KeywordClassifier::default();
        let state = state_with(ConversationStage::Presenting, 1);
        let input = "I wonder about something used later on";
        let c = classifier.classify(input);
        assert_eq!(c.best, Some(HandlerKind::Marketplace));
        assert!(!c.strong);
        assert!(matches!(
            guard.route(&state, &c, input),
            Route::Handler { kind: HandlerKind::Property, .. }
        ));
    }

    #[test]
    fn test_strong_signal_switches() {
        let guard = ContinuityGuard::default();
        let classifier = KeywordClassifier::default();
        let state = state_with(ConversationStage::Presenting, 4);
        let c = classifier.classify("where's the nearest pharmacy?");
        assert_eq!(
            guard.route(&state, &c, "where's the nearest pharmacy?"),
            Route::Handler {
                kind: HandlerKind::LocalInfo,
                reason: "strong_signal".into()
            }
        );
    }

    #[test]
    fn test_no_active_handler_and_no_signal_clarifies() {
        let guard = ContinuityGuard::default();
        let state = SessionState::new("t1", 20);
        let c = KeywordClassifier::default().classify("hmm okay");
        assert_eq!(guard.route(&state, &c, "hmm okay"), Route::Clarify);
    }
}
