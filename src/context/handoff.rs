//! 交接协议：切换智能体时保留已收集的事实
//!
//! 切换发生时：
//! 1. 由离开方的 AgentContext 生成交接摘要；
//! 2. 白名单键（location、budget 及配置的 sticky 键）从离开方复制到 shared_context；
//! 3. shared_context 合并进目标方 collected_info，目标方已有的键不覆盖。

use chrono::{DateTime, Utc};
use tracing::info;

use crate::agents::HandlerKind;
use crate::core::state::{format_entities, AgentContext, EntityMap, SessionState};
use crate::observability;

/// 默认跨智能体保留的实体
pub const DEFAULT_CARRY_KEYS: [&str; 2] = ["location", "budget"];

/// 一次交接（仅存在于本轮，不持久化）
#[derive(Clone, Debug, PartialEq)]
pub struct HandoffRecord {
    pub from: HandlerKind,
    pub to: HandlerKind,
    pub synopsis: String,
    /// 本次注入目标方 collected_info 的实体
    pub carried: EntityMap,
}

/// 交接协议
#[derive(Debug, Clone)]
pub struct HandoffProtocol {
    carry_keys: Vec<String>,
}

impl HandoffProtocol {
    /// sticky_keys 追加在默认白名单之后（去重）
    pub fn new(sticky_keys: impl IntoIterator<Item = String>) -> Self {
        let mut carry_keys: Vec<String> = DEFAULT_CARRY_KEYS.iter().map(|k| k.to_string()).collect();
        for key in sticky_keys {
            if !carry_keys.contains(&key) {
                carry_keys.push(key);
            }
        }
        Self { carry_keys }
    }

    pub fn carry_keys(&self) -> &[String] {
        &self.carry_keys
    }

    /// 将活跃智能体切换到 target；发生切换时返回交接记录，否则为 None
    pub fn switch_to(
        &self,
        state: &mut SessionState,
        target: HandlerKind,
        now: DateTime<Utc>,
    ) -> Option<HandoffRecord> {
        let outgoing = state.active_handler;
        state.previous_handler = outgoing;
        state.active_handler = Some(target);
        state.context_mut(target, now);

        let from = outgoing.filter(|from| *from != target)?;

        let outgoing_ctx = state
            .agent_contexts
            .get(&from)
            .cloned()
            .unwrap_or_else(|| AgentContext::new(now));

        for key in &self.carry_keys {
            if let Some(value) = outgoing_ctx.collected_info.get(key) {
                state.shared_context.insert(key.clone(), value.clone());
            }
        }

        let shared = state.shared_context.clone();
        let target_ctx = state.context_mut(target, now);
        let mut carried = EntityMap::new();
        for (key, value) in shared {
            if !target_ctx.collected_info.contains_key(&key) {
                target_ctx.collected_info.insert(key.clone(), value.clone());
                carried.insert(key, value);
            }
        }

        let record = HandoffRecord {
            from,
            to: target,
            synopsis: synopsis(from, target, &outgoing_ctx),
            carried,
        };

        info!(
            thread_id = %state.thread_id,
            from = %from,
            to = %target,
            carried = ?record.carried.keys().collect::<Vec<_>>(),
            "agent handoff"
        );
        observability::record_handoff(from, target);
        Some(record)
    }
}

impl Default for HandoffProtocol {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn synopsis(from: HandlerKind, to: HandlerKind, ctx: &AgentContext) -> String {
    let mut text = format!(
        "User moved from {} to {}. {} was at stage {} with {} result(s).",
        from, to, from, ctx.conversation_stage, ctx.result_count
    );
    if !ctx.collected_info.is_empty() {
        text.push_str(" Known so far: ");
        text.push_str(&format_entities(&ctx.collected_info).join(", "));
        text.push('.');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::ConversationStage;
    use serde_json::json;

    fn state_on_property() -> SessionState {
        let now = Utc::now();
        let mut state = SessionState::new("t1", 20);
        state.active_handler = Some(HandlerKind::Property);
        let ctx = state.context_mut(HandlerKind::Property, now);
        ctx.collected_info.insert("location".into(), json!("Girne"));
        ctx.collected_info.insert("bedrooms".into(), json!(2));
        ctx.conversation_stage = ConversationStage::Discovery;
        state
    }

    #[test]
    fn test_whitelisted_keys_are_carried() {
        let mut state = state_on_property();
        let record = HandoffProtocol::default()
            .switch_to(&mut state, HandlerKind::LocalInfo, Utc::now())
            .expect("switch should produce a record");

        let target = &state.agent_contexts[&HandlerKind::LocalInfo];
        assert_eq!(target.collected_info.get("location"), Some(&json!("Girne")));
        // bedrooms 不在白名单内
        assert!(target.collected_info.get("bedrooms").is_none());
        assert_eq!(state.shared_context.get("location"), Some(&json!("Girne")));
        assert_eq!(record.carried.len(), 1);
        assert!(record.synopsis.contains("bedrooms=2"));
        assert_eq!(state.previous_handler, Some(HandlerKind::Property));
        assert_eq!(state.active_handler, Some(HandlerKind::LocalInfo));
    }

    #[test]
    fn test_target_keys_are_not_overwritten() {
        let mut state = state_on_property();
        state
            .context_mut(HandlerKind::LocalInfo, Utc::now())
            .collected_info
            .insert("location".into(), json!("Lapta"));

        let record = HandoffProtocol::default()
            .switch_to(&mut state, HandlerKind::LocalInfo, Utc::now())
            .unwrap();
        let target = &state.agent_contexts[&HandlerKind::LocalInfo];
        assert_eq!(target.collected_info.get("location"), Some(&json!("Lapta")));
        assert!(record.carried.is_empty());
    }

    #[test]
    fn test_sticky_keys_extend_whitelist() {
        let mut state = state_on_property();
        let protocol = HandoffProtocol::new(vec!["bedrooms".to_string(), "location".to_string()]);
        assert_eq!(protocol.carry_keys().len(), 3);

        protocol.switch_to(&mut state, HandlerKind::Marketplace, Utc::now());
        let target = &state.agent_contexts[&HandlerKind::Marketplace];
        assert_eq!(target.collected_info.get("bedrooms"), Some(&json!(2)));
    }

    #[test]
    fn test_no_switch_is_noop() {
        let mut state = state_on_property();
        let before = state.agent_contexts.clone();
        let record = HandoffProtocol::default().switch_to(&mut state, HandlerKind::Property, Utc::now());
        assert!(record.is_none());
        assert!(state.shared_context.is_empty());
        assert_eq!(state.agent_contexts, before);
    }

    #[test]
    fn test_first_turn_has_no_handoff() {
        let mut state = SessionState::new("t1", 20);
        let record = HandoffProtocol::default().switch_to(&mut state, HandlerKind::General, Utc::now());
        assert!(record.is_none());
        assert!(state.agent_contexts.contains_key(&HandlerKind::General));
    }
}
