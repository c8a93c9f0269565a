//! 状态定义：SessionState、AgentContext、归档摘要
//!
//! SessionState 是单个对话线程的完整状态，一轮处理期间只由 Supervisor 持有，
//! 轮与轮之间以检查点形式落盘。AgentContext 是某个智能体的私有工作记忆。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::HandlerKind;
use crate::context::FusedContext;
use crate::memory::TurnHistory;

/// 实体表：规范实体名 -> 值（如 location = "Girne"、bedrooms = 2）
///
/// 使用 BTreeMap 保证摘要、交接记录的输出顺序稳定。
pub type EntityMap = BTreeMap<String, serde_json::Value>;

/// 实体值的展示形式：字符串去掉引号，其余按 JSON 输出
pub fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 将实体表格式化为 `key=value` 列表
pub fn format_entities<'a>(entities: impl IntoIterator<Item = (&'a String, &'a serde_json::Value)>) -> Vec<String> {
    entities
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, display_value(v)))
        .collect()
}

/// 对话阶段
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStage {
    #[default]
    Greeting,
    Discovery,
    Refinement,
    Presenting,
    Transaction,
}

impl ConversationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStage::Greeting => "greeting",
            ConversationStage::Discovery => "discovery",
            ConversationStage::Refinement => "refinement",
            ConversationStage::Presenting => "presenting",
            ConversationStage::Transaction => "transaction",
        }
    }

    /// 处于这些阶段时，模糊输入不允许切换智能体
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ConversationStage::Presenting
                | ConversationStage::Refinement
                | ConversationStage::Transaction
        )
    }
}

impl std::fmt::Display for ConversationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个智能体的工作记忆
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    /// 已收集实体（只增不覆盖，显式重新提及才替换）
    pub collected_info: EntityMap,
    pub conversation_stage: ConversationStage,
    pub last_active: DateTime<Utc>,
    pub result_count: usize,
    pub has_more_results: bool,
}

impl AgentContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            collected_info: EntityMap::new(),
            conversation_stage: ConversationStage::Greeting,
            last_active: now,
            result_count: 0,
            has_more_results: false,
        }
    }
}

/// 已轮换（归档）的智能体上下文摘要，创建后不可变
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentContextSummary {
    pub handler: HandlerKind,
    pub summary: String,
    pub inactive_secs: i64,
    pub conversation_stage: ConversationStage,
    pub result_count: usize,
    pub archived_at: DateTime<Utc>,
    /// 是否已成功写入长期记忆（写入为尽力而为）
    pub archived: bool,
}

/// 单个对话线程的完整状态
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionState {
    pub thread_id: String,
    pub active_handler: Option<HandlerKind>,
    pub previous_handler: Option<HandlerKind>,
    /// 键为封闭枚举，天然只包含已知智能体
    pub agent_contexts: BTreeMap<HandlerKind, AgentContext>,
    pub shared_context: EntityMap,
    /// 每轮重建的派生视图，不单独修改
    #[serde(default)]
    pub fused_context: FusedContext,
    pub turn_history: TurnHistory,
    pub agent_context_summaries: Vec<AgentContextSummary>,
    pub last_summary_timestamp: Option<DateTime<Utc>>,
    /// 每次生命周期轮换递增，只增不减
    pub summary_version: u64,
    /// 同一线程连续的智能体失败次数（用于运维告警）
    #[serde(default)]
    pub handler_failure_streak: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(thread_id: impl Into<String>, max_turn_history: usize) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            active_handler: None,
            previous_handler: None,
            agent_contexts: BTreeMap::new(),
            shared_context: EntityMap::new(),
            fused_context: FusedContext::default(),
            turn_history: TurnHistory::new(max_turn_history),
            agent_context_summaries: Vec::new(),
            last_summary_timestamp: None,
            summary_version: 0,
            handler_failure_streak: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// 当前活跃智能体及其上下文
    pub fn active_context(&self) -> Option<(HandlerKind, &AgentContext)> {
        let handler = self.active_handler?;
        self.agent_contexts.get(&handler).map(|ctx| (handler, ctx))
    }

    /// 取得（必要时惰性创建）某智能体的上下文
    pub fn context_mut(&mut self, handler: HandlerKind, now: DateTime<Utc>) -> &mut AgentContext {
        self.agent_contexts
            .entry(handler)
            .or_insert_with(|| AgentContext::new(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_stages() {
        assert!(ConversationStage::Presenting.is_critical());
        assert!(ConversationStage::Refinement.is_critical());
        assert!(ConversationStage::Transaction.is_critical());
        assert!(!ConversationStage::Discovery.is_critical());
        assert!(!ConversationStage::Greeting.is_critical());
    }

    #[test]
    fn test_context_mut_creates_lazily() {
        let mut state = SessionState::new("t1", 10);
        assert!(state.agent_contexts.is_empty());
        state
            .context_mut(HandlerKind::Property, Utc::now())
            .collected_info
            .insert("bedrooms".into(), serde_json::json!(2));
        assert_eq!(state.agent_contexts.len(), 1);
        assert!(state.active_context().is_none());
    }

    #[test]
    fn test_session_state_json_roundtrip_keeps_handler_keys() {
        let mut state = SessionState::new("t1", 10);
        state.active_handler = Some(HandlerKind::LocalInfo);
        state.context_mut(HandlerKind::LocalInfo, Utc::now());
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"local_info\""));
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert!(back.agent_contexts.contains_key(&HandlerKind::LocalInfo));
    }

    #[test]
    fn test_format_entities() {
        let mut map = EntityMap::new();
        map.insert("location".into(), serde_json::json!("Girne"));
        map.insert("bedrooms".into(), serde_json::json!(2));
        assert_eq!(format_entities(&map), vec!["bedrooms=2", "location=Girne"]);
    }
}
