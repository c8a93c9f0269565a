//! 生命周期管理：把长时间不活跃的智能体上下文压缩成摘要并归档
//!
//! 每轮在交接之后运行一次。除本轮目标智能体外，`now - last_active > ttl`
//! 的上下文会被：生成抽取式摘要 → 尽力写入长期记忆 → 从 agent_contexts 删除
//! → 追加到 agent_context_summaries，summary_version 随之递增。

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::agents::HandlerKind;
use crate::core::state::{format_entities, AgentContext, AgentContextSummary, SessionState};
use crate::memory::backend::ROLE_SUMMARY;
use crate::memory::{MemoryRecord, ResilientMemoryClient};
use crate::observability;

/// 摘要中附带的该智能体最近轮数
const SUMMARY_TURNS: usize = 2;

#[derive(Debug, Clone)]
pub struct LifecycleManager {
    ttl: Duration,
    max_entities: usize,
    max_summary_chars: usize,
    max_summaries: usize,
}

impl LifecycleManager {
    pub fn new(ttl_secs: u64, max_entities: usize, max_summary_chars: usize, max_summaries: usize) -> Self {
        Self {
            ttl: Duration::seconds(ttl_secs as i64),
            max_entities,
            max_summary_chars,
            max_summaries: max_summaries.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 需要轮换的智能体（严格大于 ttl 才算过期）
    pub fn stale_handlers(&self, state: &SessionState, target: HandlerKind, now: DateTime<Utc>) -> Vec<HandlerKind> {
        state
            .agent_contexts
            .iter()
            .filter(|(handler, ctx)| **handler != target && now - ctx.last_active > self.ttl)
            .map(|(handler, _)| *handler)
            .collect()
    }

    /// 抽取式摘要：阶段 + 若干实体 + 最近两轮
    pub fn summarize(
        &self,
        state: &SessionState,
        handler: HandlerKind,
        ctx: &AgentContext,
        now: DateTime<Utc>,
    ) -> AgentContextSummary {
        let mut parts = vec![format!("[{}] stage={}", handler, ctx.conversation_stage)];
        let entities = format_entities(ctx.collected_info.iter().take(self.max_entities));
        if !entities.is_empty() {
            parts.push(entities.join(", "));
        }
        if ctx.result_count > 0 {
            parts.push(format!("results={}", ctx.result_count));
        }
        for turn in state.turn_history.recent_for(handler, SUMMARY_TURNS) {
            parts.push(turn.to_line());
        }
        let summary: String = parts.join("; ").chars().take(self.max_summary_chars).collect();

        AgentContextSummary {
            handler,
            summary,
            inactive_secs: (now - ctx.last_active).num_seconds(),
            conversation_stage: ctx.conversation_stage,
            result_count: ctx.result_count,
            archived_at: now,
            archived: false,
        }
    }

    /// 轮换所有过期上下文，返回被轮换的智能体
    pub async fn rotate(
        &self,
        state: &mut SessionState,
        target: HandlerKind,
        now: DateTime<Utc>,
        memory: &ResilientMemoryClient,
    ) -> Vec<HandlerKind> {
        let stale = self.stale_handlers(state, target, now);
        if stale.is_empty() {
            return stale;
        }

        let mut summaries: Vec<AgentContextSummary> = stale
            .iter()
            .filter_map(|handler| {
                state
                    .agent_contexts
                    .get(handler)
                    .map(|ctx| self.summarize(state, *handler, ctx, now))
            })
            .collect();

        let thread_id = state.thread_id.clone();
        let writes = summaries.iter().map(|s| {
            let record = MemoryRecord::new(ROLE_SUMMARY, s.summary.clone())
                .with_meta("handler", s.handler.as_str())
                .with_meta("conversation_stage", s.conversation_stage.as_str())
                .with_meta("inactive_secs", s.inactive_secs);
            memory.write(&thread_id, record)
        });
        let results = join_all(writes).await;

        for (summary, result) in summaries.iter_mut().zip(results) {
            match result {
                Ok(()) => summary.archived = true,
                Err(e) => warn!(
                    thread_id = %thread_id,
                    handler = %summary.handler,
                    error = %e,
                    "failed to archive context summary, keeping local copy"
                ),
            }
        }

        for summary in summaries {
            state.agent_contexts.remove(&summary.handler);
            state.summary_version += 1;
            observability::record_rotation(summary.handler);
            info!(
                thread_id = %thread_id,
                handler = %summary.handler,
                inactive_secs = summary.inactive_secs,
                archived = summary.archived,
                summary_version = state.summary_version,
                "agent context rotated"
            );
            state.agent_context_summaries.push(summary);
        }

        let overflow = state.agent_context_summaries.len().saturating_sub(self.max_summaries);
        if overflow > 0 {
            state.agent_context_summaries.drain(0..overflow);
        }
        state.last_summary_timestamp = Some(now);
        stale
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(1800, 5, 400, 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::ConversationStage;
    use crate::memory::{
        CircuitBreaker, InMemoryBackend, MemoryBackend, MemoryClientConfig, MemoryQuery, SearchMode, Turn,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn client(backend: Arc<InMemoryBackend>) -> ResilientMemoryClient {
        ResilientMemoryClient::new(backend, Arc::new(CircuitBreaker::default()), MemoryClientConfig::default())
    }

    fn state_with_idle(handler: HandlerKind, idle_secs: i64, now: DateTime<Utc>) -> SessionState {
        let mut state = SessionState::new("t1", 20);
        state.active_handler = Some(HandlerKind::LocalInfo);
        state.context_mut(HandlerKind::LocalInfo, now);
        let ctx = state.context_mut(handler, now);
        ctx.last_active = now - Duration::seconds(idle_secs);
        ctx.conversation_stage = ConversationStage::Discovery;
        ctx.collected_info.insert("location".into(), json!("Girne"));
        ctx.collected_info.insert("bedrooms".into(), json!(2));
        state
            .turn_history
            .push(Turn::new("2-bedroom in Girne", "Which budget?", handler));
        state
    }

    #[tokio::test]
    async fn test_context_past_ttl_is_rotated() {
        let now = Utc::now();
        let backend = Arc::new(InMemoryBackend::default());
        let mut state = state_with_idle(HandlerKind::Property, 1801, now);

        let rotated = LifecycleManager::default()
            .rotate(&mut state, HandlerKind::LocalInfo, now, &client(backend.clone()))
            .await;

        assert_eq!(rotated, vec![HandlerKind::Property]);
        assert!(!state.agent_contexts.contains_key(&HandlerKind::Property));
        assert!(state.agent_contexts.contains_key(&HandlerKind::LocalInfo));
        assert_eq!(state.summary_version, 1);
        assert_eq!(state.last_summary_timestamp, Some(now));

        let summary = &state.agent_context_summaries[0];
        assert_eq!(summary.handler, HandlerKind::Property);
        assert!(summary.archived);
        assert_eq!(summary.inactive_secs, 1801);
        assert!(summary.summary.contains("stage=discovery"));
        assert!(summary.summary.contains("location=Girne"));
        assert!(summary.summary.contains("Which budget?"));

        let recall = backend
            .search("t1", &MemoryQuery::new("Girne", SearchMode::Hybrid, 5))
            .await
            .unwrap();
        assert_eq!(recall.facts.len(), 1);
    }

    #[tokio::test]
    async fn test_context_within_ttl_is_kept() {
        let now = Utc::now();
        let mut state = state_with_idle(HandlerKind::Property, 1799, now);
        let rotated = LifecycleManager::default()
            .rotate(&mut state, HandlerKind::LocalInfo, now, &client(Arc::new(InMemoryBackend::default())))
            .await;
        assert!(rotated.is_empty());
        assert!(state.agent_contexts.contains_key(&HandlerKind::Property));
        assert_eq!(state.summary_version, 0);
        assert!(state.last_summary_timestamp.is_none());
    }

    #[tokio::test]
    async fn test_target_is_never_rotated() {
        let now = Utc::now();
        let mut state = state_with_idle(HandlerKind::Property, 5000, now);
        let rotated = LifecycleManager::default()
            .rotate(&mut state, HandlerKind::Property, now, &client(Arc::new(InMemoryBackend::default())))
            .await;
        assert!(rotated.is_empty());
    }

    #[test]
    fn test_summary_is_truncated() {
        let now = Utc::now();
        let state = state_with_idle(HandlerKind::Property, 10, now);
        let manager = LifecycleManager::new(1800, 1, 20, 20);
        let ctx = &state.agent_contexts[&HandlerKind::Property];
        let summary = manager.summarize(&state, HandlerKind::Property, ctx, now);
        assert_eq!(summary.summary.chars().count(), 20);
        assert!(summary.summary.starts_with("[property] stage=dis"));
    }

    #[tokio::test]
    async fn test_summary_list_is_bounded() {
        let now = Utc::now();
        let manager = LifecycleManager::new(1800, 5, 400, 2);
        let memory = client(Arc::new(InMemoryBackend::default()));
        let mut state = SessionState::new("t1", 20);
        for handler in [HandlerKind::Property, HandlerKind::Marketplace, HandlerKind::General] {
            state.context_mut(handler, now).last_active = now - Duration::seconds(4000);
        }
        let rotated = manager.rotate(&mut state, HandlerKind::LocalInfo, now, &memory).await;
        assert_eq!(rotated.len(), 3);
        assert_eq!(state.summary_version, 3);
        assert_eq!(state.agent_context_summaries.len(), 2);
    }
}
