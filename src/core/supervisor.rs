//! Supervisor：每轮输入的编排入口
//!
//! 一轮的顺序：
//! 1. 取线程锁（同一线程按到达顺序串行）与全局许可；
//! 2. 读取 SessionState（未落盘缓存 → 检查点存储 → 新建）；
//! 3. 意图分类 + 连续性守卫，确定目标智能体；无法判断且无活跃智能体时直接请用户澄清；
//! 4. 交接协议：切换时携带白名单实体；
//! 5. 检索长期记忆（失败则降级），融合上下文并按预算裁剪；
//! 6. 带超时调用目标智能体，写回其 AgentContext；
//! 7. 记录轮次，轮换其他过期上下文，写入长期记忆；
//! 8. 整体写一次检查点，返回回复。
//!
//! 任何失败都在内部转成预定义回复，调用方永远拿到 TurnReply。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::agents::{
    HandlerKind, HandlerRegistry, IntentClassifier, KeywordClassifier, PatternExtractor,
};
use crate::config::AppConfig;
use crate::context::{ContextFusion, ContinuityGuard, HandoffProtocol, LifecycleManager, Route};
use crate::core::state::{EntityMap, SessionState};
use crate::core::{OrchestratorError, RecoveryAction, RecoveryEngine, ThreadLocks, TurnScheduler};
use crate::memory::backend::ROLE_USER;
use crate::memory::token_budget::LengthFn;
use crate::memory::{
    open_checkpoint_store, CheckpointStore, CircuitBreaker, CircuitBreakerConfig, HttpMemoryBackend,
    InMemoryBackend, MemoryBackend, MemoryClientConfig, MemoryQuery, MemoryRecord, ResilientMemoryClient,
    RetryPolicy, SearchMode, TokenBudgetEnforcer, Turn,
};
use crate::observability;

/// 无法判断意图时的澄清回复
pub const CLARIFICATION_PROMPT: &str = "I can help with renting a home, second-hand items, or finding places nearby. \
Which of these are you looking for?";

const FALLBACK_REPLY: &str = "Sorry, I can't help with that right now. Please try again shortly.";

/// 重连时回放的轮数
const REHYDRATE_TURNS: usize = 5;

/// 一轮处理结果
#[derive(Clone, Debug)]
pub struct TurnReply {
    pub thread_id: String,
    pub reply: String,
    /// 本轮执行的智能体；澄清回复时为 None
    pub handler: Option<HandlerKind>,
    /// 路由原因，如 `strong_signal`、`critical_stage:presenting`
    pub routing_reason: String,
    /// 发生切换时的离开方
    pub handoff_from: Option<HandlerKind>,
    /// 长期记忆不可用，本轮未使用召回
    pub context_degraded: bool,
    pub handler_failed: bool,
    pub rotated: Vec<HandlerKind>,
    pub tokens_trimmed: usize,
    /// 检查点是否写入成功
    pub persisted: bool,
}

impl TurnReply {
    fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            reply: String::new(),
            handler: None,
            routing_reason: String::new(),
            handoff_from: None,
            context_degraded: false,
            handler_failed: false,
            rotated: Vec::new(),
            tokens_trimmed: 0,
            persisted: false,
        }
    }
}

/// 断线重连时推送给客户端的会话快照
#[derive(Clone, Debug, PartialEq)]
pub struct RehydrationSnapshot {
    pub thread_id: String,
    pub active_handler: Option<HandlerKind>,
    pub collected_info: EntityMap,
    pub recent_turns: Vec<Turn>,
    pub summary_version: u64,
}

#[derive(Debug, Clone)]
struct TurnSettings {
    handler_timeout: Duration,
    max_turn_history: usize,
    recall_limit: usize,
    search_mode: SearchMode,
}

struct Inner {
    registry: HandlerRegistry,
    classifier: Arc<dyn IntentClassifier>,
    memory: Arc<ResilientMemoryClient>,
    checkpoints: Arc<dyn CheckpointStore>,
    fusion: ContextFusion,
    budget: TokenBudgetEnforcer,
    guard: ContinuityGuard,
    handoff: HandoffProtocol,
    lifecycle: LifecycleManager,
    recovery: RecoveryEngine,
    locks: ThreadLocks,
    scheduler: TurnScheduler,
    /// 最近一次检查点写入失败的线程状态（比存储中的更新）
    unpersisted: std::sync::Mutex<HashMap<String, SessionState>>,
    settings: TurnSettings,
}

/// 多智能体编排器，可廉价克隆并在任务间共享
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("registry", &self.inner.registry)
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl Supervisor {
    pub fn builder(config: AppConfig) -> SupervisorBuilder {
        SupervisorBuilder::new(config)
    }

    /// 按配置构建全部默认组件
    pub fn from_config(config: AppConfig) -> Result<Self, OrchestratorError> {
        SupervisorBuilder::new(config).build()
    }

    pub fn memory(&self) -> &Arc<ResilientMemoryClient> {
        &self.inner.memory
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.inner.checkpoints
    }

    /// 处理一轮输入。轮次在独立任务中执行，调用方中途放弃也会跑完并写检查点。
    pub async fn process_turn(&self, thread_id: &str, user_input: &str) -> TurnReply {
        // 在调用方任务中排队取锁，保证同一线程按到达顺序执行
        let guard = self.inner.locks.acquire(thread_id).await;

        let this = self.clone();
        let tid = thread_id.to_string();
        let input = user_input.to_string();
        let handle = tokio::spawn(async move { this.run_turn(guard, &tid, &input).await });

        match handle.await {
            Ok(reply) => reply,
            Err(e) => {
                error!(thread_id, error = %e, alert = true, "turn task aborted");
                let mut reply = TurnReply::new(thread_id);
                reply.reply = FALLBACK_REPLY.to_string();
                reply.handler_failed = true;
                reply
            }
        }
    }

    /// 重连回放：在线程锁内读取，不会看到半完成的轮次
    pub async fn rehydrate(&self, thread_id: &str) -> Option<RehydrationSnapshot> {
        let _guard = self.inner.locks.acquire(thread_id).await;
        let state = self.load_existing(thread_id).await?;

        let collected_info = state
            .active_context()
            .map(|(_, ctx)| ctx.collected_info.clone())
            .unwrap_or_default();
        let recent_turns = state
            .turn_history
            .recent(REHYDRATE_TURNS)
            .into_iter()
            .cloned()
            .collect();
        Some(RehydrationSnapshot {
            thread_id: state.thread_id,
            active_handler: state.active_handler,
            collected_info,
            recent_turns,
            summary_version: state.summary_version,
        })
    }

    async fn run_turn(&self, _thread_guard: OwnedMutexGuard<()>, thread_id: &str, user_input: &str) -> TurnReply {
        let _permit = self.inner.scheduler.acquire().await;
        let inner = &self.inner;
        let now = Utc::now();
        observability::record_turn();

        let mut state = self
            .load_existing(thread_id)
            .await
            .unwrap_or_else(|| SessionState::new(thread_id, inner.settings.max_turn_history));
        let mut out = TurnReply::new(thread_id);

        let classification = inner.classifier.classify(user_input);
        let target = match inner.guard.route(&state, &classification, user_input) {
            Route::Handler { kind, reason } => {
                debug!(thread_id, handler = %kind, reason = %reason, score = classification.score, "turn routed");
                out.routing_reason = reason;
                kind
            }
            Route::Clarify => {
                debug!(thread_id, "no handler above confidence floor, asking for clarification");
                out.routing_reason = "clarification".to_string();
                out.reply = CLARIFICATION_PROMPT.to_string();
                state
                    .turn_history
                    .push(Turn::new(user_input, out.reply.clone(), HandlerKind::General));
                out.persisted = self.persist(&mut state, now).await;
                return out;
            }
        };
        out.handler = Some(target);

        let handoff = inner.handoff.switch_to(&mut state, target, now);
        out.handoff_from = handoff.as_ref().map(|h| h.from);

        let query = MemoryQuery::new(user_input, inner.settings.search_mode, inner.settings.recall_limit);
        let mut degraded_note = None;
        let recall = match inner.memory.search(thread_id, &query).await {
            Ok(recall) => Some(recall),
            Err(e) => {
                let err = OrchestratorError::from(e);
                warn!(thread_id, error = %err, "continuing without long-term memory");
                if let RecoveryAction::ContinueDegraded(note) = inner.recovery.handle(&err) {
                    degraded_note = Some(note);
                }
                None
            }
        };

        let fused = inner.fusion.fuse(&state, handoff.as_ref(), recall.as_ref());
        let (fused, trim) = inner.budget.enforce(fused);
        out.context_degraded = fused.is_degraded();
        out.tokens_trimmed = trim.tokens_removed();
        state.fused_context = fused;

        let agent_ctx = state.context_mut(target, now).clone();
        let handler = inner.registry.get(target);
        let outcome = tokio::time::timeout(
            inner.settings.handler_timeout,
            handler.handle(user_input, &state.fused_context, &agent_ctx),
        )
        .await;
        let outcome = match outcome {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(source)) => Err(OrchestratorError::HandlerFailure {
                handler: target,
                source,
            }),
            Err(_) => Err(OrchestratorError::HandlerTimeout {
                handler: target,
                timeout_ms: inner.settings.handler_timeout.as_millis() as u64,
            }),
        };

        let ctx = state.context_mut(target, now);
        ctx.last_active = now;
        match outcome {
            Ok(resp) => {
                ctx.collected_info = resp.collected_info;
                ctx.conversation_stage = resp.conversation_stage;
                ctx.result_count = resp.result_count;
                ctx.has_more_results = resp.has_more_results;
                state.handler_failure_streak = 0;
                out.reply = resp.reply;
            }
            Err(err) => {
                state.handler_failure_streak += 1;
                observability::record_handler_failure(target);
                let streak = state.handler_failure_streak;
                if inner.recovery.should_escalate(&err, streak) {
                    error!(thread_id, handler = %target, streak, error = %err, alert = true, "handler keeps failing");
                } else {
                    warn!(thread_id, handler = %target, streak, error = %err, "handler failed");
                }
                out.handler_failed = true;
                out.reply = match inner.recovery.handle(&err) {
                    RecoveryAction::Apologize(message) => message,
                    _ => FALLBACK_REPLY.to_string(),
                };
            }
        }

        if let Some(note) = &degraded_note {
            out.reply.push_str("\n\n");
            out.reply.push_str(note);
        }

        state
            .turn_history
            .push(Turn::new(user_input, out.reply.clone(), target));

        out.rotated = inner.lifecycle.rotate(&mut state, target, now, &inner.memory).await;

        // 本轮已确认记忆不可用时不再写入，避免再走一遍重试
        if recall.is_some() {
            let record = MemoryRecord::new(ROLE_USER, user_input)
                .with_meta("handler", target.as_str())
                .with_meta("reply", out.reply.clone());
            if let Err(e) = inner.memory.write(thread_id, record).await {
                debug!(thread_id, error = %e, "turn not written to long-term memory");
            }
        }

        out.persisted = self.persist(&mut state, now).await;
        inner.locks.prune();
        info!(
            thread_id,
            handler = %target,
            reason = %out.routing_reason,
            degraded = out.context_degraded,
            rotated = out.rotated.len(),
            persisted = out.persisted,
            "turn completed"
        );
        out
    }

    /// 读取已有状态：未落盘缓存优先，其次检查点存储
    async fn load_existing(&self, thread_id: &str) -> Option<SessionState> {
        let cached = self.unpersisted().get(thread_id).cloned();
        if cached.is_some() {
            return cached;
        }
        match self.inner.checkpoints.load(thread_id).await {
            Ok(Some(state)) if state.thread_id != thread_id => {
                observability::record_checkpoint_failure();
                error!(
                    thread_id,
                    stored = %state.thread_id,
                    alert = true,
                    "checkpoint store returned another thread's state, starting from empty state"
                );
                None
            }
            Ok(state) => state,
            Err(e) => {
                let err = OrchestratorError::from(e);
                observability::record_checkpoint_failure();
                error!(thread_id, error = %err, alert = true, "checkpoint load failed, starting from empty state");
                None
            }
        }
    }

    /// 一次性写入检查点；失败时保留在进程内，状态在本进程内仍然正确
    async fn persist(&self, state: &mut SessionState, now: DateTime<Utc>) -> bool {
        state.updated_at = now;
        match self.inner.checkpoints.save(state).await {
            Ok(()) => {
                self.unpersisted().remove(&state.thread_id);
                true
            }
            Err(e) => {
                let err = OrchestratorError::from(e);
                observability::record_checkpoint_failure();
                let escalate = self.inner.recovery.should_escalate(&err, 0);
                error!(
                    thread_id = %state.thread_id,
                    error = %err,
                    alert = escalate,
                    "checkpoint save failed, state kept in memory only"
                );
                self.unpersisted().insert(state.thread_id.clone(), state.clone());
                false
            }
        }
    }

    fn unpersisted(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionState>> {
        self.inner
            .unpersisted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Supervisor 构建器：未显式提供的组件按配置创建
pub struct SupervisorBuilder {
    config: AppConfig,
    registry: Option<HandlerRegistry>,
    classifier: Option<Arc<dyn IntentClassifier>>,
    backend: Option<Arc<dyn MemoryBackend>>,
    breaker: Option<Arc<CircuitBreaker>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    length_fn: Option<LengthFn>,
}

impl SupervisorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: None,
            classifier: None,
            backend: None,
            breaker: None,
            checkpoints: None,
            length_fn: None,
        }
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_memory_backend(mut self, backend: Arc<dyn MemoryBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// 注入进程级熔断器（多个 Supervisor 共享同一后端时使用）
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_length_fn(mut self, length: LengthFn) -> Self {
        self.length_fn = Some(length);
        self
    }

    pub fn build(self) -> Result<Supervisor, OrchestratorError> {
        let cfg = self.config;

        let registry = match self.registry {
            Some(registry) => registry,
            None => HandlerRegistry::with_defaults(Arc::new(PatternExtractor::new())),
        };
        let classifier = self.classifier.unwrap_or_else(|| {
            Arc::new(KeywordClassifier::new(
                cfg.handlers.confidence_floor,
                cfg.handlers.strong_score,
            ))
        });

        let backend: Arc<dyn MemoryBackend> = match (self.backend, &cfg.memory.endpoint) {
            (Some(backend), _) => backend,
            (None, Some(endpoint)) => Arc::new(HttpMemoryBackend::new(endpoint.clone())),
            (None, None) => Arc::new(InMemoryBackend::default()),
        };
        let breaker = self.breaker.unwrap_or_else(|| {
            Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: cfg.memory.failure_threshold,
                reset_timeout: cfg.memory.reset_timeout(),
            }))
        });
        let memory = Arc::new(ResilientMemoryClient::new(
            backend,
            breaker,
            MemoryClientConfig {
                timeout: cfg.memory.timeout(),
                retry: RetryPolicy {
                    max_retries: cfg.memory.max_retries,
                    base_delay: Duration::from_millis(cfg.memory.base_delay_ms),
                    multiplier: cfg.memory.backoff_multiplier,
                    max_delay: Duration::from_millis(cfg.memory.max_delay_ms),
                },
            },
        ));

        let checkpoints = match self.checkpoints {
            Some(store) => store,
            None => open_checkpoint_store(&cfg.checkpoint)?,
        };

        let budget = match self.length_fn {
            Some(length) => TokenBudgetEnforcer::with_length_fn(cfg.context.max_tokens, length),
            None => TokenBudgetEnforcer::new(cfg.context.max_tokens),
        };

        let inner = Inner {
            registry,
            classifier,
            memory,
            checkpoints,
            fusion: ContextFusion::new(cfg.context.recent_turns),
            budget,
            guard: ContinuityGuard::new(
                cfg.continuity.short_input_max_words,
                cfg.continuity.significant_entities,
                cfg.continuity.refinement_phrases.clone(),
            ),
            handoff: HandoffProtocol::new(cfg.handoff.sticky_keys.clone()),
            lifecycle: LifecycleManager::new(
                cfg.lifecycle.ttl_secs,
                cfg.lifecycle.max_entities,
                cfg.lifecycle.max_summary_chars,
                cfg.lifecycle.max_summaries,
            ),
            recovery: RecoveryEngine::new(cfg.handlers.failure_alert_threshold),
            locks: ThreadLocks::new(),
            scheduler: TurnScheduler::new(cfg.app.max_concurrent_turns),
            unpersisted: std::sync::Mutex::new(HashMap::new()),
            settings: TurnSettings {
                handler_timeout: cfg.handlers.timeout(),
                max_turn_history: cfg.app.max_turn_history,
                recall_limit: cfg.memory.recall_limit,
                search_mode: cfg.memory.search_mode,
            },
        };
        Ok(Supervisor { inner: Arc::new(inner) })
    }
}
