//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONCIERGE__*` 覆盖
//! （双下划线表示嵌套，如 `CONCIERGE__MEMORY__FAILURE_THRESHOLD=3`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::context::continuity::DEFAULT_REFINEMENT_PHRASES;
use crate::memory::SearchMode;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub checkpoint: CheckpointSection,
    pub memory: MemorySection,
    pub context: ContextSection,
    pub handoff: HandoffSection,
    pub continuity: ContinuitySection,
    pub lifecycle: LifecycleSection,
    pub handlers: HandlersSection,
    pub observability: ObservabilitySection,
}

/// [app] 段：应用名、轮次历史上限、全局并发轮数
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 每个线程保留的轮次历史
    #[serde(default = "default_max_turn_history")]
    pub max_turn_history: usize,
    /// 同时执行的轮数上限（跨线程）
    #[serde(default = "default_max_concurrent_turns")]
    pub max_concurrent_turns: usize,
}

fn default_max_turn_history() -> usize {
    20
}

fn default_max_concurrent_turns() -> usize {
    64
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_turn_history: default_max_turn_history(),
            max_concurrent_turns: default_max_concurrent_turns(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    #[default]
    Memory,
    File,
    Sqlite,
}

/// [checkpoint] 段：file 时 path 为目录，sqlite 时为数据库文件
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSection {
    #[serde(default)]
    pub backend: CheckpointBackend,
    #[serde(default = "default_checkpoint_path")]
    pub path: String,
}

fn default_checkpoint_path() -> String {
    "data/checkpoints".to_string()
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::default(),
            path: default_checkpoint_path(),
        }
    }
}

/// [memory] 段：长期记忆服务地址、超时、重试与熔断
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    /// 未设置时使用进程内实现
    pub endpoint: Option<String>,
    #[serde(default = "default_memory_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
    #[serde(default = "default_recall_limit")]
    pub recall_limit: usize,
    #[serde(default)]
    pub search_mode: SearchMode,
}

fn default_memory_timeout_ms() -> u64 {
    1500
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_secs() -> u64 {
    30
}

fn default_recall_limit() -> usize {
    5
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_memory_timeout_ms(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
            recall_limit: default_recall_limit(),
            search_mode: SearchMode::default(),
        }
    }
}

impl MemorySection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

/// [context] 段：融合上下文预算
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// 当前智能体纳入融合上下文的最近轮数
    #[serde(default = "default_recent_turns")]
    pub recent_turns: usize,
}

fn default_max_tokens() -> usize {
    6000
}

fn default_recent_turns() -> usize {
    2
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            recent_turns: default_recent_turns(),
        }
    }
}

/// [handoff] 段：除 location / budget 外额外跨智能体保留的实体
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HandoffSection {
    #[serde(default)]
    pub sticky_keys: Vec<String>,
}

/// [continuity] 段：连续性守卫阈值
#[derive(Debug, Clone, Deserialize)]
pub struct ContinuitySection {
    #[serde(default = "default_short_input_max_words")]
    pub short_input_max_words: usize,
    #[serde(default = "default_significant_entities")]
    pub significant_entities: usize,
    #[serde(default = "default_refinement_phrases")]
    pub refinement_phrases: Vec<String>,
}

fn default_short_input_max_words() -> usize {
    3
}

fn default_significant_entities() -> usize {
    3
}

fn default_refinement_phrases() -> Vec<String> {
    DEFAULT_REFINEMENT_PHRASES.iter().map(|p| p.to_string()).collect()
}

impl Default for ContinuitySection {
    fn default() -> Self {
        Self {
            short_input_max_words: default_short_input_max_words(),
            significant_entities: default_significant_entities(),
            refinement_phrases: default_refinement_phrases(),
        }
    }
}

/// [lifecycle] 段：不活跃上下文轮换
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleSection {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// 摘要中保留的实体数
    #[serde(default = "default_max_entities")]
    pub max_entities: usize,
    #[serde(default = "default_max_summary_chars")]
    pub max_summary_chars: usize,
    /// SessionState 中保留的摘要条数
    #[serde(default = "default_max_summaries")]
    pub max_summaries: usize,
}

fn default_ttl_secs() -> u64 {
    1800
}

fn default_max_entities() -> usize {
    5
}

fn default_max_summary_chars() -> usize {
    400
}

fn default_max_summaries() -> usize {
    20
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_entities: default_max_entities(),
            max_summary_chars: default_max_summary_chars(),
            max_summaries: default_max_summaries(),
        }
    }
}

/// [handlers] 段：智能体超时、分类阈值、失败告警
#[derive(Debug, Clone, Deserialize)]
pub struct HandlersSection {
    #[serde(default = "default_handler_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f32,
    #[serde(default = "default_strong_score")]
    pub strong_score: f32,
    /// 同一线程连续失败达到该次数时告警
    #[serde(default = "default_failure_alert_threshold")]
    pub failure_alert_threshold: u32,
}

fn default_handler_timeout_ms() -> u64 {
    1000
}

fn default_confidence_floor() -> f32 {
    1.0
}

fn default_strong_score() -> f32 {
    2.0
}

fn default_failure_alert_threshold() -> u32 {
    2
}

impl Default for HandlersSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_handler_timeout_ms(),
            confidence_floor: default_confidence_floor(),
            strong_score: default_strong_score(),
            failure_alert_threshold: default_failure_alert_threshold(),
        }
    }
}

impl HandlersSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// [observability] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ObservabilitySection {
    /// Prometheus 导出地址（如 0.0.0.0:9000），未设置时不导出
    pub metrics_listen: Option<String>,
}

/// 从 config 目录加载配置，环境变量 CONCIERGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONCIERGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONCIERGE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
