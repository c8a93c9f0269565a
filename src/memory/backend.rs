//! 长期记忆服务契约与进程内实现
//!
//! 外部长期记忆服务只暴露两个操作：write 与 search。编排器只通过
//! ResilientMemoryClient 调用它，不直接访问后端。

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::tokenizer::{overlap_score, tokenize_to_set};

/// 写入长期记忆的记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// user / summary
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl MemoryRecord {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 归档摘要以 facts 形式返回
    pub fn is_summary(&self) -> bool {
        self.role == ROLE_SUMMARY
    }
}

pub const ROLE_USER: &str = "user";
pub const ROLE_SUMMARY: &str = "summary";

/// 检索模式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Semantic,
    Keyword,
    #[default]
    Hybrid,
}

/// 检索请求
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryQuery {
    pub text: String,
    pub mode: SearchMode,
    pub limit: usize,
}

impl MemoryQuery {
    pub fn new(text: impl Into<String>, mode: SearchMode, limit: usize) -> Self {
        Self {
            text: text.into(),
            mode,
            limit,
        }
    }
}

/// 检索结果
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecallResult {
    #[serde(default)]
    pub snippets: Vec<String>,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl RecallResult {
    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty() && self.facts.is_empty()
    }
}

/// 后端原始错误（由 ResilientMemoryClient 统一转为 MemoryUnavailable）
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("memory backend timed out after {0}ms")]
    Timeout(u64),

    #[error("memory backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("memory backend transport error: {0}")]
    Transport(String),

    #[error("memory backend response could not be decoded: {0}")]
    Decode(String),
}

/// 长期记忆服务接口
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn write(&self, thread_id: &str, record: MemoryRecord) -> Result<(), BackendError>;

    async fn search(&self, thread_id: &str, query: &MemoryQuery) -> Result<RecallResult, BackendError>;
}

struct StoredRecord {
    record: MemoryRecord,
    tokens: HashSet<String>,
}

/// 进程内实现：按线程隔离，词重叠排序（中文经 jieba 分词）
pub struct InMemoryBackend {
    threads: RwLock<HashMap<String, Vec<StoredRecord>>>,
    max_entries_per_thread: usize,
}

impl InMemoryBackend {
    pub fn new(max_entries_per_thread: usize) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            max_entries_per_thread,
        }
    }

    /// 某线程已存储的记录数
    pub async fn len(&self, thread_id: &str) -> usize {
        self.threads
            .read()
            .await
            .get(thread_id)
            .map_or(0, |records| records.len())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn write(&self, thread_id: &str, record: MemoryRecord) -> Result<(), BackendError> {
        if record.content.trim().is_empty() {
            return Ok(());
        }
        let tokens = tokenize_to_set(&record.content);
        let mut threads = self.threads.write().await;
        let records = threads.entry(thread_id.to_string()).or_default();
        records.push(StoredRecord { record, tokens });
        let n = records.len();
        if n > self.max_entries_per_thread {
            records.drain(0..n - self.max_entries_per_thread);
        }
        Ok(())
    }

    async fn search(&self, thread_id: &str, query: &MemoryQuery) -> Result<RecallResult, BackendError> {
        let query_tokens = tokenize_to_set(&query.text);
        let threads = self.threads.read().await;
        let Some(records) = threads.get(thread_id) else {
            return Ok(RecallResult::default());
        };

        // 新记录优先：同分时按写入顺序倒序
        let mut scored: Vec<(usize, usize, &MemoryRecord)> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (overlap_score(&query_tokens, &r.tokens), i, &r.record))
            .filter(|(score, _, r)| *score > 0 || (r.is_summary() && query.mode != SearchMode::Keyword))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        let mut result = RecallResult::default();
        for (_, _, record) in scored {
            let bucket = if record.is_summary() {
                &mut result.facts
            } else {
                &mut result.snippets
            };
            if bucket.len() < query.limit {
                bucket.push(record.content.clone());
            }
        }
        result
            .meta
            .insert("backend".into(), serde_json::Value::from("in_memory"));
        Ok(result)
    }
}
