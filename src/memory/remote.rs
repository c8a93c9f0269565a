//! HTTP 长期记忆服务客户端
//!
//! - `POST {endpoint}/v1/memories`        写入 `{thread_id, role, content, metadata}`
//! - `POST {endpoint}/v1/memories/search` 检索 `{thread_id, query, mode, limit}`，返回 RecallResult
//!
//! 超时与重试由 ResilientMemoryClient 负责，这里只做一次请求。

use async_trait::async_trait;
use serde::Serialize;

use super::backend::{BackendError, MemoryBackend, MemoryQuery, MemoryRecord, RecallResult, SearchMode};

#[derive(Serialize)]
struct WriteRequest<'a> {
    thread_id: &'a str,
    #[serde(flatten)]
    record: &'a MemoryRecord,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    thread_id: &'a str,
    query: &'a str,
    mode: SearchMode,
    limit: usize,
}

pub struct HttpMemoryBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpMemoryBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<reqwest::Response, BackendError> {
        let url = format!("{}{}", self.endpoint, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }
        Ok(resp)
    }
}

#[async_trait]
impl MemoryBackend for HttpMemoryBackend {
    async fn write(&self, thread_id: &str, record: MemoryRecord) -> Result<(), BackendError> {
        let body = WriteRequest {
            thread_id,
            record: &record,
        };
        self.post("/v1/memories", &body).await?;
        Ok(())
    }

    async fn search(&self, thread_id: &str, query: &MemoryQuery) -> Result<RecallResult, BackendError> {
        let body = SearchRequest {
            thread_id,
            query: &query.text,
            mode: query.mode,
            limit: query.limit,
        };
        let resp = self.post("/v1/memories/search", &body).await?;
        resp.json::<RecallResult>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}
