//! 带重试与熔断的长期记忆客户端
//!
//! 每次调用：先问熔断器是否放行，再在超时内调用后端；失败按指数退避重试
//! （base × multiplier^n，封顶 max_delay）。所有失败统一返回 MemoryUnavailable，
//! 调用方据此降级，不会拿到后端原始错误。

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::backend::{BackendError, MemoryBackend, MemoryQuery, MemoryRecord, RecallResult};
use super::circuit_breaker::CircuitBreaker;
use crate::observability;

/// 长期记忆不可用（熔断或重试耗尽）
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MemoryUnavailable {
    #[error("memory circuit is open")]
    CircuitOpen,

    #[error("memory backend failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// 第 n 次重试前的等待（n 从 0 开始）
    pub fn delay_for(&self, retry: u32) -> Duration {
        let ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        let capped = ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 1.5,
            max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MemoryClientConfig {
    /// 单次调用超时（与重试总时长无关）
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for MemoryClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1500),
            retry: RetryPolicy::default(),
        }
    }
}

/// 进程内计数（测试与诊断用，与 Prometheus 指标同步累加）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub ops_total: u64,
    pub ops_failed: u64,
    pub ops_circuit_rejected: u64,
    pub retries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ops_total: AtomicU64,
    ops_failed: AtomicU64,
    ops_circuit_rejected: AtomicU64,
    retries: AtomicU64,
}

pub struct ResilientMemoryClient {
    backend: Arc<dyn MemoryBackend>,
    breaker: Arc<CircuitBreaker>,
    config: MemoryClientConfig,
    counters: Counters,
}

impl ResilientMemoryClient {
    /// breaker 由调用方注入，便于多个客户端共享同一进程级状态
    pub fn new(backend: Arc<dyn MemoryBackend>, breaker: Arc<CircuitBreaker>, config: MemoryClientConfig) -> Self {
        Self {
            backend,
            breaker,
            config,
            counters: Counters::default(),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            ops_total: self.counters.ops_total.load(Ordering::Relaxed),
            ops_failed: self.counters.ops_failed.load(Ordering::Relaxed),
            ops_circuit_rejected: self.counters.ops_circuit_rejected.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }

    pub async fn write(&self, thread_id: &str, record: MemoryRecord) -> Result<(), MemoryUnavailable> {
        self.call("write", || self.backend.write(thread_id, record.clone()))
            .await
    }

    pub async fn search(&self, thread_id: &str, query: &MemoryQuery) -> Result<RecallResult, MemoryUnavailable> {
        self.call("search", || self.backend.search(thread_id, query)).await
    }

    async fn call<T, F, Fut>(&self, op: &'static str, attempt_fn: F) -> Result<T, MemoryUnavailable>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        self.counters.ops_total.fetch_add(1, Ordering::Relaxed);
        observability::record_memory_op(op);

        let policy = &self.config.retry;
        let mut last_error = String::new();

        for attempt in 0..=policy.max_retries {
            if attempt > 0 {
                let delay = policy.delay_for(attempt - 1);
                debug!(op, attempt, delay_ms = delay.as_millis() as u64, "retrying memory call");
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
            }

            let Some(permit) = self.breaker.allow() else {
                self.counters.ops_circuit_rejected.fetch_add(1, Ordering::Relaxed);
                observability::record_memory_rejected(op);
                debug!(op, "memory call rejected by open circuit");
                return Err(MemoryUnavailable::CircuitOpen);
            };

            let outcome = match tokio::time::timeout(self.config.timeout, attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(self.config.timeout.as_millis() as u64)),
            };

            match outcome {
                Ok(value) => {
                    permit.success();
                    return Ok(value);
                }
                Err(e) => {
                    permit.failure();
                    warn!(op, attempt, error = %e, "memory call failed");
                    last_error = e.to_string();
                }
            }
        }

        self.counters.ops_failed.fetch_add(1, Ordering::Relaxed);
        observability::record_memory_failed(op);
        Err(MemoryUnavailable::RetriesExhausted {
            attempts: policy.max_retries + 1,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::backend::SearchMode;
    use crate::memory::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// 前 fail_first 次调用失败，之后成功
    struct ScriptedBackend {
        fail_first: usize,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedBackend {
        fn failing(fail_first: usize) -> Self {
            Self {
                fail_first,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MemoryBackend for ScriptedBackend {
        async fn write(&self, _thread_id: &str, _record: MemoryRecord) -> Result<(), BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if n < self.fail_first {
                Err(BackendError::Status {
                    status: 503,
                    body: "unavailable".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn search(&self, thread_id: &str, _query: &MemoryQuery) -> Result<RecallResult, BackendError> {
            self.write(thread_id, MemoryRecord::new("user", "lookup")).await?;
            Ok(RecallResult {
                snippets: vec!["hit".into()],
                ..Default::default()
            })
        }
    }

    fn fast_config(max_retries: u32) -> MemoryClientConfig {
        MemoryClientConfig {
            timeout: Duration::from_millis(100),
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                multiplier: 1.5,
                max_delay: Duration::from_millis(5),
            },
        }
    }

    fn breaker(reset_ms: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(reset_ms),
        }))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for(2), Duration::from_millis(450));
        assert_eq!(policy.delay_for(20), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let backend = Arc::new(ScriptedBackend::failing(2));
        let client = ResilientMemoryClient::new(backend.clone(), breaker(1000), fast_config(3));
        let result = client
            .search("t1", &MemoryQuery::new("x", SearchMode::Hybrid, 3))
            .await
            .unwrap();
        assert_eq!(result.snippets, vec!["hit".to_string()]);
        assert_eq!(backend.calls(), 3);
        assert_eq!(client.stats().retries, 2);
        assert_eq!(client.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_calling_backend() {
        let backend = Arc::new(ScriptedBackend::failing(usize::MAX));
        let client = ResilientMemoryClient::new(backend.clone(), breaker(60_000), fast_config(3));

        let first = client.write("t1", MemoryRecord::new("user", "a")).await.unwrap_err();
        assert!(matches!(first, MemoryUnavailable::RetriesExhausted { attempts: 4, .. }));
        // 第 5 次失败后熔断，剩余重试直接被拒绝
        let second = client.write("t1", MemoryRecord::new("user", "b")).await.unwrap_err();
        assert_eq!(second, MemoryUnavailable::CircuitOpen);
        assert_eq!(backend.calls(), 5);

        let third = client.write("t1", MemoryRecord::new("user", "c")).await.unwrap_err();
        assert_eq!(third, MemoryUnavailable::CircuitOpen);
        assert_eq!(backend.calls(), 5);

        let stats = client.stats();
        assert_eq!(stats.ops_total, 3);
        assert_eq!(stats.ops_failed, 1);
        assert_eq!(stats.ops_circuit_rejected, 2);
    }

    #[tokio::test]
    async fn test_half_open_trial_success_closes() {
        let backend = Arc::new(ScriptedBackend::failing(5));
        let client = ResilientMemoryClient::new(backend.clone(), breaker(40), fast_config(0));
        for _ in 0..5 {
            let _ = client.write("t1", MemoryRecord::new("user", "x")).await;
        }
        assert_eq!(client.breaker().state(), CircuitState::Open);
        assert_eq!(
            client.write("t1", MemoryRecord::new("user", "x")).await,
            Err(MemoryUnavailable::CircuitOpen)
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        client.write("t1", MemoryRecord::new("user", "x")).await.unwrap();
        assert_eq!(client.breaker().state(), CircuitState::Closed);
        assert_eq!(backend.calls(), 6);
    }

    #[tokio::test]
    async fn test_cancelled_trial_does_not_wedge_breaker() {
        let backend = Arc::new(ScriptedBackend {
            fail_first: 5,
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(30),
        });
        let client = ResilientMemoryClient::new(backend.clone(), breaker(40), fast_config(0));
        for _ in 0..5 {
            let _ = client.write("t1", MemoryRecord::new("user", "x")).await;
        }
        assert_eq!(client.breaker().state(), CircuitState::Open);

        // 试探调用在后端返回前被调用方放弃
        tokio::time::sleep(Duration::from_millis(60)).await;
        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            client.write("t1", MemoryRecord::new("user", "x")),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(client.breaker().state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        client.write("t1", MemoryRecord::new("user", "x")).await.unwrap();
        assert_eq!(client.breaker().state(), CircuitState::Closed);
        assert_eq!(backend.calls(), 7);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let backend = Arc::new(ScriptedBackend {
            fail_first: 0,
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(300),
        });
        let client = ResilientMemoryClient::new(backend, breaker(1000), fast_config(0));
        let err = client.write("t1", MemoryRecord::new("user", "x")).await.unwrap_err();
        match err {
            MemoryUnavailable::RetriesExhausted { attempts, last_error } => {
                assert_eq!(attempts, 1);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
