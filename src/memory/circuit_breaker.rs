//! 熔断器：长期记忆服务的可用性是进程级事实，所有线程共享一个实例
//!
//! Closed --(连续失败达到阈值)--> Open --(reset_timeout 到期)--> HalfOpen
//! HalfOpen 只放行一次试探调用：成功 → Closed，失败 → Open（重新计时）。
//!
//! `allow()` 返回 [`CallPermit`]；调用被取消（future 被丢弃、panic）时许可在 Drop
//! 中按失败结算，试探标记不会悬挂。

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::observability;

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// 对外可见的熔断状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// 指标取值：0 closed，1 half-open，2 open
    pub fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    consecutive_failures: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        observability::set_circuit_state(CircuitState::Closed);
        Self {
            config,
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 申请一次调用许可；HalfOpen 下只放行第一个请求
    pub fn allow(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.lock();
        let granted = match inner.phase {
            Phase::Closed => true,
            Phase::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    inner.phase = Phase::HalfOpen { trial_in_flight: true };
                    info!("memory circuit breaker half-open, allowing one trial call");
                    observability::set_circuit_state(CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
            Phase::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    false
                } else {
                    inner.phase = Phase::HalfOpen { trial_in_flight: true };
                    true
                }
            }
        };
        granted.then(|| CallPermit {
            breaker: self,
            settled: false,
        })
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if !matches!(inner.phase, Phase::Closed) {
            info!("memory circuit breaker closed after successful call");
            inner.phase = Phase::Closed;
            observability::set_circuit_state(CircuitState::Closed);
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let failures = inner.consecutive_failures;
        match inner.phase {
            Phase::Closed if failures >= self.config.failure_threshold => {
                warn!(
                    failures,
                    reset_timeout_secs = self.config.reset_timeout.as_secs(),
                    "memory circuit breaker opened"
                );
                inner.phase = Phase::Open {
                    opened_at: Instant::now(),
                };
                observability::set_circuit_state(CircuitState::Open);
            }
            Phase::HalfOpen { .. } => {
                warn!(failures, "memory circuit breaker trial failed, reopening");
                inner.phase = Phase::Open {
                    opened_at: Instant::now(),
                };
                observability::set_circuit_state(CircuitState::Open);
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.lock().phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

/// 一次已放行调用的结算凭证，必须以 success / failure 结束
#[must_use = "a permit that is dropped unsettled counts as a failure"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("memory call abandoned before completion, counting as failure");
            self.breaker.record_failure();
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(50),
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = fast_breaker();
        for _ in 0..4 {
            cb.allow().unwrap().failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.allow().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.allow().is_none());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = fast_breaker();
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_allows_exactly_one_trial() {
        let cb = fast_breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(70)).await;

        let trial = cb.allow().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow().is_none());

        trial.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow().is_some());
    }

    #[tokio::test]
    async fn test_failed_trial_reopens() {
        let cb = fast_breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(70)).await;
        cb.allow().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // opened_at 已重置，冷却期内继续拒绝
        assert!(cb.allow().is_none());
    }

    #[tokio::test]
    async fn test_dropped_trial_reopens_instead_of_blocking() {
        let cb = fast_breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(70)).await;

        drop(cb.allow().unwrap());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(70)).await;
        let trial = cb.allow().unwrap();
        trial.success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_gauge_values() {
        assert_eq!(CircuitState::Closed.gauge_value(), 0.0);
        assert_eq!(CircuitState::HalfOpen.gauge_value(), 1.0);
        assert_eq!(CircuitState::Open.gauge_value(), 2.0);
    }
}
