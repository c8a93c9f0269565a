//! 可观测性：tracing 日志与 Prometheus 指标
//!
//! 未安装 recorder 时指标宏为空操作，库代码可以无条件调用这里的记录函数。

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::agents::HandlerKind;
use crate::memory::CircuitState;

pub const TURNS_TOTAL: &str = "concierge_turns_total";
/// labels: from, to
pub const HANDOFFS_TOTAL: &str = "concierge_handoffs_total";
/// labels: handler
pub const ROTATIONS_TOTAL: &str = "concierge_rotations_total";
/// labels: op
pub const MEMORY_OPS_TOTAL: &str = "concierge_memory_ops_total";
pub const MEMORY_OPS_FAILED_TOTAL: &str = "concierge_memory_ops_failed_total";
pub const MEMORY_OPS_CIRCUIT_REJECTED_TOTAL: &str = "concierge_memory_ops_circuit_rejected_total";
/// 0 closed，1 half-open，2 open
pub const MEMORY_CIRCUIT_STATE: &str = "concierge_memory_circuit_state";
pub const CONTEXT_TRIMS_TOTAL: &str = "concierge_context_trims_total";
pub const CONTEXT_TOKENS_TRIMMED_TOTAL: &str = "concierge_context_tokens_trimmed_total";
/// labels: handler
pub const HANDLER_FAILURES_TOTAL: &str = "concierge_handler_failures_total";
pub const CHECKPOINT_FAILURES_TOTAL: &str = "concierge_checkpoint_failures_total";

#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("invalid metrics listen address {addr}: {source}")]
    InvalidAddress {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("failed to install prometheus exporter: {0}")]
    Exporter(#[from] metrics_exporter_prometheus::BuildError),
}

/// 安装日志订阅器（默认 info，可用 RUST_LOG 覆盖）；重复调用无副作用
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 配置了地址时启动 Prometheus HTTP 导出（需在 tokio 运行时内调用）
pub fn init_metrics(listen: Option<&str>) -> Result<(), ObservabilityError> {
    let Some(listen) = listen else {
        tracing::debug!("metrics exporter disabled");
        return Ok(());
    };
    let addr: SocketAddr = listen.parse().map_err(|source| ObservabilityError::InvalidAddress {
        addr: listen.to_string(),
        source,
    })?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}

pub fn record_turn() {
    counter!(TURNS_TOTAL).increment(1);
}

pub fn record_handoff(from: HandlerKind, to: HandlerKind) {
    counter!(HANDOFFS_TOTAL, "from" => from.as_str(), "to" => to.as_str()).increment(1);
}

pub fn record_rotation(handler: HandlerKind) {
    counter!(ROTATIONS_TOTAL, "handler" => handler.as_str()).increment(1);
}

pub fn record_memory_op(op: &'static str) {
    counter!(MEMORY_OPS_TOTAL, "op" => op).increment(1);
}

pub fn record_memory_failed(op: &'static str) {
    counter!(MEMORY_OPS_FAILED_TOTAL, "op" => op).increment(1);
}

pub fn record_memory_rejected(op: &'static str) {
    counter!(MEMORY_OPS_CIRCUIT_REJECTED_TOTAL, "op" => op).increment(1);
}

pub fn set_circuit_state(state: CircuitState) {
    gauge!(MEMORY_CIRCUIT_STATE).set(state.gauge_value());
}

pub fn record_context_trim(tokens_removed: usize) {
    counter!(CONTEXT_TRIMS_TOTAL).increment(1);
    counter!(CONTEXT_TOKENS_TRIMMED_TOTAL).increment(tokens_removed as u64);
}

pub fn record_handler_failure(handler: HandlerKind) {
    counter!(HANDLER_FAILURES_TOTAL, "handler" => handler.as_str()).increment(1);
}

pub fn record_checkpoint_failure() {
    counter!(CHECKPOINT_FAILURES_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_snake_case() {
        let names = [
            TURNS_TOTAL,
            HANDOFFS_TOTAL,
            ROTATIONS_TOTAL,
            MEMORY_OPS_TOTAL,
            MEMORY_OPS_FAILED_TOTAL,
            MEMORY_OPS_CIRCUIT_REJECTED_TOTAL,
            MEMORY_CIRCUIT_STATE,
            CONTEXT_TRIMS_TOTAL,
            CONTEXT_TOKENS_TRIMMED_TOTAL,
            HANDLER_FAILURES_TOTAL,
            CHECKPOINT_FAILURES_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }

    #[test]
    fn test_invalid_listen_address() {
        let err = init_metrics(Some("not-an-address")).unwrap_err();
        assert!(matches!(err, ObservabilityError::InvalidAddress { .. }));
        assert!(init_metrics(None).is_ok());
    }
}
