//! 编排错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 OrchestratorError 决定降级继续 / 致歉 / 不持久化继续。
//! 所有错误都在 Supervisor 内部消化，调用方只会拿到回复文本。

use thiserror::Error;

use crate::agents::{HandlerError, HandlerKind, RegistryError};
use crate::memory::{CheckpointError, MemoryUnavailable};

/// 一轮编排中可能出现的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("long-term memory unavailable: {0}")]
    MemoryUnavailable(#[from] MemoryUnavailable),

    #[error("handler {handler} failed: {source}")]
    HandlerFailure {
        handler: HandlerKind,
        #[source]
        source: HandlerError,
    },

    #[error("handler {handler} timed out after {timeout_ms}ms")]
    HandlerTimeout { handler: HandlerKind, timeout_ms: u64 },

    #[error("checkpoint failed: {0}")]
    CheckpointFailure(#[from] CheckpointError),

    #[error(transparent)]
    MissingHandler(#[from] RegistryError),
}

impl OrchestratorError {
    /// 智能体侧失败（执行报错或超时）
    pub fn is_handler_failure(&self) -> bool {
        matches!(
            self,
            OrchestratorError::HandlerFailure { .. } | OrchestratorError::HandlerTimeout { .. }
        )
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 不带长期记忆继续，回复末尾附加提示
    ContinueDegraded(String),
    /// 本轮以致歉回复结束
    Apologize(String),
    /// 回复照常返回，但状态未能持久化
    ContinueUnpersisted,
}
