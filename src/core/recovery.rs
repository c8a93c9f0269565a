//! 错误恢复引擎
//!
//! 根据 OrchestratorError 类型返回 RecoveryAction，并决定是否需要运维告警。
//! 每种失败都有预定义的用户可见文本，原始错误只进日志。

use crate::core::{OrchestratorError, RecoveryAction};

/// 长期记忆不可用时附加在回复末尾
pub const MEMORY_DEGRADED_NOTE: &str = "I couldn't access memory right now, continuing without it.";

const HANDLER_FAILURE_REPLY: &str = "Sorry, something went wrong while I was looking that up. \
You can try again, or broaden the request (for example a wider area or budget).";

const HANDLER_TIMEOUT_REPLY: &str = "Sorry, that took longer than expected. \
Please try again in a moment, or ask for something a little broader.";

const INTERNAL_REPLY: &str = "Sorry, I can't help with that right now. Please try again shortly.";

#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    /// 同一线程连续智能体失败达到该值时告警
    failure_alert_threshold: u32,
}

impl RecoveryEngine {
    pub fn new(failure_alert_threshold: u32) -> Self {
        Self {
            failure_alert_threshold: failure_alert_threshold.max(1),
        }
    }

    pub fn handle(&self, err: &OrchestratorError) -> RecoveryAction {
        match err {
            OrchestratorError::MemoryUnavailable(_) => {
                RecoveryAction::ContinueDegraded(MEMORY_DEGRADED_NOTE.to_string())
            }
            OrchestratorError::HandlerFailure { .. } => {
                RecoveryAction::Apologize(HANDLER_FAILURE_REPLY.to_string())
            }
            OrchestratorError::HandlerTimeout { .. } => {
                RecoveryAction::Apologize(HANDLER_TIMEOUT_REPLY.to_string())
            }
            OrchestratorError::CheckpointFailure(_) => RecoveryAction::ContinueUnpersisted,
            OrchestratorError::MissingHandler(_) => RecoveryAction::Apologize(INTERNAL_REPLY.to_string()),
        }
    }

    /// 是否升级为运维告警；failure_streak 为该线程当前连续失败次数（含本次）
    pub fn should_escalate(&self, err: &OrchestratorError, failure_streak: u32) -> bool {
        match err {
            OrchestratorError::CheckpointFailure(_) | OrchestratorError::MissingHandler(_) => true,
            OrchestratorError::HandlerFailure { .. } | OrchestratorError::HandlerTimeout { .. } => {
                failure_streak >= self.failure_alert_threshold
            }
            OrchestratorError::MemoryUnavailable(_) => false,
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(2)
    }
}
