//! 核心编排层：状态、错误与恢复、线程互斥、轮次调度、Supervisor

pub mod error;
pub mod recovery;
pub mod state;
pub mod supervisor;
pub mod task_scheduler;
pub mod thread_lock;

pub use error::{OrchestratorError, RecoveryAction};
pub use recovery::{RecoveryEngine, MEMORY_DEGRADED_NOTE};
pub use state::{AgentContext, AgentContextSummary, ConversationStage, EntityMap, SessionState};
pub use supervisor::{RehydrationSnapshot, Supervisor, SupervisorBuilder, TurnReply, CLARIFICATION_PROMPT};
pub use task_scheduler::TurnScheduler;
pub use thread_lock::ThreadLocks;
