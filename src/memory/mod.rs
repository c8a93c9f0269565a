//! 记忆层：短期（轮次历史）、长期（外部记忆服务）、检查点持久化、Token 预算

pub mod backend;
pub mod circuit_breaker;
pub mod client;
pub mod conversation;
pub mod persistence;
pub mod remote;
pub mod token_budget;
pub mod tokenizer;

pub use backend::{
    BackendError, InMemoryBackend, MemoryBackend, MemoryQuery, MemoryRecord, RecallResult, SearchMode,
};
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{ClientStats, MemoryClientConfig, MemoryUnavailable, ResilientMemoryClient, RetryPolicy};
pub use conversation::{Turn, TurnHistory};
pub use persistence::{
    open_checkpoint_store, CheckpointError, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
    SqliteCheckpointStore,
};
pub use remote::HttpMemoryBackend;
pub use token_budget::{TokenBudgetEnforcer, TokenEstimator, TrimReport};
