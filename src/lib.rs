//! Concierge - 多智能体对话编排器
//!
//! 模块划分：
//! - **agents**: 领域智能体（房产 / 二手市场 / 本地信息 / 闲聊）、意图分类、实体抽取
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **context**: 上下文融合、交接协议、连续性守卫、生命周期轮换
//! - **core**: 会话状态、Supervisor、错误恢复、线程互斥与并发调度
//! - **memory**: 轮次历史、长期记忆客户端（重试 + 熔断）、token 预算、检查点
//! - **observability**: tracing 日志与 Prometheus 指标

pub mod agents;
pub mod config;
pub mod context;
pub mod core;
pub mod memory;
pub mod observability;

pub use crate::core::{Supervisor, SupervisorBuilder, TurnReply};
