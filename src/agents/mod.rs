//! 领域智能体：封闭的智能体枚举、统一接口与启动期注册表
//!
//! 每个业务领域（房产、二手市场、本地信息、闲聊）一个智能体，
//! 只通过返回值与编排器通信，不直接修改编排器状态。

pub mod classifier;
pub mod extraction;
pub mod general;
pub mod local_info;
pub mod marketplace;
pub mod property;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::FusedContext;
use crate::core::state::{AgentContext, ConversationStage, EntityMap};

pub use classifier::{Classification, IntentClassifier, KeywordClassifier};
pub use extraction::{absorb, merge_entities, EntityExtractor, ExtractedEntity, MergeOutcome, PatternExtractor};
pub use general::GeneralHandler;
pub use local_info::LocalInfoHandler;
pub use marketplace::MarketplaceHandler;
pub use property::PropertyHandler;

/// 智能体种类（封闭枚举，新增种类时编译器会检查所有 match）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Property,
    Marketplace,
    LocalInfo,
    General,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 4] = [
        HandlerKind::Property,
        HandlerKind::Marketplace,
        HandlerKind::LocalInfo,
        HandlerKind::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Property => "property",
            HandlerKind::Marketplace => "marketplace",
            HandlerKind::LocalInfo => "local_info",
            HandlerKind::General => "general",
        }
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 智能体执行结果
#[derive(Clone, Debug)]
pub struct HandlerResponse {
    pub reply: String,
    /// 更新后的完整实体表（由智能体通过增量抽取合并得到）
    pub collected_info: EntityMap,
    pub conversation_stage: ConversationStage,
    pub result_count: usize,
    pub has_more_results: bool,
}

/// 智能体内部错误（下游搜索失败等）
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("downstream unavailable: {0}")]
    Downstream(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// 领域智能体统一接口
#[async_trait]
pub trait DomainHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    /// 处理一轮输入；context 为裁剪后的融合上下文，agent_context 为本智能体的工作记忆快照
    async fn handle(
        &self,
        user_input: &str,
        context: &FusedContext,
        agent_context: &AgentContext,
    ) -> Result<HandlerResponse, HandlerError>;
}

/// 注册表构建错误
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no handler registered for {0}")]
    MissingHandler(HandlerKind),
}

/// 智能体注册表：启动时构建，保证每个 HandlerKind 都有实现
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKind, Arc<dyn DomainHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &kinds).finish()
    }
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// 内置参考实现：四个领域智能体共享同一个实体抽取器
    pub fn with_defaults(extractor: Arc<dyn EntityExtractor>) -> Self {
        let handlers: Vec<Arc<dyn DomainHandler>> = vec![
            Arc::new(PropertyHandler::new(extractor.clone())),
            Arc::new(MarketplaceHandler::new(extractor.clone())),
            Arc::new(LocalInfoHandler::new(extractor.clone())),
            Arc::new(GeneralHandler::new(extractor)),
        ];
        Self {
            handlers: handlers.into_iter().map(|h| (h.kind(), h)).collect(),
        }
    }

    pub fn get(&self, kind: HandlerKind) -> Arc<dyn DomainHandler> {
        // build() 已校验完整性
        self.handlers[&kind].clone()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<HandlerKind, Arc<dyn DomainHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register(mut self, handler: impl DomainHandler + 'static) -> Self {
        self.handlers.insert(handler.kind(), Arc::new(handler));
        self
    }

    pub fn register_arc(mut self, handler: Arc<dyn DomainHandler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        for kind in HandlerKind::ALL {
            if !self.handlers.contains_key(&kind) {
                return Err(RegistryError::MissingHandler(kind));
            }
        }
        Ok(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}
