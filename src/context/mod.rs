//! 上下文编排：融合、交接、连续性守卫、生命周期轮换
//!
//! FusedContext 是当前轮所有记忆来源按固定优先级合并后的视图：
//! 1 交接摘要 > 2 共享实体 > 3 当前智能体实体 > 4 最近轮次 > 5 长期记忆召回。
//! 其中 1–3 为受保护块，预算裁剪时不会被删除。

pub mod continuity;
pub mod fusion;
pub mod handoff;
pub mod lifecycle;

use serde::{Deserialize, Serialize};

pub use continuity::{ContinuityGuard, GuardDecision, Route};
pub use fusion::ContextFusion;
pub use handoff::{HandoffProtocol, HandoffRecord};
pub use lifecycle::LifecycleManager;

/// 上下文块类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Handoff,
    SharedContext,
    CollectedInfo,
    TurnHistory,
    Recall,
}

impl BlockKind {
    /// 优先级（数字越小优先级越高）
    pub fn priority(&self) -> u8 {
        match self {
            BlockKind::Handoff => 1,
            BlockKind::SharedContext => 2,
            BlockKind::CollectedInfo => 3,
            BlockKind::TurnHistory => 4,
            BlockKind::Recall => 5,
        }
    }

    /// 受保护块：预算裁剪时只截断、不删除
    pub fn is_protected(&self) -> bool {
        self.priority() <= 3
    }

    pub fn heading(&self) -> &'static str {
        match self {
            BlockKind::Handoff => "Handoff",
            BlockKind::SharedContext => "Shared facts",
            BlockKind::CollectedInfo => "Collected info",
            BlockKind::TurnHistory => "Recent turn",
            BlockKind::Recall => "Long-term recall",
        }
    }

    /// 渲染时每块附加的开销：标题行加块间分隔
    pub fn overhead_with(&self, length: &dyn Fn(&str) -> usize) -> usize {
        length(&format!("## {}\n", self.heading())) + length(BLOCK_SEPARATOR)
    }
}

const BLOCK_SEPARATOR: &str = "\n\n";

/// 单个上下文块
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextBlock {
    pub kind: BlockKind,
    pub content: String,
}

impl ContextBlock {
    pub fn new(kind: BlockKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    /// 渲染后的大小；空块不渲染，计 0
    pub fn size_with(&self, length: &dyn Fn(&str) -> usize) -> usize {
        if self.content.is_empty() {
            return 0;
        }
        self.kind.overhead_with(length) + length(&self.content)
    }
}

/// 融合上下文（按优先级排序）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FusedContext {
    blocks: Vec<ContextBlock>,
    /// 长期记忆不可用时为 true，下游据此提示用户
    degraded: bool,
}

impl FusedContext {
    pub fn from_blocks(blocks: Vec<ContextBlock>, degraded: bool) -> Self {
        Self { blocks, degraded }
    }

    pub fn blocks(&self) -> &[ContextBlock] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<ContextBlock> {
        self.blocks
    }

    pub fn blocks_of(&self, kind: BlockKind) -> impl Iterator<Item = &ContextBlock> {
        self.blocks.iter().filter(move |b| b.kind == kind)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// 按给定长度函数统计渲染后的总大小（含标题与分隔）。
    /// 长度函数次可加时，结果不小于 `length(&self.render())`。
    pub fn size_with(&self, length: &dyn Fn(&str) -> usize) -> usize {
        self.blocks.iter().map(|b| b.size_with(length)).sum()
    }

    /// 渲染为供模型 / 智能体阅读的文本
    pub fn render(&self) -> String {
        self.blocks
            .iter()
            .filter(|b| !b.content.is_empty())
            .map(|b| format!("## {}\n{}", b.kind.heading(), b.content))
            .collect::<Vec<_>>()
            .join(BLOCK_SEPARATOR)
    }
}
