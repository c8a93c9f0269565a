//! 上下文融合：合并短期会话状态、长期记忆召回与智能体私有记忆
//!
//! 纯合并，不修改任何底层存储。长期记忆不可用时只输出 1–4 类块并标记 degraded。

use crate::context::{BlockKind, ContextBlock, FusedContext, HandoffRecord};
use crate::core::state::{format_entities, SessionState};
use crate::memory::RecallResult;

/// 融合器
#[derive(Debug, Clone)]
pub struct ContextFusion {
    /// 当前智能体纳入的最近轮数
    recent_turns: usize,
}

impl ContextFusion {
    pub fn new(recent_turns: usize) -> Self {
        Self { recent_turns }
    }

    /// 构建融合上下文；recall 为 None 表示长期记忆不可用
    pub fn fuse(
        &self,
        state: &SessionState,
        handoff: Option<&HandoffRecord>,
        recall: Option<&RecallResult>,
    ) -> FusedContext {
        let mut blocks = Vec::new();

        if let Some(record) = handoff {
            blocks.push(ContextBlock::new(BlockKind::Handoff, record.synopsis.clone()));
        }

        if !state.shared_context.is_empty() {
            blocks.push(ContextBlock::new(
                BlockKind::SharedContext,
                format_entities(&state.shared_context).join("\n"),
            ));
        }

        if let Some((handler, ctx)) = state.active_context() {
            if !ctx.collected_info.is_empty() {
                blocks.push(ContextBlock::new(
                    BlockKind::CollectedInfo,
                    format_entities(&ctx.collected_info).join("\n"),
                ));
            }
            for turn in state.turn_history.recent_for(handler, self.recent_turns) {
                blocks.push(ContextBlock::new(BlockKind::TurnHistory, turn.to_line()));
            }
        }

        if let Some(result) = recall {
            for snippet in result.snippets.iter().chain(result.facts.iter()) {
                if !snippet.trim().is_empty() {
                    blocks.push(ContextBlock::new(BlockKind::Recall, snippet.clone()));
                }
            }
        }

        // 稳定排序：同优先级保持插入顺序
        blocks.sort_by_key(|b| b.kind.priority());
        FusedContext::from_blocks(blocks, recall.is_none())
    }
}

impl Default for ContextFusion {
    fn default() -> Self {
        Self::new(2)
    }
}
