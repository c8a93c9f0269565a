//! Token 预算控制
//!
//! 融合上下文按渲染后的块计数（标题行与块间分隔一并计入），超出预算时先删低优先级块：
//! 长期召回（从最后一条开始），再是最近轮次（从最旧开始）。
//! 交接摘要、共享实体、当前智能体实体三类受保护块只截断不删除，
//! 仅在它们本身已超出预算时才从低优先级开始截断内容。

use std::sync::Arc;

use tracing::debug;

use crate::context::{BlockKind, ContextBlock, FusedContext};
use crate::observability;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 英文约 4 字符/token，中文约 1.5 字符/token；空文本为 0
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0usize;
        let mut non_ascii_chars = 0usize;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        ascii_chars.div_ceil(4) + (non_ascii_chars as f64 / 1.5).ceil() as usize
    }
}

/// 可替换的长度函数
pub type LengthFn = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// 单次裁剪结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub removed_blocks: usize,
    pub truncated_blocks: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

impl TrimReport {
    pub fn tokens_removed(&self) -> usize {
        self.tokens_before.saturating_sub(self.tokens_after)
    }

    pub fn trimmed(&self) -> bool {
        self.removed_blocks > 0 || self.truncated_blocks > 0
    }
}

#[derive(Clone)]
pub struct TokenBudgetEnforcer {
    max_tokens: usize,
    length: LengthFn,
}

impl std::fmt::Debug for TokenBudgetEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBudgetEnforcer")
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl TokenBudgetEnforcer {
    pub fn new(max_tokens: usize) -> Self {
        Self::with_length_fn(max_tokens, Arc::new(TokenEstimator::estimate))
    }

    pub fn with_length_fn(max_tokens: usize, length: LengthFn) -> Self {
        Self { max_tokens, length }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn size(&self, context: &FusedContext) -> usize {
        context.size_with(self.length.as_ref())
    }

    /// 裁剪到预算以内；相同输入与预算总是得到相同输出
    pub fn enforce(&self, context: FusedContext) -> (FusedContext, TrimReport) {
        let degraded = context.is_degraded();
        let mut blocks = context.into_blocks();
        let length = self.length.as_ref();
        let mut sizes: Vec<usize> = blocks.iter().map(|b| b.size_with(length)).collect();
        let before: usize = sizes.iter().sum();

        let mut report = TrimReport {
            tokens_before: before,
            tokens_after: before,
            ..Default::default()
        };
        if before <= self.max_tokens {
            return (FusedContext::from_blocks(blocks, degraded), report);
        }

        let mut total = before;
        let mut removed = vec![false; blocks.len()];

        // 召回从后往前，轮次从旧到新
        let recall = (0..blocks.len()).rev().filter(|&i| blocks[i].kind == BlockKind::Recall);
        let history = (0..blocks.len()).filter(|&i| blocks[i].kind == BlockKind::TurnHistory);
        let removal_order: Vec<usize> = recall.chain(history).collect();
        for i in removal_order {
            if total <= self.max_tokens {
                break;
            }
            removed[i] = true;
            total -= sizes[i];
            report.removed_blocks += 1;
        }

        if total > self.max_tokens {
            // 受保护块：按优先级从低到高、同级从后往前截断
            let mut protected: Vec<usize> = (0..blocks.len())
                .filter(|&i| !removed[i] && blocks[i].kind.is_protected())
                .collect();
            protected.sort_by(|&a, &b| {
                blocks[b]
                    .kind
                    .priority()
                    .cmp(&blocks[a].kind.priority())
                    .then(b.cmp(&a))
            });
            for i in protected {
                if total <= self.max_tokens {
                    break;
                }
                let excess = total - self.max_tokens;
                // 标题开销不可截断，放不下时整块内容清空
                let target = sizes[i]
                    .saturating_sub(excess)
                    .saturating_sub(blocks[i].kind.overhead_with(length));
                blocks[i].content = self.truncate_to(&blocks[i].content, target);
                let new_size = blocks[i].size_with(length);
                total = total - sizes[i] + new_size;
                sizes[i] = new_size;
                report.truncated_blocks += 1;
            }
        }

        let kept: Vec<ContextBlock> = blocks
            .into_iter()
            .zip(removed)
            .filter_map(|(block, gone)| (!gone).then_some(block))
            .collect();
        report.tokens_after = total;

        debug!(
            max_tokens = self.max_tokens,
            before = report.tokens_before,
            after = report.tokens_after,
            removed = report.removed_blocks,
            truncated = report.truncated_blocks,
            "fused context trimmed to budget"
        );
        observability::record_context_trim(report.tokens_removed());
        (FusedContext::from_blocks(kept, degraded), report)
    }

    /// 取满足 length(prefix) <= target 的最长前缀
    fn truncate_to(&self, text: &str, target: usize) -> String {
        if target == 0 {
            return String::new();
        }
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if (self.length)(&text[..boundaries[mid]]) <= target {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        text[..boundaries[lo]].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars() -> LengthFn {
        Arc::new(|s: &str| s.chars().count())
    }

    // 按字符计数时各块的标题开销：
    // Handoff 13，SharedContext 18，CollectedInfo 20，TurnHistory 17，Recall 22
    fn sample() -> FusedContext {
        FusedContext::from_blocks(
            vec![
                ContextBlock::new(BlockKind::Handoff, "hhhhh"),
                ContextBlock::new(BlockKind::SharedContext, "sssss"),
                ContextBlock::new(BlockKind::CollectedInfo, "ccccc"),
                ContextBlock::new(BlockKind::TurnHistory, "old01"),
                ContextBlock::new(BlockKind::TurnHistory, "new01"),
                ContextBlock::new(BlockKind::Recall, "recA1"),
                ContextBlock::new(BlockKind::Recall, "recB1"),
            ],
            false,
        )
    }

    fn contents(ctx: &FusedContext) -> Vec<&str> {
        ctx.blocks().iter().map(|b| b.content.as_str()).collect()
    }

    #[test]
    fn test_estimator() {
        assert_eq!(TokenEstimator::estimate(""), 0);
        assert_eq!(TokenEstimator::estimate("abcd"), 1);
        assert_eq!(TokenEstimator::estimate("abcde"), 2);
        assert_eq!(TokenEstimator::estimate("你好吗"), 2);
    }

    #[test]
    fn test_size_includes_headings() {
        let enforcer = TokenBudgetEnforcer::with_length_fn(1000, chars());
        assert_eq!(enforcer.size(&sample()), 164);
    }

    #[test]
    fn test_under_budget_is_untouched() {
        let enforcer = TokenBudgetEnforcer::with_length_fn(164, chars());
        let (ctx, report) = enforcer.enforce(sample());
        assert_eq!(ctx, sample());
        assert!(!report.trimmed());
    }

    #[test]
    fn test_recall_goes_first_then_oldest_turn() {
        let enforcer = TokenBudgetEnforcer::with_length_fn(110, chars());
        let (ctx, report) = enforcer.enforce(sample());
        assert_eq!(contents(&ctx), vec!["hhhhh", "sssss", "ccccc", "old01", "new01"]);
        assert_eq!(report.removed_blocks, 2);
        assert_eq!(report.tokens_removed(), 54);

        let enforcer = TokenBudgetEnforcer::with_length_fn(109, chars());
        let (ctx, _) = enforcer.enforce(sample());
        assert_eq!(contents(&ctx), vec!["hhhhh", "sssss", "ccccc", "new01"]);

        let enforcer = TokenBudgetEnforcer::with_length_fn(137, chars());
        let (ctx, _) = enforcer.enforce(sample());
        // 最后一条召回先删
        assert_eq!(contents(&ctx).last(), Some(&"recA1"));
    }

    #[test]
    fn test_protected_blocks_truncated_only_when_alone_over_budget() {
        let enforcer = TokenBudgetEnforcer::with_length_fn(64, chars());
        let (ctx, report) = enforcer.enforce(sample());
        assert_eq!(enforcer.size(&ctx), 64);
        assert_eq!(ctx.blocks().len(), 3);
        assert_eq!(contents(&ctx), vec!["hhhhh", "sssss", "ccc"]);
        assert_eq!(report.truncated_blocks, 1);

        // 连标题都放不下的块整块清空，不再渲染
        let enforcer = TokenBudgetEnforcer::with_length_fn(50, chars());
        let (ctx, _) = enforcer.enforce(sample());
        assert_eq!(contents(&ctx), vec!["hhhhh", "sssss", ""]);
        assert!(!ctx.render().contains("Collected info"));

        let (ctx, _) = TokenBudgetEnforcer::with_length_fn(0, chars()).enforce(sample());
        assert_eq!(enforcer.size(&ctx), 0);
        assert_eq!(ctx.blocks().len(), 3);
        assert!(ctx.render().is_empty());
    }

    #[test]
    fn test_budget_invariant_over_range() {
        for budget in 0..180 {
            let enforcer = TokenBudgetEnforcer::with_length_fn(budget, chars());
            let (ctx, _) = enforcer.enforce(sample());
            assert!(enforcer.size(&ctx) <= budget, "budget {budget}");
            assert!(ctx.render().chars().count() <= budget, "rendered, budget {budget}");
            let protected = ctx.blocks().iter().filter(|b| b.kind.is_protected()).count();
            assert_eq!(protected, 3);
            // 有低优先级块保留时受保护块必须完整
            if ctx.blocks().len() > 3 {
                assert_eq!(&contents(&ctx)[..3], &["hhhhh", "sssss", "ccccc"]);
            }
        }
    }

    #[test]
    fn test_rendered_context_fits_estimated_budget() {
        for budget in 0..60 {
            let enforcer = TokenBudgetEnforcer::new(budget);
            let (ctx, _) = enforcer.enforce(sample());
            let rendered = TokenEstimator::estimate(&ctx.render());
            assert!(rendered <= budget, "budget {budget}, rendered {rendered}");
        }
    }

    #[test]
    fn test_deterministic() {
        let enforcer = TokenBudgetEnforcer::new(3);
        let a = enforcer.enforce(sample());
        let b = enforcer.enforce(sample());
        assert_eq!(a, b);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        // 标题开销 18，剩 2 个字符给内容
        let enforcer = TokenBudgetEnforcer::with_length_fn(20, chars());
        let ctx = FusedContext::from_blocks(vec![ContextBlock::new(BlockKind::SharedContext, "地点=基尔")], true);
        let (ctx, _) = enforcer.enforce(ctx);
        assert_eq!(contents(&ctx), vec!["地点"]);
        assert!(ctx.is_degraded());
    }
}
