//! 短期记忆：轮次历史
//!
//! 保留最近 N 轮（用户输入 + 回复 + 处理该轮的智能体），超出时自动剪枝，
//! 供上下文融合（最近两轮）、生命周期摘要与断线重连回放使用。

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::HandlerKind;

/// 单轮对话：一条用户输入及其回复
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub user: String,
    pub reply: String,
    pub handler: HandlerKind,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn new(user: impl Into<String>, reply: impl Into<String>, handler: HandlerKind) -> Self {
        Self {
            user: user.into(),
            reply: reply.into(),
            handler,
            at: Utc::now(),
        }
    }

    /// 单行展示形式，用于上下文块与摘要
    pub fn to_line(&self) -> String {
        format!("user: {} | {}: {}", self.user, self.handler, self.reply)
    }
}

/// 有界轮次历史（最旧在前，最新在后）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnHistory {
    turns: VecDeque<Turn>,
    max_turns: usize,
}

impl TurnHistory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_turns: max_turns.max(1),
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        self.prune();
    }

    /// 超出上限时丢弃最旧的轮次
    fn prune(&mut self) {
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Turn> {
        self.turns.iter()
    }

    /// 最近 n 轮（按时间正序）
    pub fn recent(&self, n: usize) -> Vec<&Turn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).collect()
    }

    /// 某个智能体最近 n 轮（按时间正序）
    pub fn recent_for(&self, handler: HandlerKind, n: usize) -> Vec<&Turn> {
        let mut picked: Vec<&Turn> = self
            .turns
            .iter()
            .rev()
            .filter(|t| t.handler == handler)
            .take(n)
            .collect();
        picked.reverse();
        picked
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

impl Default for TurnHistory {
    fn default() -> Self {
        Self::new(20)
    }
}
