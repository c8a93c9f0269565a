//! 线程级互斥：同一 thread_id 同时只处理一轮
//!
//! tokio Mutex 按到达顺序唤醒等待者，因此同一线程内的轮次严格按到达顺序执行；
//! 不同线程互不阻塞。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct ThreadLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 等待并持有该线程的锁，guard 释放即解锁
    pub async fn acquire(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(thread_id).lock_owned().await
    }

    /// 清理无人持有、无人等待的条目，返回清理数量
    pub fn prune(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_thread_is_serialized() {
        let locks = Arc::new(ThreadLocks::new());
        let guard = locks.acquire("t1").await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = locks2.acquire("t1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_threads_do_not_block() {
        let locks = ThreadLocks::new();
        let _a = locks.acquire("t1").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("t2")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = ThreadLocks::new();
        let held = locks.acquire("t1").await;
        drop(locks.acquire("t2").await);
        assert_eq!(locks.len(), 2);
        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.prune(), 1);
        assert!(locks.is_empty());
    }
}
