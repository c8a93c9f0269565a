//! 轮次调度：限制跨线程同时执行的轮数
//!
//! 先取线程锁再取全局许可，排队等待同一线程的请求不会占用许可。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct TurnScheduler {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl TurnScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// 获取执行许可；信号量从不关闭，None 仅在关闭后出现
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

impl Default for TurnScheduler {
    fn default() -> Self {
        Self::new(64)
    }
}
