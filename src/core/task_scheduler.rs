//! 任务调度：批内并行的并发上限
//!
//! 同一依赖批次内的任务与工具调用是唯一真正并行的地方；两个 Semaphore 分别限制任务数与工具调用数。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::AgentError;

/// 任务调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    /// 并行任务上限
    task_semaphore: Arc<Semaphore>,
    /// 并行工具调用上限（跨任务共享）
    tool_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tasks: usize, max_concurrent_tools: usize) -> Self {
        Self {
            task_semaphore: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
        }
    }

    /// 获取任务执行许可
    pub async fn acquire_task(&self) -> Result<OwnedSemaphorePermit, AgentError> {
        self.task_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Cancelled)
    }

    /// 获取工具执行许可
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, AgentError> {
        self.tool_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Cancelled)
    }

    pub fn available_task_permits(&self) -> usize {
        self.task_semaphore.available_permits()
    }

    pub fn available_tool_permits(&self) -> usize {
        self.tool_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4, 4)
    }
}
