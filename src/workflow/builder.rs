//! 任务图构建器
//!
//! 流畅 API 构建 TaskGraph，主要用于测试与手工编排

use std::collections::BTreeSet;

use crate::workflow::graph::TaskGraph;
use crate::workflow::types::*;

/// 任务图构建器
#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    tasks: Vec<Task>,
    prior: BTreeSet<TaskId>,
    iteration: usize,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置所属轮次（应用到之后添加的任务）
    pub fn iteration(mut self, iteration: usize) -> Self {
        self.iteration = iteration;
        self
    }

    /// 声明更早轮次已执行的任务
    pub fn prior(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.prior.extend(ids);
        self
    }

    /// 添加工具任务
    pub fn tool_task(self, id: impl Into<TaskId>, description: impl Into<String>) -> Self {
        self.add(Task::new(id, TaskKind::ToolUse, description))
    }

    /// 添加推理任务
    pub fn reasoning_task(self, id: impl Into<TaskId>, description: impl Into<String>) -> Self {
        self.add(Task::new(id, TaskKind::Reasoning, description))
    }

    pub fn add(mut self, task: Task) -> Self {
        let iteration = self.iteration;
        self.tasks.push(task.with_iteration(iteration));
        self
    }

    /// 为最近添加的任务声明依赖
    pub fn after(mut self, dependency: impl Into<TaskId>) -> Self {
        if let Some(task) = self.tasks.last_mut() {
            task.depends_on.insert(dependency.into());
        }
        self
    }

    /// 为最近添加的任务声明多个依赖
    pub fn after_all<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        if let Some(task) = self.tasks.last_mut() {
            task.depends_on.extend(dependencies.into_iter().map(Into::into));
        }
        self
    }

    pub fn build(self) -> Result<TaskGraph, PlanningError> {
        TaskGraph::new(self.tasks, &self.prior)
    }
}
