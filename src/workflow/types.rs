//! 任务图类型定义
//!
//! 每轮规划产出一组 Task，组成 DAG；depends_on 只能引用本轮或更早轮次的任务。

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context_store::ContextPointer;
use crate::evidence::{EvidenceEnvelope, ToolResult};

pub type TaskId = String;

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// 先选工具，再并发调用
    ToolUse,
    /// 基于依赖任务的结果做一次主模型推理
    Reasoning,
}

/// 子任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub description: String,
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
    /// 产生该任务的规划轮次
    #[serde(default)]
    pub iteration: usize,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, kind: TaskKind, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            description: description.into(),
            depends_on: BTreeSet::new(),
            iteration: 0,
        }
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn with_iteration(mut self, iteration: usize) -> Self {
        self.iteration = iteration;
        self
    }
}

/// 任务终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Completed,
    /// 全部工具调用失败、选择回退链耗尽或推理失败
    Failed,
    /// 依赖失败（skip 策略）或运行预算耗尽
    Skipped,
}

/// 依赖任务失败时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyFailurePolicy {
    /// 直接跳过下游任务
    #[default]
    Skip,
    /// 继续执行，并标记为 degraded
    Proceed,
}

impl FromStr for DependencyFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "proceed" => Ok(Self::Proceed),
            other => Err(format!("unknown dependency failure policy '{other}' (expected skip|proceed)")),
        }
    }
}

impl fmt::Display for DependencyFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip => write!(f, "skip"),
            Self::Proceed => write!(f, "proceed"),
        }
    }
}

/// 单个任务的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskResult {
    pub task_id: TaskId,
    pub state: TaskState,
    /// 与选中的工具调用一一对应，按选择顺序
    pub tool_results: Vec<ToolResult>,
    /// 写入上下文存储后的指针
    #[serde(default)]
    pub pointers: Vec<ContextPointer>,
    #[serde(default)]
    pub selection_exhausted: bool,
    /// 在依赖失败的情况下仍被执行
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl SubTaskResult {
    pub fn new(task_id: impl Into<TaskId>, state: TaskState) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            tool_results: Vec::new(),
            pointers: Vec::new(),
            selection_exhausted: false,
            degraded: false,
            error: None,
        }
    }

    pub fn skipped(task_id: impl Into<TaskId>, reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::new(task_id, TaskState::Skipped)
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == TaskState::Completed
    }

    /// 成功输出携带的全部证据
    pub fn evidence(&self) -> impl Iterator<Item = &EvidenceEnvelope> {
        self.tool_results
            .iter()
            .filter(|r| r.success)
            .flat_map(|r| r.evidence.iter())
    }
}

/// 规划结构错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("Cyclic dependency among tasks: {0:?}")]
    CyclicDependency(Vec<TaskId>),
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),
    #[error("Task '{0}' depends on itself")]
    SelfDependency(TaskId),
    #[error("Task id must not be empty")]
    EmptyTaskId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse() {
        assert_eq!("Skip".parse::<DependencyFailurePolicy>().unwrap(), DependencyFailurePolicy::Skip);
        assert_eq!(
            " proceed ".parse::<DependencyFailurePolicy>().unwrap(),
            DependencyFailurePolicy::Proceed
        );
        assert!("retry".parse::<DependencyFailurePolicy>().is_err());
    }

    #[test]
    fn test_evidence_only_from_successful_results() {
        let mut result = SubTaskResult::new("t", TaskState::Completed);
        let mut ok = ToolResult::ok("x").with_tool_name("echo");
        ok.ensure_evidence();
        result.tool_results.push(ok);
        result.tool_results.push(ToolResult::failure("down"));
        assert_eq!(result.evidence().count(), 1);
    }
}
