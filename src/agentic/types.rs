//! 编排输入输出类型

use serde::Serialize;

use crate::agentic::Intent;
use crate::core::RunCost;
use crate::evidence::{EvidenceEnvelope, EvidenceId};
use crate::llm::Message;
use crate::workflow::TaskId;

/// 用户查询：原文 + 可选的前几轮对话；一次运行内不可变
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub text: String,
    pub context: Vec<Message>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Vec<Message>) -> Self {
        self.context = context;
        self
    }
}

/// 运行终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Reflect 判定完成
    Completed,
    /// 达到迭代上限后强制完成
    CapReached,
    /// 预算耗尽，或有任务失败 / 被跳过 / 规划被拒
    Partial,
    /// Understand 失败，或全部工具任务的选择回退链耗尽且没有任何证据
    Failed,
}

/// 单轮摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationSummary {
    pub iteration: usize,
    pub task_ids: Vec<TaskId>,
    /// 本轮新增的证据
    pub evidence_ids: Vec<EvidenceId>,
    pub complete: bool,
    pub reason: String,
}

/// 运行结果；每次运行恰好返回一个
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorResult {
    pub run_id: String,
    pub answer: String,
    pub evidence: Vec<EvidenceEnvelope>,
    pub iterations_used: usize,
    pub cost: RunCost,
    pub status: RunStatus,
    pub intent: Option<Intent>,
    /// 答案中有效的引用
    pub citations: Vec<EvidenceId>,
    /// 模型引用了但不存在的证据 id（已从答案中移除）
    pub invalid_citations: Vec<EvidenceId>,
    pub error: Option<String>,
    pub iterations: Vec<IterationSummary>,
}
