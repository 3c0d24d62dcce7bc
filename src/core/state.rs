//! 编排状态机与迭代状态
//!
//! OrchestratorPhase 描述一次运行所处阶段，PhaseMachine 校验迁移合法性并记录轨迹；
//! IterationState 由编排器独占，证据只追加不删除。

use serde::Serialize;

use crate::core::AgentError;
use crate::evidence::EvidenceEnvelope;
use crate::workflow::SubTaskResult;

/// 编排阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorPhase {
    Understanding,
    Planning,
    Executing,
    Reflecting,
    Finalizing,
    Done,
    Failed,
}

impl OrchestratorPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrchestratorPhase::Done | OrchestratorPhase::Failed)
    }

    /// 合法迁移；空计划时 Planning 可直接进入 Reflecting
    pub fn can_transition_to(&self, next: OrchestratorPhase) -> bool {
        use OrchestratorPhase::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Understanding, Planning)
                | (Planning, Executing)
                | (Planning, Reflecting)
                | (Executing, Reflecting)
                | (Reflecting, Planning)
                | (Reflecting, Finalizing)
                | (Finalizing, Done)
        )
    }
}

/// 阶段机：当前阶段 + 历史轨迹
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase: OrchestratorPhase,
    history: Vec<OrchestratorPhase>,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            phase: OrchestratorPhase::Understanding,
            history: vec![OrchestratorPhase::Understanding],
        }
    }

    pub fn phase(&self) -> OrchestratorPhase {
        self.phase
    }

    pub fn history(&self) -> &[OrchestratorPhase] {
        &self.history
    }

    pub fn transition(&mut self, next: OrchestratorPhase) -> Result<(), AgentError> {
        if !self.phase.can_transition_to(next) {
            return Err(AgentError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!(from = ?self.phase, to = ?next, "phase transition");
        self.phase = next;
        self.history.push(next);
        Ok(())
    }
}

/// 单轮迭代状态
#[derive(Debug, Clone, Default)]
pub struct IterationState {
    /// 从 0 起
    pub iteration_number: usize,
    /// 本轮执行过的任务结果（按计划顺序）
    pub executed_tasks: Vec<SubTaskResult>,
    /// 截至本轮结束的全部证据（含之前各轮）
    pub collected_evidence: Vec<EvidenceEnvelope>,
    /// 最近一次推理任务产出的草稿答案
    pub answer_draft: Option<String>,
    pub complete: bool,
}

impl IterationState {
    pub fn new(iteration_number: usize) -> Self {
        Self {
            iteration_number,
            ..Default::default()
        }
    }

    pub fn failed_task_count(&self) -> usize {
        self.executed_tasks.iter().filter(|r| !r.is_success()).count()
    }
}
