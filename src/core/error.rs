//! Agent 错误类型与分类
//!
//! AgentError 覆盖编排过程中的全部失败；kind() 将其映射到统一的处理分类，
//! 由 RecoveryEngine 决定重试、降级、收敛还是终止。

use thiserror::Error;

use crate::core::OrchestratorPhase;
use crate::llm::LlmError;
use crate::workflow::PlanningError;

/// 编排过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    #[error("Malformed model output: {0}")]
    MalformedModelOutput(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Understand phase failed after {attempts} attempts: {reason}")]
    UnderstandFailed { attempts: u32, reason: String },

    #[error("Tool selection exhausted: {0}")]
    SelectionExhausted(String),

    #[error("Context store error: {0}")]
    ContextStore(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Invalid phase transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: OrchestratorPhase,
        to: OrchestratorPhase,
    },

    #[error("Run budget exhausted")]
    BudgetExhausted,

    #[error("Cancelled")]
    Cancelled,
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 网络 / 限流等，可退避重试
    TransientProvider,
    /// 模型输出不符合 JSON / schema
    MalformedModelOutput,
    /// 工具调用失败或超时，记录在 ToolResult 中
    ToolExecution,
    /// 缺少必需配置，运行前即终止
    FatalConfiguration,
    /// 任务图结构错误
    Planning,
    /// 取消或预算耗尽
    Cancelled,
    Other,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::LlmError(e) if e.is_transient() => ErrorKind::TransientProvider,
            AgentError::LlmError(LlmError::MalformedStream(_)) => ErrorKind::MalformedModelOutput,
            AgentError::LlmError(_) => ErrorKind::Other,
            AgentError::MalformedModelOutput(_) | AgentError::HallucinatedTool(_) => {
                ErrorKind::MalformedModelOutput
            }
            AgentError::ToolExecutionFailed(_) | AgentError::ToolTimeout(_) => {
                ErrorKind::ToolExecution
            }
            AgentError::ConfigError(_) => ErrorKind::FatalConfiguration,
            AgentError::Planning(_) => ErrorKind::Planning,
            AgentError::BudgetExhausted | AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::UnderstandFailed { .. }
            | AgentError::SelectionExhausted(_)
            | AgentError::ContextStore(_)
            | AgentError::InvalidTransition { .. } => ErrorKind::Other,
        }
    }

    /// 运行预算耗尽或被取消：不应再发起新的调用
    pub fn is_budget_stop(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}
