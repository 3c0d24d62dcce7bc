//! 错误恢复引擎
//!
//! 根据 AgentError 分类给出 RecoveryAction；Understand 阶段据此重试，ToolSelector 据此决定是否切换备用模型。

use std::time::Duration;

use crate::core::{AgentError, ErrorKind};
use crate::llm::RetryConfig;

/// 恢复引擎给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 等待后原样重试（瞬时错误）
    RetryWithBackoff(Duration),
    /// 将纠正提示注入下一轮后重试（输出格式错误）
    RetryWithPrompt(String),
    /// 换备用模型或确定性降级
    Fallback,
    /// 记录在结果树中，不影响兄弟调用 / 任务
    Contain,
    /// 终止当前阶段
    Abort,
}

impl RecoveryAction {
    /// 是否值得再发起一次模型调用（同模型或备用模型）
    pub fn allows_another_attempt(&self) -> bool {
        matches!(
            self,
            RecoveryAction::RetryWithBackoff(_)
                | RecoveryAction::RetryWithPrompt(_)
                | RecoveryAction::Fallback
        )
    }
}

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Clone, Default)]
pub struct RecoveryEngine {
    retry: RetryConfig,
}

impl RecoveryEngine {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// attempt 为已失败的次数（从 0 起），用于计算退避
    pub fn handle(&self, err: &AgentError, attempt: u32) -> RecoveryAction {
        match (err.kind(), err) {
            (ErrorKind::TransientProvider, AgentError::LlmError(e)) => {
                RecoveryAction::RetryWithBackoff(self.retry.delay_after(attempt, e))
            }
            (ErrorKind::TransientProvider, _) => {
                RecoveryAction::RetryWithBackoff(self.retry.backoff_for(attempt))
            }
            (ErrorKind::MalformedModelOutput, AgentError::MalformedModelOutput(raw)) => {
                RecoveryAction::RetryWithPrompt(format!(
                    "上一轮输出不是符合要求 schema 的 JSON: {raw}。\
                     你必须只输出一个合法的 JSON 对象，不能输出 Markdown 或其它文字。"
                ))
            }
            (ErrorKind::MalformedModelOutput, _) => RecoveryAction::Fallback,
            (ErrorKind::ToolExecution, _) | (ErrorKind::Planning, _) => RecoveryAction::Contain,
            (ErrorKind::FatalConfiguration, _) | (ErrorKind::Cancelled, _) => RecoveryAction::Abort,
            (ErrorKind::Other, AgentError::LlmError(_)) => RecoveryAction::Fallback,
            (ErrorKind::Other, AgentError::SelectionExhausted(_))
            | (ErrorKind::Other, AgentError::ContextStore(_)) => RecoveryAction::Contain,
            (ErrorKind::Other, _) => RecoveryAction::Abort,
        }
    }
}
