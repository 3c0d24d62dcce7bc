//! ReflectPhase：判断本轮证据 / 草稿是否足以回答，并结构性地执行迭代上限
//!
//! iteration_number >= max_iterations - 1 时直接返回 complete = true，不调用模型；
//! 终止从不依赖模型配合。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agentic::Intent;
use crate::core::{AgentError, IterationState, RunContext};
use crate::llm::{parse_json_output, CallPurpose, ChatRequest, DecodingParams, LlmClient, Message};

const MAX_EVIDENCE_IN_PROMPT: usize = 30;

/// 判定来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionSource {
    /// 已是最后一轮
    IterationCap,
    /// 运行预算耗尽或被取消
    Budget,
    Model,
    /// 模型调用失败时的确定性判定
    Heuristic,
}

/// Reflect 结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reflection {
    pub complete: bool,
    pub reason: String,
    pub source: ReflectionSource,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    complete: bool,
    #[serde(default)]
    reason: String,
}

/// Reflect 阶段
pub struct ReflectPhase {
    llm: Arc<dyn LlmClient>,
    model: Option<String>,
    timeout: Duration,
}

impl ReflectPhase {
    pub fn new(llm: Arc<dyn LlmClient>, model: Option<String>, timeout: Duration) -> Self {
        Self { llm, model, timeout }
    }

    pub async fn reflect(
        &self,
        ctx: &RunContext,
        state: &IterationState,
        intent: &Intent,
        iteration_number: usize,
        max_iterations: usize,
    ) -> Reflection {
        if iteration_number + 1 >= max_iterations {
            return Reflection {
                complete: true,
                reason: format!("iteration cap reached ({max_iterations})"),
                source: ReflectionSource::IterationCap,
            };
        }
        if let Some(stop) = ctx.stop_reason() {
            return Reflection {
                complete: true,
                reason: stop.to_string(),
                source: ReflectionSource::Budget,
            };
        }

        match self.ask_model(ctx, state, intent).await {
            Ok(verdict) => Reflection {
                complete: verdict.complete,
                reason: if verdict.reason.trim().is_empty() {
                    if verdict.complete { "sufficient" } else { "insufficient" }.to_string()
                } else {
                    verdict.reason
                },
                source: ReflectionSource::Model,
            },
            Err(e) => {
                tracing::warn!(run_id = ctx.run_id(), iteration = iteration_number, error = %e, "reflect model failed, using heuristic");
                heuristic(state)
            }
        }
    }

    async fn ask_model(
        &self,
        ctx: &RunContext,
        state: &IterationState,
        intent: &Intent,
    ) -> Result<Verdict, AgentError> {
        let mut user = format!("Intent: {}", intent.intent_type);
        if !intent.entities.is_empty() {
            user.push_str(&format!("\nEntities: {}", intent.entity_values().join(", ")));
        }
        user.push_str(&format!(
            "\nTasks this pass: {} ({} failed)",
            state.executed_tasks.len(),
            state.failed_task_count()
        ));
        user.push_str("\nEvidence collected so far:");
        if state.collected_evidence.is_empty() {
            user.push_str(" none");
        }
        for envelope in state.collected_evidence.iter().take(MAX_EVIDENCE_IN_PROMPT) {
            user.push_str(&format!("\n- {}: {}", envelope.id, envelope.label));
        }
        if let Some(draft) = &state.answer_draft {
            user.push_str(&format!("\n\nDraft answer:\n{draft}"));
        }

        let request = ChatRequest::new(
            CallPurpose::Reflect,
            vec![
                Message::system(
                    "Decide whether the evidence is enough to answer the user's request completely. \
                     Reply with JSON only: {\"complete\": true|false, \"reason\": \"what is missing or why it is enough\"}",
                ),
                Message::user(user),
            ],
            DecodingParams::json(self.model.clone()),
        );
        let response = ctx.call_model(self.llm.as_ref(), &request, self.timeout).await?;
        parse_json_output(response.content_str())
    }
}

/// 有证据且没有失败任务即视为完成
fn heuristic(state: &IterationState) -> Reflection {
    let failed = state.failed_task_count();
    let complete = !state.collected_evidence.is_empty() && failed == 0;
    let reason = if complete {
        "evidence collected and all tasks succeeded".to_string()
    } else if state.collected_evidence.is_empty() {
        "no evidence collected yet".to_string()
    } else {
        format!("{failed} task(s) failed")
    };
    Reflection {
        complete,
        reason,
        source: ReflectionSource::Heuristic,
    }
}
