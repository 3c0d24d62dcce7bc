//! 工具选择器
//!
//! 用独立的小模型为单个任务选出至多 max_calls 个工具调用。
//! 失败策略：主模型 → （仅在配置了 fallback_model 时）备用模型恰好一次 → 返回空列表。
//! 任何失败路径都不会退化为「选择全部工具」。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{AgentError, RecoveryEngine, RunContext};
use crate::llm::{parse_json_output, CallPurpose, ChatRequest, DecodingParams, LlmClient, Message};
use crate::tools::schema::{format_tools_prompt, selection_schema_json, SelectionFormat};
use crate::tools::{ToolCall, ToolSchema};
use crate::workflow::Task;

/// 选择器配置
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSelectorConfig {
    pub model: String,
    pub fallback_model: Option<String>,
    pub max_calls: usize,
    pub timeout: Duration,
    pub temperature: f32,
    pub fail_closed: bool,
}

impl Default for ToolSelectorConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            fallback_model: None,
            max_calls: 5,
            timeout: Duration::from_secs(30),
            temperature: 0.0,
            fail_closed: true,
        }
    }
}

/// 一次选择的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionOutcome {
    pub calls: Vec<ToolCall>,
    /// 产出 calls 的模型；全部失败或未调用模型时为 None
    pub model_used: Option<String>,
    /// 实际发起的模型调用次数
    pub attempts: u32,
    /// 回退链耗尽（仅 fail_closed 时置位，任务据此记为失败）
    pub exhausted: bool,
    /// 被截断前的调用数
    pub truncated_from: Option<usize>,
    pub last_error: Option<String>,
}

/// 工具选择器
pub struct ToolSelector {
    llm: Arc<dyn LlmClient>,
    config: ToolSelectorConfig,
    recovery: RecoveryEngine,
}

impl ToolSelector {
    pub fn new(llm: Arc<dyn LlmClient>, config: ToolSelectorConfig) -> Self {
        Self {
            llm,
            config,
            recovery: RecoveryEngine::default(),
        }
    }

    pub fn with_recovery(mut self, recovery: RecoveryEngine) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn config(&self) -> &ToolSelectorConfig {
        &self.config
    }

    /// 为任务选择工具调用
    pub async fn select_tool_calls(
        &self,
        ctx: &RunContext,
        task: &Task,
        tools: &[ToolSchema],
        query: Option<&str>,
        context: Option<&str>,
    ) -> SelectionOutcome {
        let mut outcome = SelectionOutcome::default();
        if tools.is_empty() || self.config.max_calls == 0 {
            return outcome;
        }

        let mut models = vec![self.config.model.clone()];
        if let Some(fallback) = &self.config.fallback_model {
            models.push(fallback.clone());
        }
        let messages = self.build_messages(task, tools, query, context);

        for (attempt, model) in models.iter().enumerate() {
            outcome.attempts += 1;
            let request = ChatRequest::new(
                CallPurpose::ToolSelection,
                messages.clone(),
                DecodingParams {
                    model: Some(model.clone()),
                    temperature: Some(self.config.temperature),
                    max_tokens: None,
                    json_mode: true,
                },
            );
            let result = match ctx.call_model(self.llm.as_ref(), &request, self.config.timeout).await {
                Ok(response) => parse_selection(response.content_str(), tools, self.config.max_calls),
                Err(e) => Err(e),
            };

            match result {
                Ok((calls, truncated_from)) => {
                    if let Some(n) = truncated_from {
                        tracing::info!(task_id = %task.id, model = %model, returned = n, kept = calls.len(), "tool selection truncated");
                    }
                    outcome.calls = calls;
                    outcome.truncated_from = truncated_from;
                    outcome.model_used = Some(model.clone());
                    return outcome;
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, model = %model, attempt, error = %e, "tool selection attempt failed");
                    let action = self.recovery.handle(&e, attempt as u32);
                    outcome.last_error = Some(e.to_string());
                    if e.is_budget_stop() || !action.allows_another_attempt() {
                        break;
                    }
                }
            }
        }

        tracing::warn!(
            task_id = %task.id,
            attempts = outcome.attempts,
            fail_closed = self.config.fail_closed,
            "tool selection exhausted, returning no tool calls"
        );
        outcome.exhausted = self.config.fail_closed;
        outcome
    }

    fn build_messages(
        &self,
        task: &Task,
        tools: &[ToolSchema],
        query: Option<&str>,
        context: Option<&str>,
    ) -> Vec<Message> {
        let system = format!(
            "You are a tool selector. Choose the tool calls needed to complete the task. \
             Use at most {max} calls and only the tools listed. If no tool is needed, return an empty list.\n\n\
             {tools}\n\
             Reply with a single JSON object matching this schema:\n{schema}",
            max = self.config.max_calls,
            tools = format_tools_prompt(tools),
            schema = selection_schema_json(),
        );
        let mut user = format!("Task: {}", task.description);
        if let Some(q) = query {
            user.push_str(&format!("\nUser question: {q}"));
        }
        if let Some(c) = context.filter(|c| !c.trim().is_empty()) {
            user.push_str(&format!("\nContext:\n{c}"));
        }
        vec![Message::system(system), Message::user(user)]
    }
}

/// 解析并校验选择输出：工具名必须存在；超过 max_calls 时按模型给出的顺序保留前 N 个
pub fn parse_selection(
    raw: &str,
    tools: &[ToolSchema],
    max_calls: usize,
) -> Result<(Vec<ToolCall>, Option<usize>), AgentError> {
    let parsed: SelectionFormat = parse_json_output(raw)?;
    let known: BTreeSet<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    for call in &parsed.calls {
        if !known.contains(call.tool_name.as_str()) {
            return Err(AgentError::HallucinatedTool(call.tool_name.clone()));
        }
        if !(call.args.is_object() || call.args.is_null()) {
            return Err(AgentError::MalformedModelOutput(format!(
                "args for '{}' must be an object",
                call.tool_name
            )));
        }
    }

    let returned = parsed.calls.len();
    let mut calls = parsed.calls;
    calls.truncate(max_calls);
    for call in &mut calls {
        if call.args.is_null() {
            call.args = serde_json::json!({});
        }
    }
    let truncated_from = (returned > max_calls).then_some(returned);
    Ok((calls, truncated_from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::workflow::TaskKind;
    use serde_json::json;

    fn tools() -> Vec<ToolSchema> {
        ["quote", "news", "search"]
            .iter()
            .map(|n| ToolSchema {
                name: n.to_string(),
                description: format!("{n} tool"),
                parameters: json!({"type": "object"}),
            })
            .collect()
    }

    fn task() -> Task {
        Task::new("research_aapl", TaskKind::ToolUse, "Research AAPL 2024 performance")
    }

    fn config(fallback: Option<&str>) -> ToolSelectorConfig {
        ToolSelectorConfig {
            model: "small".into(),
            fallback_model: fallback.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_selection_truncates_in_model_order() {
        let raw = json!({"calls": (0..7).map(|i| json!({"tool": "quote", "args": {"n": i}})).collect::<Vec<_>>()})
            .to_string();
        let (calls, truncated) = parse_selection(&raw, &tools(), 5).unwrap();
        assert_eq!(calls.len(), 5);
        assert_eq!(truncated, Some(7));
        let order: Vec<i64> = calls.iter().map(|c| c.args["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_parse_selection_rejects_unknown_tool() {
        let raw = r#"{"calls": [{"tool": "quote"}, {"tool": "delete_everything"}]}"#;
        let err = parse_selection(raw, &tools(), 5).unwrap_err();
        assert!(matches!(err, AgentError::HallucinatedTool(name) if name == "delete_everything"));
    }

    #[tokio::test]
    async fn test_primary_success_uses_one_attempt() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_json(
            CallPurpose::ToolSelection,
            json!({"calls": [{"tool": "quote", "args": {"ticker": "AAPL"}}]}),
        );
        let selector = ToolSelector::new(mock.clone(), config(Some("backup")));
        let outcome = selector
            .select_tool_calls(&RunContext::default(), &task(), &tools(), Some("q"), None)
            .await;
        assert_eq!(outcome.calls, vec![ToolCall::new("quote", json!({"ticker": "AAPL"}))]);
        assert_eq!(outcome.model_used.as_deref(), Some("small"));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_exactly_one_fallback_attempt_on_garbage() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_text(CallPurpose::ToolSelection, "I think you should use quote");
        mock.push_json(CallPurpose::ToolSelection, json!({"calls": [{"tool": "news", "args": {}}]}));
        let selector = ToolSelector::new(mock.clone(), config(Some("backup")));
        let outcome = selector
            .select_tool_calls(&RunContext::default(), &task(), &tools(), None, None)
            .await;
        assert_eq!(outcome.calls.len(), 1);
        assert_eq!(outcome.model_used.as_deref(), Some("backup"));
        assert_eq!(
            mock.models_for(CallPurpose::ToolSelection),
            vec![Some("small".to_string()), Some("backup".to_string())]
        );
    }

    #[tokio::test]
    async fn test_both_fail_returns_empty_never_all_tools() {
        for fail_closed in [true, false] {
            let mock = Arc::new(MockLlmClient::new());
            mock.push_error(CallPurpose::ToolSelection, LlmError::Network("reset".into()));
            mock.push_text(CallPurpose::ToolSelection, "not json");
            mock.push_json(CallPurpose::ToolSelection, json!({"calls": [{"tool": "quote"}]}));
            let selector = ToolSelector::new(
                mock.clone(),
                ToolSelectorConfig {
                    fail_closed,
                    ..config(Some("backup"))
                },
            );
            let outcome = selector
                .select_tool_calls(&RunContext::default(), &task(), &tools(), None, None)
                .await;
            assert!(outcome.calls.is_empty());
            assert_eq!(outcome.exhausted, fail_closed);
            assert_eq!(mock.calls_for(CallPurpose::ToolSelection), 2);
        }
    }

    #[tokio::test]
    async fn test_no_fallback_configured_means_single_attempt() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_json(CallPurpose::ToolSelection, json!({"calls": [{"tool": "ghost"}]}));
        let selector = ToolSelector::new(mock.clone(), config(None));
        let outcome = selector
            .select_tool_calls(&RunContext::default(), &task(), &tools(), None, None)
            .await;
        assert!(outcome.calls.is_empty());
        assert!(outcome.exhausted);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_tool_schema_skips_model() {
        let mock = Arc::new(MockLlmClient::new());
        let selector = ToolSelector::new(mock.clone(), config(None));
        let outcome = selector
            .select_tool_calls(&RunContext::default(), &task(), &[], None, None)
            .await;
        assert!(outcome.calls.is_empty());
        assert!(!outcome.exhausted);
        assert_eq!(mock.call_count(), 0);
    }
}
