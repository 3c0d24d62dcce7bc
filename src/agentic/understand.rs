//! UnderstandPhase：从原始查询中抽取意图与实体
//!
//! 一次 JSON 模式调用；调用失败或输出不符合 schema 时按 RecoveryEngine 的建议重试，
//! 仍失败则返回 UnderstandFailed，这是唯一会让整个运行失败的阶段。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::agentic::Query;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine, RunContext};
use crate::llm::{parse_json_output, CallPurpose, ChatRequest, DecodingParams, LlmClient, Message};

/// 结构化意图
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Intent {
    /// 意图类型，如 compare、lookup、explain、summarize
    pub intent_type: String,
    /// 实体：名称 -> 值，如 {"company_1": "AAPL"}
    #[serde(default, deserialize_with = "lenient_entities")]
    #[schemars(with = "BTreeMap<String, String>")]
    pub entities: BTreeMap<String, String>,
}

impl Intent {
    pub fn new(intent_type: impl Into<String>) -> Self {
        Self {
            intent_type: intent_type.into(),
            entities: BTreeMap::new(),
        }
    }

    pub fn with_entity(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entities.insert(key.into(), value.into());
        self
    }

    /// 实体值（按 key 顺序）
    pub fn entity_values(&self) -> Vec<&str> {
        self.entities.values().map(String::as_str).collect()
    }
}

/// 实体同时接受对象与字符串数组；非字符串值转为文本
fn lenient_entities<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    fn text(v: &Value) -> String {
        match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), text(v))).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("entity_{}", i + 1), text(v)))
            .collect(),
        _ => BTreeMap::new(),
    })
}

/// Understand 阶段
pub struct UnderstandPhase {
    llm: Arc<dyn LlmClient>,
    model: Option<String>,
    timeout: Duration,
    recovery: RecoveryEngine,
}

impl UnderstandPhase {
    pub fn new(llm: Arc<dyn LlmClient>, model: Option<String>, timeout: Duration) -> Self {
        Self {
            llm,
            model,
            timeout,
            recovery: RecoveryEngine::default(),
        }
    }

    pub fn with_recovery(mut self, recovery: RecoveryEngine) -> Self {
        self.recovery = recovery;
        self
    }

    pub async fn understand(&self, ctx: &RunContext, query: &Query) -> Result<Intent, AgentError> {
        let max_attempts = self.recovery.retry_config().max_attempts.max(1);
        let schema = serde_json::to_string(&schema_for!(Intent)).unwrap_or_default();
        let system = format!(
            "Extract the user's intent. Reply with a single JSON object matching this schema:\n{schema}\n\
             intent_type is one short lowercase verb (compare, lookup, explain, summarize, ...). \
             entities holds the concrete things the question is about."
        );

        let mut messages = vec![Message::system(system)];
        messages.extend(query.context.iter().cloned());
        messages.push(Message::user(query.text.clone()));

        let mut last_error = String::new();
        let mut attempts = 0;
        while attempts < max_attempts {
            attempts += 1;
            let request = ChatRequest::new(
                CallPurpose::Understand,
                messages.clone(),
                DecodingParams::json(self.model.clone()),
            );
            let outcome = match ctx.call_model(self.llm.as_ref(), &request, self.timeout).await {
                Ok(response) => {
                    let raw = response.content_str().to_string();
                    parse_intent(&raw).map_err(|e| (e, Some(raw)))
                }
                Err(e) => Err((e, None)),
            };

            let (err, raw) = match outcome {
                Ok(intent) => {
                    tracing::info!(
                        run_id = ctx.run_id(),
                        intent = %intent.intent_type,
                        entities = intent.entities.len(),
                        "intent extracted"
                    );
                    return Ok(intent);
                }
                Err(failure) => failure,
            };
            tracing::warn!(run_id = ctx.run_id(), attempt = attempts, error = %err, "understand attempt failed");
            last_error = err.to_string();
            if err.is_budget_stop() {
                break;
            }
            match self.recovery.handle(&err, attempts - 1) {
                RecoveryAction::RetryWithBackoff(delay) => {
                    if attempts < max_attempts {
                        tokio::time::sleep(ctx.clip_timeout(delay)).await;
                    }
                }
                RecoveryAction::RetryWithPrompt(correction) => {
                    if let Some(raw) = raw {
                        messages.push(Message::assistant(raw));
                    }
                    messages.push(Message::user(correction));
                }
                RecoveryAction::Fallback => {}
                RecoveryAction::Contain | RecoveryAction::Abort => break,
            }
        }

        Err(AgentError::UnderstandFailed {
            attempts,
            reason: last_error,
        })
    }
}

fn parse_intent(raw: &str) -> Result<Intent, AgentError> {
    let mut intent: Intent = parse_json_output(raw)?;
    intent.intent_type = intent.intent_type.trim().to_lowercase();
    if intent.intent_type.is_empty() {
        return Err(AgentError::MalformedModelOutput("intent_type is empty".into()));
    }
    intent.entities.retain(|_, v| !v.trim().is_empty());
    Ok(intent)
}
