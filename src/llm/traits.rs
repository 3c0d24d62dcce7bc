//! LLM 客户端抽象
//!
//! 编排核心只依赖这里的抽象契约：call（非流式，返回 content 或 tool_calls）与 call_stream（有序 chunk 流）。
//! 具体厂商的传输协议不在本 crate 内实现。

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::Message;
use crate::tools::ToolSchema;

/// 调用用途：用于按阶段归集成本，也便于测试按阶段编排回复
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    Understand,
    Plan,
    ToolSelection,
    Task,
    Reflect,
    Relevance,
    Synthesis,
}

impl CallPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPurpose::Understand => "understand",
            CallPurpose::Plan => "plan",
            CallPurpose::ToolSelection => "tool_selection",
            CallPurpose::Task => "task",
            CallPurpose::Reflect => "reflect",
            CallPurpose::Relevance => "relevance",
            CallPurpose::Synthesis => "synthesis",
        }
    }
}

/// 解码参数；model 为 None 时由后端使用其默认模型
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodingParams {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// 要求后端输出 JSON 对象（schema 约束由调用方写入 system prompt）
    pub json_mode: bool,
}

impl DecodingParams {
    /// 确定性 JSON 模式：temperature = 0
    pub fn json(model: Option<String>) -> Self {
        Self {
            model,
            temperature: Some(0.0),
            max_tokens: None,
            json_mode: true,
        }
    }

    pub fn text(model: Option<String>, temperature: f32) -> Self {
        Self {
            model,
            temperature: Some(temperature),
            max_tokens: None,
            json_mode: false,
        }
    }
}

/// 一次模型调用请求
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub purpose: CallPurpose,
    pub messages: Vec<Message>,
    /// 原生 tool-calling 的工具 schema（可选）
    pub tools: Vec<ToolSchema>,
    pub params: DecodingParams,
}

impl ChatRequest {
    pub fn new(purpose: CallPurpose, messages: Vec<Message>, params: DecodingParams) -> Self {
        Self {
            purpose,
            messages,
            tools: Vec::new(),
            params,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }

    pub fn model(&self) -> Option<&str> {
        self.params.model.as_deref()
    }
}

/// Token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// 模型返回的原生 tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// 模型响应：content 与 tool_calls 至少其一
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ModelToolCall>,
    pub usage: Usage,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// content 文本（无 content 时为空串）
    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// 拆成流式 chunk 序列，供默认的 call_stream 使用
    pub fn into_chunks(self) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        if let Some(content) = self.content {
            chunks.push(StreamChunk::Text(content));
        }
        for (index, call) in self.tool_calls.into_iter().enumerate() {
            chunks.push(StreamChunk::ToolCallFragment {
                index,
                id: Some(call.id),
                name: Some(call.name),
                arguments: call.arguments.to_string(),
            });
            chunks.push(StreamChunk::ToolCallEnd { index });
        }
        chunks.push(StreamChunk::Usage(self.usage));
        chunks
    }
}

/// 流式 chunk：按到达顺序消费
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Text(String),
    Reasoning(String),
    /// tool call 片段：同一 index 的 arguments 按到达顺序拼接
    ToolCallFragment {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// 某个 tool call 块结束，此时才解析其 arguments
    ToolCallEnd { index: usize },
    Usage(Usage),
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// LLM 后端错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Malformed stream: {0}")]
    MalformedStream(String),
}

impl LlmError {
    /// 网络 / 超时 / 限流属于可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Network(_) | LlmError::Timeout | LlmError::RateLimited { .. }
        )
    }
}

/// LLM 客户端 trait：非流式调用与流式调用
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式调用
    async fn call(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// 流式调用；默认实现由 call 的结果拆分得到（不支持流式的后端无需覆盖）
    async fn call_stream(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError> {
        let response = self.call(request).await?;
        Ok(Box::pin(stream::iter(
            response.into_chunks().into_iter().map(Ok),
        )))
    }
}

/// 重试配置：指数退避，次数有上限
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// 总尝试次数（含首次）
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// 不等待的重试配置（测试用）
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// 第 attempt 次失败（从 0 起）之后的等待时间
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt as i32);
        let millis = (self.initial_backoff.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_backoff)
    }

    /// 结合限流提示的等待时间（不超过 max_backoff）
    pub fn delay_after(&self, attempt: u32, error: &LlmError) -> Duration {
        let base = self.backoff_for(attempt);
        match error {
            LlmError::RateLimited { retry_after_ms } => base
                .max(Duration::from_millis(*retry_after_ms))
                .min(self.max_backoff),
            _ => base,
        }
    }
}

/// 带重试的客户端包装：仅对瞬时错误按退避重试
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn call(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.call(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                    let delay = self.config.delay_after(attempt, &e);
                    tracing::warn!(
                        purpose = request.purpose.as_str(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient llm error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 只重试建立流的阶段；流开始后的错误交给消费者
    async fn call_stream(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.call_stream(request).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                    tokio::time::sleep(self.config.delay_after(attempt, &e)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn request() -> ChatRequest {
        ChatRequest::new(
            CallPurpose::Task,
            vec![Message::user("hi")],
            DecodingParams::default(),
        )
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            multiplier: 2.0,
        };
        assert_eq!(config.backoff_for(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for(4), Duration::from_millis(300));
    }

    #[test]
    fn test_rate_limit_hint_respected_within_cap() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        };
        let err = LlmError::RateLimited { retry_after_ms: 200 };
        assert_eq!(config.delay_after(0, &err), Duration::from_millis(200));
        let err = LlmError::RateLimited { retry_after_ms: 10_000 };
        assert_eq!(config.delay_after(0, &err), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retrying_client_retries_transient_errors() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(CallPurpose::Task, LlmError::Network("reset".into()));
        mock.push_error(CallPurpose::Task, LlmError::Timeout);
        mock.push_text(CallPurpose::Task, "ok");

        let client = RetryingLlmClient::new(mock.clone(), RetryConfig::immediate(3));
        let response = client.call(&request()).await.unwrap();
        assert_eq!(response.content_str(), "ok");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retrying_client_does_not_retry_api_errors() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(CallPurpose::Task, LlmError::ApiError("bad request".into()));
        mock.push_text(CallPurpose::Task, "never reached");

        let client = RetryingLlmClient::new(mock.clone(), RetryConfig::immediate(3));
        let err = client.call(&request()).await.unwrap_err();
        assert!(matches!(err, LlmError::ApiError(_)));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_retrying_client_gives_up_after_max_attempts() {
        let mock = Arc::new(MockLlmClient::new());
        for _ in 0..5 {
            mock.push_error(CallPurpose::Task, LlmError::Timeout);
        }
        let client = RetryingLlmClient::new(mock.clone(), RetryConfig::immediate(2));
        assert!(client.call(&request()).await.is_err());
        assert_eq!(mock.call_count(), 2);
    }
}
