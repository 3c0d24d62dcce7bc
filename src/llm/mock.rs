//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按 CallPurpose（或按模型名）排队预设回复；队列为空时交给 responder，再退回回显最后一条 User 消息。
//! 所有请求都被记录，便于断言尝试次数与使用的模型。

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{CallPurpose, ChatRequest, ChatResponse, LlmClient, LlmError, Role, Usage};

/// 一条预设回复
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Response(ChatResponse),
    Error(LlmError),
    /// 等待一段时间后再给出内部回复（模拟慢调用 / 超时）
    Delayed(Duration, Box<MockReply>),
}

type Responder = Box<dyn Fn(&ChatRequest) -> MockReply + Send + Sync>;

/// Mock 客户端
#[derive(Default)]
pub struct MockLlmClient {
    by_purpose: Mutex<HashMap<CallPurpose, VecDeque<MockReply>>>,
    by_model: Mutex<HashMap<String, VecDeque<MockReply>>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 队列为空时按请求动态生成回复
    pub fn with_responder(
        mut self,
        responder: impl Fn(&ChatRequest) -> MockReply + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn push_reply(&self, purpose: CallPurpose, reply: MockReply) {
        self.by_purpose
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(purpose)
            .or_default()
            .push_back(reply);
    }

    pub fn push_text(&self, purpose: CallPurpose, text: impl Into<String>) {
        self.push_reply(purpose, MockReply::Text(text.into()));
    }

    pub fn push_json(&self, purpose: CallPurpose, value: serde_json::Value) {
        self.push_reply(purpose, MockReply::Text(value.to_string()));
    }

    pub fn push_error(&self, purpose: CallPurpose, error: LlmError) {
        self.push_reply(purpose, MockReply::Error(error));
    }

    /// 针对指定模型名排队（优先于按用途排队）
    pub fn push_model_reply(&self, model: impl Into<String>, reply: MockReply) {
        self.by_model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(model.into())
            .or_default()
            .push_back(reply);
    }

    /// 已收到的全部请求（按到达顺序）
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn calls_for(&self, purpose: CallPurpose) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.purpose == purpose)
            .count()
    }

    /// 某用途下每次调用使用的模型名
    pub fn models_for(&self, purpose: CallPurpose) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.purpose == purpose)
            .map(|r| r.params.model.clone())
            .collect()
    }

    fn next_reply(&self, request: &ChatRequest) -> MockReply {
        if let Some(model) = request.model() {
            let mut by_model = self.by_model.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(reply) = by_model.get_mut(model).and_then(|q| q.pop_front()) {
                return reply;
            }
        }
        {
            let mut by_purpose = self
                .by_purpose
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(reply) = by_purpose
                .get_mut(&request.purpose)
                .and_then(|q| q.pop_front())
            {
                return reply;
            }
        }
        if let Some(responder) = &self.responder {
            return responder(request);
        }

        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        MockReply::Text(format!("Echo from Mock: {}", last_user))
    }
}

/// 粗略估算 token：约 4 字符 1 token
fn approx_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn call(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let mut reply = self.next_reply(request);
        loop {
            match reply {
                MockReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                MockReply::Error(e) => return Err(e),
                MockReply::Response(response) => return Ok(response),
                MockReply::Text(text) => {
                    let prompt: u64 = request
                        .messages
                        .iter()
                        .map(|m| approx_tokens(&m.content))
                        .sum();
                    let usage = Usage::new(prompt, approx_tokens(&text));
                    return Ok(ChatResponse::text(text).with_usage(usage));
                }
            }
        }
    }
}
