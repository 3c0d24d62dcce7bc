//! 运行上下文：run_id、墙钟预算、取消令牌与成本归集
//!
//! 显式沿调用链传递，不使用进程级全局计数器；运行结束时 cost.snapshot() 写入 OrchestratorResult。

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{CallPurpose, ChatRequest, ChatResponse, LlmClient, LlmError, Usage};

/// 每千 token 单价（美元）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostRates {
    pub prompt_usd_per_1k: f64,
    pub completion_usd_per_1k: f64,
}

/// 一次运行的成本汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunCost {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub llm_calls: u64,
    pub failed_llm_calls: u64,
    pub tool_calls: u64,
    pub estimated_usd: f64,
    pub by_purpose: BTreeMap<String, Usage>,
}

#[derive(Debug, Default)]
struct CostState {
    by_purpose: BTreeMap<CallPurpose, Usage>,
    llm_calls: u64,
    failed_llm_calls: u64,
    tool_calls: u64,
}

/// 运行级成本计数（并行任务并发写入）
#[derive(Debug, Default)]
pub struct CostTracker {
    state: Mutex<CostState>,
    rates: CostRates,
}

impl CostTracker {
    pub fn new(rates: CostRates) -> Self {
        Self {
            state: Mutex::default(),
            rates,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut CostState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn record_llm(&self, purpose: CallPurpose, usage: &Usage) {
        self.with_state(|s| {
            s.llm_calls += 1;
            s.by_purpose.entry(purpose).or_default().add(usage);
        });
    }

    pub fn record_llm_failure(&self) {
        self.with_state(|s| s.failed_llm_calls += 1);
    }

    pub fn record_tool_call(&self) {
        self.with_state(|s| s.tool_calls += 1);
    }

    pub fn snapshot(&self) -> RunCost {
        self.with_state(|s| {
            let mut total = Usage::default();
            for usage in s.by_purpose.values() {
                total.add(usage);
            }
            let estimated_usd = total.prompt_tokens as f64 / 1000.0 * self.rates.prompt_usd_per_1k
                + total.completion_tokens as f64 / 1000.0 * self.rates.completion_usd_per_1k;
            RunCost {
                prompt_tokens: total.prompt_tokens,
                completion_tokens: total.completion_tokens,
                total_tokens: total.total(),
                llm_calls: s.llm_calls,
                failed_llm_calls: s.failed_llm_calls,
                tool_calls: s.tool_calls,
                estimated_usd,
                by_purpose: s
                    .by_purpose
                    .iter()
                    .map(|(purpose, usage)| (purpose.as_str().to_string(), *usage))
                    .collect(),
            }
        })
    }
}

/// 单次运行的上下文
#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    started_at: Instant,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    pub cost: CostTracker,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(None, CostRates::default())
    }
}

impl RunContext {
    pub fn new(budget: Option<Duration>, rates: CostRates) -> Self {
        let started_at = Instant::now();
        Self {
            run_id: format!("run_{}", uuid::Uuid::new_v4().simple()),
            started_at,
            deadline: budget.map(|b| started_at + b),
            cancel: CancellationToken::new(),
            cost: CostTracker::new(rates),
        }
    }

    /// 使用外部取消令牌（调用方可随时取消整个运行）
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 剩余墙钟预算；None 表示不限
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// 已取消或预算耗尽
    pub fn is_exhausted(&self) -> bool {
        self.is_cancelled() || self.remaining().is_some_and(|r| r.is_zero())
    }

    /// 耗尽时对应的错误
    pub fn stop_reason(&self) -> Option<AgentError> {
        if self.is_cancelled() {
            Some(AgentError::Cancelled)
        } else if self.is_exhausted() {
            Some(AgentError::BudgetExhausted)
        } else {
            None
        }
    }

    /// 单次调用超时与剩余预算取较小者
    pub fn clip_timeout(&self, per_call: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => per_call.min(remaining),
            None => per_call,
        }
    }

    /// 模型调用的唯一挂起点：超时、取消、成本记录
    pub async fn call_model(
        &self,
        llm: &dyn LlmClient,
        request: &ChatRequest,
        per_call_timeout: Duration,
    ) -> Result<ChatResponse, AgentError> {
        if let Some(reason) = self.stop_reason() {
            return Err(reason);
        }
        let limit = self.clip_timeout(per_call_timeout);
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.cost.record_llm_failure();
                return Err(AgentError::Cancelled);
            }
            r = tokio::time::timeout(limit, llm.call(request)) => r,
        };

        match outcome {
            Ok(Ok(response)) => {
                self.cost.record_llm(request.purpose, &response.usage);
                tracing::debug!(
                    run_id = %self.run_id,
                    purpose = request.purpose.as_str(),
                    model = request.model().unwrap_or("default"),
                    tokens = response.usage.total(),
                    "llm call"
                );
                Ok(response)
            }
            Ok(Err(e)) => {
                self.cost.record_llm_failure();
                Err(AgentError::LlmError(e))
            }
            Err(_) => {
                self.cost.record_llm_failure();
                if self.is_exhausted() {
                    Err(AgentError::BudgetExhausted)
                } else {
                    Err(AgentError::LlmError(LlmError::Timeout))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{DecodingParams, Message, MockLlmClient, MockReply};

    fn request(purpose: CallPurpose) -> ChatRequest {
        ChatRequest::new(purpose, vec![Message::user("q")], DecodingParams::default())
    }

    #[tokio::test]
    async fn test_cost_recorded_per_purpose() {
        let ctx = RunContext::new(
            None,
            CostRates {
                prompt_usd_per_1k: 1.0,
                completion_usd_per_1k: 2.0,
            },
        );
        let mock = MockLlmClient::new();
        ctx.call_model(&mock, &request(CallPurpose::Plan), Duration::from_secs(1))
            .await
            .unwrap();
        ctx.call_model(&mock, &request(CallPurpose::Reflect), Duration::from_secs(1))
            .await
            .unwrap();
        ctx.cost.record_tool_call();

        let cost = ctx.cost.snapshot();
        assert_eq!(cost.llm_calls, 2);
        assert_eq!(cost.tool_calls, 1);
        assert!(cost.by_purpose.contains_key("plan"));
        assert!(cost.by_purpose.contains_key("reflect"));
        assert_eq!(cost.total_tokens, cost.prompt_tokens + cost.completion_tokens);
        assert!(cost.estimated_usd > 0.0);
    }

    #[tokio::test]
    async fn test_per_call_timeout_maps_to_llm_timeout() {
        let ctx = RunContext::default();
        let mock = MockLlmClient::new();
        mock.push_reply(
            CallPurpose::Task,
            MockReply::Delayed(Duration::from_millis(200), Box::new(MockReply::Text("late".into()))),
        );
        let err = ctx
            .call_model(&mock, &request(CallPurpose::Task), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::LlmError(LlmError::Timeout)));
        assert_eq!(ctx.cost.snapshot().failed_llm_calls, 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_short_circuits() {
        let ctx = RunContext::new(Some(Duration::ZERO), CostRates::default());
        let mock = MockLlmClient::new();
        let err = ctx
            .call_model(&mock, &request(CallPurpose::Task), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::BudgetExhausted));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_calls() {
        let ctx = RunContext::default();
        ctx.cancel();
        let mock = MockLlmClient::new();
        let err = ctx
            .call_model(&mock, &request(CallPurpose::Task), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
