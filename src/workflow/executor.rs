//! AgenticExecutor：按拓扑批次执行任务 DAG
//!
//! 批内任务并发（受 TaskScheduler 限制），工具任务先经 ToolSelector 选出调用，再并发调用工具。
//! 结果按 task_id 汇总，与完成先后无关；单个工具失败只记录在其 ToolResult 中，不影响兄弟调用与兄弟任务。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;

use crate::agentic::{EventSink, OrchestratorEvent};
use crate::context_store::{ContextPointer, ToolContextStore};
use crate::core::{RunContext, TaskScheduler};
use crate::evidence::{EvidenceEnvelope, EvidenceKind, EvidenceLedger, ToolResult};
use crate::llm::{CallPurpose, ChatRequest, DecodingParams, LlmClient, Message};
use crate::tools::{ToolCall, ToolExecutor, ToolSelector};
use crate::workflow::graph::TaskGraph;
use crate::workflow::types::*;

/// 推理任务的伪工具名
pub const REASONING_TOOL: &str = "reasoning";

const DEPENDENCY_PREVIEW_CHARS: usize = 1500;

const REASONING_SYSTEM: &str = "You are an analyst. Answer the task using only the results provided. \
Be concise and mention the evidence ids (shown in brackets) that support each statement.";

/// 执行器配置
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub max_concurrent_tasks: usize,
    pub max_concurrent_tools: usize,
    pub on_dependency_failure: DependencyFailurePolicy,
    /// 复用之前迭代中相同工具 + 参数的成功输出
    pub reuse_cached_results: bool,
    /// 推理任务使用的模型（None 为后端默认主模型）
    pub reasoning_model: Option<String>,
    pub reasoning_timeout: Duration,
    pub reasoning_temperature: f32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            max_concurrent_tools: 4,
            on_dependency_failure: DependencyFailurePolicy::Skip,
            reuse_cached_results: true,
            reasoning_model: None,
            reasoning_timeout: Duration::from_secs(60),
            reasoning_temperature: 0.2,
        }
    }
}

/// 单次执行的输入
#[derive(Debug, Clone, Copy)]
pub struct ExecutionInput<'a> {
    pub query: &'a str,
    pub group_key: &'a str,
    pub iteration: usize,
    /// 更早轮次的结果，跨轮依赖从这里取
    pub prior_results: &'a BTreeMap<TaskId, SubTaskResult>,
}

/// 执行报告
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// 计划顺序
    pub order: Vec<TaskId>,
    pub results: BTreeMap<TaskId, SubTaskResult>,
    /// 有任务因预算耗尽或取消而被跳过
    pub budget_exhausted: bool,
    /// 计划顺序中最后一个完成的推理任务的输出
    pub answer_draft: Option<String>,
}

impl ExecutionReport {
    /// 按计划顺序的结果
    pub fn ordered_results(&self) -> Vec<SubTaskResult> {
        self.order
            .iter()
            .filter_map(|id| self.results.get(id).cloned())
            .collect()
    }

    /// 按计划顺序、调用顺序收集证据
    pub fn evidence(&self) -> Vec<EvidenceEnvelope> {
        self.order
            .iter()
            .filter_map(|id| self.results.get(id))
            .flat_map(|r| r.evidence().cloned())
            .collect()
    }
}

/// 单次执行内已占用的证据 id（以更早轮次的证据为种子）
///
/// 成功结果在写入存储和发出事件之前登记；同 id 不同内容的信封改用账本分配的派生 id，
/// 这样存储、结果与事件中的 id 与运行级账本一致。
struct EvidenceClaims(Mutex<EvidenceLedger>);

impl EvidenceClaims {
    fn seeded(prior: &BTreeMap<TaskId, SubTaskResult>) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.extend(prior.values().flat_map(|r| r.evidence().cloned()));
        Self(Mutex::new(ledger))
    }

    fn claim(&self, result: &mut ToolResult) {
        if !result.success {
            return;
        }
        let mut ledger = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        for envelope in result.evidence.iter_mut() {
            let id = ledger.append(envelope.clone());
            if id != envelope.id {
                if let Some(assigned) = ledger.get(&id) {
                    *envelope = assigned.clone();
                }
            }
        }
    }
}

/// 任务 DAG 执行器
pub struct AgenticExecutor {
    llm: Arc<dyn LlmClient>,
    selector: Arc<ToolSelector>,
    tools: ToolExecutor,
    store: Arc<ToolContextStore>,
    scheduler: TaskScheduler,
    config: ExecutorConfig,
}

impl AgenticExecutor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        selector: Arc<ToolSelector>,
        tools: ToolExecutor,
        store: Arc<ToolContextStore>,
        config: ExecutorConfig,
    ) -> Self {
        let scheduler = TaskScheduler::new(config.max_concurrent_tasks, config.max_concurrent_tools);
        Self {
            llm,
            selector,
            tools,
            store,
            scheduler,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ToolContextStore> {
        &self.store
    }

    /// 执行整张图；每个批次全部结束后才开始下一批次
    pub async fn execute(
        &self,
        ctx: &RunContext,
        graph: &TaskGraph,
        input: ExecutionInput<'_>,
        events: &EventSink,
    ) -> ExecutionReport {
        let mut report = ExecutionReport {
            order: graph.tasks().iter().map(|t| t.id.clone()).collect(),
            ..Default::default()
        };
        let claims = EvidenceClaims::seeded(input.prior_results);

        for batch in graph.batches() {
            let outputs = join_all(
                batch
                    .iter()
                    .map(|&idx| self.run_task(ctx, graph, idx, &report.results, input, &claims, events)),
            )
            .await;
            for (result, budget_skipped) in outputs {
                report.budget_exhausted |= budget_skipped;
                report.results.insert(result.task_id.clone(), result);
            }
        }

        report.answer_draft = graph
            .tasks()
            .iter()
            .filter(|t| t.kind == TaskKind::Reasoning)
            .filter_map(|t| report.results.get(&t.id))
            .filter(|r| r.is_success())
            .filter_map(|r| r.tool_results.first())
            .filter_map(|r| r.data.as_str().map(str::to_string))
            .last();

        tracing::info!(
            run_id = ctx.run_id(),
            iteration = input.iteration,
            tasks = report.results.len(),
            failed = report.results.values().filter(|r| !r.is_success()).count(),
            budget_exhausted = report.budget_exhausted,
            "task graph executed"
        );
        report
    }

    /// 返回 (结果, 是否因预算跳过)
    async fn run_task(
        &self,
        ctx: &RunContext,
        graph: &TaskGraph,
        idx: usize,
        done: &BTreeMap<TaskId, SubTaskResult>,
        input: ExecutionInput<'_>,
        claims: &EvidenceClaims,
        events: &EventSink,
    ) -> (SubTaskResult, bool) {
        let task = graph.task(idx);

        let dependencies: Vec<(&TaskId, Option<&SubTaskResult>)> = task
            .depends_on
            .iter()
            .map(|id| (id, done.get(id).or_else(|| input.prior_results.get(id))))
            .collect();
        let failed: Vec<&str> = dependencies
            .iter()
            .filter(|(_, r)| !r.is_some_and(|r| r.is_success()))
            .map(|(id, _)| id.as_str())
            .collect();

        let mut degraded = false;
        if !failed.is_empty() {
            match self.config.on_dependency_failure {
                DependencyFailurePolicy::Skip => {
                    tracing::info!(task_id = %task.id, deps = ?failed, "skipping task with failed dependencies");
                    return (
                        SubTaskResult::skipped(&task.id, format!("dependency failed: {}", failed.join(", "))),
                        false,
                    );
                }
                DependencyFailurePolicy::Proceed => degraded = true,
            }
        }

        if let Some(reason) = ctx.stop_reason() {
            return (SubTaskResult::skipped(&task.id, reason.to_string()), true);
        }
        let _permit = match self.scheduler.acquire_task().await {
            Ok(permit) => permit,
            Err(e) => return (SubTaskResult::skipped(&task.id, e.to_string()), true),
        };

        let upstream: Vec<&SubTaskResult> = dependencies.iter().filter_map(|(_, r)| *r).collect();
        let mut result = match task.kind {
            TaskKind::ToolUse => self.run_tool_task(ctx, task, &upstream, input, claims, events).await,
            TaskKind::Reasoning => self.run_reasoning_task(ctx, task, &upstream, input, claims).await,
        };
        result.degraded = degraded;
        (result, false)
    }

    async fn run_tool_task(
        &self,
        ctx: &RunContext,
        task: &Task,
        upstream: &[&SubTaskResult],
        input: ExecutionInput<'_>,
        claims: &EvidenceClaims,
        events: &EventSink,
    ) -> SubTaskResult {
        let schema = self.tools.tools_schema();
        let context = dependency_context(upstream);
        let selection = self
            .selector
            .select_tool_calls(ctx, task, &schema, Some(input.query), context.as_deref())
            .await;

        let mut result = SubTaskResult::new(&task.id, TaskState::Completed);
        if selection.exhausted {
            result.state = TaskState::Failed;
            result.selection_exhausted = true;
            result.error = Some(
                selection
                    .last_error
                    .unwrap_or_else(|| "tool selection exhausted".to_string()),
            );
            return result;
        }
        if selection.calls.is_empty() {
            return result;
        }

        events.emit(OrchestratorEvent::ToolCallsStart {
            iteration: input.iteration,
            task_id: task.id.clone(),
            calls: selection.calls.clone(),
        });

        let outcomes = join_all(
            selection
                .calls
                .iter()
                .enumerate()
                .map(|(i, call)| self.run_call(ctx, task, i, call, input, claims, events)),
        )
        .await;
        for (tool_result, pointer) in outcomes {
            result.tool_results.push(tool_result);
            result.pointers.extend(pointer);
        }

        if result.tool_results.iter().all(|r| !r.success) {
            result.state = TaskState::Failed;
            result.error = Some(format!("all {} tool calls failed", result.tool_results.len()));
        }
        result
    }

    async fn run_call(
        &self,
        ctx: &RunContext,
        task: &Task,
        call_index: usize,
        call: &ToolCall,
        input: ExecutionInput<'_>,
        claims: &EvidenceClaims,
        events: &EventSink,
    ) -> (ToolResult, Option<ContextPointer>) {
        let _permit = match self.scheduler.acquire_tool().await {
            Ok(permit) => permit,
            Err(e) => {
                return (ToolResult::failure(e.to_string()).with_tool_name(&call.tool_name), None)
            }
        };

        let cached = if self.config.reuse_cached_results {
            match self.store.find_cached(input.group_key, call).await {
                Ok(hit) => hit,
                Err(e) => {
                    tracing::warn!(tool = %call.tool_name, error = %e, "context lookup failed");
                    None
                }
            }
        } else {
            None
        };

        let (result, pointer, was_cached) = match cached {
            Some(hit) => {
                tracing::debug!(task_id = %task.id, tool = %call.tool_name, "reusing stored tool output");
                let mut result = hit.result;
                claims.claim(&mut result);
                (result, Some(hit.pointer), true)
            }
            None => {
                let mut result = self.tools.execute(ctx, call).await;
                claims.claim(&mut result);
                let pointer = match self
                    .store
                    .record(input.group_key, &task.id, call_index, input.iteration, call, &result)
                    .await
                {
                    Ok(p) => Some(p),
                    Err(e) => {
                        tracing::warn!(task_id = %task.id, tool = %call.tool_name, error = %e, "failed to store tool output");
                        None
                    }
                };
                (result, pointer, false)
            }
        };

        events.emit(OrchestratorEvent::ToolCallComplete {
            iteration: input.iteration,
            task_id: task.id.clone(),
            tool: call.tool_name.clone(),
            success: result.success,
            cached: was_cached,
            error: result.error.clone(),
            evidence_ids: result.evidence.iter().map(|e| e.id.clone()).collect(),
            duration_ms: result.duration_ms,
        });
        (result, pointer)
    }

    async fn run_reasoning_task(
        &self,
        ctx: &RunContext,
        task: &Task,
        upstream: &[&SubTaskResult],
        input: ExecutionInput<'_>,
        claims: &EvidenceClaims,
    ) -> SubTaskResult {
        let mut prompt = format!("Question: {}\nTask: {}\n", input.query, task.description);
        let mut derived_from = Vec::new();
        if !upstream.is_empty() {
            prompt.push_str("\nResults from previous steps:\n");
        }
        for dep in upstream {
            for tool_result in dep.tool_results.iter().filter(|r| r.success) {
                let ids: Vec<&str> = tool_result.evidence.iter().map(|e| e.id.as_str()).collect();
                derived_from.extend(ids.iter().map(|s| s.to_string()));
                prompt.push_str(&format!(
                    "- [{}] {} ({}): {}\n",
                    ids.join(", "),
                    dep.task_id,
                    tool_result.tool_name,
                    tool_result.data_preview(DEPENDENCY_PREVIEW_CHARS)
                ));
            }
        }

        let request = ChatRequest::new(
            CallPurpose::Task,
            vec![Message::system(REASONING_SYSTEM), Message::user(prompt)],
            DecodingParams::text(self.config.reasoning_model.clone(), self.config.reasoning_temperature),
        );
        let response = match ctx
            .call_model(self.llm.as_ref(), &request, self.config.reasoning_timeout)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "reasoning task failed");
                let mut failed = SubTaskResult::new(&task.id, TaskState::Failed);
                failed.error = Some(e.to_string());
                return failed;
            }
        };

        let envelope = EvidenceEnvelope::new(EvidenceKind::ModelInference, task.description.clone())
            .with_metadata("task_id", task.id.clone())
            .with_metadata("derived_from", json!(derived_from));
        let mut tool_result = ToolResult::ok(response.content_str().trim())
            .with_tool_name(REASONING_TOOL)
            .with_evidence(envelope);
        claims.claim(&mut tool_result);

        let mut result = SubTaskResult::new(&task.id, TaskState::Completed);
        let call = ToolCall::new(REASONING_TOOL, json!({"task": task.description}));
        match self
            .store
            .record(input.group_key, &task.id, 0, input.iteration, &call, &tool_result)
            .await
        {
            Ok(pointer) => result.pointers.push(pointer),
            Err(e) => tracing::warn!(task_id = %task.id, error = %e, "failed to store reasoning output"),
        }
        result.tool_results.push(tool_result);
        result
    }
}

/// 上游成功输出的简要文本，供工具选择参考
fn dependency_context(upstream: &[&SubTaskResult]) -> Option<String> {
    let lines: Vec<String> = upstream
        .iter()
        .flat_map(|dep| {
            dep.tool_results
                .iter()
                .filter(|r| r.success)
                .map(move |r| format!("{} ({}): {}", dep.task_id, r.tool_name, r.data_preview(500)))
        })
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, MockReply};
    use crate::tools::{Tool, ToolRegistry, ToolSelectorConfig};
    use crate::workflow::TaskGraphBuilder;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 行情工具：记录开始 / 结束顺序与最大并发；ticker 为 FAIL 时失败
    #[derive(Default)]
    struct QuoteTool {
        /// 设置后每次调用都用这个证据 id（内容随 ticker 不同）
        evidence_id: Option<String>,
        log: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl Tool for Arc<QuoteTool> {
        fn name(&self) -> &str {
            "quote"
        }
        fn description(&self) -> &str {
            "Stock quote for a ticker"
        }
        async fn invoke(&self, args: Value) -> Result<ToolResult, String> {
            let ticker = args["ticker"].as_str().unwrap_or("?").to_string();
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("start:{ticker}"));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("end:{ticker}"));
            if ticker == "FAIL" {
                return Err("quote service unavailable".into());
            }
            let mut result = ToolResult::ok(format!("{ticker} closed higher"));
            if let Some(id) = &self.evidence_id {
                result = result
                    .with_evidence(EvidenceEnvelope::new(EvidenceKind::ToolOutput, format!("{ticker} quote")).with_id(id));
            }
            Ok(result)
        }
    }

    /// 选择器回复：每个任务调用一次 quote，ticker 取任务描述；推理调用返回固定文本
    fn mock() -> Arc<MockLlmClient> {
        Arc::new(MockLlmClient::new().with_responder(|req| {
            if req.purpose == CallPurpose::ToolSelection {
                let user = &req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
                let desc = user
                    .lines()
                    .find_map(|l| l.strip_prefix("Task: "))
                    .unwrap_or("?")
                    .to_string();
                MockReply::Text(json!({"calls": [{"tool": "quote", "args": {"ticker": desc}}]}).to_string())
            } else {
                MockReply::Text("both rose".into())
            }
        }))
    }

    fn executor(
        tool: &Arc<QuoteTool>,
        llm: Arc<MockLlmClient>,
        config: ExecutorConfig,
        store: Arc<ToolContextStore>,
    ) -> AgenticExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::clone(tool));
        let selector = Arc::new(ToolSelector::new(llm.clone(), ToolSelectorConfig::default()));
        AgenticExecutor::new(
            llm,
            selector,
            ToolExecutor::new(Arc::new(registry), Duration::from_secs(5)),
            store,
            config,
        )
    }

    fn input<'a>(prior: &'a BTreeMap<TaskId, SubTaskResult>, iteration: usize) -> ExecutionInput<'a> {
        ExecutionInput {
            query: "compare AAPL and MSFT",
            group_key: "g",
            iteration,
            prior_results: prior,
        }
    }

    #[tokio::test]
    async fn test_independent_tasks_run_concurrently_then_dependent() {
        let tool = Arc::new(QuoteTool::default());
        let exec = executor(&tool, mock(), ExecutorConfig::default(), Arc::new(ToolContextStore::in_memory()));
        let graph = TaskGraphBuilder::new()
            .tool_task("aapl", "AAPL")
            .tool_task("msft", "MSFT")
            .tool_task("summary", "SUMMARY")
            .after_all(["aapl", "msft"])
            .build()
            .unwrap();
        let prior = BTreeMap::new();
        let report = exec.execute(&RunContext::default(), &graph, input(&prior, 0), &EventSink::disabled()).await;

        assert_eq!(tool.max_in_flight.load(Ordering::SeqCst), 2);
        let log = tool.log.lock().unwrap().clone();
        let pos = |s: &str| log.iter().position(|l| l == s).unwrap();
        assert!(pos("start:SUMMARY") > pos("end:AAPL"));
        assert!(pos("start:SUMMARY") > pos("end:MSFT"));
        assert_eq!(report.order, vec!["aapl", "msft", "summary"]);
        assert!(report.results.values().all(|r| r.is_success()));
        assert_eq!(report.evidence().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrency_limit_respected() {
        let tool = Arc::new(QuoteTool::default());
        let config = ExecutorConfig {
            max_concurrent_tasks: 1,
            ..Default::default()
        };
        let exec = executor(&tool, mock(), config, Arc::new(ToolContextStore::in_memory()));
        let graph = TaskGraphBuilder::new()
            .tool_task("a", "A")
            .tool_task("b", "B")
            .tool_task("c", "C")
            .build()
            .unwrap();
        let prior = BTreeMap::new();
        exec.execute(&RunContext::default(), &graph, input(&prior, 0), &EventSink::disabled()).await;
        assert_eq!(tool.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_dependency_skip_and_proceed() {
        for (policy, expected) in [
            (DependencyFailurePolicy::Skip, TaskState::Skipped),
            (DependencyFailurePolicy::Proceed, TaskState::Completed),
        ] {
            let tool = Arc::new(QuoteTool::default());
            let config = ExecutorConfig {
                on_dependency_failure: policy,
                ..Default::default()
            };
            let exec = executor(&tool, mock(), config, Arc::new(ToolContextStore::in_memory()));
            let graph = TaskGraphBuilder::new()
                .tool_task("bad", "FAIL")
                .tool_task("ok", "AAPL")
                .tool_task("after", "MSFT")
                .after("bad")
                .build()
                .unwrap();
            let prior = BTreeMap::new();
            let report = exec
                .execute(&RunContext::default(), &graph, input(&prior, 0), &EventSink::disabled())
                .await;

            assert_eq!(report.results["bad"].state, TaskState::Failed);
            assert!(report.results["bad"].tool_results[0].error.is_some());
            assert_eq!(report.results["ok"].state, TaskState::Completed);
            assert_eq!(report.results["after"].state, expected);
            assert_eq!(report.results["after"].degraded, policy == DependencyFailurePolicy::Proceed);
        }
    }

    #[tokio::test]
    async fn test_reasoning_task_cites_upstream_evidence() {
        let tool = Arc::new(QuoteTool::default());
        let llm = mock();
        let exec = executor(&tool, llm.clone(), ExecutorConfig::default(), Arc::new(ToolContextStore::in_memory()));
        let graph = TaskGraphBuilder::new()
            .tool_task("aapl", "AAPL")
            .reasoning_task("compare", "Compare")
            .after("aapl")
            .build()
            .unwrap();
        let prior = BTreeMap::new();
        let report = exec.execute(&RunContext::default(), &graph, input(&prior, 0), &EventSink::disabled()).await;

        let compare = &report.results["compare"];
        assert!(compare.is_success());
        let envelope = &compare.tool_results[0].evidence[0];
        assert_eq!(envelope.kind, EvidenceKind::ModelInference);
        let upstream_id = report.results["aapl"].tool_results[0].evidence[0].id.clone();
        assert_eq!(envelope.metadata["derived_from"], json!([upstream_id]));
        assert_eq!(report.answer_draft.as_deref(), Some("both rose"));
        let task_prompt = llm
            .requests()
            .into_iter()
            .find(|r| r.purpose == CallPurpose::Task)
            .unwrap();
        assert!(task_prompt.messages[1].content.contains(&upstream_id));
    }

    #[tokio::test]
    async fn test_cached_outputs_reused_across_iterations() {
        let tool = Arc::new(QuoteTool::default());
        let store = Arc::new(ToolContextStore::in_memory());
        let exec = executor(&tool, mock(), ExecutorConfig::default(), store);
        let ctx = RunContext::default();

        let first = TaskGraphBuilder::new().tool_task("i0.a", "AAPL").build().unwrap();
        let prior = BTreeMap::new();
        let r0 = exec.execute(&ctx, &first, input(&prior, 0), &EventSink::disabled()).await;

        let prior_ids: BTreeSet<TaskId> = r0.results.keys().cloned().collect();
        let second = TaskGraphBuilder::new()
            .prior(prior_ids)
            .iteration(1)
            .tool_task("i1.a", "AAPL")
            .after("i0.a")
            .build()
            .unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let r1 = exec
            .execute(&ctx, &second, input(&r0.results, 1), &EventSink::new(tx))
            .await;

        assert_eq!(tool.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(r1.results["i1.a"].tool_results[0], r0.results["i0.a"].tool_results[0]);
        let mut saw_cached = false;
        while let Ok(ev) = rx.try_recv() {
            if let OrchestratorEvent::ToolCallComplete { cached, .. } = ev {
                saw_cached |= cached;
            }
        }
        assert!(saw_cached);
    }

    #[tokio::test]
    async fn test_exhausted_budget_skips_tasks() {
        let tool = Arc::new(QuoteTool::default());
        let exec = executor(&tool, mock(), ExecutorConfig::default(), Arc::new(ToolContextStore::in_memory()));
        let graph = TaskGraphBuilder::new().tool_task("a", "AAPL").build().unwrap();
        let ctx = RunContext::default();
        ctx.cancel();
        let prior = BTreeMap::new();
        let report = exec.execute(&ctx, &graph, input(&prior, 0), &EventSink::disabled()).await;
        assert!(report.budget_exhausted);
        assert_eq!(report.results["a"].state, TaskState::Skipped);
        assert_eq!(tool.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_colliding_evidence_ids_renamed_before_store_and_events() {
        let tool = Arc::new(QuoteTool {
            evidence_id: Some("shared".into()),
            ..Default::default()
        });
        let store = Arc::new(ToolContextStore::in_memory());
        let exec = executor(&tool, mock(), ExecutorConfig::default(), store.clone());
        let graph = TaskGraphBuilder::new()
            .tool_task("aapl", "AAPL")
            .tool_task("msft", "MSFT")
            .build()
            .unwrap();
        let prior = BTreeMap::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let report = exec
            .execute(&RunContext::default(), &graph, input(&prior, 0), &EventSink::new(tx))
            .await;

        let id_of = |task: &str| report.results[task].tool_results[0].evidence[0].id.clone();
        let ids: BTreeSet<String> = [id_of("aapl"), id_of("msft")].into_iter().collect();
        assert_eq!(ids, BTreeSet::from(["shared".to_string(), "shared~1".to_string()]));
        let renamed = report
            .evidence()
            .into_iter()
            .find(|e| e.id == "shared~1")
            .unwrap();
        assert_eq!(renamed.metadata["original_id"], json!("shared"));

        for task in ["aapl", "msft"] {
            let stored = store.load(&report.results[task].pointers).await.unwrap();
            assert_eq!(stored.len(), 1);
            assert_eq!(stored[0].result.evidence[0].id, id_of(task));
        }

        let mut completed = BTreeMap::new();
        while let Ok(ev) = rx.try_recv() {
            if let OrchestratorEvent::ToolCallComplete { task_id, evidence_ids, .. } = ev {
                completed.insert(task_id, evidence_ids);
            }
        }
        assert_eq!(completed["aapl"], vec![id_of("aapl")]);
        assert_eq!(completed["msft"], vec![id_of("msft")]);
    }

    #[tokio::test]
    async fn test_prior_evidence_ids_stay_claimed_across_iterations() {
        let tool = Arc::new(QuoteTool {
            evidence_id: Some("shared".into()),
            ..Default::default()
        });
        let config = ExecutorConfig {
            reuse_cached_results: false,
            ..Default::default()
        };
        let exec = executor(&tool, mock(), config, Arc::new(ToolContextStore::in_memory()));
        let ctx = RunContext::default();

        let first = TaskGraphBuilder::new().tool_task("i0.a", "AAPL").build().unwrap();
        let prior = BTreeMap::new();
        let r0 = exec.execute(&ctx, &first, input(&prior, 0), &EventSink::disabled()).await;

        let second = TaskGraphBuilder::new().iteration(1).tool_task("i1.m", "MSFT").build().unwrap();
        let r1 = exec
            .execute(&ctx, &second, input(&r0.results, 1), &EventSink::disabled())
            .await;

        assert_eq!(r0.results["i0.a"].tool_results[0].evidence[0].id, "shared");
        assert_eq!(r1.results["i1.m"].tool_results[0].evidence[0].id, "shared~1");
    }
}
