//! TaskPlanner：意图 + 查询 → 一轮的任务 DAG
//!
//! 每轮的任务 id 加上 `i{n}.` 前缀，保证整个运行内唯一；引用更早轮次的 id 视为已满足的依赖。
//! 模型失败或输出不可解析时退化为单个工具任务；结构错误（环、未知依赖、重复 id）返回空计划并带 PlanningError。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;

use crate::agentic::{Intent, Query};
use crate::core::{AgentError, RunContext};
use crate::evidence::EvidenceEnvelope;
use crate::llm::{parse_json_output, CallPurpose, ChatRequest, DecodingParams, LlmClient, Message};
use crate::workflow::{PlanningError, Task, TaskGraph, TaskId, TaskKind};

const MAX_EVIDENCE_IN_PROMPT: usize = 20;

#[derive(Debug, Deserialize, JsonSchema)]
struct RawPlan {
    /// 1 到 max_tasks 个任务
    #[serde(default)]
    tasks: Vec<RawTask>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RawTask {
    /// 本轮内唯一的短 id，如 research_aapl
    id: String,
    /// tool_use（需要调用工具获取信息）或 reasoning（基于依赖任务的结果分析）
    #[serde(default)]
    kind: Option<String>,
    description: String,
    /// 依赖的任务 id
    #[serde(default)]
    depends_on: Vec<String>,
}

fn parse_kind(kind: Option<&str>) -> TaskKind {
    match kind.map(|k| k.trim().to_ascii_lowercase()) {
        Some(k) if matches!(k.as_str(), "reasoning" | "synthesis" | "analysis" | "compare") => {
            TaskKind::Reasoning
        }
        _ => TaskKind::ToolUse,
    }
}

/// 规划时可见的运行状态
#[derive(Debug, Clone, Copy)]
pub struct PlanningContext<'a> {
    pub iteration: usize,
    /// 之前各轮收集的证据
    pub prior_evidence: &'a [EvidenceEnvelope],
    /// 之前各轮已执行的任务 id
    pub prior_task_ids: &'a BTreeSet<TaskId>,
    /// 上一轮 Reflect 给出的未完成原因
    pub feedback: Option<&'a str>,
}

/// 一次规划的结果
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub graph: TaskGraph,
    /// 结构错误：此时 graph 为空
    pub error: Option<PlanningError>,
    /// 使用了单任务兜底计划
    pub fallback: bool,
}

impl PlanOutcome {
    pub fn tasks(&self) -> &[Task] {
        self.graph.tasks()
    }
}

/// 任务规划器
pub struct TaskPlanner {
    llm: Arc<dyn LlmClient>,
    model: Option<String>,
    timeout: Duration,
    max_tasks: usize,
}

impl TaskPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, model: Option<String>, timeout: Duration, max_tasks: usize) -> Self {
        Self {
            llm,
            model,
            timeout,
            max_tasks: max_tasks.max(1),
        }
    }

    pub async fn plan(&self, ctx: &RunContext, query: &Query, intent: &Intent, pctx: PlanningContext<'_>) -> PlanOutcome {
        let raw = match self.request_plan(ctx, query, intent, &pctx).await {
            Ok(raw) if !raw.tasks.is_empty() => raw,
            Ok(_) => {
                tracing::warn!(iteration = pctx.iteration, "planner returned no tasks, using single-task plan");
                return self.fallback_plan(query, &pctx);
            }
            Err(e) => {
                tracing::warn!(iteration = pctx.iteration, error = %e, "planning failed, using single-task plan");
                return self.fallback_plan(query, &pctx);
            }
        };

        let tasks = self.namespace(raw, &pctx);
        match TaskGraph::new(tasks, pctx.prior_task_ids) {
            Ok(graph) => {
                tracing::info!(iteration = pctx.iteration, tasks = graph.len(), batches = graph.batches().len(), "plan ready");
                PlanOutcome {
                    graph,
                    error: None,
                    fallback: false,
                }
            }
            Err(e) => {
                tracing::warn!(iteration = pctx.iteration, error = %e, "plan rejected");
                PlanOutcome {
                    graph: TaskGraph::default(),
                    error: Some(e),
                    fallback: false,
                }
            }
        }
    }

    async fn request_plan(
        &self,
        ctx: &RunContext,
        query: &Query,
        intent: &Intent,
        pctx: &PlanningContext<'_>,
    ) -> Result<RawPlan, AgentError> {
        let schema = serde_json::to_string(&schema_for!(RawPlan)).unwrap_or_default();
        let system = format!(
            "You plan research work. Split the question into at most {max} small tasks forming an acyclic graph. \
             Independent lookups should not depend on each other; a reasoning task that combines results depends on them. \
             Reply with a single JSON object matching this schema:\n{schema}",
            max = self.max_tasks,
        );

        let mut user = format!("Question: {}\nIntent: {}", query.text, intent.intent_type);
        if !intent.entities.is_empty() {
            let entities: Vec<String> = intent.entities.iter().map(|(k, v)| format!("{k}={v}")).collect();
            user.push_str(&format!("\nEntities: {}", entities.join(", ")));
        }
        if pctx.iteration > 0 {
            user.push_str(&format!("\n\nThis is planning pass {}.", pctx.iteration + 1));
            if let Some(feedback) = pctx.feedback {
                user.push_str(&format!("\nWhat is still missing: {feedback}"));
            }
            if !pctx.prior_task_ids.is_empty() {
                let ids: Vec<&str> = pctx.prior_task_ids.iter().map(String::as_str).collect();
                user.push_str(&format!("\nAlready executed tasks (may be used in depends_on): {}", ids.join(", ")));
            }
            if !pctx.prior_evidence.is_empty() {
                user.push_str("\nEvidence already collected:");
                for envelope in pctx.prior_evidence.iter().take(MAX_EVIDENCE_IN_PROMPT) {
                    user.push_str(&format!("\n- {}: {}", envelope.id, envelope.label));
                }
            }
        }

        let request = ChatRequest::new(
            CallPurpose::Plan,
            vec![Message::system(system), Message::user(user)],
            DecodingParams::json(self.model.clone()),
        );
        let response = ctx.call_model(self.llm.as_ref(), &request, self.timeout).await?;
        parse_json_output(response.content_str())
    }

    /// 截断到 max_tasks 并加轮次前缀；被截掉的任务的依赖引用一并移除
    fn namespace(&self, raw: RawPlan, pctx: &PlanningContext<'_>) -> Vec<Task> {
        let mut raw_tasks = raw.tasks;
        let mut dropped = BTreeSet::new();
        if raw_tasks.len() > self.max_tasks {
            tracing::info!(returned = raw_tasks.len(), kept = self.max_tasks, "plan truncated");
            dropped = raw_tasks
                .drain(self.max_tasks..)
                .map(|t| t.id.trim().to_string())
                .collect();
        }
        let prefix = format!("i{}.", pctx.iteration);
        let local: BTreeSet<String> = raw_tasks.iter().map(|t| t.id.trim().to_string()).collect();

        raw_tasks
            .into_iter()
            .map(|t| {
                let id = t.id.trim();
                let id = if id.is_empty() { String::new() } else { format!("{prefix}{id}") };
                let mut task = Task::new(id, parse_kind(t.kind.as_deref()), t.description)
                    .with_iteration(pctx.iteration);
                for dep in t.depends_on {
                    let dep = dep.trim();
                    if dep.is_empty() || (dropped.contains(dep) && !local.contains(dep)) {
                        continue;
                    }
                    if local.contains(dep) {
                        task.depends_on.insert(format!("{prefix}{dep}"));
                    } else {
                        // 更早轮次的 id 原样保留；其余由图校验报 UnknownDependency
                        task.depends_on.insert(dep.to_string());
                    }
                }
                task
            })
            .collect()
    }

    fn fallback_plan(&self, query: &Query, pctx: &PlanningContext<'_>) -> PlanOutcome {
        let task = Task::new(
            format!("i{}.research", pctx.iteration),
            TaskKind::ToolUse,
            query.text.clone(),
        )
        .with_iteration(pctx.iteration);
        match TaskGraph::new(vec![task], pctx.prior_task_ids) {
            Ok(graph) => PlanOutcome {
                graph,
                error: None,
                fallback: true,
            },
            Err(e) => PlanOutcome {
                graph: TaskGraph::default(),
                error: Some(e),
                fallback: true,
            },
        }
    }
}
