//! IterativeOrchestrator：Understand → Plan → Execute → Reflect 迭代主循环
//!
//! 单一控制流驱动一次运行，只在批次内并行；证据账本跨迭代只追加。
//! 无论以何种方式结束（正常完成、到达上限、部分失败、Understand 失败），
//! 都返回 OrchestratorResult，并在最后各发出一次 evidence 与 answer 事件。

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::agentic::{
    AnswerSynthesizer, EventSink, Intent, IterationSummary, OrchestratorEvent, OrchestratorResult,
    PlannedTask, PlanningContext, Query, ReflectPhase, ReflectionSource, RunStatus, TaskPlanner,
    UnderstandPhase,
};
use crate::context_store::{query_group_key, ContextPointer};
use crate::core::{AgentError, CostRates, IterationState, OrchestratorPhase, PhaseMachine, RunContext};
use crate::evidence::EvidenceLedger;
use crate::workflow::{AgenticExecutor, ExecutionInput, SubTaskResult, TaskId, TaskKind};

/// 编排器配置
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_iterations: usize,
    /// 整次运行的墙钟预算
    pub run_timeout: Option<Duration>,
    /// 全部工具任务的选择回退链耗尽且没有证据时，整次运行记为 Failed
    pub escalate_selection_exhaustion: bool,
    pub cost_rates: CostRates,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            run_timeout: None,
            escalate_selection_exhaustion: true,
            cost_rates: CostRates::default(),
        }
    }
}

/// 跨迭代累积的运行状态
#[derive(Default)]
struct RunAccumulator {
    ledger: EvidenceLedger,
    results: BTreeMap<TaskId, SubTaskResult>,
    pointers: Vec<ContextPointer>,
    summaries: Vec<IterationSummary>,
    draft: Option<String>,
    tool_tasks: usize,
    exhausted_tool_tasks: usize,
    partial: bool,
    cap_reached: bool,
}

impl RunAccumulator {
    fn prior_task_ids(&self) -> BTreeSet<TaskId> {
        self.results.keys().cloned().collect()
    }

    fn selection_fully_exhausted(&self) -> bool {
        self.tool_tasks > 0 && self.exhausted_tool_tasks == self.tool_tasks
    }
}

/// 迭代编排器
pub struct IterativeOrchestrator {
    understand: UnderstandPhase,
    planner: TaskPlanner,
    executor: AgenticExecutor,
    reflect: ReflectPhase,
    synthesizer: AnswerSynthesizer,
    config: OrchestratorConfig,
}

impl IterativeOrchestrator {
    pub fn new(
        understand: UnderstandPhase,
        planner: TaskPlanner,
        executor: AgenticExecutor,
        reflect: ReflectPhase,
        synthesizer: AnswerSynthesizer,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            understand,
            planner,
            executor,
            reflect,
            synthesizer,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// 按配置的预算与费率创建新的运行上下文
    pub fn new_context(&self) -> RunContext {
        RunContext::new(self.config.run_timeout, self.config.cost_rates)
    }

    pub async fn run(&self, query: Query) -> OrchestratorResult {
        self.run_with_context(self.new_context(), query, EventSink::disabled())
            .await
    }

    pub async fn run_with_events(
        &self,
        query: Query,
        tx: UnboundedSender<OrchestratorEvent>,
    ) -> OrchestratorResult {
        self.run_with_context(self.new_context(), query, EventSink::new(tx))
            .await
    }

    /// 以调用方提供的上下文运行（可在外部取消）
    pub async fn run_with_context(
        &self,
        ctx: RunContext,
        query: Query,
        events: EventSink,
    ) -> OrchestratorResult {
        let mut phases = PhaseMachine::new();
        tracing::info!(run_id = ctx.run_id(), query = %query.text, "run started");

        let intent = match self.understand.understand(&ctx, &query).await {
            Ok(intent) => intent,
            Err(e) => {
                tracing::error!(run_id = ctx.run_id(), error = %e, "understand failed, aborting run");
                advance(&mut phases, OrchestratorPhase::Failed, ctx.run_id());
                return understand_failed(&ctx, e, &events);
            }
        };
        tracing::info!(
            run_id = ctx.run_id(),
            intent = %intent.intent_type,
            entities = ?intent.entity_values(),
            "intent resolved"
        );

        let group_key = query_group_key(&query.text);
        let mut acc = RunAccumulator::default();
        let mut feedback: Option<String> = None;
        let mut iterations_used = 0;

        for iteration in 0..self.config.max_iterations {
            iterations_used = iteration + 1;
            advance(&mut phases, OrchestratorPhase::Planning, ctx.run_id());

            let prior_task_ids = acc.prior_task_ids();
            let outcome = self
                .planner
                .plan(
                    &ctx,
                    &query,
                    &intent,
                    PlanningContext {
                        iteration,
                        prior_evidence: acc.ledger.as_slice(),
                        prior_task_ids: &prior_task_ids,
                        feedback: feedback.as_deref(),
                    },
                )
                .await;
            events.emit(OrchestratorEvent::Plan {
                iteration,
                tasks: outcome.tasks().iter().map(PlannedTask::from).collect(),
                error: outcome.error.as_ref().map(ToString::to_string),
            });
            if let Some(error) = &outcome.error {
                tracing::warn!(run_id = ctx.run_id(), iteration, error = %error, "plan rejected");
                acc.partial = true;
            }

            let mut state = IterationState::new(iteration);
            let evidence_before = acc.ledger.len();

            if !outcome.graph.is_empty() {
                advance(&mut phases, OrchestratorPhase::Executing, ctx.run_id());
                let report = self
                    .executor
                    .execute(
                        &ctx,
                        &outcome.graph,
                        ExecutionInput {
                            query: &query.text,
                            group_key: &group_key,
                            iteration,
                            prior_results: &acc.results,
                        },
                        &events,
                    )
                    .await;
                if report.budget_exhausted {
                    acc.partial = true;
                }

                let tool_task_ids: BTreeSet<&TaskId> = outcome
                    .tasks()
                    .iter()
                    .filter(|t| t.kind == TaskKind::ToolUse)
                    .map(|t| &t.id)
                    .collect();
                for result in report.ordered_results() {
                    acc.ledger.extend(result.evidence().cloned());
                    acc.pointers.extend(result.pointers.iter().cloned());
                    if !result.is_success() {
                        acc.partial = true;
                    }
                    if tool_task_ids.contains(&result.task_id) {
                        acc.tool_tasks += 1;
                        if result.selection_exhausted {
                            acc.exhausted_tool_tasks += 1;
                        }
                    }
                    acc.results.insert(result.task_id.clone(), result.clone());
                    state.executed_tasks.push(result);
                }
                if report.answer_draft.is_some() {
                    acc.draft = report.answer_draft;
                }
            }

            state.collected_evidence = acc.ledger.snapshot();
            state.answer_draft = acc.draft.clone();

            advance(&mut phases, OrchestratorPhase::Reflecting, ctx.run_id());
            let reflection = self
                .reflect
                .reflect(&ctx, &state, &intent, iteration, self.config.max_iterations)
                .await;
            state.complete = reflection.complete;

            acc.summaries.push(IterationSummary {
                iteration,
                task_ids: state.executed_tasks.iter().map(|r| r.task_id.clone()).collect(),
                evidence_ids: acc.ledger.as_slice()[evidence_before..]
                    .iter()
                    .map(|e| e.id.clone())
                    .collect(),
                complete: reflection.complete,
                reason: reflection.reason.clone(),
            });
            events.emit(OrchestratorEvent::IterationComplete {
                iteration,
                complete: reflection.complete,
                reason: reflection.reason.clone(),
                evidence_count: acc.ledger.len(),
            });
            tracing::info!(
                run_id = ctx.run_id(),
                iteration,
                complete = reflection.complete,
                source = ?reflection.source,
                evidence = acc.ledger.len(),
                "iteration complete"
            );

            if reflection.complete {
                match reflection.source {
                    ReflectionSource::IterationCap => acc.cap_reached = true,
                    ReflectionSource::Budget => acc.partial = true,
                    ReflectionSource::Model | ReflectionSource::Heuristic => {}
                }
                break;
            }
            feedback = Some(reflection.reason);
        }

        advance(&mut phases, OrchestratorPhase::Finalizing, ctx.run_id());
        let result = self
            .finalize(&ctx, &query, intent, acc, iterations_used, &events)
            .await;
        let terminal = if result.status == RunStatus::Failed {
            OrchestratorPhase::Failed
        } else {
            OrchestratorPhase::Done
        };
        advance(&mut phases, terminal, ctx.run_id());
        result
    }

    async fn finalize(
        &self,
        ctx: &RunContext,
        query: &Query,
        intent: Intent,
        acc: RunAccumulator,
        iterations_used: usize,
        events: &EventSink,
    ) -> OrchestratorResult {
        let synthesis = self
            .synthesizer
            .synthesize(
                ctx,
                query,
                Some(&intent),
                &acc.ledger,
                &acc.pointers,
                acc.draft.as_deref(),
            )
            .await;

        let escalated = self.config.escalate_selection_exhaustion
            && acc.selection_fully_exhausted()
            && acc.ledger.is_empty();
        let (status, error) = if escalated {
            (
                RunStatus::Failed,
                Some(AgentError::SelectionExhausted("every tool-use task exhausted tool selection".into()).to_string()),
            )
        } else if acc.partial {
            (RunStatus::Partial, ctx.stop_reason().map(|e| e.to_string()))
        } else if acc.cap_reached {
            (RunStatus::CapReached, None)
        } else {
            (RunStatus::Completed, None)
        };

        let evidence = acc.ledger.snapshot();
        events.emit(OrchestratorEvent::Evidence {
            evidence: evidence.clone(),
        });
        events.emit(OrchestratorEvent::Answer {
            answer: synthesis.answer.clone(),
            citations: synthesis.citations.clone(),
            status,
        });

        let cost = ctx.cost.snapshot();
        tracing::info!(
            run_id = ctx.run_id(),
            status = ?status,
            iterations = iterations_used,
            evidence = evidence.len(),
            answer_source = ?synthesis.source,
            total_tokens = cost.total_tokens,
            "run finished"
        );

        OrchestratorResult {
            run_id: ctx.run_id().to_string(),
            answer: synthesis.answer,
            evidence,
            iterations_used,
            cost,
            status,
            intent: Some(intent),
            citations: synthesis.citations,
            invalid_citations: synthesis.invalid_citations,
            error,
            iterations: acc.summaries,
        }
    }
}

fn advance(phases: &mut PhaseMachine, next: OrchestratorPhase, run_id: &str) {
    if let Err(e) = phases.transition(next) {
        tracing::error!(run_id, error = %e, "unexpected phase transition");
    }
}

fn understand_failed(ctx: &RunContext, error: AgentError, events: &EventSink) -> OrchestratorResult {
    events.emit(OrchestratorEvent::Evidence { evidence: Vec::new() });
    events.emit(OrchestratorEvent::Answer {
        answer: String::new(),
        citations: Vec::new(),
        status: RunStatus::Failed,
    });
    OrchestratorResult {
        run_id: ctx.run_id().to_string(),
        answer: String::new(),
        evidence: Vec::new(),
        iterations_used: 0,
        cost: ctx.cost.snapshot(),
        status: RunStatus::Failed,
        intent: None,
        citations: Vec::new(),
        invalid_citations: Vec::new(),
        error: Some(error.to_string()),
        iterations: Vec::new(),
    }
}
