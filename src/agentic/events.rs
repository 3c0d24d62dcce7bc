//! 编排过程事件：按迭代顺序推送 plan / tool_calls_start / tool_call_complete / iteration_complete，
//! 运行结束时恰好各一条 evidence 与 answer

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::agentic::RunStatus;
use crate::evidence::{EvidenceEnvelope, EvidenceId};
use crate::tools::ToolCall;
use crate::workflow::{Task, TaskId, TaskKind};

/// 计划中的任务摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub description: String,
    pub depends_on: Vec<TaskId>,
}

impl From<&Task> for PlannedTask {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            kind: task.kind,
            description: task.description.clone(),
            depends_on: task.depends_on.iter().cloned().collect(),
        }
    }
}

/// 编排事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// 本轮计划；结构错误时 tasks 为空并带 error
    Plan {
        iteration: usize,
        tasks: Vec<PlannedTask>,
        error: Option<String>,
    },
    /// 某任务选出的工具调用即将执行
    ToolCallsStart {
        iteration: usize,
        task_id: TaskId,
        calls: Vec<ToolCall>,
    },
    /// 单个工具调用结束
    ToolCallComplete {
        iteration: usize,
        task_id: TaskId,
        tool: String,
        success: bool,
        /// 复用了之前迭代的存储输出
        cached: bool,
        error: Option<String>,
        evidence_ids: Vec<EvidenceId>,
        duration_ms: u64,
    },
    IterationComplete {
        iteration: usize,
        complete: bool,
        reason: String,
        evidence_count: usize,
    },
    /// 运行结束时的全部证据
    Evidence { evidence: Vec<EvidenceEnvelope> },
    /// 最终答案
    Answer {
        answer: String,
        citations: Vec<EvidenceId>,
        status: RunStatus,
    },
}

/// 事件出口；未设置接收端时丢弃
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<OrchestratorEvent>>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<OrchestratorEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.tx {
            // 接收端已关闭时不影响运行
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_tags() {
        let plan = serde_json::to_value(OrchestratorEvent::Plan {
            iteration: 0,
            tasks: vec![],
            error: None,
        })
        .unwrap();
        assert_eq!(plan["type"], "plan");

        let done = serde_json::to_value(OrchestratorEvent::IterationComplete {
            iteration: 1,
            complete: true,
            reason: "cap".into(),
            evidence_count: 2,
        })
        .unwrap();
        assert_eq!(done["type"], "iteration_complete");
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        sink.emit(OrchestratorEvent::Evidence { evidence: vec![] });
        sink.emit(OrchestratorEvent::Answer {
            answer: "a".into(),
            citations: vec![],
            status: RunStatus::Completed,
        });
        assert!(matches!(rx.recv().await, Some(OrchestratorEvent::Evidence { .. })));
        assert!(matches!(rx.recv().await, Some(OrchestratorEvent::Answer { .. })));
        EventSink::disabled().emit(OrchestratorEvent::Evidence { evidence: vec![] });
    }
}
