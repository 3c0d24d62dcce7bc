//! 工具执行器
//!
//! 持有 ToolRegistry 与单次调用超时；超时与剩余运行预算取较小者。
//! 超时或失败都落在 ToolResult 中，不向上抛错；每次调用输出一行结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::RunContext;
use crate::evidence::ToolResult;
use crate::tools::{ToolCall, ToolRegistry, ToolSchema};

/// 工具执行器
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tools_schema(&self) -> Vec<ToolSchema> {
        self.registry.get_tools_schema()
    }

    /// 执行一次工具调用
    pub async fn execute(&self, ctx: &RunContext, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let limit = ctx.clip_timeout(self.timeout);

        let mut result = if ctx.is_exhausted() {
            ToolResult::timeout(0).with_tool_name(&call.tool_name)
        } else {
            ctx.cost.record_tool_call();
            match timeout(limit, self.registry.invoke(&call.tool_name, call.args.clone())).await {
                Ok(result) => result,
                Err(_) => ToolResult::timeout(limit.as_millis() as u64).with_tool_name(&call.tool_name),
            }
        };
        result.duration_ms = start.elapsed().as_millis() as u64;
        result.ensure_evidence();

        let outcome = if result.success {
            "ok"
        } else if result.timed_out {
            "timeout"
        } else {
            "error"
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "run_id": ctx.run_id(),
            "tool": call.tool_name,
            "ok": result.success,
            "outcome": outcome,
            "duration_ms": result.duration_ms,
            "args_preview": args_preview(&call.args),
        });
        tracing::info!(audit = %audit, "tool");
        result
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
