//! Echo 工具（测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::evidence::{EvidenceEnvelope, EvidenceKind, ToolResult};
use crate::tools::Tool;

/// Echo 工具：回显文本，附带一条 ToolOutput 证据
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing)."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<ToolResult, String> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(ToolResult::ok(text)
            .with_evidence(EvidenceEnvelope::new(EvidenceKind::ToolOutput, format!("echo: {text}"))))
    }
}
