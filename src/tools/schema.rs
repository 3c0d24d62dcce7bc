//! 工具 Schema 与工具选择输出格式
//!
//! 选择输出的 JSON 结构 `{"calls": [{"tool": "...", "args": {...}}]}` 由 schemars 生成后拼入 system prompt，
//! 减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 工具描述：名称、说明、参数 JSON Schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 一次工具调用（由 ToolSelector 产生，生命周期只在单个任务内）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolCall {
    /// 工具名，必须是可用工具之一
    #[serde(rename = "tool")]
    pub tool_name: String,
    /// 工具参数，结构见各工具的 parameters
    #[serde(default = "empty_args")]
    #[schemars(with = "Map<String, Value>")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(Map::new())
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
        }
    }
}

/// 工具选择输出格式
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SelectionFormat {
    /// 选中的工具调用，按执行优先级排列
    #[serde(default)]
    pub calls: Vec<ToolCall>,
}

/// 选择输出格式的 JSON Schema 字符串
pub fn selection_schema_json() -> String {
    let schema = schema_for!(SelectionFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 将可用工具格式化为 prompt 段落
pub fn format_tools_prompt(tools: &[ToolSchema]) -> String {
    let mut out = String::from("Available tools:\n");
    for tool in tools {
        out.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            tool.name, tool.description, tool.parameters
        ));
    }
    out
}
