//! 工具注册表
//!
//! 工具是封闭接口（name / description / parameters_schema / invoke），按名注册在 ToolRegistry 中；
//! 编排核心只通过 get_tools_schema 与 invoke 使用工具，不探查具体实现。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::evidence::ToolResult;
use crate::tools::ToolSchema;

/// 工具 trait
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（对应选择输出中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供模型理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；Err 表示工具抛错，由注册表转为失败的 ToolResult
    async fn invoke(&self, args: Value) -> Result<ToolResult, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous definition replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 全部工具的 schema（按名称排序）
    pub fn get_tools_schema(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|(name, tool)| ToolSchema {
                name: name.clone(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    /// 调用工具；未知工具与工具错误都表现为失败的 ToolResult
    pub async fn invoke(&self, name: &str, args: Value) -> ToolResult {
        let result = match self.tools.get(name) {
            Some(tool) => tool
                .invoke(args)
                .await
                .unwrap_or_else(ToolResult::failure),
            None => ToolResult::failure(format!("Unknown tool: {name}")),
        };
        result.with_tool_name(name)
    }
}
