//! 上下文指针：工具输出的稳定定位
//!
//! 可复用的输出由 (tool_name, normalized_args, query_group_key) 确定；
//! 存储 key 额外带上 (task_id, call_index)，保证同一批次内并发写入的 key 互不相同。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::evidence::ToolResult;
use crate::tools::ToolCall;

/// 规范化查询文本：小写、标点转空格、合并空白
pub fn normalize_query(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// 查询分组键：规范化查询的 SHA-256 前 16 位 hex
pub fn query_group_key(query: &str) -> String {
    let digest = hex::encode(Sha256::digest(normalize_query(query).as_bytes()));
    digest[..16].to_string()
}

/// 规范化参数：对象键排序（递归），数组顺序保留
pub fn normalize_args(args: &Value) -> Value {
    match args {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), normalize_args(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_args).collect()),
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

/// 规范化参数的摘要（12 位 hex）
pub fn args_digest(args: &Value) -> String {
    let canonical = normalize_args(args).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))[..12].to_string()
}

/// 指向一条已存储工具输出的指针
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextPointer {
    pub group_key: String,
    pub tool_name: String,
    pub args_digest: String,
    pub task_id: String,
    pub call_index: usize,
}

impl ContextPointer {
    pub fn new(
        group_key: impl Into<String>,
        call: &ToolCall,
        task_id: impl Into<String>,
        call_index: usize,
    ) -> Self {
        Self {
            group_key: group_key.into(),
            tool_name: call.tool_name.clone(),
            args_digest: args_digest(&call.args),
            task_id: task_id.into(),
            call_index,
        }
    }

    /// 存储 key：`{group}/{tool}/{args_digest}/{task_id}#{call_index}`
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}#{}",
            self.group_key,
            self.tool_name.replace('/', "_"),
            self.args_digest,
            self.task_id,
            self.call_index
        )
    }

    /// 与另一次调用是否为同一 (tool, normalized_args, group)
    pub fn same_invocation(&self, group_key: &str, call: &ToolCall) -> bool {
        self.group_key == group_key
            && self.tool_name == call.tool_name
            && self.args_digest == args_digest(&call.args)
    }
}

/// 存储的工具输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToolOutput {
    pub pointer: ContextPointer,
    pub iteration: usize,
    pub normalized_args: Value,
    pub result: ToolResult,
    pub stored_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_query() {
        assert_eq!(
            normalize_query("  Compare AAPL,  and MSFT 2024 performance? "),
            "compare aapl and msft 2024 performance"
        );
    }

    #[test]
    fn test_group_key_stable_under_formatting() {
        let a = query_group_key("Compare AAPL and MSFT");
        let b = query_group_key("compare   aapl and msft!");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, query_group_key("compare aapl and goog"));
    }

    #[test]
    fn test_args_digest_ignores_key_order() {
        let a = json!({"ticker": "AAPL", "year": 2024});
        let b = json!({"year": 2024, "ticker": " AAPL "});
        assert_eq!(args_digest(&a), args_digest(&b));
        assert_ne!(args_digest(&a), args_digest(&json!({"ticker": "MSFT", "year": 2024})));
    }

    #[test]
    fn test_pointer_keys_unique_per_task_and_call() {
        let call = ToolCall::new("quote", json!({"ticker": "AAPL"}));
        let a = ContextPointer::new("g", &call, "i0.t1", 0);
        let b = ContextPointer::new("g", &call, "i0.t2", 0);
        let c = ContextPointer::new("g", &call, "i0.t1", 1);
        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert!(a.key().starts_with("g/quote/"));
        assert!(a.same_invocation("g", &ToolCall::new("quote", json!({"ticker": "AAPL"}))));
        assert!(!a.same_invocation("other", &call));
    }
}
