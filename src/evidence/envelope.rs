//! 证据信封与工具结果
//!
//! EvidenceEnvelope 是引用的规范目标：答案中的每个 [cite:<id>] 都必须能在运行累计的证据集中找到。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type EvidenceId = String;

/// 证据来源类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    ToolOutput,
    WebPage,
    Document,
    Dataset,
    Computation,
    ModelInference,
}

/// 证据信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceEnvelope {
    pub id: EvidenceId,
    pub kind: EvidenceKind,
    pub label: String,
    #[serde(default)]
    pub source_urls: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl EvidenceEnvelope {
    /// 新建并分配随机 id（ev_ + 12 位 hex）
    pub fn new(kind: EvidenceKind, label: impl Into<String>) -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("ev_{}", &uuid[..12]),
            kind,
            label: label.into(),
            source_urls: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<EvidenceId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_urls.push(url.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// 一次工具调用的结果；创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub tool_name: String,
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub source_urls: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<EvidenceEnvelope>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn ok(data: impl Into<Value>) -> Self {
        Self {
            tool_name: String::new(),
            success: true,
            data: data.into(),
            source_urls: Vec::new(),
            evidence: Vec::new(),
            error: None,
            timed_out: false,
            duration_ms: 0,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            ..Self::ok(Value::Null)
        }
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self {
            timed_out: true,
            duration_ms: after_ms,
            ..Self::failure(format!("timed out after {after_ms}ms"))
        }
    }

    pub fn with_tool_name(mut self, name: impl Into<String>) -> Self {
        self.tool_name = name.into();
        self
    }

    pub fn with_evidence(mut self, envelope: EvidenceEnvelope) -> Self {
        self.evidence.push(envelope);
        self
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_urls.push(url.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// 成功但未带证据的结果补一条 ToolOutput 信封，保证每个成功输出都可被引用
    pub fn ensure_evidence(&mut self) {
        if !self.success || !self.evidence.is_empty() {
            return;
        }
        let mut envelope = EvidenceEnvelope::new(
            EvidenceKind::ToolOutput,
            format!("{} output", self.tool_name),
        )
        .with_metadata("tool", self.tool_name.clone());
        envelope.source_urls = self.source_urls.clone();
        self.evidence.push(envelope);
    }

    /// data 的文本预览
    pub fn data_preview(&self, max_chars: usize) -> String {
        let text = match &self.data {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        if text.chars().count() > max_chars {
            format!("{}...", text.chars().take(max_chars).collect::<String>())
        } else {
            text
        }
    }
}
