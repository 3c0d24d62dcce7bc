//! ToolContextStore：工具输出的指针存储
//!
//! 写入只追加，key 由 (group, tool, args_digest, task_id, call_index) 唯一确定，
//! 同一批次内的并发写入不会落到同一个 key 上。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use crate::context_store::backend::{ContextBackend, InMemoryBackend};
use crate::context_store::pointer::{normalize_args, ContextPointer, StoredToolOutput};
use crate::context_store::relevance::{entry_text, heuristic_select};
use crate::core::{AgentError, RunContext};
use crate::evidence::ToolResult;
use crate::llm::{parse_json_output, CallPurpose, ChatRequest, DecodingParams, LlmClient, Message};
use crate::tools::ToolCall;

const DEFAULT_MAX_RELEVANT: usize = 8;

#[derive(Debug, Deserialize)]
struct RelevanceReply {
    #[serde(default)]
    indices: Vec<usize>,
}

/// 工具输出上下文存储
pub struct ToolContextStore {
    backend: Arc<dyn ContextBackend>,
    relevance_llm: Option<Arc<dyn LlmClient>>,
    relevance_model: Option<String>,
    max_relevant: usize,
    call_timeout: Duration,
}

impl ToolContextStore {
    pub fn new(backend: Arc<dyn ContextBackend>) -> Self {
        Self {
            backend,
            relevance_llm: None,
            relevance_model: None,
            max_relevant: DEFAULT_MAX_RELEVANT,
            call_timeout: Duration::from_secs(30),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    /// 启用小模型相关性筛选
    pub fn with_relevance_model(
        mut self,
        llm: Arc<dyn LlmClient>,
        model: Option<String>,
        call_timeout: Duration,
    ) -> Self {
        self.relevance_llm = Some(llm);
        self.relevance_model = model;
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_max_relevant(mut self, max_relevant: usize) -> Self {
        self.max_relevant = max_relevant.max(1);
        self
    }

    pub fn max_relevant(&self) -> usize {
        self.max_relevant
    }

    /// 写入；key 已存在时返回 false，原记录保持不变
    pub async fn put(&self, output: &StoredToolOutput) -> Result<bool, AgentError> {
        let payload = serde_json::to_string(output)
            .map_err(|e| AgentError::ContextStore(format!("serialize: {e}")))?;
        self.backend
            .put(&output.pointer.key(), &payload)
            .await
            .map_err(|e| AgentError::ContextStore(e.to_string()))
    }

    pub async fn get(&self, pointer: &ContextPointer) -> Result<Option<StoredToolOutput>, AgentError> {
        let payload = self
            .backend
            .get(&pointer.key())
            .await
            .map_err(|e| AgentError::ContextStore(e.to_string()))?;
        match payload {
            Some(p) => serde_json::from_str(&p)
                .map(Some)
                .map_err(|e| AgentError::ContextStore(format!("corrupt entry {}: {e}", pointer.key()))),
            None => Ok(None),
        }
    }

    /// 某分组下全部输出；损坏的记录跳过并告警
    pub async fn list(&self, group_key: &str) -> Result<Vec<StoredToolOutput>, AgentError> {
        let rows = self
            .backend
            .list(group_key)
            .await
            .map_err(|e| AgentError::ContextStore(e.to_string()))?;
        let mut outputs = Vec::with_capacity(rows.len());
        for (key, payload) in rows {
            match serde_json::from_str::<StoredToolOutput>(&payload) {
                Ok(output) => outputs.push(output),
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping corrupt context entry"),
            }
        }
        Ok(outputs)
    }

    /// 记录一次工具调用的结果并返回其指针
    pub async fn record(
        &self,
        group_key: &str,
        task_id: &str,
        call_index: usize,
        iteration: usize,
        call: &ToolCall,
        result: &ToolResult,
    ) -> Result<ContextPointer, AgentError> {
        let pointer = ContextPointer::new(group_key, call, task_id, call_index);
        let output = StoredToolOutput {
            pointer: pointer.clone(),
            iteration,
            normalized_args: normalize_args(&call.args),
            result: result.clone(),
            stored_at: Utc::now(),
        };
        if !self.put(&output).await? {
            tracing::debug!(key = %pointer.key(), "context entry already stored");
        }
        Ok(pointer)
    }

    /// 同一分组内相同工具 + 规范化参数的最早一次成功输出
    pub async fn find_cached(
        &self,
        group_key: &str,
        call: &ToolCall,
    ) -> Result<Option<StoredToolOutput>, AgentError> {
        let mut hits: Vec<StoredToolOutput> = self
            .list(group_key)
            .await?
            .into_iter()
            .filter(|o| o.result.success && o.pointer.same_invocation(group_key, call))
            .collect();
        hits.sort_by(|a, b| a.iteration.cmp(&b.iteration).then(a.stored_at.cmp(&b.stored_at)));
        Ok(hits.into_iter().next())
    }

    /// 按指针批量读取，缺失的跳过
    pub async fn load(&self, pointers: &[ContextPointer]) -> Result<Vec<StoredToolOutput>, AgentError> {
        let mut outputs = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            if let Some(output) = self.get(pointer).await? {
                outputs.push(output);
            }
        }
        Ok(outputs)
    }

    /// 从候选指针中选出与查询相关的子集（保持原顺序，至多 max_relevant 条）
    pub async fn select_relevant(
        &self,
        ctx: &RunContext,
        query: &str,
        available: &[ContextPointer],
    ) -> Result<Vec<ContextPointer>, AgentError> {
        let entries = self.load(available).await?;
        if entries.len() <= self.max_relevant {
            return Ok(entries.into_iter().map(|e| e.pointer).collect());
        }

        if let Some(llm) = &self.relevance_llm {
            match self.model_select(ctx, llm.as_ref(), query, &entries).await {
                Ok(indices) => {
                    return Ok(indices.into_iter().map(|i| entries[i].pointer.clone()).collect());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "relevance model failed, using heuristic");
                }
            }
        }

        Ok(heuristic_select(query, &entries, self.max_relevant)
            .into_iter()
            .map(|i| entries[i].pointer.clone())
            .collect())
    }

    async fn model_select(
        &self,
        ctx: &RunContext,
        llm: &dyn LlmClient,
        query: &str,
        entries: &[StoredToolOutput],
    ) -> Result<Vec<usize>, AgentError> {
        let mut listing = String::new();
        for (i, entry) in entries.iter().enumerate() {
            let text: String = entry_text(entry).chars().take(300).collect();
            listing.push_str(&format!("[{i}] {text}\n"));
        }
        let system = format!(
            "Select the tool outputs most relevant to the user's question. \
             Pick at most {} entries. Reply with JSON only: {{\"indices\": [<entry number>, ...]}}",
            self.max_relevant
        );
        let request = ChatRequest::new(
            CallPurpose::Relevance,
            vec![
                Message::system(system),
                Message::user(format!("Question: {query}\n\nEntries:\n{listing}")),
            ],
            DecodingParams::json(self.relevance_model.clone()),
        );
        let response = ctx.call_model(llm, &request, self.call_timeout).await?;
        let reply: RelevanceReply = parse_json_output(response.content_str())?;

        let mut picked = BTreeSet::new();
        for index in reply.indices {
            if index >= entries.len() {
                return Err(AgentError::MalformedModelOutput(format!(
                    "relevance index {index} out of range"
                )));
            }
            picked.insert(index);
        }
        if picked.is_empty() {
            return Err(AgentError::MalformedModelOutput("no relevant entries selected".into()));
        }
        Ok(picked.into_iter().take(self.max_relevant).collect())
    }
}
