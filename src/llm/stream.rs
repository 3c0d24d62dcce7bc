//! 流式响应聚合
//!
//! 文本与推理增量按到达顺序拼接；tool call 片段按 index 分桶拼接，块结束（或流结束）时解析一次 arguments。

use std::collections::BTreeMap;

use futures_util::StreamExt;

use crate::llm::{ChatResponse, ChunkStream, LlmError, ModelToolCall, StreamChunk, Usage};

/// 流聚合结果：ChatResponse 之外保留推理文本
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedStream {
    pub response: ChatResponse,
    pub reasoning: String,
}

#[derive(Debug, Default)]
struct ToolCallBuffer {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallBuffer {
    fn finish(self, index: usize) -> Result<ModelToolCall, LlmError> {
        let name = self
            .name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| LlmError::MalformedStream(format!("tool call #{index} has no name")))?;
        let arguments = if self.arguments.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&self.arguments).map_err(|e| {
                LlmError::MalformedStream(format!("tool call '{name}' arguments: {e}"))
            })?
        };
        Ok(ModelToolCall {
            id: self.id.unwrap_or_else(|| format!("call_{index}")),
            name,
            arguments,
        })
    }
}

/// tool call 片段累加器
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    open: BTreeMap<usize, ToolCallBuffer>,
    closed: Vec<ModelToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_fragment(
        &mut self,
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: &str,
    ) {
        let buffer = self.open.entry(index).or_default();
        if buffer.id.is_none() {
            buffer.id = id;
        }
        if let Some(name) = name {
            buffer.name.get_or_insert_with(String::new).push_str(&name);
        }
        buffer.arguments.push_str(arguments);
    }

    /// 关闭一个 tool call 块并解析；未见过的 index 忽略
    pub fn close(&mut self, index: usize) -> Result<(), LlmError> {
        if let Some(buffer) = self.open.remove(&index) {
            self.closed.push(buffer.finish(index)?);
        }
        Ok(())
    }

    /// 流结束：关闭所有仍未结束的块（按 index 顺序）
    pub fn finish(mut self) -> Result<Vec<ModelToolCall>, LlmError> {
        let remaining = std::mem::take(&mut self.open);
        for (index, buffer) in remaining {
            self.closed.push(buffer.finish(index)?);
        }
        Ok(self.closed)
    }
}

/// 消费整个 chunk 流
pub async fn collect_stream(mut stream: ChunkStream) -> Result<CollectedStream, LlmError> {
    let mut text = String::new();
    let mut saw_text = false;
    let mut reasoning = String::new();
    let mut usage = Usage::default();
    let mut tool_calls = ToolCallAccumulator::new();

    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::Text(delta) => {
                saw_text = true;
                text.push_str(&delta);
            }
            StreamChunk::Reasoning(delta) => reasoning.push_str(&delta),
            StreamChunk::ToolCallFragment {
                index,
                id,
                name,
                arguments,
            } => tool_calls.push_fragment(index, id, name, &arguments),
            StreamChunk::ToolCallEnd { index } => tool_calls.close(index)?,
            StreamChunk::Usage(u) => usage.add(&u),
        }
    }

    Ok(CollectedStream {
        response: ChatResponse {
            content: saw_text.then_some(text),
            tool_calls: tool_calls.finish()?,
            usage,
        },
        reasoning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn boxed(chunks: Vec<Result<StreamChunk, LlmError>>) -> ChunkStream {
        Box::pin(stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_fragments_concatenated_in_arrival_order() {
        let chunks = vec![
            Ok(StreamChunk::Reasoning("thinking ".into())),
            Ok(StreamChunk::Text("Hel".into())),
            Ok(StreamChunk::ToolCallFragment {
                index: 0,
                id: Some("c1".into()),
                name: Some("web_search".into()),
                arguments: "{\"query\":".into(),
            }),
            Ok(StreamChunk::Text("lo".into())),
            Ok(StreamChunk::ToolCallFragment {
                index: 0,
                id: None,
                name: None,
                arguments: "\"AAPL\"}".into(),
            }),
            Ok(StreamChunk::ToolCallEnd { index: 0 }),
            Ok(StreamChunk::Usage(Usage::new(10, 5))),
        ];
        let collected = collect_stream(boxed(chunks)).await.unwrap();
        assert_eq!(collected.response.content.as_deref(), Some("Hello"));
        assert_eq!(collected.reasoning, "thinking ");
        assert_eq!(collected.response.tool_calls.len(), 1);
        let call = &collected.response.tool_calls[0];
        assert_eq!(call.id, "c1");
        assert_eq!(call.name, "web_search");
        assert_eq!(call.arguments["query"], "AAPL");
        assert_eq!(collected.response.usage.total(), 15);
    }

    #[tokio::test]
    async fn test_unterminated_block_parsed_at_end() {
        let chunks = vec![
            Ok(StreamChunk::ToolCallFragment {
                index: 1,
                id: None,
                name: Some("calc".into()),
                arguments: "{\"x\": 1}".into(),
            }),
        ];
        let collected = collect_stream(boxed(chunks)).await.unwrap();
        assert_eq!(collected.response.content, None);
        assert_eq!(collected.response.tool_calls[0].id, "call_1");
    }

    #[tokio::test]
    async fn test_malformed_arguments_rejected() {
        let chunks = vec![
            Ok(StreamChunk::ToolCallFragment {
                index: 0,
                id: None,
                name: Some("calc".into()),
                arguments: "{\"x\": ".into(),
            }),
            Ok(StreamChunk::ToolCallEnd { index: 0 }),
        ];
        let err = collect_stream(boxed(chunks)).await.unwrap_err();
        assert!(matches!(err, LlmError::MalformedStream(_)));
    }

    #[tokio::test]
    async fn test_default_call_stream_round_trips_response() {
        use crate::llm::{CallPurpose, ChatRequest, DecodingParams, LlmClient, Message, MockLlmClient, MockReply};

        let mock = MockLlmClient::new();
        mock.push_reply(
            CallPurpose::Task,
            MockReply::Response(ChatResponse {
                content: Some("done".into()),
                tool_calls: vec![ModelToolCall {
                    id: "t".into(),
                    name: "echo".into(),
                    arguments: serde_json::json!({"text": "x"}),
                }],
                usage: Usage::new(1, 1),
            }),
        );
        let req = ChatRequest::new(CallPurpose::Task, vec![Message::user("q")], DecodingParams::default());
        let stream = mock.call_stream(&req).await.unwrap();
        let collected = collect_stream(stream).await.unwrap();
        assert_eq!(collected.response.content_str(), "done");
        assert_eq!(collected.response.tool_calls[0].arguments["text"], "x");
    }
}
