//! LLM 层：后端抽象契约、重试包装、流式聚合、JSON 输出解析与 Mock

pub mod json;
pub mod message;
pub mod mock;
pub mod stream;
pub mod traits;

pub use json::{extract_json, parse_json_output};
pub use message::{Message, Role};
pub use mock::{MockLlmClient, MockReply};
pub use stream::{collect_stream, CollectedStream, ToolCallAccumulator};
pub use traits::{
    CallPurpose, ChatRequest, ChatResponse, ChunkStream, DecodingParams, LlmClient, LlmError,
    ModelToolCall, RetryConfig, RetryingLlmClient, StreamChunk, Usage,
};
