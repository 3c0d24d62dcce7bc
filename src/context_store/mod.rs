//! 工具输出上下文存储
//!
//! 工具输出按查询分组键持久化在稳定指针之后，后续迭代可直接复用而无需重跑工具；
//! select_relevant 控制交给答案合成的上下文规模。

pub mod backend;
pub mod file;
pub mod pointer;
pub mod relevance;
pub mod sqlite;
pub mod store;

pub use backend::{group_of, ContextBackend, InMemoryBackend};
pub use file::JsonFileBackend;
pub use pointer::{
    args_digest, normalize_args, normalize_query, query_group_key, ContextPointer, StoredToolOutput,
};
pub use relevance::{heuristic_select, tokenize_to_set};
pub use sqlite::SqliteBackend;
pub use store::ToolContextStore;
