//! Bee Agentic - Rust 智能体编排核心
//!
//! 模块划分：
//! - **agentic**: Understand / Plan / Execute / Reflect 迭代编排、事件与最终答案合成
//! - **config**: 应用配置加载（TOML + 环境变量）与校验
//! - **context_store**: 工具输出持久化（内存 / 文件 / SQLite）与相关性筛选
//! - **core**: 错误分类与恢复、阶段状态机、运行上下文与成本、并发调度、组件装配
//! - **evidence**: 证据信封、证据账本与引用校验
//! - **llm**: LLM 客户端抽象、流式聚合、重试包装与 Mock
//! - **observability**: tracing 初始化
//! - **tools**: 工具注册表、执行器与 ToolSelector
//! - **workflow**: 任务 DAG、拓扑批次与并行执行器

pub mod agentic;
pub mod config;
pub mod context_store;
pub mod core;
pub mod evidence;
pub mod llm;
pub mod observability;
pub mod tools;
pub mod workflow;

pub use agentic::{IterativeOrchestrator, OrchestratorEvent, OrchestratorResult, Query, RunStatus};
pub use config::{load_config, AppConfig};
pub use core::{AgentError, OrchestratorBuilder};
