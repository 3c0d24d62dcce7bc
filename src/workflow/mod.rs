//! 任务图：类型、依赖图（arena + index）、构建器与 DAG 执行器

pub mod builder;
pub mod executor;
pub mod graph;
pub mod types;

pub use builder::TaskGraphBuilder;
pub use executor::{AgenticExecutor, ExecutionInput, ExecutionReport, ExecutorConfig, REASONING_TOOL};
pub use graph::TaskGraph;
pub use types::{DependencyFailurePolicy, PlanningError, SubTaskResult, Task, TaskId, TaskKind, TaskState};
