//! 核心层：错误与恢复、状态机、运行上下文、并发调度、组件装配

pub mod builder;
pub mod error;
pub mod recovery;
pub mod run_context;
pub mod state;
pub mod task_scheduler;

pub use builder::OrchestratorBuilder;
pub use error::{AgentError, ErrorKind};
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use run_context::{CostRates, CostTracker, RunContext, RunCost};
pub use state::{IterationState, OrchestratorPhase, PhaseMachine};
pub use task_scheduler::TaskScheduler;
