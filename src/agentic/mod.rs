//! 智能体编排：Understand / Plan / Execute / Reflect 迭代循环与最终答案合成

pub mod events;
pub mod orchestrator;
pub mod planner;
pub mod reflect;
pub mod synthesize;
pub mod types;
pub mod understand;

pub use events::{EventSink, OrchestratorEvent, PlannedTask};
pub use orchestrator::{IterativeOrchestrator, OrchestratorConfig};
pub use planner::{PlanOutcome, PlanningContext, TaskPlanner};
pub use reflect::{ReflectPhase, Reflection, ReflectionSource};
pub use synthesize::{evidence_digest, AnswerSource, AnswerSynthesizer, Synthesis};
pub use types::{IterationSummary, OrchestratorResult, Query, RunStatus};
pub use understand::{Intent, UnderstandPhase};
