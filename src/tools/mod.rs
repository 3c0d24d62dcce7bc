//! 工具层：封闭的 Tool 接口、按名注册表、带超时与审计的执行器、工具选择器

pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod selector;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};
pub use schema::{format_tools_prompt, selection_schema_json, SelectionFormat, ToolCall, ToolSchema};
pub use selector::{parse_selection, SelectionOutcome, ToolSelector, ToolSelectorConfig};
