//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__TOOL_SELECTOR__MAX_CALLS=3`）。
//! 各段缺省时使用内置默认值；`validate()` 在任何模型调用之前执行。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{AgentError, CostRates};
use crate::llm::RetryConfig;
use crate::workflow::DependencyFailurePolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub planner: PlannerSection,
    pub tool_selector: ToolSelectorSection,
    pub executor: ExecutorSection,
    pub context_store: ContextStoreSection,
    pub cost: CostSection,
}

/// [llm] 段：主模型、单次请求超时、瞬时错误重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub request_timeout_secs: u64,
    pub retry: RetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            request_timeout_secs: 60,
            retry: RetrySection::default(),
        }
    }
}

/// [llm.retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// 总尝试次数（含首次）
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            multiplier: 2.0,
        }
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_iterations: usize,
    /// 整次运行的墙钟预算（秒），未设置则不限
    pub run_timeout_secs: Option<u64>,
    pub escalate_selection_exhaustion: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            run_timeout_secs: None,
            escalate_selection_exhaustion: true,
        }
    }
}

/// [planner] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    /// 单轮计划的任务数上限
    pub max_tasks: usize,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self { max_tasks: 5 }
    }
}

/// [tool_selector] 段：选择模型、备用模型、调用数上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolSelectorSection {
    pub model: String,
    pub fallback_model: Option<String>,
    pub max_calls: usize,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub fail_closed: bool,
}

impl Default for ToolSelectorSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            fallback_model: None,
            max_calls: 5,
            timeout_secs: 30,
            temperature: 0.0,
            fail_closed: true,
        }
    }
}

/// [executor] 段：并发上限、工具超时、依赖失败策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub max_concurrent_tasks: usize,
    pub max_concurrent_tools: usize,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// skip / proceed
    pub on_dependency_failure: String,
    pub reuse_cached_results: bool,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            max_concurrent_tools: 4,
            tool_timeout_secs: 30,
            on_dependency_failure: "skip".to_string(),
            reuse_cached_results: true,
        }
    }
}

/// [context_store] 段：持久化后端与相关性筛选
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextStoreSection {
    /// memory / file / sqlite
    pub backend: String,
    /// file 后端为目录，sqlite 后端为数据库文件
    pub path: Option<PathBuf>,
    pub max_relevant: usize,
    /// 未设置时只用启发式筛选
    pub relevance_model: Option<String>,
}

impl Default for ContextStoreSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: None,
            max_relevant: 8,
            relevance_model: None,
        }
    }
}

/// [cost] 段：每千 token 单价（美元）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CostSection {
    pub prompt_usd_per_1k: f64,
    pub completion_usd_per_1k: f64,
}

const KNOWN_BACKENDS: [&str; 3] = ["memory", "file", "sqlite"];

impl AppConfig {
    /// 运行前校验；任何一项不满足都视为致命配置错误
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.llm.model.trim().is_empty() {
            return Err(AgentError::ConfigError("llm.model must be set".into()));
        }
        if self.tool_selector.model.trim().is_empty() {
            return Err(AgentError::ConfigError("tool_selector.model must be set".into()));
        }
        if self.orchestrator.max_iterations == 0 {
            return Err(AgentError::ConfigError(
                "orchestrator.max_iterations must be at least 1".into(),
            ));
        }
        if self.tool_selector.max_calls == 0 {
            return Err(AgentError::ConfigError(
                "tool_selector.max_calls must be at least 1".into(),
            ));
        }
        if self.executor.max_concurrent_tasks == 0 || self.executor.max_concurrent_tools == 0 {
            return Err(AgentError::ConfigError(
                "executor concurrency limits must be at least 1".into(),
            ));
        }
        self.dependency_policy()?;

        let backend = self.context_store.backend.to_lowercase();
        if !KNOWN_BACKENDS.contains(&backend.as_str()) {
            return Err(AgentError::ConfigError(format!(
                "unknown context_store.backend '{}'",
                self.context_store.backend
            )));
        }
        if backend != "memory" && self.context_store.path.is_none() {
            return Err(AgentError::ConfigError(format!(
                "context_store.path is required for the {backend} backend"
            )));
        }

        if self.tool_selector.model == self.llm.model {
            tracing::warn!(
                model = %self.llm.model,
                "tool selector uses the main model; a smaller model is usually cheaper"
            );
        }
        Ok(())
    }

    pub fn dependency_policy(&self) -> Result<DependencyFailurePolicy, AgentError> {
        self.executor
            .on_dependency_failure
            .parse()
            .map_err(AgentError::ConfigError)
    }

    pub fn retry_config(&self) -> RetryConfig {
        let r = &self.llm.retry;
        RetryConfig {
            max_attempts: r.max_attempts.max(1),
            initial_backoff: Duration::from_millis(r.initial_backoff_ms),
            max_backoff: Duration::from_millis(r.max_backoff_ms),
            multiplier: r.multiplier,
        }
    }

    pub fn cost_rates(&self) -> CostRates {
        CostRates {
            prompt_usd_per_1k: self.cost.prompt_usd_per_1k,
            completion_usd_per_1k: self.cost.completion_usd_per_1k,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.request_timeout_secs)
    }
}

/// 从 config 目录加载配置，环境变量 BEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(text: &str) -> AppConfig {
        config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.max_iterations, 3);
        assert_eq!(cfg.tool_selector.max_calls, 5);
        assert!(cfg.tool_selector.fail_closed);
        assert_eq!(cfg.context_store.max_relevant, 8);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let cfg = from_toml(
            r#"
            [tool_selector]
            model = "small"
            fallback_model = "medium"
            max_calls = 2

            [executor]
            on_dependency_failure = "proceed"
            "#,
        );
        assert_eq!(cfg.tool_selector.model, "small");
        assert_eq!(cfg.tool_selector.fallback_model.as_deref(), Some("medium"));
        assert_eq!(cfg.tool_selector.max_calls, 2);
        assert_eq!(cfg.tool_selector.timeout_secs, 30);
        assert_eq!(cfg.executor.max_concurrent_tasks, 4);
        assert_eq!(cfg.dependency_policy().unwrap(), DependencyFailurePolicy::Proceed);
        assert_eq!(cfg.llm.model, "gpt-4o");
    }

    #[test]
    fn test_validation_rejects_fatal_settings() {
        let mut cfg = AppConfig::default();
        cfg.tool_selector.model = " ".into();
        assert!(matches!(cfg.validate(), Err(AgentError::ConfigError(_))));

        let mut cfg = AppConfig::default();
        cfg.orchestrator.max_iterations = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.executor.max_concurrent_tools = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.executor.on_dependency_failure = "retry".into();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.context_store.backend = "sqlite".into();
        assert!(cfg.validate().is_err());
        cfg.context_store.path = Some(PathBuf::from("ctx.db"));
        assert!(cfg.validate().is_ok());

        let mut cfg = AppConfig::default();
        cfg.context_store.backend = "redis".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_explicit_file_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bee.toml");
        std::fs::write(&path, "[orchestrator]\nmax_iterations = 7\n").unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.orchestrator.max_iterations, 7);
    }
}
