//! 编排器构建器：统一的组件装配逻辑
//!
//! 由 AppConfig 装配各阶段、持久化后端与工具执行器；build() 先校验配置，校验失败时不会发出任何模型调用。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agentic::{
    AnswerSynthesizer, IterativeOrchestrator, OrchestratorConfig, ReflectPhase, TaskPlanner,
    UnderstandPhase,
};
use crate::config::{load_config, AppConfig};
use crate::context_store::{
    ContextBackend, InMemoryBackend, JsonFileBackend, SqliteBackend, ToolContextStore,
};
use crate::core::{AgentError, RecoveryEngine};
use crate::llm::{LlmClient, RetryConfig, RetryingLlmClient};
use crate::tools::{Tool, ToolExecutor, ToolRegistry, ToolSelector, ToolSelectorConfig};
use crate::workflow::{AgenticExecutor, ExecutorConfig};

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    backend: Option<Arc<dyn ContextBackend>>,
    retry: Option<RetryConfig>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            config,
            llm,
            tools: ToolRegistry::new(),
            backend: None,
            retry: None,
        }
    }

    /// 从配置文件（及 BEE__* 环境变量）创建
    pub fn from_config_file(
        config_path: Option<PathBuf>,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Self, AgentError> {
        let config = load_config(config_path).map_err(|e| AgentError::ConfigError(e.to_string()))?;
        Ok(Self::new(config, llm))
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn register_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.register(tool);
        self
    }

    /// 使用调用方提供的持久化后端（忽略 [context_store].backend）
    pub fn with_backend(mut self, backend: Arc<dyn ContextBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// 覆盖 [llm.retry] 的重试配置
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 按 [context_store] 创建后端
    pub fn build_backend(&self) -> Result<Arc<dyn ContextBackend>, AgentError> {
        if let Some(backend) = &self.backend {
            return Ok(backend.clone());
        }
        let section = &self.config.context_store;
        let missing_path =
            || AgentError::ConfigError(format!("context_store.path is required for the {} backend", section.backend));
        match section.backend.to_lowercase().as_str() {
            "memory" => Ok(Arc::new(InMemoryBackend::new())),
            "file" => {
                let path = section.path.as_ref().ok_or_else(missing_path)?;
                Ok(Arc::new(JsonFileBackend::new(path)))
            }
            "sqlite" => {
                let path = section.path.as_ref().ok_or_else(missing_path)?;
                let backend = SqliteBackend::open(path)
                    .map_err(|e| AgentError::ContextStore(format!("open {}: {e}", path.display())))?;
                Ok(Arc::new(backend))
            }
            other => Err(AgentError::ConfigError(format!(
                "unknown context_store.backend '{other}'"
            ))),
        }
    }

    pub fn build(self) -> Result<IterativeOrchestrator, AgentError> {
        self.config.validate()?;
        let cfg = &self.config;

        let retry = self.retry.clone().unwrap_or_else(|| cfg.retry_config());
        // UnderstandPhase 与 ToolSelector 通过 RecoveryEngine 自行决定重试 / 回退，使用未包装的客户端
        let raw_llm = self.llm.clone();
        let llm: Arc<dyn LlmClient> = Arc::new(RetryingLlmClient::new(raw_llm.clone(), retry.clone()));
        let recovery = RecoveryEngine::new(retry);
        let timeout = cfg.request_timeout();
        let model = Some(cfg.llm.model.clone());

        let mut store = ToolContextStore::new(self.build_backend()?)
            .with_max_relevant(cfg.context_store.max_relevant);
        if let Some(relevance_model) = &cfg.context_store.relevance_model {
            store = store.with_relevance_model(llm.clone(), Some(relevance_model.clone()), timeout);
        }
        let store = Arc::new(store);

        let selector = Arc::new(
            ToolSelector::new(
                raw_llm.clone(),
                ToolSelectorConfig {
                    model: cfg.tool_selector.model.clone(),
                    fallback_model: cfg.tool_selector.fallback_model.clone(),
                    max_calls: cfg.tool_selector.max_calls,
                    timeout: Duration::from_secs(cfg.tool_selector.timeout_secs),
                    temperature: cfg.tool_selector.temperature,
                    fail_closed: cfg.tool_selector.fail_closed,
                },
            )
            .with_recovery(recovery.clone()),
        );
        let tools = ToolExecutor::new(
            Arc::new(self.tools.clone()),
            Duration::from_secs(cfg.executor.tool_timeout_secs),
        );
        let executor = AgenticExecutor::new(
            llm.clone(),
            selector,
            tools,
            store.clone(),
            ExecutorConfig {
                max_concurrent_tasks: cfg.executor.max_concurrent_tasks,
                max_concurrent_tools: cfg.executor.max_concurrent_tools,
                on_dependency_failure: cfg.dependency_policy()?,
                reuse_cached_results: cfg.executor.reuse_cached_results,
                reasoning_model: model.clone(),
                reasoning_timeout: timeout,
                ..ExecutorConfig::default()
            },
        );

        tracing::info!(
            model = %cfg.llm.model,
            selector_model = %cfg.tool_selector.model,
            fallback_model = ?cfg.tool_selector.fallback_model,
            backend = %cfg.context_store.backend,
            tools = self.tools.tool_names().len(),
            "orchestrator assembled"
        );

        Ok(IterativeOrchestrator::new(
            UnderstandPhase::new(raw_llm, model.clone(), timeout).with_recovery(recovery),
            TaskPlanner::new(llm.clone(), model.clone(), timeout, cfg.planner.max_tasks),
            executor,
            ReflectPhase::new(llm.clone(), model.clone(), timeout),
            AnswerSynthesizer::new(llm, store, model, timeout),
            OrchestratorConfig {
                max_iterations: cfg.orchestrator.max_iterations,
                run_timeout: cfg.orchestrator.run_timeout_secs.map(Duration::from_secs),
                escalate_selection_exhaustion: cfg.orchestrator.escalate_selection_exhaustion,
                cost_rates: cfg.cost_rates(),
            },
        ))
    }
}
