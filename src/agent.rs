//! Headless 运行时装配
//!
//! 从 AppConfig 构建 LLM、工具执行器、快照存储与 RunSupervisor，供 CLI / HTTP 等传输层复用。
//! 缺少必需依赖（如非 mock 后端没有 API Key）在这里直接失败，而不是等到处理消息时。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{
    AgentError, Delivery, LifecycleSink, RunSupervisor, ShutdownManager,
};
use crate::llm::{create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{InMemorySnapshotStore, Persona};
use crate::react::RetryConfig;
use crate::tools::{EchoTool, ToolExecutor, ToolInvoker, ToolRegistry};

/// 按 llm.provider 创建客户端
pub fn create_llm_from_config(cfg: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
    let provider = cfg.llm.provider.trim().to_lowercase();
    let timeout = Duration::from_secs(cfg.llm.timeouts.request.max(1));

    match provider.as_str() {
        "deepseek" => {
            let model = cfg
                .llm
                .deepseek
                .model
                .clone()
                .unwrap_or_else(|| cfg.llm.model.clone());
            tracing::info!("Using DeepSeek LLM ({})", model);
            Ok(Arc::new(create_deepseek_client(Some(&model), timeout)?))
        }
        "openai" => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    AgentError::ConfigError("llm.provider = openai but OPENAI_API_KEY is not set".into())
                })?;
            let model = cfg
                .llm
                .openai
                .model
                .clone()
                .unwrap_or_else(|| "gpt-4o-mini".to_string());
            tracing::info!("Using OpenAI LLM ({})", model);
            Ok(Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &model,
                &api_key,
                timeout,
            )))
        }
        "mock" => {
            tracing::warn!("Using Mock LLM");
            Ok(Arc::new(MockLlmClient))
        }
        other => Err(AgentError::ConfigError(format!(
            "unknown llm.provider '{}' (expected deepseek, openai or mock)",
            other
        ))),
    }
}

/// 内置工具；具体业务动作由插件层注册
pub fn build_tool_registry() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    tools
}

pub fn default_persona(cfg: &AppConfig) -> Persona {
    let mut persona = Persona::new(
        cfg.app.agent_name.clone(),
        "You are a concise assistant for crypto and stock market questions. \
         Use the available actions to fetch data before answering.",
    );
    persona.bio = vec!["Never invent prices or balances.".to_string()];
    persona
}

/// 预构建的组件，可多会话共享
pub struct AgentComponents {
    pub config: AppConfig,
    pub llm: Arc<dyn LlmClient>,
    pub executor: Arc<ToolExecutor>,
    pub snapshots: Arc<InMemorySnapshotStore>,
    pub shutdown: ShutdownManager,
}

pub fn create_agent_components(config: AppConfig) -> Result<AgentComponents, AgentError> {
    let llm = create_llm_from_config(&config)?;
    let executor = Arc::new(ToolExecutor::new(
        build_tool_registry(),
        config.tools.tool_timeout_secs,
    ));
    let snapshots = Arc::new(InMemorySnapshotStore::new(
        default_persona(&config),
        executor.catalog(),
        config.orchestrator.recent_message_limit,
    ));
    Ok(AgentComponents {
        config,
        llm,
        executor,
        snapshots,
        shutdown: ShutdownManager::new(),
    })
}

impl AgentComponents {
    /// 用配置中的策略、重试、迭代上限与超时构建 RunSupervisor
    pub fn build_supervisor(
        &self,
        delivery: Arc<dyn Delivery>,
        lifecycle: Arc<dyn LifecycleSink>,
    ) -> Result<RunSupervisor, AgentError> {
        let cfg = &self.config;
        RunSupervisor::builder()
            .with_llm(self.llm.clone())
            .with_invoker(self.executor.clone())
            .with_snapshots(self.snapshots.clone())
            .with_delivery(delivery)
            .with_lifecycle(lifecycle)
            .with_shutdown(self.shutdown.clone())
            .with_policy(cfg.policy.clone())
            .with_agent(cfg.app.agent_id.clone(), cfg.app.agent_name.clone())
            .with_retry(RetryConfig::from_config(&cfg.orchestrator))
            .with_max_iterations(cfg.orchestrator.max_iterations)
            .with_run_timeout(cfg.orchestrator.run_timeout())
            .build()
    }
}
