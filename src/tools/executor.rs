//! 工具执行器（ToolInvoker 的默认实现）
//!
//! 持有 ToolRegistry 与全局超时：invoke(action, params) 先校验动作存在与必填参数，再在超时内执行。
//! 任何失败（未知动作 / 参数缺失 / 工具报错 / 超时）都转成 success=false 的 ActionOutcome，从不返回 Err；
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::{ToolContext, ToolOutput, ToolParams, ToolRegistry, ToolSpec};

/// 一次动作调用的结果（进入 ActionTrace）
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub action_name: String,
    pub success: bool,
    pub result_text: String,
    pub values: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ActionOutcome {
    pub fn succeeded(action_name: impl Into<String>, output: ToolOutput, duration_ms: u64) -> Self {
        Self {
            action_name: action_name.into(),
            success: true,
            result_text: output.text,
            values: output.values,
            error: None,
            duration_ms,
        }
    }

    pub fn failed(action_name: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            action_name: action_name.into(),
            success: false,
            result_text: String::new(),
            values: Value::Object(Default::default()),
            error: Some(error.into()),
            duration_ms,
        }
    }

    /// prompt 中的一行摘要
    pub fn to_prompt_line(&self) -> String {
        if self.success {
            format!("{} succeeded: {}", self.action_name, self.result_text)
        } else {
            format!(
                "{} failed: {}",
                self.action_name,
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

/// 编排核心对工具层的唯一依赖：目录 + 调用（永不返回 Err）
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    fn catalog(&self) -> Vec<ToolSpec>;

    async fn invoke(&self, action_name: &str, params: ToolParams, ctx: &ToolContext) -> ActionOutcome;
}

/// 工具执行器：对每次调用施加超时，并将结果映射为 ActionOutcome
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self::with_timeout(registry, Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    async fn run(
        &self,
        action_name: &str,
        params: &ToolParams,
        ctx: &ToolContext,
    ) -> Result<(String, ToolOutput), AgentError> {
        let tool = self
            .registry
            .resolve(action_name)
            .ok_or_else(|| AgentError::HallucinatedTool(action_name.to_string()))?;
        let name = tool.name().to_string();

        check_required(&tool.parameters_schema(), params)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("{name}: {e}")))?;

        match timeout(self.timeout, tool.execute(params, ctx)).await {
            Ok(Ok(output)) => Ok((name, output)),
            Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(e)),
            Err(_) => Err(AgentError::ToolTimeout(name)),
        }
    }
}

#[async_trait]
impl ToolInvoker for ToolExecutor {
    fn catalog(&self) -> Vec<ToolSpec> {
        self.registry.catalog()
    }

    async fn invoke(&self, action_name: &str, params: ToolParams, ctx: &ToolContext) -> ActionOutcome {
        let start = Instant::now();
        let args_preview = args_preview(&params.to_json());
        let result = self.run(action_name, &params, ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(_) => (true, "ok"),
            Err(AgentError::ToolTimeout(_)) => (false, "timeout"),
            Err(AgentError::HallucinatedTool(_)) => (false, "unknown_action"),
            Err(_) => (false, "error"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "run_id": ctx.run_id,
            "tool": action_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok((name, output)) => ActionOutcome::succeeded(name, output, duration_ms),
            Err(AgentError::HallucinatedTool(name)) => ActionOutcome::failed(
                name.clone(),
                format!("Action {name} is not available"),
                duration_ms,
            ),
            Err(e) => ActionOutcome::failed(action_name, e.to_string(), duration_ms),
        }
    }
}

/// 校验 schema 中 `required` 列出的参数都已提供
fn check_required(schema: &Value, params: &ToolParams) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    let missing: Vec<&str> = required
        .iter()
        .filter_map(Value::as_str)
        .filter(|k| !params.contains_key(k))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("missing required parameter(s): {}", missing.join(", ")))
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
