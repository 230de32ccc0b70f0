//! DeepSeek 预设（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 默认模型: deepseek-chat；可通过 llm.deepseek.model 覆盖
//!
//! API Key 取 `DEEPSEEK_API_KEY`，没有则退回 `OPENAI_API_KEY`；两者都没有属于启动期配置错误。

use std::time::Duration;

use crate::core::AgentError;
use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 读取 DeepSeek 可用的 API Key
pub fn deepseek_api_key() -> Option<String> {
    std::env::var("DEEPSEEK_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|k| !k.trim().is_empty())
}

/// 创建 DeepSeek 客户端；model 为 None 时用 deepseek-chat
pub fn create_deepseek_client(
    model: Option<&str>,
    request_timeout: Duration,
) -> Result<OpenAiClient, AgentError> {
    let api_key = deepseek_api_key().ok_or_else(|| {
        AgentError::ConfigError(
            "llm.provider = deepseek but neither DEEPSEEK_API_KEY nor OPENAI_API_KEY is set"
                .to_string(),
        )
    })?;
    let model = model.unwrap_or(DEEPSEEK_CHAT);
    Ok(OpenAiClient::new(
        Some(DEEPSEEK_BASE_URL),
        model,
        &api_key,
        request_timeout,
    ))
}
