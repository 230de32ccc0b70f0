//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithPrompt / ForceFinish / Abort。
//! 可在单次运行内恢复的错误（解析失败、工具失败）从不向上冒泡；只有 Timeout / Superseded / ConfigError 会到达调用方。

use std::time::Duration;

use thiserror::Error;

/// 运行过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// 整体处理超过墙钟预算
    #[error("Run timed out after {0:?}")]
    Timeout(Duration),

    /// 同一会话有更新的消息，本次结果被丢弃
    #[error("Run superseded by a newer message in conversation {conversation_id}")]
    Superseded { conversation_id: String },

    /// 缺少必需依赖等启动期错误
    #[error("Config error: {0}")]
    ConfigError(String),

    /// 多次尝试后仍无法解析模型输出
    #[error("Structured decode failed after {attempts} attempts: {last_error}")]
    DecodeFailure { attempts: u32, last_error: String },

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 模型请求了目录中不存在的动作
    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 对用户而言是否只是「无输出」，而不是错误
    pub fn is_silent(&self) -> bool {
        matches!(self, AgentError::Superseded { .. } | AgentError::Cancelled)
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将提示注入下一次尝试，让 LLM 重新按格式输出
    RetryWithPrompt(String),
    /// 结束 Step Loop，直接进入总结
    ForceFinish,
    /// 终止当前运行
    Abort,
}
