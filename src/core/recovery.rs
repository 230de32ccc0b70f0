//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction：解码器据此在下一次尝试里追加格式提示。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作（重试提示 / 强制结束 / 终止）
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// format_hint 为期望的输出格式示例，会原样拼入重试提示
    pub fn handle(&self, err: &AgentError, format_hint: &str) -> RecoveryAction {
        match err {
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous reply could not be parsed ({}). \
                Reply with ONLY the requested fields and nothing else, using this format:\n{}",
                truncate(raw, 200),
                format_hint
            )),
            AgentError::LlmError(_) => RecoveryAction::RetryWithPrompt(format!(
                "Please answer again using this format:\n{}",
                format_hint
            )),
            AgentError::DecodeFailure { .. } => RecoveryAction::ForceFinish,
            AgentError::Timeout(_) | AgentError::Cancelled | AgentError::Superseded { .. } => {
                RecoveryAction::Abort
            }
            AgentError::ConfigError(_) => RecoveryAction::Abort,
            AgentError::ToolExecutionFailed(_)
            | AgentError::ToolTimeout(_)
            | AgentError::HallucinatedTool(_) => RecoveryAction::ForceFinish,
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
