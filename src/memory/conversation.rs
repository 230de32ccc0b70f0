//! LLM 消息与会话内的聊天记录
//!
//! Message/Role 与 LLM API 对齐；ChatMessage 是快照中「最近消息」的一条记录（谁说了什么、何时）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 发往 LLM 的单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 会话中的一条历史消息（由快照提供者维护）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    /// 渲染为 prompt 中的一行：`name: text`
    pub fn to_prompt_line(&self) -> String {
        format!("{}: {}", self.sender_name, self.text)
    }
}

/// 将最近消息渲染为 prompt 段落（最旧在前）
pub fn format_recent_messages(messages: &[ChatMessage]) -> String {
    if messages.is_empty() {
        return "(no previous messages)".to_string();
    }
    messages
        .iter()
        .map(ChatMessage::to_prompt_line)
        .collect::<Vec<_>>()
        .join("\n")
}
