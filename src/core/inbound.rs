//! 入站消息：由传输层创建，核心只读

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 附件（图片、文件链接等）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// 平台级的提及 / 回复标记
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MentionContext {
    /// 消息 @ 了智能体
    pub is_mention: bool,
    /// 消息回复了智能体的某条消息
    pub is_reply: bool,
}

/// 一条待处理的用户消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// 来源标签（client_chat、discord、telegram ...）
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub mention: MentionContext,
    /// 一次性的 job 请求：不参与竞态抑制
    #[serde(default)]
    pub is_job: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            attachments: Vec::new(),
            source: None,
            mention: MentionContext::default(),
            is_job: false,
            received_at: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_mention(mut self, mention: MentionContext) -> Self {
        self.mention = mention;
        self
    }

    /// 标记为 job 请求
    pub fn as_job(mut self) -> Self {
        self.is_job = true;
        self
    }

    /// prompt 中的消息段落（附件逐行列出）
    pub fn to_prompt_section(&self) -> String {
        let mut s = format!("{}: {}", self.sender_id, self.text);
        for a in &self.attachments {
            s.push_str(&format!(
                "\n[attachment] {} ({})",
                a.title.as_deref().unwrap_or(&a.url),
                a.content_type.as_deref().unwrap_or("unknown")
            ));
        }
        s
    }
}
