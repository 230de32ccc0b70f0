//! 会话快照：最近消息、人设、可用工具目录
//!
//! SnapshotProvider 是编排核心依赖的外部边界：每轮 DECIDING 前后都会重新读取，
//! 因此实现必须廉价且可重复调用。InMemorySnapshotStore 为进程内实现（CLI / 测试使用）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::memory::ChatMessage;
use crate::tools::ToolSpec;

/// 会话所在频道类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Dm,
    VoiceDm,
    #[serde(rename = "self")]
    SelfChannel,
    Api,
    Group,
    VoiceGroup,
    Thread,
    Feed,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Dm => "dm",
            ChannelType::VoiceDm => "voice_dm",
            ChannelType::SelfChannel => "self",
            ChannelType::Api => "api",
            ChannelType::Group => "group",
            ChannelType::VoiceGroup => "voice_group",
            ChannelType::Thread => "thread",
            ChannelType::Feed => "feed",
        }
    }
}

impl std::str::FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dm" => Ok(ChannelType::Dm),
            "voice_dm" => Ok(ChannelType::VoiceDm),
            "self" => Ok(ChannelType::SelfChannel),
            "api" => Ok(ChannelType::Api),
            "group" => Ok(ChannelType::Group),
            "voice_group" => Ok(ChannelType::VoiceGroup),
            "thread" => Ok(ChannelType::Thread),
            "feed" => Ok(ChannelType::Feed),
            other => Err(format!("unknown channel type: {}", other)),
        }
    }
}

/// 智能体人设
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub bio: Vec<String>,
}

impl Persona {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            bio: Vec::new(),
        }
    }

    /// 人设段落，拼入所有 prompt 的开头
    pub fn to_prompt_section(&self) -> String {
        let mut s = format!("# About {}\n{}\n", self.name, self.system_prompt);
        for line in &self.bio {
            s.push_str(&format!("- {}\n", line));
        }
        s
    }
}

/// 某个会话在某一时刻的只读视图
#[derive(Clone, Debug)]
pub struct ConversationSnapshot {
    pub conversation_id: String,
    pub channel_type: ChannelType,
    pub persona: Persona,
    /// 最近消息，最旧在前
    pub recent_messages: Vec<ChatMessage>,
    /// 当前可用的工具目录（由插件/动作注册表提供）
    pub tools: Vec<ToolSpec>,
}

impl ConversationSnapshot {
    /// Available actions 段落：每行 `- NAME: description`
    pub fn tools_section(&self) -> String {
        if self.tools.is_empty() {
            return "(no actions available)".to_string();
        }
        self.tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 快照提供者：未知会话返回 None（调用方据此 fail closed）
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn get_snapshot(&self, conversation_id: &str) -> Option<ConversationSnapshot>;
}

struct Room {
    channel_type: ChannelType,
    messages: Vec<ChatMessage>,
}

/// 进程内快照存储：房间 + 最近消息（超出上限时丢弃最旧的）
pub struct InMemorySnapshotStore {
    persona: Persona,
    tools: Vec<ToolSpec>,
    rooms: RwLock<HashMap<String, Room>>,
    recent_limit: usize,
    reads: AtomicUsize,
}

impl InMemorySnapshotStore {
    pub fn new(persona: Persona, tools: Vec<ToolSpec>, recent_limit: usize) -> Self {
        Self {
            persona,
            tools,
            rooms: RwLock::new(HashMap::new()),
            recent_limit: recent_limit.max(1),
            reads: AtomicUsize::new(0),
        }
    }

    /// 注册会话（已存在则只更新频道类型）
    pub async fn open_room(&self, conversation_id: &str, channel_type: ChannelType) {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(conversation_id.to_string())
            .and_modify(|r| r.channel_type = channel_type)
            .or_insert_with(|| Room {
                channel_type,
                messages: Vec::new(),
            });
    }

    /// 追加一条消息；会话不存在时返回 false
    pub async fn record_message(&self, conversation_id: &str, message: ChatMessage) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(conversation_id) else {
            return false;
        };
        room.messages.push(message);
        if room.messages.len() > self.recent_limit {
            let excess = room.messages.len() - self.recent_limit;
            room.messages.drain(..excess);
        }
        true
    }

    /// 累计 get_snapshot 调用次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SnapshotProvider for InMemorySnapshotStore {
    async fn get_snapshot(&self, conversation_id: &str) -> Option<ConversationSnapshot> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let rooms = self.rooms.read().await;
        let room = rooms.get(conversation_id)?;
        Some(ConversationSnapshot {
            conversation_id: conversation_id.to_string(),
            channel_type: room.channel_type,
            persona: self.persona.clone(),
            recent_messages: room.messages.clone(),
            tools: self.tools.clone(),
        })
    }
}
