//! 记忆层：LLM 消息、会话快照（最近消息 / 人设 / 工具目录）、单次运行的工作记忆

pub mod conversation;
pub mod snapshot;
pub mod working;

pub use conversation::{format_recent_messages, ChatMessage, Message, Role};
pub use snapshot::{
    ChannelType, ConversationSnapshot, InMemorySnapshotStore, Persona, SnapshotProvider,
};
pub use working::WorkingMemory;
