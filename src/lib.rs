//! FinBee - 对话式金融智能体的消息编排核心
//!
//! 模块划分：
//! - **agent**: 从配置装配组件（LLM / 工具 / 快照 / RunSupervisor）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、竞态追踪、生命周期事件、回复策略、运行监管、优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: LLM 消息、会话快照、工作记忆
//! - **observability**: tracing 初始化
//! - **react**: 结构化解码、Step Loop、总结合成
//! - **tools**: Tool trait、注册表、执行器与参数规范化

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{AgentError, InboundMessage, RunResult, RunSupervisor};
