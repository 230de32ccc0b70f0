//! LLM 客户端抽象
//!
//! 编排核心只依赖一种调用形态：complete(messages) -> 原始文本。模型被视为黑盒，
//! 结构化解析与重试由 react::decoder 负责。

use async_trait::async_trait;

use crate::memory::Message;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成；Err 为传输层或服务端错误描述
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }

    /// 日志中展示的模型名
    fn model_name(&self) -> &str {
        "unknown"
    }
}
