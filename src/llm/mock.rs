//! Mock LLM 客户端（无需 API）
//!
//! - MockLlmClient：按 prompt 类型给出固定格式的回复（分类 -> RESPOND；决策 -> 先 ECHO 再结束；总结 -> 回显），
//!   便于本地跑通完整流程。
//! - ScriptedLlmClient：按脚本返回，用于测试（记录调用次数与 prompt，可注入延迟）。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let goal = extract_goal(&prompt).unwrap_or("(no input)");

        if prompt.contains("RESPOND | IGNORE | STOP") {
            return Ok("<response><reasoning>mock</reasoning><action>RESPOND</action></response>"
                .to_string());
        }
        if prompt.contains("isFinish") {
            if prompt.contains("ECHO succeeded") {
                return Ok(r#"{"thought": "done", "isFinish": true}"#.to_string());
            }
            return Ok(serde_json::json!({
                "thought": "echo the request back",
                "action": "ECHO",
                "parameters": { "text": format!("Echo from Mock: {}", goal) },
                "isFinish": false
            })
            .to_string());
        }
        Ok(serde_json::json!({
            "thought": "summarize",
            "text": format!("Echo from Mock: {}", goal)
        })
        .to_string())
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

fn extract_goal(prompt: &str) -> Option<&str> {
    let start = prompt.find("## Current Goal\n")? + "## Current Goal\n".len();
    prompt[start..].lines().next().map(str::trim)
}

type Responder = Box<dyn Fn(&[Message], usize) -> Result<String, String> + Send + Sync>;

/// 脚本化客户端：每次调用把 (messages, 第几次调用) 交给 responder
pub struct ScriptedLlmClient {
    responder: Responder,
    delay: Option<Duration>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&[Message], usize) -> Result<String, String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(f),
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 依次返回 responses；用完后重复最后一条
    pub fn from_responses<S: Into<String>>(responses: Vec<S>) -> Self {
        let queue: VecDeque<String> = responses.into_iter().map(Into::into).collect();
        let queue = Mutex::new(queue);
        Self::from_fn(move |_, _| {
            let mut q = queue.lock().map_err(|e| e.to_string())?;
            match q.len() {
                0 => Err("script exhausted".to_string()),
                1 => Ok(q[0].clone()),
                _ => Ok(q.pop_front().unwrap_or_default()),
            }
        })
    }

    /// 总是返回同一段文本
    pub fn always(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::from_fn(move |_, _| Ok(text.clone()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的完整消息列表
    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// 每次调用中最后一条 User 消息的内容
    pub fn last_user_prompts(&self) -> Vec<String> {
        self.prompts()
            .iter()
            .filter_map(|msgs| {
                msgs.iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.clone())
            })
            .collect()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut p) = self.prompts.lock() {
            p.push(messages.to_vec());
        }
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        (self.responder)(messages, n)
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses_in_order_then_repeat_last() {
        let llm = ScriptedLlmClient::from_responses(vec!["a", "b"]);
        let msgs = [Message::user("hi")];
        assert_eq!(llm.complete(&msgs).await.unwrap(), "a");
        assert_eq!(llm.complete(&msgs).await.unwrap(), "b");
        assert_eq!(llm.complete(&msgs).await.unwrap(), "b");
        assert_eq!(llm.calls(), 3);
        assert_eq!(llm.last_user_prompts(), vec!["hi", "hi", "hi"]);
    }

    #[tokio::test]
    async fn test_mock_classifies_and_decides() {
        let llm = MockLlmClient;
        let classify = [Message::user("Answer with RESPOND | IGNORE | STOP")];
        assert!(llm.complete(&classify).await.unwrap().contains("RESPOND"));

        let decide = [Message::user("## Current Goal\nprice of BTC\n\nreply with isFinish")];
        let out = llm.complete(&decide).await.unwrap();
        assert!(out.contains("ECHO"));
        assert!(out.contains("price of BTC"));

        let done = [Message::user("ECHO succeeded: x\nreply with isFinish")];
        assert!(llm.complete(&done).await.unwrap().contains("\"isFinish\": true"));
    }
}
