//! Structured Decoder：把模型的自由文本解析成类型化记录
//!
//! 每次尝试：调用 LLM -> 抽取键值候选（JSON 对象 / ```json 代码块 / `<key>value</key>` 标签）->
//! 第一个含必需字段且能构造目标类型的候选胜出。失败时按指数退避（base * multiplier^(n-1)，封顶 max_delay）
//! 真实 sleep 后重试，并在下一次尝试里追加 RecoveryEngine 给出的格式提示。
//! 达到 max_attempts 后返回 DecodeFailure，由调用方转为强制结束，不会 panic。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::react::decision::{Fields, StructuredOutput};

/// 重试与退避参数
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn from_config(cfg: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: cfg.max_parse_retries.max(1),
            base: Duration::from_millis(cfg.retry_base_ms),
            multiplier: cfg.retry_multiplier,
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
        }
    }

    /// 第 attempt 次（从 1 开始）失败后、下一次尝试前的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let ms = (self.base.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }
}

/// 解码器：LLM + 重试策略 + 恢复引擎
pub struct StructuredDecoder {
    llm: Arc<dyn LlmClient>,
    retry: RetryConfig,
    recovery: RecoveryEngine,
}

impl StructuredDecoder {
    pub fn new(llm: Arc<dyn LlmClient>, retry: RetryConfig) -> Self {
        Self {
            llm,
            retry,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// 单条 user prompt 的便捷形式
    pub async fn decode_prompt<T: StructuredOutput>(
        &self,
        system: &str,
        prompt: &str,
    ) -> Result<T, AgentError> {
        self.decode(vec![Message::system(system), Message::user(prompt)])
            .await
    }

    /// 解析成功立即返回；否则最多尝试 max_attempts 次
    pub async fn decode<T: StructuredOutput>(&self, messages: Vec<Message>) -> Result<T, AgentError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut request = messages.clone();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let err = match self.llm.complete(&request).await {
                Ok(raw) => match parse_output::<T>(&raw) {
                    Ok(value) => {
                        debug!(attempt, field = T::REQUIRED_FIELD, "Structured output decoded");
                        return Ok(value);
                    }
                    Err(e) => e,
                },
                Err(e) => AgentError::LlmError(e),
            };

            warn!(
                attempt,
                max_attempts,
                model = self.llm.model_name(),
                error = %err,
                "Structured decode attempt failed"
            );
            last_error = err.to_string();
            if attempt == max_attempts {
                break;
            }

            // 每次只保留最近一次的纠正提示
            request = messages.clone();
            if let RecoveryAction::RetryWithPrompt(hint) = self.recovery.handle(&err, T::format_hint()) {
                request.push(Message::user(hint));
            }
            tokio::time::sleep(self.retry.delay_for(attempt)).await;
        }

        Err(AgentError::DecodeFailure {
            attempts: max_attempts,
            last_error,
        })
    }
}

/// 从原始输出构造 T：依次尝试各个候选键值表
pub fn parse_output<T: StructuredOutput>(raw: &str) -> Result<T, AgentError> {
    let candidates = extract_key_values(raw);
    if candidates.is_empty() {
        return Err(AgentError::JsonParseError(format!(
            "no key-value block found in: {}",
            raw.trim()
        )));
    }
    candidates
        .iter()
        .filter(|fields| fields.contains_key(T::REQUIRED_FIELD))
        .find_map(T::from_fields)
        .ok_or_else(|| {
            AgentError::JsonParseError(format!(
                "missing or invalid required field '{}' in: {}",
                T::REQUIRED_FIELD,
                raw.trim()
            ))
        })
}

/// 按优先级抽取候选键值表：```json 代码块 > 裸 JSON 对象 > 标签块
pub fn extract_key_values(raw: &str) -> Vec<Fields> {
    let trimmed = raw.trim();
    let mut candidates = Vec::new();

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let block = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        if let Some(fields) = parse_json_object(block) {
            candidates.push(fields);
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Some(fields) = parse_json_object(&trimmed[start..=end]) {
                candidates.push(fields);
            }
        }
    }
    if let Some(fields) = parse_tag_block(trimmed) {
        candidates.push(fields);
    }
    candidates
}

fn parse_json_object(s: &str) -> Option<Fields> {
    match serde_json::from_str::<Value>(s.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

static OPEN_TAG_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// `<key>value</key>` 标签；可被 `<response>` 包裹；同名键以第一次出现为准
fn parse_tag_block(raw: &str) -> Option<Fields> {
    let re = OPEN_TAG_RE
        .get_or_init(|| Regex::new(r"<([A-Za-z_][A-Za-z0-9_]*)>").ok())
        .as_ref()?;

    let body = match (raw.find("<response>"), raw.rfind("</response>")) {
        (Some(start), Some(end)) if start < end => &raw[start + "<response>".len()..end],
        _ => raw,
    };

    let mut fields = Fields::new();
    let mut rest = body;
    while let Some(caps) = re.captures(rest) {
        let (Some(open), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let name = name.as_str();
        let after = &rest[open.end()..];
        let close = format!("</{}>", name);
        match after.find(&close) {
            Some(end) => {
                fields
                    .entry(name.to_string())
                    .or_insert_with(|| Value::String(after[..end].trim().to_string()));
                rest = &after[end + close.len()..];
            }
            None => rest = after,
        }
    }

    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::react::decision::{ResponseAction, ResponseClassification, StepDecision, SummaryOutput};

    fn decoder(llm: Arc<ScriptedLlmClient>) -> StructuredDecoder {
        StructuredDecoder::new(llm, RetryConfig::default())
    }

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for(3), Duration::from_secs(4));
        assert_eq!(retry.delay_for(4), Duration::from_secs(8));
        assert_eq!(retry.delay_for(5), Duration::from_secs(10));
        let mut previous = Duration::ZERO;
        for attempt in 1..=40 {
            let d = retry.delay_for(attempt);
            assert!(d >= previous);
            assert!(d <= retry.max_delay);
            previous = d;
        }
    }

    #[test]
    fn test_extract_fenced_json() {
        let raw = "Sure!\n```json\n{\"thought\": \"t\", \"isFinish\": true}\n```";
        let c = extract_key_values(raw);
        assert_eq!(c[0]["thought"], "t");
        let d: StepDecision = parse_output(raw).unwrap();
        assert!(d.is_finish);
    }

    #[test]
    fn test_extract_tag_block() {
        let raw = "<response>\n<reasoning>asked directly</reasoning>\n<action>RESPOND</action>\n</response>";
        let c: ResponseClassification = parse_output(raw).unwrap();
        assert_eq!(c.action, ResponseAction::Respond);
        assert_eq!(c.reasoning, "asked directly");
    }

    #[test]
    fn test_json_without_required_field_falls_back_to_tags() {
        let raw = r#"{"note": "x"} <text>BTC is 60k</text>"#;
        let s: SummaryOutput = parse_output(raw).unwrap();
        assert_eq!(s.text, "BTC is 60k");
    }

    #[test]
    fn test_unparseable_is_json_parse_error() {
        let err = parse_output::<SummaryOutput>("I cannot help with that").unwrap_err();
        assert!(matches!(err, AgentError::JsonParseError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_output_uses_single_attempt() {
        let llm = Arc::new(ScriptedLlmClient::always(r#"{"thought": "t", "text": "hello"}"#));
        let out: SummaryOutput = decoder(llm.clone())
            .decode_prompt("sys", "summarize")
            .await
            .unwrap();
        assert_eq!(out.text, "hello");
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_exhausts_attempts_with_backoff() {
        let llm = Arc::new(ScriptedLlmClient::always("not structured at all"));
        let start = tokio::time::Instant::now();
        let err = decoder(llm.clone())
            .decode_prompt::<SummaryOutput>("sys", "summarize")
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert_eq!(llm.calls(), 5);
        match err {
            AgentError::DecodeFailure { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("expected DecodeFailure, got {:?}", other),
        }
        // 1 + 2 + 4 + 8 秒
        assert!(elapsed >= Duration::from_secs(15));
        assert!(elapsed < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_appends_format_hint() {
        let llm = Arc::new(ScriptedLlmClient::from_responses(vec![
            "garbage",
            r#"{"text": "ok"}"#,
        ]));
        let out: SummaryOutput = decoder(llm.clone())
            .decode_prompt("sys", "summarize")
            .await
            .unwrap();
        assert_eq!(out.text, "ok");
        assert_eq!(llm.calls(), 2);
        let prompts = llm.last_user_prompts();
        assert_eq!(prompts[0], "summarize");
        assert!(prompts[1].contains("could not be parsed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_error_is_retried() {
        let llm = Arc::new(ScriptedLlmClient::from_fn(|_, n| {
            if n == 0 {
                Err("503 Service Unavailable".to_string())
            } else {
                Ok(r#"{"thought": "t", "isFinish": true}"#.to_string())
            }
        }));
        let d: StepDecision = decoder(llm.clone()).decode_prompt("sys", "decide").await.unwrap();
        assert!(d.is_finish);
        assert_eq!(llm.calls(), 2);
    }
}
