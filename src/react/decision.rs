//! 结构化输出类型：Step 决策、回复分类、总结
//!
//! 解码器先把模型原始输出抽取成扁平的键值表（JSON 对象或 `<key>value</key>` 标签），
//! 再交给各类型的 from_fields；缺少必需字段时返回 None，由解码器重试。

use serde::Serialize;
use serde_json::{Map, Value};

use crate::tools::{normalize_parameters, ToolParams};

/// 抽取后的扁平键值表
pub type Fields = Map<String, Value>;

/// 可由解码器产出的类型
pub trait StructuredOutput: Sized + Send {
    /// 必需字段：一次解析只有包含该字段才算成功
    const REQUIRED_FIELD: &'static str;

    /// 期望的输出格式示例，用于 prompt 与重试提示
    fn format_hint() -> &'static str;

    fn from_fields(fields: &Fields) -> Option<Self>;
}

/// DECIDING 阶段的一次决策
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDecision {
    pub thought: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub parameters: ToolParams,
    pub is_finish: bool,
}

impl StepDecision {
    /// 仅结束、不带动作的决策（强制结束时使用）
    pub fn finish(thought: impl Into<String>) -> Self {
        Self {
            thought: thought.into(),
            action: None,
            parameters: ToolParams::new(),
            is_finish: true,
        }
    }
}

impl StructuredOutput for StepDecision {
    const REQUIRED_FIELD: &'static str = "thought";

    fn format_hint() -> &'static str {
        r#"{"thought": "<reasoning>", "action": "<ACTION_NAME or omit>", "parameters": {"<key>": "<value>"}, "isFinish": false}"#
    }

    fn from_fields(fields: &Fields) -> Option<Self> {
        let thought = field_text(fields, "thought")?;
        let action = field_text(fields, "action").filter(|a| !is_null_action(a));
        let is_finish = field_bool(fields, "isFinish")
            .or_else(|| field_bool(fields, "is_finish"))
            .unwrap_or(false);
        Some(Self {
            thought,
            action,
            parameters: normalize_parameters(fields.get("parameters")),
            is_finish,
        })
    }
}

/// 回复分类结果
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseAction {
    Respond,
    Ignore,
    Stop,
}

/// LLM 兜底分类的输出
#[derive(Clone, Debug, Serialize)]
pub struct ResponseClassification {
    pub action: ResponseAction,
    pub reasoning: String,
}

impl StructuredOutput for ResponseClassification {
    const REQUIRED_FIELD: &'static str = "action";

    fn format_hint() -> &'static str {
        "<response>\n<reasoning>short reason</reasoning>\n<action>RESPOND | IGNORE | STOP</action>\n</response>"
    }

    /// 无法识别的取值按 IGNORE 处理：只有明确的 RESPOND 才会回复
    fn from_fields(fields: &Fields) -> Option<Self> {
        let raw = field_text(fields, "action")?;
        let action = match raw.trim().to_ascii_uppercase().as_str() {
            "RESPOND" => ResponseAction::Respond,
            "STOP" => ResponseAction::Stop,
            _ => ResponseAction::Ignore,
        };
        Some(Self {
            action,
            reasoning: field_text(fields, "reasoning").unwrap_or_default(),
        })
    }
}

/// 总结阶段的输出
#[derive(Clone, Debug, Serialize)]
pub struct SummaryOutput {
    pub text: String,
    pub thought: String,
}

impl StructuredOutput for SummaryOutput {
    const REQUIRED_FIELD: &'static str = "text";

    fn format_hint() -> &'static str {
        r#"{"thought": "<how you summarized>", "text": "<final reply to the user>"}"#
    }

    fn from_fields(fields: &Fields) -> Option<Self> {
        let text = field_text(fields, "text").filter(|t| !t.trim().is_empty())?;
        Some(Self {
            text,
            thought: field_text(fields, "thought").unwrap_or_default(),
        })
    }
}

/// 字段转文本：字符串原样返回，数字/布尔转字符串，null 与缺失为 None
pub fn field_text(fields: &Fields, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// 字段转布尔：兼容 "true"/"false"/"yes"/"no"/1/0
pub fn field_bool(fields: &Fields, key: &str) -> Option<bool> {
    match fields.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn is_null_action(action: &str) -> bool {
    let a = action.trim();
    a.is_empty() || a.eq_ignore_ascii_case("none") || a.eq_ignore_ascii_case("null")
}
