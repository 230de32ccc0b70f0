//! 工具参数：带标签的参数值类型
//!
//! 模型给出的 parameters 可能是 JSON 对象，也可能是「JSON 编码的字符串」。
//! normalize_parameters 在解码边界把两者统一成 ToolParams；格式错误只记日志并视为空参数。

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// 单个参数值
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<ParamValue>),
    Object(BTreeMap<String, ParamValue>),
}

impl From<Value> for ParamValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => ParamValue::Null,
            Value::Bool(b) => ParamValue::Bool(b),
            Value::Number(n) => ParamValue::Number(n),
            Value::String(s) => ParamValue::String(s),
            Value::Array(items) => ParamValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                ParamValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => n.as_f64(),
            ParamValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            ParamValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => Some(true),
                "false" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// 已规范化的参数表
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ToolParams(BTreeMap<String, ParamValue>);

impl ToolParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ParamValue::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<serde_json::Map<String, Value>> for ToolParams {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::String(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::String(s)
    }
}

/// 将模型给出的参数统一为 ToolParams
///
/// - 缺失 / null / 空字符串 -> 空参数
/// - 对象 -> 直接转换
/// - 字符串 -> 按 JSON 解析，结果须为对象
/// - 其他（数字、数组、格式错误的 JSON）-> warn 日志 + 空参数
pub fn normalize_parameters(raw: Option<&Value>) -> ToolParams {
    match raw {
        None | Some(Value::Null) => ToolParams::new(),
        Some(Value::Object(map)) => ToolParams::from(map.clone()),
        Some(Value::String(s)) => {
            let trimmed = strip_code_fence(s.trim());
            if trimmed.is_empty() {
                return ToolParams::new();
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(map)) => ToolParams::from(map),
                Ok(other) => {
                    tracing::warn!(parameters = %other, "Parameters JSON is not an object, ignoring");
                    ToolParams::new()
                }
                Err(e) => {
                    tracing::warn!(error = %e, raw = %trimmed, "Malformed parameters JSON, using empty parameters");
                    ToolParams::new()
                }
            }
        }
        Some(other) => {
            tracing::warn!(parameters = %other, "Unsupported parameters shape, ignoring");
            ToolParams::new()
        }
    }
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
