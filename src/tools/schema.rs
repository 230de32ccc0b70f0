//! 决策格式 JSON Schema 生成（schemars）
//!
//! 将「合法 StepDecision」的结构注入 DECIDING prompt，减少 LLM 输出格式错误。

use schemars::{schema_for, JsonSchema};
use std::collections::HashMap;

/// DECIDING 阶段的输出格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct StepDecisionFormat {
    /// 对下一步的简短推理
    pub thought: String,
    /// 要执行的动作名（取自 Available actions）；结束时可省略
    pub action: Option<String>,
    /// 动作参数，依动作不同而不同（symbol、amount、address 等）
    pub parameters: Option<HashMap<String, serde_json::Value>>,
    /// 任务已完成、无需再调用动作时为 true
    #[schemars(rename = "isFinish")]
    pub is_finish: bool,
}

/// 返回 StepDecision 的 JSON Schema 字符串，可拼入 prompt
pub fn decision_schema_json() -> String {
    let schema = schema_for!(StepDecisionFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mentions_fields() {
        let s = decision_schema_json();
        assert!(s.contains("thought"));
        assert!(s.contains("isFinish"));
        assert!(s.contains("parameters"));
    }
}
