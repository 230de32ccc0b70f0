//! Echo 工具：原样回显文本（内置，CLI 演示与测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolContext, ToolOutput, ToolParams};

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "ECHO"
    }

    fn description(&self) -> &str {
        "Echo text back to the user. Parameters: {\"text\": \"message\"}"
    }

    fn similes(&self) -> Vec<String> {
        vec!["REPEAT".to_string()]
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, params: &ToolParams, _ctx: &ToolContext) -> Result<ToolOutput, String> {
        let text = params.get_str("text").unwrap_or("(empty)");
        Ok(ToolOutput::text(text).with_values(serde_json::json!({ "echoed": text })))
    }
}
