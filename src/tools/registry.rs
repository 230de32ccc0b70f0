//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / similes / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! 查找时对名称做规范化（忽略大小写与 `_` `-`），并支持别名（similes），模型写成 `get-price` 也能命中 `GET_PRICE`。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolParams;

/// 工具调用时的上下文（只读）
#[derive(Clone, Debug, Default)]
pub struct ToolContext {
    pub run_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub sender_id: String,
}

/// 工具执行成功的产出：文本 + 结构化值
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub values: Value,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            values: Value::Object(Default::default()),
        }
    }

    pub fn with_values(mut self, values: Value) -> Self {
        self.values = values;
        self
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、别名、参数 schema、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型输出中的 action 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 别名，同样可以命中该工具
    fn similes(&self) -> Vec<String> {
        Vec::new()
    }

    /// 参数 JSON Schema；`required` 中的键会在执行前校验
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> Result<ToolOutput, String>;
}

/// 工具目录中的一项（进入会话快照，拼入 prompt）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub similes: Vec<String>,
}

/// 名称规范化：大写，去掉 `_` `-` 与空白
pub fn normalize_action_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-') && !c.is_whitespace())
        .flat_map(|c| c.to_uppercase())
        .collect()
}

/// 工具注册表：按名称存储 Arc<dyn Tool>，另维护规范化名称/别名 -> 名称 的索引
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    index: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        for simile in tool.similes() {
            self.index
                .entry(normalize_action_name(&simile))
                .or_insert_with(|| name.clone());
        }
        // 正式名称优先于其他工具的别名
        self.index.insert(normalize_action_name(&name), name.clone());
        self.tools.insert(name, tool);
    }

    /// 按名称、规范化名称或别名查找
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if let Some(tool) = self.tools.get(name) {
            return Some(Arc::clone(tool));
        }
        self.index
            .get(&normalize_action_name(name))
            .and_then(|canonical| self.tools.get(canonical))
            .cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 工具目录（按名称排序，保证 prompt 稳定）
    pub fn catalog(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
                similes: t.similes(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
