//! 中期记忆：单次运行内的工作记忆
//!
//! 只在一次 Step Loop 内有效：记录目标与每一步的结果（step_<n> -> {action, success, result}），
//! 拼入下一轮 DECIDING prompt，减少重复调用同一工具。

use std::collections::BTreeMap;

use serde_json::Value;

#[derive(Clone, Debug, Default)]
pub struct WorkingMemory {
    pub goal: Option<String>,
    entries: BTreeMap<String, Value>,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_goal(&mut self, goal: impl Into<String>) {
        self.goal = Some(goal.into());
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// 记录第 step 步的结果；step 从 1 开始，键按数字补零以保证 BTreeMap 顺序与执行顺序一致
    pub fn record_step(&mut self, step: usize, action: &str, success: bool, result: &str) {
        self.insert(
            format!("step_{:03}", step),
            serde_json::json!({
                "action": action,
                "success": success,
                "result": result,
            }),
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.goal = None;
        self.entries.clear();
    }

    /// 构建供 DECIDING 使用的 Prompt 片段（Current Goal / Working Memory）
    pub fn to_prompt_section(&self) -> String {
        let mut s = String::new();
        if let Some(goal) = &self.goal {
            s.push_str(&format!("## Current Goal\n{}\n\n", goal));
        }
        if !self.entries.is_empty() {
            s.push_str("## Working Memory\n");
            for (k, v) in &self.entries {
                s.push_str(&format!("- {}: {}\n", k, v));
            }
            s.push('\n');
        }
        s
    }
}
