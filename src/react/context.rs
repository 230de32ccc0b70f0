//! 单次运行的上下文：快照 + 工作记忆 + 动作轨迹
//!
//! RunContext 只属于一次 Step Loop 调用，不跨会话共享；ActionTrace 只追加不修改。

use serde::Serialize;

use crate::core::InboundMessage;
use crate::memory::{format_recent_messages, ConversationSnapshot, WorkingMemory};
use crate::tools::{decision_schema_json, ActionOutcome};

/// 本次运行执行过的动作，按执行顺序
#[derive(Clone, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct ActionTrace(Vec<ActionOutcome>);

impl ActionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, outcome: ActionOutcome) {
        self.0.push(outcome);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn outcomes(&self) -> &[ActionOutcome] {
        &self.0
    }

    pub fn last(&self) -> Option<&ActionOutcome> {
        self.0.last()
    }

    pub fn succeeded(&self) -> usize {
        self.0.iter().filter(|o| o.success).count()
    }

    /// `## Actions Taken` 段落；没有动作时为空串
    pub fn to_prompt_section(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let mut s = String::from("## Actions Taken\n");
        for (i, outcome) in self.0.iter().enumerate() {
            s.push_str(&format!("{}. {}\n", i + 1, outcome.to_prompt_line()));
        }
        s.push('\n');
        s
    }
}

/// Step Loop 的可变累加器
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub message: InboundMessage,
    pub snapshot: ConversationSnapshot,
    pub working: WorkingMemory,
    pub trace: ActionTrace,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, message: InboundMessage, snapshot: ConversationSnapshot) -> Self {
        let mut working = WorkingMemory::new();
        working.set_goal(message.text.clone());
        Self {
            run_id: run_id.into(),
            message,
            snapshot,
            working,
            trace: ActionTrace::new(),
        }
    }

    /// 记录一次动作结果：追加到轨迹并写入工作记忆
    pub fn record(&mut self, outcome: ActionOutcome) {
        let step = self.trace.len() + 1;
        let result = if outcome.success {
            outcome.result_text.as_str()
        } else {
            outcome.error.as_deref().unwrap_or("unknown error")
        };
        self.working
            .record_step(step, &outcome.action_name, outcome.success, result);
        self.trace.push(outcome);
    }

    /// REFRESHING：整体替换为重新读取的快照
    pub fn refresh(&mut self, snapshot: ConversationSnapshot) {
        self.snapshot = snapshot;
    }

    /// DECIDING 的 system prompt：人设
    pub fn system_prompt(&self) -> String {
        self.snapshot.persona.to_prompt_section()
    }

    /// DECIDING 的 user prompt
    pub fn decision_prompt(&self, step: usize, max_iterations: usize) -> String {
        format!(
            "# Conversation ({channel})\n{recent}\n\n\
             # Current Message\n{message}\n\n\
             # Available Actions\n{tools}\n\n\
             {working}{trace}\
             # Task\n\
             You are at step {step} of at most {max}. Decide the single next action needed to answer the current message.\n\
             - Set \"action\" to one of the available action names and fill \"parameters\" for it.\n\
             - If the actions taken so far are enough to answer, omit \"action\" and set \"isFinish\" to true.\n\
             - Respond with ONLY a JSON object matching this schema:\n{schema}\n",
            channel = self.snapshot.channel_type.as_str(),
            recent = format_recent_messages(&self.snapshot.recent_messages),
            message = self.message.to_prompt_section(),
            tools = self.snapshot.tools_section(),
            working = self.working.to_prompt_section(),
            trace = self.trace.to_prompt_section(),
            step = step,
            max = max_iterations,
            schema = decision_schema_json(),
        )
    }
}
