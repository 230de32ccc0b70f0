//! Summary Synthesizer：把整条 ActionTrace 合成为一条面向用户的回复
//!
//! 只调用一次解码器（同样的重试策略）；解码最终失败时返回固定的非空兜底内容，
//! 保证执行过动作的运行不会以空回复结束。

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::core::InboundMessage;
use crate::memory::{format_recent_messages, ConversationSnapshot};
use crate::react::decision::{StructuredOutput, SummaryOutput};
use crate::react::{ActionTrace, StructuredDecoder, Termination};

/// 总结失败时的兜底回复
pub const FALLBACK_TEXT: &str =
    "I completed the requested actions, but I couldn't summarize the results. Please try asking again.";

/// 最终投递给用户的内容
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Content {
    pub text: String,
    pub thought: String,
    /// 本次运行执行过的动作名（按顺序）
    pub actions: Vec<String>,
}

impl Content {
    pub fn fallback(trace: &ActionTrace) -> Self {
        Self {
            text: FALLBACK_TEXT.to_string(),
            thought: "summary could not be decoded".to_string(),
            actions: action_names(trace),
        }
    }
}

fn action_names(trace: &ActionTrace) -> Vec<String> {
    trace
        .outcomes()
        .iter()
        .map(|o| o.action_name.clone())
        .collect()
}

pub struct SummarySynthesizer {
    decoder: Arc<StructuredDecoder>,
}

impl SummarySynthesizer {
    pub fn new(decoder: Arc<StructuredDecoder>) -> Self {
        Self { decoder }
    }

    pub async fn summarize(
        &self,
        message: &InboundMessage,
        snapshot: &ConversationSnapshot,
        trace: &ActionTrace,
        termination: Termination,
    ) -> Content {
        let prompt = build_summary_prompt(message, snapshot, trace, termination);
        match self
            .decoder
            .decode_prompt::<SummaryOutput>(&snapshot.persona.to_prompt_section(), &prompt)
            .await
        {
            Ok(out) => Content {
                text: out.text,
                thought: out.thought,
                actions: action_names(trace),
            },
            Err(e) => {
                warn!(
                    conversation_id = %message.conversation_id,
                    actions = trace.len(),
                    error = %e,
                    "Summary decode failed, using fallback content"
                );
                Content::fallback(trace)
            }
        }
    }
}

fn build_summary_prompt(
    message: &InboundMessage,
    snapshot: &ConversationSnapshot,
    trace: &ActionTrace,
    termination: Termination,
) -> String {
    let actions = if trace.is_empty() {
        "## Actions Taken\n(no actions were executed)\n\n".to_string()
    } else {
        trace.to_prompt_section()
    };
    let note = match termination {
        Termination::MaxIterations => {
            "Note: the step limit was reached before the work was marked complete. \
             Answer with what the results above support.\n\n"
        }
        Termination::DecodeFailure => {
            "Note: planning stopped early. Answer with what the results above support.\n\n"
        }
        _ => "",
    };
    format!(
        "# Conversation\n{recent}\n\n\
         # Current Message\n{message}\n\n\
         ## Current Goal\n{goal}\n\n\
         {actions}{note}\
         # Task\n\
         Write the final reply to the user based on the results above. \
         Report failed actions plainly without raw error details.\n\
         Respond with ONLY this format:\n{format}\n",
        recent = format_recent_messages(&snapshot.recent_messages),
        message = message.to_prompt_section(),
        goal = message.text,
        actions = actions,
        note = note,
        format = SummaryOutput::format_hint(),
    )
}
