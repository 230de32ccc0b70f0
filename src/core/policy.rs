//! Response Policy Engine：决定是否处理一条入站消息
//!
//! 规则按优先级短路求值（命中即 skip_further_evaluation = true）：
//! 0. 发送者是智能体自己 -> 不回复
//! 1. 私聊类频道（dm / voice_dm / self / api）-> 回复
//! 2. 来源标签在白名单中 -> 回复
//! 3. 消息 @ 了智能体或回复了智能体 -> 回复
//! 4. 都未命中 -> 一次 LLM 分类（RESPOND / IGNORE / STOP），只有明确的 RESPOND 才回复
//!
//! 没有会话快照（未知房间）时 fail closed。

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::PolicyConfig;
use crate::core::{AgentError, InboundMessage};
use crate::memory::{format_recent_messages, ChannelType, ConversationSnapshot};
use crate::react::{ResponseAction, ResponseClassification, StructuredDecoder, StructuredOutput};

/// 策略结论；每条消息只产生一次
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDecision {
    pub should_engage: bool,
    pub skip_further_evaluation: bool,
    pub reason: String,
}

impl ResponseDecision {
    fn rule(should_engage: bool, reason: impl Into<String>) -> Self {
        Self {
            should_engage,
            skip_further_evaluation: true,
            reason: reason.into(),
        }
    }

    pub(crate) fn deferred(should_engage: bool, reason: impl Into<String>) -> Self {
        Self {
            should_engage,
            skip_further_evaluation: false,
            reason: reason.into(),
        }
    }
}

/// 规则参数
#[derive(Clone, Debug)]
pub struct PolicyRules {
    pub agent_id: String,
    pub agent_name: String,
    pub direct_channels: HashSet<ChannelType>,
    /// 小写
    pub allowed_sources: HashSet<String>,
    pub use_llm_fallback: bool,
}

impl PolicyRules {
    pub fn from_config(
        cfg: &PolicyConfig,
        agent_id: &str,
        agent_name: &str,
    ) -> Result<Self, AgentError> {
        let direct_channels = cfg
            .direct_channel_types
            .iter()
            .map(|s| s.parse::<ChannelType>())
            .collect::<Result<HashSet<_>, _>>()
            .map_err(|e| AgentError::ConfigError(format!("policy.direct_channel_types: {}", e)))?;
        Ok(Self {
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            direct_channels,
            allowed_sources: cfg
                .allowed_sources
                .iter()
                .map(|s| s.trim().to_ascii_lowercase())
                .collect(),
            use_llm_fallback: cfg.use_llm_fallback,
        })
    }
}

pub struct ResponsePolicy {
    rules: PolicyRules,
    decoder: Arc<StructuredDecoder>,
}

impl ResponsePolicy {
    pub fn new(rules: PolicyRules, decoder: Arc<StructuredDecoder>) -> Self {
        Self { rules, decoder }
    }

    pub async fn should_engage(
        &self,
        message: &InboundMessage,
        snapshot: Option<&ConversationSnapshot>,
    ) -> ResponseDecision {
        if let Some(decision) = self.evaluate_rules(message, snapshot) {
            debug!(
                conversation_id = %message.conversation_id,
                engage = decision.should_engage,
                reason = %decision.reason,
                "Policy rule matched"
            );
            return decision;
        }
        // 规则未命中时 snapshot 必然存在
        let Some(snapshot) = snapshot else {
            return ResponseDecision::rule(false, "no conversation snapshot");
        };
        if !self.rules.use_llm_fallback {
            return ResponseDecision::deferred(false, "no rule matched and LLM fallback is disabled");
        }
        self.classify(message, snapshot).await
    }

    /// 纯规则部分；None 表示需要 LLM 兜底
    pub fn evaluate_rules(
        &self,
        message: &InboundMessage,
        snapshot: Option<&ConversationSnapshot>,
    ) -> Option<ResponseDecision> {
        if message.sender_id == self.rules.agent_id {
            return Some(ResponseDecision::rule(false, "message sent by the agent itself"));
        }
        let Some(snapshot) = snapshot else {
            return Some(ResponseDecision::rule(false, "no conversation snapshot"));
        };
        if self.rules.direct_channels.contains(&snapshot.channel_type) {
            return Some(ResponseDecision::rule(
                true,
                format!("direct channel ({})", snapshot.channel_type.as_str()),
            ));
        }
        if let Some(source) = message.source.as_deref() {
            if self
                .rules
                .allowed_sources
                .contains(&source.trim().to_ascii_lowercase())
            {
                return Some(ResponseDecision::rule(true, format!("allowed source ({})", source)));
            }
        }
        if message.mention.is_mention {
            return Some(ResponseDecision::rule(true, "agent mentioned"));
        }
        if message.mention.is_reply {
            return Some(ResponseDecision::rule(true, "reply to agent"));
        }
        None
    }

    async fn classify(&self, message: &InboundMessage, snapshot: &ConversationSnapshot) -> ResponseDecision {
        let prompt = format!(
            "# Conversation ({channel})\n{recent}\n\n\
             # Current Message\n{message}\n\n\
             # Task\n\
             Decide whether {name} should reply to the current message.\n\
             - RESPOND: the message is addressed to {name} or asks something {name} can help with.\n\
             - IGNORE: the message is not meant for {name}.\n\
             - STOP: participants asked {name} to stop or stay quiet.\n\
             Answer with exactly one of RESPOND | IGNORE | STOP using this format:\n{format}\n",
            channel = snapshot.channel_type.as_str(),
            recent = format_recent_messages(&snapshot.recent_messages),
            message = message.to_prompt_section(),
            name = self.rules.agent_name,
            format = ResponseClassification::format_hint(),
        );

        match self
            .decoder
            .decode_prompt::<ResponseClassification>(&snapshot.persona.to_prompt_section(), &prompt)
            .await
        {
            Ok(c) => {
                let engage = c.action == ResponseAction::Respond;
                debug!(
                    conversation_id = %message.conversation_id,
                    action = ?c.action,
                    "LLM classification"
                );
                ResponseDecision::deferred(engage, format!("llm classified {:?}: {}", c.action, c.reasoning))
            }
            Err(e) => {
                warn!(
                    conversation_id = %message.conversation_id,
                    error = %e,
                    "Response classification failed, not engaging"
                );
                ResponseDecision::deferred(false, "classification failed")
            }
        }
    }
}
