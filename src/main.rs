//! FinBee 命令行入口
//!
//! 从 stdin 逐行读取 `<conversation_id> <text>`，每行作为一条 API 频道消息并发处理，
//! 投递的回复打印到 stdout。Ctrl+C 触发优雅关闭（在途运行被取消）。
//!
//! 用法：`finbee [config.toml]`，例如 `FINBEE__LLM__PROVIDER=mock finbee`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use finbee::agent::create_agent_components;
use finbee::config::load_config;
use finbee::core::{ChannelDelivery, InboundMessage, TracingLifecycleSink};
use finbee::memory::{ChannelType, ChatMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;

/// 拆分 `<conversation_id> <text>`；只有一个词时使用默认会话
fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match line.split_once(char::is_whitespace) {
        Some((conversation_id, text)) if !text.trim().is_empty() => {
            Some((conversation_id, text.trim()))
        }
        _ => Some(("cli", line)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    finbee::observability::init(&cfg.app.log_level);

    let agent_id = cfg.app.agent_id.clone();
    let agent_name = cfg.app.agent_name.clone();
    let components = create_agent_components(cfg).context("Failed to create agent")?;
    let shutdown = Arc::new(components.shutdown.clone());
    shutdown.install_signal_handlers();

    let (delivery, mut delivered_rx) = ChannelDelivery::new();
    let supervisor = Arc::new(
        components
            .build_supervisor(Arc::new(delivery), Arc::new(TracingLifecycleSink))
            .context("Failed to build run supervisor")?,
    );

    // 打印回复，并把回复写回会话历史
    let snapshots = components.snapshots.clone();
    let printer = tokio::spawn(async move {
        while let Some(d) = delivered_rx.recv().await {
            println!("[{}] {}", d.message.conversation_id, d.content.text);
            snapshots
                .record_message(
                    &d.message.conversation_id,
                    ChatMessage::new(agent_id.as_str(), agent_name.as_str(), d.content.text.as_str()),
                )
                .await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut runs = JoinSet::new();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = shutdown.wait_for_shutdown() => break,
        };
        let Some(line) = line else {
            break;
        };
        let Some((conversation_id, text)) = parse_line(&line) else {
            continue;
        };

        // 传输层职责：先持久化原始消息，再交给核心
        components
            .snapshots
            .open_room(conversation_id, ChannelType::Api)
            .await;
        components
            .snapshots
            .record_message(conversation_id, ChatMessage::new("user", "user", text))
            .await;

        let message = InboundMessage::new(conversation_id, "user", text).with_source("api");
        let supervisor = supervisor.clone();
        runs.spawn(async move {
            match supervisor.process(message).await {
                Ok(result) if !result.responded => {
                    tracing::info!(reason = %result.decision.reason, "No reply");
                }
                Ok(_) => {}
                Err(e) if e.is_silent() => tracing::debug!(error = %e, "Run ended silently"),
                Err(e) => tracing::warn!(error = %e, "Run failed"),
            }
        });
    }

    while runs.join_next().await.is_some() {}
    let (prompt_tokens, completion_tokens, total_tokens) = components.llm.token_usage();
    tracing::info!(
        model = components.llm.model_name(),
        prompt_tokens,
        completion_tokens,
        total_tokens,
        "Token usage"
    );
    drop(supervisor);
    let _ = printer.await;
    Ok(())
}
