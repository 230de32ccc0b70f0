//! 运行生命周期事件
//!
//! 每次运行发出一个 run_started，随后恰好一个终止事件（run_ended 或 run_timeout）。
//! 事件由外部遥测/日志消费，核心只负责发出。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::RunStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted,
    RunEnded,
    RunTimeout,
}

/// 生命周期事件（可序列化为 JSON 供外部遥测）
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub kind: RunEventKind,
    pub run_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, RunEventKind::RunStarted)
    }
}

/// 一次运行的标识信息，用于生成各类事件
#[derive(Clone, Debug)]
pub struct RunRecord {
    pub run_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub start_time: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(conversation_id: &str, message_id: &str) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            start_time: Utc::now(),
        }
    }

    pub fn started(&self) -> RunEvent {
        self.event(RunEventKind::RunStarted, RunStatus::Running, None, None)
    }

    pub fn ended(&self, status: RunStatus, error: Option<String>) -> RunEvent {
        self.event(RunEventKind::RunEnded, status, Some(Utc::now()), error)
    }

    pub fn timed_out(&self, error: String) -> RunEvent {
        self.event(
            RunEventKind::RunTimeout,
            RunStatus::TimedOut,
            Some(Utc::now()),
            Some(error),
        )
    }

    fn event(
        &self,
        kind: RunEventKind,
        status: RunStatus,
        end_time: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> RunEvent {
        RunEvent {
            kind,
            run_id: self.run_id.clone(),
            conversation_id: self.conversation_id.clone(),
            message_id: self.message_id.clone(),
            status,
            start_time: self.start_time,
            end_time,
            error,
        }
    }
}

/// 一次运行的终止事件守卫
///
/// 创建时发出 run_started；end / timeout 只会生效一次。
/// 调用方丢弃 process future 时 Drop 补发 run_ended(cancelled)。
pub struct RunLifecycle {
    record: RunRecord,
    sink: Arc<dyn LifecycleSink>,
    terminated: bool,
}

impl RunLifecycle {
    pub fn start(record: RunRecord, sink: Arc<dyn LifecycleSink>) -> Self {
        sink.emit(record.started());
        Self {
            record,
            sink,
            terminated: false,
        }
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    pub fn run_id(&self) -> &str {
        &self.record.run_id
    }

    pub fn end(&mut self, status: RunStatus, error: Option<String>) {
        if !self.terminated {
            self.terminated = true;
            self.sink.emit(self.record.ended(status, error));
        }
    }

    pub fn timeout(&mut self, error: String) {
        if !self.terminated {
            self.terminated = true;
            self.sink.emit(self.record.timed_out(error));
        }
    }
}

impl Drop for RunLifecycle {
    fn drop(&mut self) {
        if !self.terminated {
            tracing::warn!(run_id = %self.record.run_id, "Run dropped before it finished");
            self.end(RunStatus::Cancelled, Some("run dropped".to_string()));
        }
    }
}

/// 生命周期事件的消费者
pub trait LifecycleSink: Send + Sync {
    fn emit(&self, event: RunEvent);
}

/// 默认实现：写入 tracing 日志
#[derive(Debug, Default)]
pub struct TracingLifecycleSink;

impl LifecycleSink for TracingLifecycleSink {
    fn emit(&self, event: RunEvent) {
        match event.kind {
            RunEventKind::RunStarted => tracing::info!(
                run_id = %event.run_id,
                conversation_id = %event.conversation_id,
                message_id = %event.message_id,
                "run started"
            ),
            RunEventKind::RunEnded => tracing::info!(
                run_id = %event.run_id,
                conversation_id = %event.conversation_id,
                status = ?event.status,
                error = event.error.as_deref().unwrap_or(""),
                "run ended"
            ),
            RunEventKind::RunTimeout => tracing::warn!(
                run_id = %event.run_id,
                conversation_id = %event.conversation_id,
                error = event.error.as_deref().unwrap_or(""),
                "run timed out"
            ),
        }
    }
}

/// 推送到 mpsc 通道（供 Web / 遥测前端订阅）；接收端关闭后静默丢弃
pub struct ChannelLifecycleSink {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelLifecycleSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LifecycleSink for ChannelLifecycleSink {
    fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}
