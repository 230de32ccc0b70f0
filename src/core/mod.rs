//! 核心编排层：错误与恢复、竞态追踪、生命周期事件、回复策略、运行监管、优雅关闭

pub mod error;
pub mod inbound;
pub mod lifecycle;
pub mod policy;
pub mod race;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod supervisor;

pub use error::{AgentError, RecoveryAction};
pub use inbound::{Attachment, InboundMessage, MentionContext};
pub use lifecycle::{
    ChannelLifecycleSink, LifecycleSink, RunEvent, RunEventKind, RunLifecycle, RunRecord,
    TracingLifecycleSink,
};
pub use policy::{PolicyRules, ResponseDecision, ResponsePolicy};
pub use race::{RaceToken, RaceTracker, TokenGuard};
pub use recovery::RecoveryEngine;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{RunStatus, StepPhase};
pub use supervisor::{
    ChannelDelivery, Delivered, Delivery, RunResult, RunSupervisor, SupervisorBuilder,
    TracingDelivery, DEFAULT_RUN_TIMEOUT,
};
