//! 状态定义：Step Loop 阶段与运行终态
//!
//! StepPhase 为 Step Loop 状态机的阶段；RunStatus 为一次运行的生命周期状态（写入生命周期事件）。

use serde::Serialize;

/// Step Loop 阶段：DECIDING -> EXECUTING -> REFRESHING -> (DECIDING | FINISHED)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Deciding,
    Executing,
    Refreshing,
    Finished,
}

impl StepPhase {
    /// 状态机允许的迁移
    pub fn can_transition_to(self, next: StepPhase) -> bool {
        matches!(
            (self, next),
            (StepPhase::Deciding, StepPhase::Executing)
                | (StepPhase::Deciding, StepPhase::Finished)
                | (StepPhase::Executing, StepPhase::Refreshing)
                | (StepPhase::Refreshing, StepPhase::Deciding)
                | (StepPhase::Refreshing, StepPhase::Finished)
        )
    }
}

/// 运行状态（生命周期事件中的 status 字段）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// 已生成并投递回复
    Completed,
    /// 策略决定不回复
    Ignored,
    /// 被同会话更新的消息取代
    Superseded,
    TimedOut,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}
