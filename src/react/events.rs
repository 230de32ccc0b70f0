//! Step Loop 过程事件：用于流式展示决策、动作调用与结束原因

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    /// 进入第 step 轮 DECIDING
    StepStarted {
        run_id: String,
        step: usize,
        max_iterations: usize,
    },
    /// 解码得到决策
    Decided {
        run_id: String,
        step: usize,
        thought: String,
        action: Option<String>,
        is_finish: bool,
    },
    /// 调用动作
    ActionStarted {
        run_id: String,
        action: String,
        parameters: serde_json::Value,
    },
    /// 动作返回（预览，避免过长）
    ActionCompleted {
        run_id: String,
        action: String,
        success: bool,
        preview: String,
    },
    /// 迭代上限或解码失败导致的强制结束
    ForcedFinish { run_id: String, reason: String },
    /// 正常结束
    Finished { run_id: String, steps: usize },
}
