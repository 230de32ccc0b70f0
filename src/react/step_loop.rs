//! Step Loop 主循环
//!
//! DECIDING -> EXECUTING -> REFRESHING -> (DECIDING | FINISHED)。
//! 终止条件：isFinish（执行动作前后各检查一次）、没有动作且未结束、达到 max_iterations、解码失败、取消。
//! 达到迭代上限属于强制结束，只记 warn 日志，不是错误；轨迹长度永远不超过 max_iterations。
//! 可选 event_tx：向前端推送 StepStarted / Decided / ActionStarted / ActionCompleted / Finished。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::StepPhase;
use crate::memory::{Message, SnapshotProvider};
use crate::react::decision::{StepDecision, StructuredOutput};
use crate::react::{RunContext, StepEvent, StructuredDecoder};
use crate::tools::{ToolContext, ToolInvoker};

/// 默认最大迭代次数
pub const DEFAULT_MAX_ITERATIONS: usize = 6;
/// 动作结果预览最大字符数
const PREVIEW_CHARS: usize = 200;

/// 循环结束原因
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// 模型给出 isFinish
    Finished,
    /// 既没有动作也没有结束
    NoAction,
    /// 达到迭代上限
    MaxIterations,
    /// 决策无法解码
    DecodeFailure,
    Cancelled,
}

impl Termination {
    /// 非模型主动结束
    pub fn is_forced(self) -> bool {
        matches!(self, Termination::MaxIterations | Termination::DecodeFailure)
    }
}

/// 一次 Step Loop 的结果；轨迹保留在 RunContext 中
#[derive(Clone, Debug)]
pub struct LoopOutcome {
    pub final_decision: StepDecision,
    pub termination: Termination,
    pub steps: usize,
}

pub struct StepLoop {
    decoder: Arc<StructuredDecoder>,
    invoker: Arc<dyn ToolInvoker>,
    snapshots: Arc<dyn SnapshotProvider>,
    max_iterations: usize,
    event_tx: Option<mpsc::UnboundedSender<StepEvent>>,
}

fn send_event(tx: &Option<mpsc::UnboundedSender<StepEvent>>, ev: StepEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(ev);
    }
}

fn transition(phase: &mut StepPhase, next: StepPhase) {
    debug_assert!(phase.can_transition_to(next), "{:?} -> {:?}", phase, next);
    debug!(from = ?*phase, to = ?next, "Step phase");
    *phase = next;
}

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

impl StepLoop {
    pub fn new(
        decoder: Arc<StructuredDecoder>,
        invoker: Arc<dyn ToolInvoker>,
        snapshots: Arc<dyn SnapshotProvider>,
        max_iterations: usize,
    ) -> Self {
        Self {
            decoder,
            invoker,
            snapshots,
            max_iterations: max_iterations.max(1),
            event_tx: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<StepEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub async fn run(&self, ctx: &mut RunContext, cancel: &CancellationToken) -> LoopOutcome {
        let run_id = ctx.run_id.clone();
        let mut last_decision: Option<StepDecision> = None;

        for step in 1..=self.max_iterations {
            let mut phase = StepPhase::Deciding;
            if cancel.is_cancelled() {
                return self.cancelled(last_decision, step - 1);
            }
            send_event(
                &self.event_tx,
                StepEvent::StepStarted {
                    run_id: run_id.clone(),
                    step,
                    max_iterations: self.max_iterations,
                },
            );

            // DECIDING
            let messages = vec![
                Message::system(ctx.system_prompt()),
                Message::user(ctx.decision_prompt(step, self.max_iterations)),
            ];
            let decoded = tokio::select! {
                r = self.decoder.decode::<StepDecision>(messages) => r,
                _ = cancel.cancelled() => return self.cancelled(last_decision, step - 1),
            };
            let decision = match decoded {
                Ok(d) => d,
                Err(err) => {
                    warn!(run_id = %run_id, step, error = %err, "Decision decode failed, forcing finish");
                    send_event(
                        &self.event_tx,
                        StepEvent::ForcedFinish {
                            run_id: run_id.clone(),
                            reason: err.to_string(),
                        },
                    );
                    return LoopOutcome {
                        final_decision: last_decision
                            .unwrap_or_else(|| StepDecision::finish("decision could not be decoded")),
                        termination: Termination::DecodeFailure,
                        steps: step - 1,
                    };
                }
            };
            info!(
                run_id = %run_id,
                step,
                action = decision.action.as_deref().unwrap_or("-"),
                is_finish = decision.is_finish,
                "Step decided"
            );
            send_event(
                &self.event_tx,
                StepEvent::Decided {
                    run_id: run_id.clone(),
                    step,
                    thought: decision.thought.clone(),
                    action: decision.action.clone(),
                    is_finish: decision.is_finish,
                },
            );

            let Some(action) = decision.action.clone() else {
                transition(&mut phase, StepPhase::Finished);
                let termination = if decision.is_finish {
                    send_event(
                        &self.event_tx,
                        StepEvent::Finished {
                            run_id: run_id.clone(),
                            steps: step - 1,
                        },
                    );
                    Termination::Finished
                } else {
                    info!(run_id = %run_id, step, "No action and not finished, ending loop");
                    Termination::NoAction
                };
                return LoopOutcome {
                    final_decision: decision,
                    termination,
                    steps: step - 1,
                };
            };

            // EXECUTING
            transition(&mut phase, StepPhase::Executing);
            send_event(
                &self.event_tx,
                StepEvent::ActionStarted {
                    run_id: run_id.clone(),
                    action: action.clone(),
                    parameters: decision.parameters.to_json(),
                },
            );
            let tool_ctx = ToolContext {
                run_id: run_id.clone(),
                conversation_id: ctx.message.conversation_id.clone(),
                message_id: ctx.message.id.clone(),
                sender_id: ctx.message.sender_id.clone(),
            };
            let outcome = tokio::select! {
                o = self.invoker.invoke(&action, decision.parameters.clone(), &tool_ctx) => o,
                _ = cancel.cancelled() => return self.cancelled(Some(decision), step - 1),
            };
            send_event(
                &self.event_tx,
                StepEvent::ActionCompleted {
                    run_id: run_id.clone(),
                    action: outcome.action_name.clone(),
                    success: outcome.success,
                    preview: preview(if outcome.success {
                        &outcome.result_text
                    } else {
                        outcome.error.as_deref().unwrap_or("")
                    }),
                },
            );
            ctx.record(outcome);

            // REFRESHING
            transition(&mut phase, StepPhase::Refreshing);
            match self.snapshots.get_snapshot(&ctx.message.conversation_id).await {
                Some(snapshot) => ctx.refresh(snapshot),
                None => warn!(
                    run_id = %run_id,
                    conversation_id = %ctx.message.conversation_id,
                    "Snapshot unavailable on refresh, keeping previous"
                ),
            }

            if decision.is_finish {
                transition(&mut phase, StepPhase::Finished);
                send_event(
                    &self.event_tx,
                    StepEvent::Finished {
                        run_id: run_id.clone(),
                        steps: step,
                    },
                );
                return LoopOutcome {
                    final_decision: decision,
                    termination: Termination::Finished,
                    steps: step,
                };
            }
            last_decision = Some(decision);
        }

        warn!(
            run_id = %run_id,
            max_iterations = self.max_iterations,
            actions = ctx.trace.len(),
            "Reached max iterations, forcing finish"
        );
        send_event(
            &self.event_tx,
            StepEvent::ForcedFinish {
                run_id,
                reason: format!("reached max iterations ({})", self.max_iterations),
            },
        );
        LoopOutcome {
            final_decision: last_decision
                .unwrap_or_else(|| StepDecision::finish("reached max iterations")),
            termination: Termination::MaxIterations,
            steps: self.max_iterations,
        }
    }

    fn cancelled(&self, last_decision: Option<StepDecision>, steps: usize) -> LoopOutcome {
        info!(steps, "Step loop cancelled");
        LoopOutcome {
            final_decision: last_decision.unwrap_or_else(|| StepDecision::finish("cancelled")),
            termination: Termination::Cancelled,
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::InboundMessage;
    use crate::llm::ScriptedLlmClient;
    use crate::memory::{ChannelType, InMemorySnapshotStore, Persona};
    use crate::react::RetryConfig;
    use crate::tools::{EchoTool, ToolExecutor, ToolRegistry};

    const ECHO_STEP: &str =
        r#"{"thought": "echo it", "action": "ECHO", "parameters": {"text": "hi"}, "isFinish": false}"#;
    const FINISH: &str = r#"{"thought": "done", "isFinish": true}"#;

    struct Harness {
        llm: Arc<ScriptedLlmClient>,
        store: Arc<InMemorySnapshotStore>,
        step_loop: StepLoop,
    }

    async fn harness(llm: ScriptedLlmClient, max_iterations: usize) -> Harness {
        let llm = Arc::new(llm);
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let executor = ToolExecutor::new(registry, 5);
        let store = Arc::new(InMemorySnapshotStore::new(
            Persona::new("FinBee", "A finance assistant."),
            executor.catalog(),
            20,
        ));
        store.open_room("room", ChannelType::Dm).await;
        let decoder = Arc::new(StructuredDecoder::new(llm.clone(), RetryConfig::default()));
        let step_loop = StepLoop::new(decoder, Arc::new(executor), store.clone(), max_iterations);
        Harness { llm, store, step_loop }
    }

    async fn context(store: &InMemorySnapshotStore) -> RunContext {
        let snapshot = store.get_snapshot("room").await.unwrap();
        RunContext::new("run-1", InboundMessage::new("room", "alice", "say hi"), snapshot)
    }

    #[tokio::test]
    async fn test_finish_without_action() {
        let h = harness(ScriptedLlmClient::always(FINISH), 6).await;
        let mut ctx = context(&h.store).await;
        let out = h.step_loop.run(&mut ctx, &CancellationToken::new()).await;
        assert_eq!(out.termination, Termination::Finished);
        assert!(ctx.trace.is_empty());
        assert_eq!(h.llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_one_action_then_finish_refreshes_snapshot() {
        let h = harness(ScriptedLlmClient::from_responses(vec![ECHO_STEP, FINISH]), 6).await;
        let mut ctx = context(&h.store).await;
        let reads_before = h.store.reads();
        let out = h.step_loop.run(&mut ctx, &CancellationToken::new()).await;
        assert_eq!(out.termination, Termination::Finished);
        assert_eq!(ctx.trace.len(), 1);
        assert!(ctx.trace.outcomes()[0].success);
        assert_eq!(h.store.reads(), reads_before + 1);
        // 第二轮 prompt 带上了第一步的结果
        let prompts = h.llm.last_user_prompts();
        assert!(prompts[1].contains("ECHO succeeded: hi"));
        assert!(prompts[1].contains("step_001"));
    }

    #[tokio::test]
    async fn test_finish_with_action_executes_then_stops() {
        let h = harness(
            ScriptedLlmClient::always(
                r#"{"thought": "last one", "action": "ECHO", "parameters": {"text": "bye"}, "isFinish": true}"#,
            ),
            6,
        )
        .await;
        let mut ctx = context(&h.store).await;
        let out = h.step_loop.run(&mut ctx, &CancellationToken::new()).await;
        assert_eq!(out.termination, Termination::Finished);
        assert_eq!(ctx.trace.len(), 1);
        assert_eq!(h.llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_max_iterations_caps_trace_and_allows_repeats() {
        let h = harness(ScriptedLlmClient::always(ECHO_STEP), 3).await;
        let mut ctx = context(&h.store).await;
        let out = h.step_loop.run(&mut ctx, &CancellationToken::new()).await;
        assert_eq!(out.termination, Termination::MaxIterations);
        assert!(out.termination.is_forced());
        assert_eq!(ctx.trace.len(), 3);
        assert!(ctx.trace.outcomes().iter().all(|o| o.action_name == "ECHO"));
        assert_eq!(h.llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_no_action_without_finish_ends_loop() {
        let h = harness(ScriptedLlmClient::always(r#"{"thought": "hmm"}"#), 6).await;
        let mut ctx = context(&h.store).await;
        let out = h.step_loop.run(&mut ctx, &CancellationToken::new()).await;
        assert_eq!(out.termination, Termination::NoAction);
        assert!(ctx.trace.is_empty());
    }

    #[tokio::test]
    async fn test_failed_action_is_recorded_and_loop_continues() {
        let h = harness(
            ScriptedLlmClient::from_responses(vec![
                r#"{"thought": "try", "action": "GET_PRICE", "parameters": {"symbol": "BTC"}}"#,
                FINISH,
            ]),
            6,
        )
        .await;
        let mut ctx = context(&h.store).await;
        let out = h.step_loop.run(&mut ctx, &CancellationToken::new()).await;
        assert_eq!(out.termination, Termination::Finished);
        assert_eq!(ctx.trace.len(), 1);
        assert!(!ctx.trace.outcomes()[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failure_forces_finish() {
        let h = harness(ScriptedLlmClient::always("no idea"), 6).await;
        let mut ctx = context(&h.store).await;
        let out = h.step_loop.run(&mut ctx, &CancellationToken::new()).await;
        assert_eq!(out.termination, Termination::DecodeFailure);
        assert!(out.final_decision.is_finish);
        assert_eq!(h.llm.calls(), 5);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let h = harness(ScriptedLlmClient::always(ECHO_STEP), 6).await;
        let mut ctx = context(&h.store).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = h.step_loop.run(&mut ctx, &cancel).await;
        assert_eq!(out.termination, Termination::Cancelled);
        assert_eq!(h.llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let h = harness(ScriptedLlmClient::from_responses(vec![ECHO_STEP, FINISH]), 6).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let step_loop = h.step_loop.with_events(tx);
        let mut ctx = context(&h.store).await;
        step_loop.run(&mut ctx, &CancellationToken::new()).await;
        drop(step_loop);

        let mut kinds = Vec::new();
        while let Some(ev) = rx.recv().await {
            kinds.push(serde_json::to_value(&ev).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec![
                "step_started",
                "decided",
                "action_started",
                "action_completed",
                "step_started",
                "decided",
                "finished"
            ]
        );
    }
}
