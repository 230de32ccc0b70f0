//! Run Supervisor：单条消息的顶层入口
//!
//! process(message)：
//! 1. 非 job 消息登记竞态令牌（TokenGuard，任何退出路径上自动释放）
//! 2. 发出 run_started
//! 3. 把 Policy -> Step Loop -> Summary 作为一个整体与计时器竞速；超时则放弃该单元，发出 run_timeout
//! 4. 正常完成后只检查一次令牌：已被取代则丢弃结果（Superseded），否则在剩余预算内投递
//!
//! 每次运行恰好发出一个终止事件（run_ended 或 run_timeout）；future 被丢弃时由 RunLifecycle 补发。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PolicyConfig;
use crate::core::{
    AgentError, InboundMessage, LifecycleSink, PolicyRules, RaceTracker, ResponseDecision,
    ResponsePolicy, RunLifecycle, RunRecord, RunStatus, ShutdownManager, TracingLifecycleSink,
};
use crate::llm::LlmClient;
use crate::memory::SnapshotProvider;
use crate::react::{
    ActionTrace, Content, RetryConfig, RunContext, StepEvent, StepLoop, StructuredDecoder,
    SummarySynthesizer, Termination, DEFAULT_MAX_ITERATIONS,
};
use crate::tools::ToolInvoker;

/// 默认墙钟预算
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);

/// 投递：有副作用的最终一步，只在令牌检查通过后调用
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, message: &InboundMessage, content: &Content) -> Result<(), String>;
}

/// 只写日志的投递
#[derive(Debug, Default)]
pub struct TracingDelivery;

#[async_trait]
impl Delivery for TracingDelivery {
    async fn deliver(&self, message: &InboundMessage, content: &Content) -> Result<(), String> {
        info!(
            conversation_id = %message.conversation_id,
            message_id = %message.id,
            text = %content.text,
            "Reply delivered"
        );
        Ok(())
    }
}

/// 一次投递的记录
#[derive(Clone, Debug)]
pub struct Delivered {
    pub message: InboundMessage,
    pub content: Content,
}

/// 推送到 mpsc 通道；接收端关闭时返回 Err
pub struct ChannelDelivery {
    tx: mpsc::UnboundedSender<Delivered>,
}

impl ChannelDelivery {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivered>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Delivery for ChannelDelivery {
    async fn deliver(&self, message: &InboundMessage, content: &Content) -> Result<(), String> {
        self.tx
            .send(Delivered {
                message: message.clone(),
                content: content.clone(),
            })
            .map_err(|_| "delivery channel closed".to_string())
    }
}

/// process 的返回值
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    /// 是否已投递回复
    pub responded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    pub trace: ActionTrace,
    pub decision: ResponseDecision,
    /// Step Loop 结束原因；未进入循环时为 None
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
}

/// 计时器内的工作单元产出
struct PipelineOutput {
    decision: ResponseDecision,
    content: Option<Content>,
    trace: ActionTrace,
    termination: Option<Termination>,
}

pub struct RunSupervisor {
    policy: ResponsePolicy,
    step_loop: StepLoop,
    summary: SummarySynthesizer,
    snapshots: Arc<dyn SnapshotProvider>,
    delivery: Arc<dyn Delivery>,
    lifecycle: Arc<dyn LifecycleSink>,
    races: Arc<RaceTracker>,
    shutdown: ShutdownManager,
    run_timeout: Duration,
}

impl RunSupervisor {
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::default()
    }

    pub fn races(&self) -> &Arc<RaceTracker> {
        &self.races
    }

    pub fn shutdown_manager(&self) -> &ShutdownManager {
        &self.shutdown
    }

    pub fn run_timeout(&self) -> Duration {
        self.run_timeout
    }

    pub async fn process(&self, message: InboundMessage) -> Result<RunResult, AgentError> {
        // 墙钟预算覆盖整个运行，包括投递
        let deadline = Instant::now() + self.run_timeout;
        // job 消息不登记也不检查令牌
        let guard = (!message.is_job).then(|| self.races.acquire(&message.conversation_id));
        let mut run = RunLifecycle::start(
            RunRecord::new(&message.conversation_id, &message.id),
            self.lifecycle.clone(),
        );
        let run_id = run.run_id().to_string();
        info!(
            run_id = %run_id,
            conversation_id = %message.conversation_id,
            message_id = %message.id,
            is_job = message.is_job,
            "Run started"
        );

        let cancel = self.shutdown.run_token();
        let output = tokio::select! {
            out = self.pipeline(&message, &run_id, &cancel) => out,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(self.time_out(&mut run, &cancel, &message));
            }
        };

        if cancel.is_cancelled() {
            run.end(RunStatus::Cancelled, None);
            return Err(AgentError::Cancelled);
        }

        let result = RunResult {
            run_id: run_id.clone(),
            responded: false,
            content: None,
            trace: output.trace,
            decision: output.decision,
            termination: output.termination,
        };

        let Some(content) = output.content else {
            info!(run_id = %run_id, reason = %result.decision.reason, "Not engaging");
            run.end(RunStatus::Ignored, None);
            return Ok(result);
        };

        // 投递前唯一一次令牌检查
        if let Some(guard) = &guard {
            if !guard.is_current() {
                info!(
                    run_id = %run_id,
                    conversation_id = %message.conversation_id,
                    "Superseded by a newer message, discarding result"
                );
                run.end(RunStatus::Superseded, None);
                return Err(AgentError::Superseded {
                    conversation_id: message.conversation_id.clone(),
                });
            }
        }

        let delivered = tokio::time::timeout_at(deadline, self.delivery.deliver(&message, &content)).await;
        match delivered {
            Ok(Ok(())) => {
                run.end(RunStatus::Completed, None);
                Ok(RunResult {
                    responded: true,
                    content: Some(content),
                    ..result
                })
            }
            Ok(Err(e)) => {
                error!(run_id = %run_id, error = %e, "Delivery failed");
                run.end(RunStatus::Failed, Some(e));
                Ok(RunResult {
                    content: Some(content),
                    ..result
                })
            }
            Err(_) => Err(self.time_out(&mut run, &cancel, &message)),
        }
    }

    fn time_out(
        &self,
        run: &mut RunLifecycle,
        cancel: &CancellationToken,
        message: &InboundMessage,
    ) -> AgentError {
        cancel.cancel();
        let err = AgentError::Timeout(self.run_timeout);
        warn!(run_id = %run.run_id(), conversation_id = %message.conversation_id, "Run timed out");
        run.timeout(err.to_string());
        err
    }

    /// Policy -> Step Loop -> Summary；每个阶段都响应取消
    async fn pipeline(
        &self,
        message: &InboundMessage,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> PipelineOutput {
        let not_engaged = |decision: ResponseDecision| PipelineOutput {
            decision,
            content: None,
            trace: ActionTrace::new(),
            termination: None,
        };
        let snapshot = self.snapshots.get_snapshot(&message.conversation_id).await;
        let decision = tokio::select! {
            d = self.policy.should_engage(message, snapshot.as_ref()) => d,
            _ = cancel.cancelled() => {
                return not_engaged(ResponseDecision::deferred(false, "cancelled before policy decision"));
            }
        };
        if !decision.should_engage {
            return not_engaged(decision);
        }
        let Some(snapshot) = snapshot else {
            return not_engaged(decision);
        };

        let mut ctx = RunContext::new(run_id, message.clone(), snapshot);
        let outcome = self.step_loop.run(&mut ctx, cancel).await;
        if outcome.termination == Termination::Cancelled {
            return PipelineOutput {
                decision,
                content: None,
                trace: ctx.trace,
                termination: Some(outcome.termination),
            };
        }

        let content = tokio::select! {
            c = self.summary.summarize(message, &ctx.snapshot, &ctx.trace, outcome.termination) => Some(c),
            _ = cancel.cancelled() => None,
        };
        PipelineOutput {
            decision,
            content,
            trace: ctx.trace,
            termination: Some(outcome.termination),
        }
    }
}

/// RunSupervisor 构建器；llm / invoker / snapshots 为必需依赖
pub struct SupervisorBuilder {
    llm: Option<Arc<dyn LlmClient>>,
    invoker: Option<Arc<dyn ToolInvoker>>,
    snapshots: Option<Arc<dyn SnapshotProvider>>,
    delivery: Arc<dyn Delivery>,
    lifecycle: Arc<dyn LifecycleSink>,
    races: Arc<RaceTracker>,
    shutdown: ShutdownManager,
    policy: PolicyConfig,
    agent_id: String,
    agent_name: String,
    retry: RetryConfig,
    max_iterations: usize,
    run_timeout: Duration,
    event_tx: Option<mpsc::UnboundedSender<StepEvent>>,
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self {
            llm: None,
            invoker: None,
            snapshots: None,
            delivery: Arc::new(TracingDelivery),
            lifecycle: Arc::new(TracingLifecycleSink),
            races: Arc::new(RaceTracker::new()),
            shutdown: ShutdownManager::new(),
            policy: PolicyConfig::default(),
            agent_id: "finbee".to_string(),
            agent_name: "FinBee".to_string(),
            retry: RetryConfig::default(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            event_tx: None,
        }
    }
}

impl SupervisorBuilder {
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotProvider>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_delivery(mut self, delivery: Arc<dyn Delivery>) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_lifecycle(mut self, sink: Arc<dyn LifecycleSink>) -> Self {
        self.lifecycle = sink;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownManager) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self.agent_name = agent_name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn with_step_events(mut self, tx: mpsc::UnboundedSender<StepEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 缺少必需依赖时返回 ConfigError（启动期失败，而不是每条消息失败）
    pub fn build(self) -> Result<RunSupervisor, AgentError> {
        let llm = self
            .llm
            .ok_or_else(|| AgentError::ConfigError("no language model client configured".into()))?;
        let invoker = self
            .invoker
            .ok_or_else(|| AgentError::ConfigError("no tool invoker configured".into()))?;
        let snapshots = self
            .snapshots
            .ok_or_else(|| AgentError::ConfigError("no snapshot provider configured".into()))?;
        if self.max_iterations == 0 {
            return Err(AgentError::ConfigError("max_iterations must be at least 1".into()));
        }

        let decoder = Arc::new(StructuredDecoder::new(llm, self.retry));
        let rules = PolicyRules::from_config(&self.policy, &self.agent_id, &self.agent_name)?;
        let mut step_loop = StepLoop::new(
            decoder.clone(),
            invoker,
            snapshots.clone(),
            self.max_iterations,
        );
        if let Some(tx) = self.event_tx {
            step_loop = step_loop.with_events(tx);
        }

        Ok(RunSupervisor {
            policy: ResponsePolicy::new(rules, decoder.clone()),
            step_loop,
            summary: SummarySynthesizer::new(decoder),
            snapshots,
            delivery: self.delivery,
            lifecycle: self.lifecycle,
            races: self.races,
            shutdown: self.shutdown,
            run_timeout: self.run_timeout,
        })
    }
}
