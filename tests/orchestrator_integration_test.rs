//! 编排核心集成测试：竞态抑制、超时、迭代上限、策略与总结兜底

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;

use finbee::core::{
    AgentError, Delivery, InboundMessage, LifecycleSink, RunEvent, RunEventKind, RunStatus,
    RunSupervisor, ShutdownReason,
};
use finbee::llm::ScriptedLlmClient;
use finbee::memory::{ChannelType, InMemorySnapshotStore, Message, Persona, Role};
use finbee::react::{Content, Termination, FALLBACK_TEXT};
use finbee::tools::{
    EchoTool, Tool, ToolContext, ToolExecutor, ToolInvoker, ToolOutput, ToolParams, ToolRegistry,
};

const PRICE_STEP: &str = r#"{"thought": "look up the price", "action": "GET_PRICE", "parameters": {"symbol": "BTC"}, "isFinish": false}"#;
const SLOW_STEP: &str = r#"{"thought": "slow lookup", "action": "SLOW_LOOKUP", "parameters": {}, "isFinish": false}"#;
const FINISH: &str = r#"{"thought": "I have the answer", "isFinish": true}"#;

// ---------- 协作方替身 ----------

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<RunEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, kind: RunEventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }

    fn terminal_statuses(&self) -> Vec<RunStatus> {
        self.events()
            .iter()
            .filter(|e| e.is_terminal())
            .map(|e| e.status)
            .collect()
    }
}

impl LifecycleSink for RecordingSink {
    fn emit(&self, event: RunEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct RecordingDelivery {
    delivered: Mutex<Vec<(String, Content)>>,
}

impl RecordingDelivery {
    fn message_ids(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn deliver(&self, message: &InboundMessage, content: &Content) -> Result<(), String> {
        self.delivered
            .lock()
            .unwrap()
            .push((message.id.clone(), content.clone()));
        Ok(())
    }
}

/// 永远挂起的投递
struct StalledDelivery;

#[async_trait]
impl Delivery for StalledDelivery {
    async fn deliver(&self, _message: &InboundMessage, _content: &Content) -> Result<(), String> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

struct PriceTool;

#[async_trait]
impl Tool for PriceTool {
    fn name(&self) -> &str {
        "GET_PRICE"
    }

    fn description(&self) -> &str {
        "Look up the spot price of a token by symbol"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "symbol": { "type": "string" } },
            "required": ["symbol"]
        })
    }

    async fn execute(&self, params: &ToolParams, _ctx: &ToolContext) -> Result<ToolOutput, String> {
        let symbol = params.get_str("symbol").unwrap_or("?");
        Ok(ToolOutput::text(format!("{} = 60000 USD", symbol))
            .with_values(json!({ "symbol": symbol, "price": 60000 })))
    }
}

struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "SLOW_LOOKUP"
    }

    fn description(&self) -> &str {
        "A lookup that takes 100ms"
    }

    async fn execute(&self, _params: &ToolParams, _ctx: &ToolContext) -> Result<ToolOutput, String> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(ToolOutput::text("slow result"))
    }
}

fn last_user(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// 按 prompt 类型路由：分类 -> classification；决策 -> 先 GET_PRICE 再结束；总结 -> summary
fn finance_llm(classification: &'static str, summary: &'static str) -> ScriptedLlmClient {
    ScriptedLlmClient::from_fn(move |messages, _| {
        let prompt = last_user(messages);
        if prompt.contains("RESPOND | IGNORE | STOP") {
            return Ok(format!("<response><action>{}</action></response>", classification));
        }
        if prompt.contains("isFinish") {
            if prompt.contains("GET_PRICE succeeded") {
                return Ok(FINISH.to_string());
            }
            return Ok(PRICE_STEP.to_string());
        }
        Ok(json!({ "thought": "answer", "text": summary }).to_string())
    })
}

fn is_decision_prompt(prompt: &str) -> bool {
    prompt.contains("isFinish")
}

struct Harness {
    supervisor: Arc<RunSupervisor>,
    sink: Arc<RecordingSink>,
    delivery: Arc<RecordingDelivery>,
    store: Arc<InMemorySnapshotStore>,
    llm: Arc<ScriptedLlmClient>,
}

async fn harness(
    llm: ScriptedLlmClient,
    channel: ChannelType,
    max_iterations: usize,
    run_timeout: Duration,
) -> Harness {
    let llm = Arc::new(llm);
    let mut registry = ToolRegistry::new();
    registry.register(PriceTool);
    registry.register(SlowTool);
    registry.register(EchoTool);
    let executor = Arc::new(ToolExecutor::new(registry, 30));
    let store = Arc::new(InMemorySnapshotStore::new(
        Persona::new("FinBee", "A concise finance assistant."),
        executor.catalog(),
        20,
    ));
    store.open_room("room", channel).await;

    let sink = Arc::new(RecordingSink::default());
    let delivery = Arc::new(RecordingDelivery::default());
    let supervisor = RunSupervisor::builder()
        .with_llm(llm.clone())
        .with_invoker(executor)
        .with_snapshots(store.clone())
        .with_delivery(delivery.clone())
        .with_lifecycle(sink.clone())
        .with_max_iterations(max_iterations)
        .with_run_timeout(run_timeout)
        .build()
        .expect("supervisor should build");

    Harness {
        supervisor: Arc::new(supervisor),
        sink,
        delivery,
        store,
        llm,
    }
}

// ---------- 场景 ----------

#[tokio::test]
async fn test_direct_channel_price_query() {
    let h = harness(
        finance_llm("IGNORE", "BTC is trading at 60,000 USD."),
        ChannelType::Dm,
        6,
        Duration::from_secs(60),
    )
    .await;

    let result = h
        .supervisor
        .process(InboundMessage::new("room", "alice", "price of BTC"))
        .await
        .unwrap();

    assert!(result.decision.should_engage);
    assert!(result.decision.skip_further_evaluation);
    // 规则命中，没有分类调用
    assert!(!h
        .llm
        .last_user_prompts()
        .iter()
        .any(|p| p.contains("RESPOND | IGNORE | STOP")));

    assert_eq!(result.trace.len(), 1);
    assert!(result.trace.outcomes()[0].success);
    assert_eq!(result.termination, Some(Termination::Finished));
    assert!(result.responded);
    let content = result.content.unwrap();
    assert_eq!(content.text, "BTC is trading at 60,000 USD.");
    assert_eq!(content.actions, vec!["GET_PRICE"]);

    assert_eq!(h.delivery.message_ids().len(), 1);
    assert_eq!(h.sink.count(RunEventKind::RunStarted), 1);
    assert_eq!(h.sink.terminal_statuses(), vec![RunStatus::Completed]);
    assert!(h.supervisor.races().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_superseding_wave_delivers_only_latest() {
    let h = harness(
        finance_llm("IGNORE", "latest answer").with_delay(Duration::from_millis(50)),
        ChannelType::Dm,
        6,
        Duration::from_secs(60),
    )
    .await;

    let a = InboundMessage::new("room", "alice", "price of BTC");
    let b = InboundMessage::new("room", "alice", "actually, price of ETH");
    let b_id = b.id.clone();

    let (ra, rb) = tokio::join!(h.supervisor.process(a), h.supervisor.process(b));

    assert!(matches!(ra, Err(AgentError::Superseded { .. })));
    assert!(ra.unwrap_err().is_silent());
    assert!(rb.unwrap().responded);
    assert_eq!(h.delivery.message_ids(), vec![b_id]);

    let mut statuses = h.sink.terminal_statuses();
    statuses.sort_by_key(|s| format!("{:?}", s));
    assert_eq!(statuses, vec![RunStatus::Completed, RunStatus::Superseded]);
    assert!(h.supervisor.races().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_job_message_is_exempt_from_supersession() {
    let h = harness(
        finance_llm("IGNORE", "answer").with_delay(Duration::from_millis(50)),
        ChannelType::Dm,
        6,
        Duration::from_secs(60),
    )
    .await;

    let first = InboundMessage::new("room", "alice", "price of BTC");
    let job = InboundMessage::new("room", "scheduler", "daily BTC report").as_job();
    let latest = InboundMessage::new("room", "alice", "price of ETH");
    let job_id = job.id.clone();
    let latest_id = latest.id.clone();

    let (r1, rj, r2) = tokio::join!(
        h.supervisor.process(first),
        h.supervisor.process(job),
        h.supervisor.process(latest)
    );

    assert!(matches!(r1, Err(AgentError::Superseded { .. })));
    assert!(rj.unwrap().responded);
    assert!(r2.unwrap().responded);

    let mut delivered = h.delivery.message_ids();
    delivered.sort();
    let mut expected = vec![job_id, latest_id];
    expected.sort();
    assert_eq!(delivered, expected);
    assert!(h.supervisor.races().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_emits_single_timeout_event() {
    let h = harness(
        ScriptedLlmClient::from_fn(|messages, _| {
            if is_decision_prompt(&last_user(messages)) {
                Ok(SLOW_STEP.to_string())
            } else {
                Ok(r#"{"text": "too late"}"#.to_string())
            }
        }),
        ChannelType::Dm,
        6,
        Duration::from_millis(10),
    )
    .await;

    let err = h
        .supervisor
        .process(InboundMessage::new("room", "alice", "slow please"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Timeout(d) if d == Duration::from_millis(10)));

    // 被放弃的工作单元不会再产生事件或投递
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.sink.count(RunEventKind::RunTimeout), 1);
    assert_eq!(h.sink.count(RunEventKind::RunEnded), 0);
    assert_eq!(h.sink.terminal_statuses(), vec![RunStatus::TimedOut]);
    assert!(h.delivery.message_ids().is_empty());
    assert!(h.supervisor.races().is_empty());
}

#[tokio::test]
async fn test_max_iterations_one_forces_finish_with_content() {
    let h = harness(
        ScriptedLlmClient::from_fn(|messages, _| {
            if is_decision_prompt(&last_user(messages)) {
                Ok(PRICE_STEP.to_string())
            } else {
                Ok(r#"{"thought": "partial", "text": "BTC is 60,000 USD."}"#.to_string())
            }
        }),
        ChannelType::Dm,
        1,
        Duration::from_secs(60),
    )
    .await;

    let result = h
        .supervisor
        .process(InboundMessage::new("room", "alice", "price of BTC and ETH"))
        .await
        .unwrap();

    assert_eq!(result.trace.len(), 1);
    assert_eq!(result.termination, Some(Termination::MaxIterations));
    assert!(result.responded);
    assert!(!result.content.unwrap().text.is_empty());
    let decisions = h
        .llm
        .last_user_prompts()
        .iter()
        .filter(|p| is_decision_prompt(p))
        .count();
    assert_eq!(decisions, 1);
}

#[tokio::test]
async fn test_trace_never_exceeds_max_iterations() {
    for max_iterations in 1..=4 {
        let h = harness(
            ScriptedLlmClient::from_fn(|messages, _| {
                if is_decision_prompt(&last_user(messages)) {
                    Ok(PRICE_STEP.to_string())
                } else {
                    Ok(r#"{"text": "done"}"#.to_string())
                }
            }),
            ChannelType::Dm,
            max_iterations,
            Duration::from_secs(60),
        )
        .await;
        let result = h
            .supervisor
            .process(InboundMessage::new("room", "alice", "keep going"))
            .await
            .unwrap();
        assert_eq!(result.trace.len(), max_iterations);
        assert_eq!(result.termination, Some(Termination::MaxIterations));
    }
}

#[tokio::test(start_paused = true)]
async fn test_summary_failure_falls_back_to_fixed_content() {
    let h = harness(
        ScriptedLlmClient::from_fn(|messages, _| {
            let prompt = last_user(messages);
            if is_decision_prompt(&prompt) {
                if prompt.contains("GET_PRICE succeeded") {
                    Ok(FINISH.to_string())
                } else {
                    Ok(PRICE_STEP.to_string())
                }
            } else {
                Ok("I'd rather not format this".to_string())
            }
        }),
        ChannelType::Dm,
        6,
        Duration::from_secs(120),
    )
    .await;

    let result = h
        .supervisor
        .process(InboundMessage::new("room", "alice", "price of BTC"))
        .await
        .unwrap();
    assert!(result.responded);
    assert_eq!(result.trace.len(), 1);
    assert_eq!(result.content.unwrap().text, FALLBACK_TEXT);
}

#[tokio::test]
async fn test_group_message_classified_ignore_is_silent() {
    let h = harness(
        finance_llm("IGNORE", "should not be sent"),
        ChannelType::Group,
        6,
        Duration::from_secs(60),
    )
    .await;

    let result = h
        .supervisor
        .process(InboundMessage::new("room", "bob", "lol nice"))
        .await
        .unwrap();
    assert!(!result.responded);
    assert!(!result.decision.should_engage);
    assert!(!result.decision.skip_further_evaluation);
    assert_eq!(h.llm.calls(), 1);
    assert!(h.delivery.message_ids().is_empty());
    assert_eq!(h.sink.terminal_statuses(), vec![RunStatus::Ignored]);
}

#[tokio::test]
async fn test_group_mention_engages_without_classification() {
    let h = harness(
        finance_llm("IGNORE", "BTC is 60,000 USD."),
        ChannelType::Group,
        6,
        Duration::from_secs(60),
    )
    .await;
    let msg = InboundMessage::new("room", "bob", "@FinBee price of BTC").with_mention(
        finbee::core::MentionContext {
            is_mention: true,
            is_reply: false,
        },
    );
    let result = h.supervisor.process(msg).await.unwrap();
    assert!(result.responded);
    assert!(!h
        .llm
        .last_user_prompts()
        .iter()
        .any(|p| p.contains("RESPOND | IGNORE | STOP")));
}

#[tokio::test(start_paused = true)]
async fn test_token_map_drains_after_burst() {
    let h = harness(
        finance_llm("IGNORE", "answer").with_delay(Duration::from_millis(10)),
        ChannelType::Dm,
        6,
        Duration::from_secs(60),
    )
    .await;
    for room in ["r1", "r2", "r3", "r4"] {
        h.store.open_room(room, ChannelType::Dm).await;
    }

    let rooms = ["room", "r1", "r2", "r3", "r4"];
    let runs = (0..25).map(|i| {
        let supervisor = h.supervisor.clone();
        let msg = InboundMessage::new(rooms[i % rooms.len()], "alice", format!("price of BTC #{}", i));
        async move { supervisor.process(msg).await }
    });
    let results = join_all(runs).await;

    let delivered = results.iter().filter(|r| matches!(r, Ok(res) if res.responded)).count();
    let superseded = results
        .iter()
        .filter(|r| matches!(r, Err(AgentError::Superseded { .. })))
        .count();
    assert_eq!(delivered, rooms.len());
    assert_eq!(superseded, 25 - rooms.len());
    assert!(h.supervisor.races().is_empty());

    assert_eq!(h.sink.count(RunEventKind::RunStarted), 25);
    assert_eq!(h.sink.terminal_statuses().len(), 25);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_in_flight_run() {
    let h = harness(
        finance_llm("IGNORE", "never").with_delay(Duration::from_secs(1)),
        ChannelType::Dm,
        6,
        Duration::from_secs(60),
    )
    .await;

    let supervisor = h.supervisor.clone();
    let (result, _) = tokio::join!(
        h.supervisor
            .process(InboundMessage::new("room", "alice", "price of BTC")),
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            supervisor
                .shutdown_manager()
                .shutdown(ShutdownReason::UserInitiated);
        }
    );

    assert!(matches!(result, Err(AgentError::Cancelled)));
    assert_eq!(h.sink.terminal_statuses(), vec![RunStatus::Cancelled]);
    assert!(h.delivery.message_ids().is_empty());
    assert!(h.supervisor.races().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_run_still_emits_terminal_event() {
    let h = harness(
        finance_llm("IGNORE", "never").with_delay(Duration::from_secs(5)),
        ChannelType::Dm,
        6,
        Duration::from_secs(60),
    )
    .await;

    let outer = tokio::time::timeout(
        Duration::from_millis(100),
        h.supervisor
            .process(InboundMessage::new("room", "alice", "price of BTC")),
    )
    .await;
    assert!(outer.is_err());

    assert_eq!(h.sink.count(RunEventKind::RunStarted), 1);
    assert_eq!(h.sink.terminal_statuses(), vec![RunStatus::Cancelled]);
    assert!(h.delivery.message_ids().is_empty());
    assert!(h.supervisor.races().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_delivery_is_bounded_by_run_budget() {
    let llm = Arc::new(ScriptedLlmClient::from_fn(|messages, _| {
        if is_decision_prompt(&last_user(messages)) {
            Ok(FINISH.to_string())
        } else {
            Ok(r#"{"text": "BTC is 60,000 USD."}"#.to_string())
        }
    }));
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    let store = Arc::new(InMemorySnapshotStore::new(
        Persona::new("FinBee", "A concise finance assistant."),
        vec![],
        20,
    ));
    store.open_room("room", ChannelType::Dm).await;
    let sink = Arc::new(RecordingSink::default());
    let supervisor = RunSupervisor::builder()
        .with_llm(llm)
        .with_invoker(Arc::new(ToolExecutor::new(registry, 30)))
        .with_snapshots(store)
        .with_delivery(Arc::new(StalledDelivery))
        .with_lifecycle(sink.clone())
        .with_run_timeout(Duration::from_millis(50))
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(60),
        supervisor.process(InboundMessage::new("room", "alice", "price of BTC")),
    )
    .await
    .expect("process must finish within its own budget");

    assert!(matches!(result, Err(AgentError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(sink.count(RunEventKind::RunTimeout), 1);
    assert_eq!(sink.terminal_statuses(), vec![RunStatus::TimedOut]);
    assert!(supervisor.races().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_summary_retries() {
    let h = harness(
        ScriptedLlmClient::from_fn(|messages, _| {
            if is_decision_prompt(&last_user(messages)) {
                Ok(FINISH.to_string())
            } else {
                Ok("not a summary".to_string())
            }
        }),
        ChannelType::Dm,
        6,
        Duration::from_secs(60),
    )
    .await;

    let started = tokio::time::Instant::now();
    let supervisor = h.supervisor.clone();
    let (result, _) = tokio::join!(
        h.supervisor
            .process(InboundMessage::new("room", "alice", "price of BTC")),
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            supervisor
                .shutdown_manager()
                .shutdown(ShutdownReason::UserInitiated);
        }
    );

    assert!(matches!(result, Err(AgentError::Cancelled)));
    // 一次决策 + 一次总结尝试，不再等待退避
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.llm.calls(), 2);
    assert_eq!(h.sink.terminal_statuses(), vec![RunStatus::Cancelled]);
    assert!(h.delivery.message_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_policy_classification() {
    let h = harness(
        finance_llm("RESPOND", "never").with_delay(Duration::from_secs(5)),
        ChannelType::Group,
        6,
        Duration::from_secs(60),
    )
    .await;

    let started = tokio::time::Instant::now();
    let supervisor = h.supervisor.clone();
    let (result, _) = tokio::join!(
        h.supervisor
            .process(InboundMessage::new("room", "bob", "what about BTC?")),
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            supervisor
                .shutdown_manager()
                .shutdown(ShutdownReason::UserInitiated);
        }
    );

    assert!(matches!(result, Err(AgentError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.llm.calls(), 1);
    assert_eq!(h.sink.terminal_statuses(), vec![RunStatus::Cancelled]);
}
