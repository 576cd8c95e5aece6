//! End-to-end flow execution through the dispatcher and the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flow_engine::dispatcher::{
    CronHandler, CronHandlers, Dispatcher, DispatcherConfig, PartitionAssignment,
};
use flow_engine::engine::{Clock, ExponentialBackoff, Interpreter, ManualClock};
use flow_engine::model::{
    CronJob, Flow, FlowBranch, FlowDefinition, FlowStatus, FlowStepDefinition, StepStatus,
};
use flow_engine::services::FlowService;
use flow_engine::store::{CronJobStore, FlowStore, MemoryStore};
use flow_steps::steps::{DelayStep, SetStep};
use flow_steps::{StepConfig, StepContext, StepError, StepExecutor, StepOutcome, StepRegistry};
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

/// Webhook stand-in that counts calls.
struct CountingWebhook {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl StepExecutor for CountingWebhook {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn execute(&self, _config: &StepConfig, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutcome::completed().with_log(format!("sent with key {}", ctx.idempotency_key())))
    }
}

struct AlwaysFails;

#[async_trait]
impl StepExecutor for AlwaysFails {
    fn kind(&self) -> &'static str {
        "fail"
    }

    async fn execute(&self, _config: &StepConfig, _ctx: &StepContext) -> Result<StepOutcome, StepError> {
        Ok(StepOutcome::failed("upstream unavailable"))
    }
}

/// Blocks until released, so a test can act while a claim is held.
struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl StepExecutor for Gate {
    fn kind(&self) -> &'static str {
        "gate"
    }

    async fn execute(&self, _config: &StepConfig, _ctx: &StepContext) -> Result<StepOutcome, StepError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(StepOutcome::completed())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    dispatcher: Dispatcher,
}

impl Harness {
    fn new(registry: StepRegistry) -> Self {
        Self::with_cron(registry, CronHandlers::new())
    }

    fn with_cron(registry: StepRegistry, cron_handlers: CronHandlers) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let interpreter = Interpreter::new(registry)
            .with_clock(clock.clone())
            .with_retry_policy(Arc::new(ExponentialBackoff::new(
                3,
                Duration::from_secs(1),
                Duration::from_secs(10),
                2.0,
            )));
        let dispatcher = Dispatcher::new(
            store.clone(),
            store.clone(),
            interpreter,
            cron_handlers,
            DispatcherConfig {
                worker_id: "test".to_string(),
                cron_retry_delay: Duration::from_secs(60),
                ..DispatcherConfig::default()
            },
            clock.clone(),
        );

        Self {
            store,
            clock,
            dispatcher,
        }
    }

    async fn insert(&self, definition: FlowDefinition, context: serde_json::Value) -> Uuid {
        let now = self.clock.now();
        let flow = Flow::new("rule-1", definition, context, now, now);
        FlowStore::insert(self.store.as_ref(), &flow).await.unwrap();
        flow.id
    }

    async fn flow(&self, id: Uuid) -> Flow {
        FlowStore::get(self.store.as_ref(), id).await.unwrap().unwrap()
    }

    /// Tick until the flow is terminal, jumping the clock to each due time.
    async fn run_to_end(&self, id: Uuid) -> Flow {
        for _ in 0..50 {
            let flow = self.flow(id).await;
            match flow.due_time {
                None => return flow,
                Some(due) if due > self.clock.now() => self.clock.set(due),
                Some(_) => {}
            }
            self.dispatcher.tick().await;
        }
        panic!("flow {} did not finish", id);
    }
}

fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn step(kind: &str, config: serde_json::Value) -> FlowStepDefinition {
    FlowStepDefinition::new(StepConfig::new(kind, config))
}

#[tokio::test]
async fn delay_then_webhook_scenario() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = StepRegistry::new();
    registry.register(DelayStep::new());
    registry.register(CountingWebhook {
        calls: calls.clone(),
    });
    let h = Harness::new(registry);

    let definition = FlowDefinition::new("publish-hook", "1")
        .with_step("1", step("delay", json!({"seconds": 30})).with_next("2"))
        .with_step("2", step("webhook", json!({"url": "https://example.com/hook"})));
    let id = h.insert(definition, json!({"event": {"id": 1}})).await;

    // First claim: the delay suspends.
    let report = h.dispatcher.tick().await;
    assert_eq!(report.flows_claimed, 1);
    assert_eq!(report.flows_advanced, 1);

    let flow = h.flow(id).await;
    assert_eq!(flow.state.status, FlowStatus::Scheduled);
    assert_eq!(flow.due_time, Some(start() + chrono::Duration::seconds(30)));
    assert_eq!(flow.state.next_step_id.as_deref(), Some("1"));
    assert_eq!(flow.state.steps["1"].attempts.len(), 1);

    // Nothing is due before the delay elapses.
    assert_eq!(h.dispatcher.tick().await.flows_claimed, 0);

    // Second claim: the delay completes.
    h.clock.advance(chrono::Duration::seconds(30));
    h.dispatcher.tick().await;
    let flow = h.flow(id).await;
    assert_eq!(flow.state.steps["1"].status, StepStatus::Completed);
    assert_eq!(flow.state.next_step_id.as_deref(), Some("2"));
    assert_eq!(flow.state.status, FlowStatus::Running);

    // Third claim: the webhook runs and the flow completes.
    h.dispatcher.tick().await;
    let flow = h.flow(id).await;
    assert_eq!(flow.state.status, FlowStatus::Completed);
    assert!(flow.state.completed.is_some());
    assert_eq!(flow.state.next_step_id, None);
    assert_eq!(flow.due_time, None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        flow.state.steps["2"].attempts[0].log[0],
        format!("sent with key {}:2:0", id)
    );
}

#[tokio::test]
async fn reclaim_after_crash_yields_same_state() {
    let mut registry = StepRegistry::new();
    registry.register(SetStep::new());
    let h = Harness::new(registry);

    let definition = FlowDefinition::new("tag", "1")
        .with_step("1", step("set", json!({"values": {"tagged": true}})));
    let id = h.insert(definition, json!({})).await;
    let lease = h.dispatcher.config().lease;

    // A worker claims the flow and dies before persisting.
    let crashed = FlowStore::claim_due(
        h.store.as_ref(),
        &PartitionAssignment::All,
        h.clock.now(),
        lease,
        10,
    )
    .await
    .unwrap();
    assert_eq!(crashed.len(), 1);

    // Not claimable while the lease holds.
    assert_eq!(h.dispatcher.tick().await.flows_claimed, 0);

    // After the lease another worker picks it up and finishes it.
    h.clock.advance(chrono::Duration::from_std(lease).unwrap());
    let report = h.dispatcher.tick().await;
    assert_eq!(report.flows_claimed, 1);
    let recovered = h.flow(id).await;

    // Running the interpreter on the crashed claim's state gives the same result.
    let interpreter = Interpreter::new({
        let mut registry = StepRegistry::new();
        registry.register(SetStep::new());
        registry
    })
    .with_clock(h.clock.clone());
    let replay = interpreter.advance(id, &crashed[0].state).await;

    assert_eq!(recovered.state, replay.state);
    assert_eq!(recovered.state.status, FlowStatus::Completed);
    assert_eq!(recovered.state.context["tagged"], json!(true));
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let mut registry = StepRegistry::new();
    registry.register(SetStep::new());
    let h = Harness::new(registry);

    let definition = FlowDefinition::new("tag", "1")
        .with_step("1", step("set", json!({"values": {"tagged": true}})));
    h.insert(definition, json!({})).await;

    let store: Arc<dyn FlowStore> = h.store.clone();
    let now = h.clock.now();
    let claims = futures::future::join_all((0..8).map(|_| {
        let store = store.clone();
        async move {
            store
                .claim_due(&PartitionAssignment::All, now, Duration::from_secs(60), 10)
                .await
                .unwrap()
                .len()
        }
    }))
    .await;

    assert_eq!(claims.iter().sum::<usize>(), 1);
}

#[tokio::test]
async fn overlapping_ticks_advance_a_flow_once() {
    let mut registry = StepRegistry::new();
    registry.register(SetStep::new());
    let h = Harness::new(registry);

    let definition = FlowDefinition::new("tag", "1")
        .with_step("1", step("set", json!({"values": {"tagged": true}})));
    let id = h.insert(definition, json!({})).await;

    let other = h.dispatcher.clone();
    let (a, b) = tokio::join!(h.dispatcher.tick(), other.tick());

    assert_eq!(a.flows_claimed + b.flows_claimed, 1);
    assert_eq!(h.flow(id).await.state.steps["1"].attempts.len(), 1);
}

#[tokio::test]
async fn always_failing_step_stops_after_three_attempts() {
    let mut registry = StepRegistry::new();
    registry.register(AlwaysFails);
    let h = Harness::new(registry);

    let definition = FlowDefinition::new("flaky", "1").with_step("1", step("fail", json!({})));
    let id = h.insert(definition, json!({})).await;

    let flow = h.run_to_end(id).await;

    assert_eq!(flow.state.status, FlowStatus::Failed);
    assert_eq!(flow.state.steps["1"].attempts.len(), 3);
    assert_eq!(flow.state.steps["1"].status, StepStatus::Failed);
    assert_eq!(
        flow.state.error.as_deref(),
        Some("Step '1' failed after 3 attempt(s): upstream unavailable")
    );
    assert_eq!(flow.due_time, None);
}

#[tokio::test]
async fn out_of_range_delay_fails_the_flow() {
    let mut registry = StepRegistry::new();
    registry.register(DelayStep::new());
    let h = Harness::new(registry);

    let definition = FlowDefinition::new("forever", "1")
        .with_step("1", step("delay", json!({"seconds": 10_000_000_000_000u64})));
    let id = h.insert(definition, json!({})).await;

    for _ in 0..3 {
        let flow = h.flow(id).await;
        if let Some(due) = flow.due_time {
            if due > h.clock.now() {
                h.clock.set(due);
            }
        }
        let report = h.dispatcher.tick().await;
        assert_eq!(report.errors, 0);
        assert_eq!(report.flows_advanced, 1);
    }

    let flow = h.flow(id).await;
    assert_eq!(flow.state.status, FlowStatus::Failed);
    assert_eq!(flow.due_time, None);
    assert_eq!(flow.state.steps["1"].attempts.len(), 3);
    assert!(flow
        .state
        .steps["1"]
        .last_error()
        .unwrap_or_default()
        .contains("out of range"));
}

#[tokio::test]
async fn ignored_failure_routes_to_next_step() {
    let mut registry = StepRegistry::new();
    registry.register(AlwaysFails);
    registry.register(SetStep::new());
    let h = Harness::new(registry);

    let definition = FlowDefinition::new("best-effort", "1")
        .with_step("1", step("fail", json!({})).ignoring_errors().with_next("2"))
        .with_step("2", step("set", json!({"values": {"after": true}})));
    let id = h.insert(definition, json!({})).await;

    let flow = h.run_to_end(id).await;

    assert_eq!(flow.state.status, FlowStatus::Completed);
    assert_eq!(flow.state.steps["1"].status, StepStatus::Failed);
    assert_eq!(flow.state.steps["1"].attempts.len(), 1);
    assert_eq!(flow.state.steps["2"].status, StepStatus::Completed);
    assert_eq!(flow.state.context["after"], json!(true));
}

#[tokio::test]
async fn branch_resolution_is_deterministic() {
    let mut registry = StepRegistry::new();
    registry.register(SetStep::new());
    let interpreter = Interpreter::new(registry).with_clock(Arc::new(ManualClock::new(start())));

    let definition = FlowDefinition::new("route", "check")
        .with_step(
            "check",
            step("set", json!({"values": {}}))
                .with_branch(FlowBranch::when("event.kind == 'image'", "c1"))
                .with_branch(FlowBranch::when("event.kind == 'video'", "c2"))
                .with_branch(FlowBranch::otherwise("fallback")),
        )
        .with_step("c1", step("set", json!({"values": {}})))
        .with_step("c2", step("set", json!({"values": {}})))
        .with_step("fallback", step("set", json!({"values": {}})));

    let state = flow_engine::model::FlowExecutionState::new(
        definition,
        json!({"event": {"kind": "video"}}),
        start(),
    );

    for _ in 0..10 {
        let transition = interpreter.advance(Uuid::new_v4(), &state).await;
        assert_eq!(transition.state.next_step_id.as_deref(), Some("c2"));
    }
}

#[tokio::test]
async fn cancel_during_claim_discards_transition() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let mut registry = StepRegistry::new();
    registry.register(Gate {
        entered: entered.clone(),
        release: release.clone(),
    });
    let h = Harness::new(registry);

    let definition = FlowDefinition::new("gated", "1").with_step("1", step("gate", json!({})));
    let id = h.insert(definition, json!({})).await;

    let service = FlowService::new(h.store.clone(), h.store.clone(), h.clock.clone());
    let dispatcher = h.dispatcher.clone();
    let tick = tokio::spawn(async move { dispatcher.tick().await });

    entered.notified().await;
    assert_eq!(service.cancel(id).await.unwrap(), FlowStatus::Cancelled);
    release.notify_one();

    let report = tick.await.unwrap();
    assert_eq!(report.conflicts, 1);

    let flow = h.flow(id).await;
    assert_eq!(flow.state.status, FlowStatus::Cancelled);
    assert_eq!(flow.due_time, None);
    assert_eq!(flow.state.steps["1"].attempts.len(), 0);
}

/// Reschedules itself an hour later.
struct Hourly {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl CronHandler for Hourly {
    fn kind(&self) -> &'static str {
        "hourly"
    }

    async fn run(&self, _job: &CronJob, now: DateTime<Utc>) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(Some(now + chrono::Duration::hours(1)))
    }
}

/// Runs once.
struct Once;

#[async_trait]
impl CronHandler for Once {
    fn kind(&self) -> &'static str {
        "once"
    }

    async fn run(&self, _job: &CronJob, _now: DateTime<Utc>) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(None)
    }
}

#[tokio::test]
async fn cron_jobs_are_dispatched_to_handlers() {
    let runs = Arc::new(AtomicUsize::new(0));
    let handlers = CronHandlers::new()
        .with(Hourly { runs: runs.clone() })
        .with(Once);
    let h = Harness::with_cron(StepRegistry::new(), handlers);
    let cron: Arc<dyn CronJobStore> = h.store.clone();

    for (id, kind) in [("cleanup", "hourly"), ("import", "once"), ("mystery", "unknown")] {
        cron.upsert(&CronJob::new(id, kind, json!({}), start())).await.unwrap();
    }

    let report = h.dispatcher.tick().await;
    assert_eq!(report.cron_jobs_claimed, 3);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let cleanup = cron.get("cleanup").await.unwrap().unwrap();
    assert_eq!(cleanup.due_time, start() + chrono::Duration::hours(1));
    assert!(cron.get("import").await.unwrap().is_none());
    let mystery = cron.get("mystery").await.unwrap().unwrap();
    assert_eq!(mystery.due_time, start() + chrono::Duration::seconds(60));

    // Nothing due until the clock moves.
    assert_eq!(h.dispatcher.tick().await.cron_jobs_claimed, 0);
}

#[tokio::test]
async fn start_and_stop_drive_flows_in_background() {
    let mut registry = StepRegistry::new();
    registry.register(SetStep::new());
    let h = Harness::new(registry);

    let definition = FlowDefinition::new("tag", "1")
        .with_step("1", step("set", json!({"values": {"tagged": true}})).with_next("2"))
        .with_step("2", step("set", json!({"values": {"done": true}})));
    let id = h.insert(definition, json!({})).await;

    let handle = h.dispatcher.start();
    for _ in 0..100 {
        if h.flow(id).await.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop().await;

    let flow = h.flow(id).await;
    assert_eq!(flow.state.status, FlowStatus::Completed);
    assert_eq!(flow.state.context["done"], json!(true));
}
