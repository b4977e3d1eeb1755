use async_trait::async_trait;
use federation::completion::{
    ChatTurn, CompletionRequest, CompletionResponse, CompletionService, ToolInvocation,
};
use federation::config::defaults::default_templates;
use federation::error::FederationError;
use federation::federation::{Federation, FederationOptions};
use federation::master::MasterSettings;
use federation::orchestration::events::{Event, EventKind};
use federation::orchestration::state::NewDelegation;
use federation::orchestration::types::{
    CompletionOutcome, Intention, MasterStatus, SpawnRequest, WorkerStatus,
};
use federation::worker::WorkspaceTools;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

// ─── Scripted completion service ──────────────────────────────────────

type MasterStep =
    Box<dyn Fn(&CompletionRequest) -> Result<CompletionResponse, FederationError> + Send + Sync>;

fn step(
    f: impl Fn(&CompletionRequest) -> Result<CompletionResponse, FederationError> + Send + Sync + 'static,
) -> MasterStep {
    Box::new(f)
}

/// How worker requests are answered.
enum WorkerMode {
    /// Reply `processed: <last user message>`.
    Echo,
    /// First call writes a file, second call answers.
    WriteThenAnswer,
    /// Every call fails.
    Fail,
    /// Wait for a permit, then echo.
    Gated(Arc<Semaphore>),
}

/// In-process stand-in for the model. Requests offering the `delegate` tool
/// are master requests and consume the master script; all others are worker
/// requests answered according to `WorkerMode`.
struct ScriptedService {
    master: Mutex<VecDeque<MasterStep>>,
    worker: WorkerMode,
}

impl ScriptedService {
    fn new(worker: WorkerMode) -> Self {
        Self {
            master: Mutex::new(VecDeque::new()),
            worker,
        }
    }

    fn with_master(self, steps: Vec<MasterStep>) -> Self {
        *self.master.lock().unwrap() = steps.into();
        self
    }
}

#[async_trait]
impl CompletionService for ScriptedService {
    async fn complete(
        &self,
        request: &CompletionRequest,
        on_text: &(dyn for<'s> Fn(&'s str) + Send + Sync),
    ) -> Result<CompletionResponse, FederationError> {
        if request.tools.iter().any(|t| t.name == "delegate") {
            let next = self.master.lock().unwrap().pop_front();
            let response = match next {
                Some(next) => next(request)?,
                None => CompletionResponse::text("script exhausted"),
            };
            on_text(&response.text);
            return Ok(response);
        }

        let response = match &self.worker {
            WorkerMode::Echo => echo(request),
            WorkerMode::Fail => {
                return Err(FederationError::ExternalServiceFailure("model unavailable".into()));
            }
            WorkerMode::Gated(gate) => {
                let _permit = gate.acquire().await.expect("gate closed");
                echo(request)
            }
            WorkerMode::WriteThenAnswer => match request.messages.last() {
                Some(ChatTurn::Tool { .. }) => CompletionResponse::text("wrote hello.txt"),
                _ => CompletionResponse::tools(vec![call(
                    "write_file",
                    json!({"path": "hello.txt", "content": "hello"}),
                )]),
            },
        };
        // Stream word by word, as a real provider would.
        for chunk in response.text.split_inclusive(' ') {
            let chunk = chunk.to_string();
            on_text(&chunk);
        }
        Ok(response)
    }
}

fn echo(request: &CompletionRequest) -> CompletionResponse {
    let last_user = request
        .messages
        .iter()
        .rev()
        .find_map(|m| match m {
            ChatTurn::User { content } => Some(content.clone()),
            _ => None,
        })
        .unwrap_or_default();
    CompletionResponse::text(format!("processed: {last_user}"))
}

fn call(name: &str, arguments: Value) -> ToolInvocation {
    ToolInvocation {
        call_id: format!("call-{name}"),
        name: name.to_string(),
        arguments,
    }
}

/// JSON content of the most recent tool result in the conversation.
fn last_tool_result(request: &CompletionRequest) -> Value {
    request
        .messages
        .iter()
        .rev()
        .find_map(|m| match m {
            ChatTurn::Tool { content, .. } => serde_json::from_str(content).ok(),
            _ => None,
        })
        .unwrap_or(Value::Null)
}

// ─── Helpers ──────────────────────────────────────────────────────────

fn build(tmp: &TempDir, service: ScriptedService, options: FederationOptions) -> Federation {
    let tools = WorkspaceTools::new(&tmp.path().join("workspace")).unwrap();
    Federation::new(Arc::new(service), tools, default_templates(), options).unwrap()
}

fn record(federation: &Federation) -> Arc<Mutex<Vec<Event>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    federation.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
    events
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

fn kinds_for(events: &[Event], worker_id: &str) -> Vec<EventKind> {
    events
        .iter()
        .filter(|e| e.worker_id.as_deref() == Some(worker_id))
        .map(|e| e.kind)
        .collect()
}

/// A run's events must be `worker_started`, then its streamed text, then
/// `worker_done`.
fn assert_run_order(kinds: &[EventKind]) {
    let position = |kind: EventKind| kinds.iter().position(|k| *k == kind);
    let started = position(EventKind::WorkerStarted).expect("no worker_started");
    let first_text = position(EventKind::WorkerText).expect("no worker_text");
    let last_text = kinds.iter().rposition(|k| *k == EventKind::WorkerText).unwrap();
    let done = position(EventKind::WorkerDone).expect("no worker_done");
    assert!(started < first_text, "text before start: {kinds:?}");
    assert!(last_text < done, "text after done: {kinds:?}");
}

fn spawn(federation: &Federation) -> String {
    federation
        .state()
        .spawn_worker(SpawnRequest::Template("general".into()))
        .unwrap()
        .id
}

// ============================================================
// End to end through the master loop
// ============================================================

#[tokio::test]
async fn master_spawns_delegates_and_collects_result() {
    let tmp = TempDir::new().unwrap();
    let steps: Vec<MasterStep> = vec![
        step(|_| {
            Ok(CompletionResponse::tools(vec![call(
                "spawn_agent",
                json!({"template_name": "coder"}),
            )]))
        }),
        step(|req| {
            let agent_id = last_tool_result(req)["agent_id"].as_str().unwrap().to_string();
            Ok(CompletionResponse::tools(vec![call(
                "delegate",
                json!({"agent_id": agent_id, "task": "Create hello.txt", "intention": "return_to_user"}),
            )]))
        }),
        step(|_| {
            Ok(CompletionResponse::tools(vec![call("get_completed", json!({"wait_secs": 5}))]))
        }),
        step(|req| {
            let result = last_tool_result(req)["completed"][0]["result"]
                .as_str()
                .unwrap_or("nothing")
                .to_string();
            Ok(CompletionResponse::text(format!("Final: {result}")))
        }),
    ];
    let federation = build(
        &tmp,
        ScriptedService::new(WorkerMode::WriteThenAnswer).with_master(steps),
        FederationOptions::default(),
    );
    let events = record(&federation);

    let answer = federation.run("Please create hello.txt").await.unwrap();

    assert_eq!(answer, "Final: wrote hello.txt");
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("workspace/hello.txt")).unwrap(),
        "hello"
    );

    let table = federation.worker_table();
    assert_eq!(table.len(), 1);
    assert_eq!(table[0].worker_type, "coder");
    assert_eq!(table[0].status, WorkerStatus::HasResult);
    assert_eq!(federation.state().master_status(), MasterStatus::Idle);

    let events = events.lock().unwrap();
    let worker_kinds = kinds_for(&events, &table[0].id);
    assert_run_order(&worker_kinds);
    assert_eq!(events.last().unwrap().kind, EventKind::MasterDone);
}

#[tokio::test]
async fn master_tool_errors_are_returned_as_json() {
    let tmp = TempDir::new().unwrap();
    let steps: Vec<MasterStep> = vec![
        step(|_| {
            Ok(CompletionResponse::tools(vec![call(
                "delegate",
                json!({"agent_id": "missing", "task": "x", "intention": "return_to_user"}),
            )]))
        }),
        step(|req| {
            let error = last_tool_result(req)["error"].as_str().unwrap_or_default().to_string();
            Ok(CompletionResponse::text(error))
        }),
    ];
    let federation = build(
        &tmp,
        ScriptedService::new(WorkerMode::Echo).with_master(steps),
        FederationOptions::default(),
    );

    let answer = federation.run("go").await.unwrap();
    assert!(answer.contains("not found"), "got {answer}");
}

#[tokio::test]
async fn master_iteration_limit_is_enforced() {
    let tmp = TempDir::new().unwrap();
    let steps: Vec<MasterStep> = (0..10)
        .map(|_| step(|_| Ok(CompletionResponse::tools(vec![call("list_agent_types", json!({}))]))))
        .collect();
    let options = FederationOptions {
        master: MasterSettings {
            max_iterations: 3,
            turn_timeout: None,
        },
        ..FederationOptions::default()
    };
    let federation = build(&tmp, ScriptedService::new(WorkerMode::Echo).with_master(steps), options);
    let events = record(&federation);

    let err = federation.run("loop forever").await.unwrap_err();

    assert_eq!(err, FederationError::IterationLimit { limit: 3 });
    assert_eq!(federation.state().master_status(), MasterStatus::Idle);
    let events = events.lock().unwrap();
    let thinking = events.iter().filter(|e| e.kind == EventKind::MasterThinking).count();
    assert_eq!(thinking, 3);
    assert_eq!(events.last().unwrap().kind, EventKind::MasterError);
}

#[tokio::test]
async fn master_service_failure_aborts_the_turn() {
    let tmp = TempDir::new().unwrap();
    let steps: Vec<MasterStep> = vec![step(|_| {
        Err(FederationError::ExternalServiceFailure("rate limited".into()))
    })];
    let federation = build(
        &tmp,
        ScriptedService::new(WorkerMode::Echo).with_master(steps),
        FederationOptions::default(),
    );

    let err = federation.run("hello").await.unwrap_err();
    assert!(matches!(err, FederationError::ExternalServiceFailure(_)));

    // The next turn proceeds normally with the exhausted script.
    assert_eq!(federation.run("again").await.unwrap(), "script exhausted");
}

#[tokio::test]
async fn failed_turn_keeps_results_already_collected() {
    let tmp = TempDir::new().unwrap();
    let steps: Vec<MasterStep> = vec![
        step(|_| Ok(CompletionResponse::tools(vec![call("get_completed", json!({}))]))),
        step(|_| Err(FederationError::ExternalServiceFailure("throttled".into()))),
        step(|req| {
            let remembered = req.messages.iter().any(|m| {
                matches!(m, ChatTurn::Tool { content, .. } if content.contains("processed: summarize"))
            });
            Ok(CompletionResponse::text(if remembered { "remembered" } else { "lost" }))
        }),
    ];
    let federation = build(
        &tmp,
        ScriptedService::new(WorkerMode::Echo).with_master(steps),
        FederationOptions::default(),
    );
    let state = federation.state().clone();
    let w = spawn(&federation);
    federation.dispatcher().start(&w, "summarize").unwrap();
    wait_for(|| state.pending_completions() == 1).await;

    let err = federation.run("what finished?").await.unwrap_err();
    assert!(matches!(err, FederationError::ExternalServiceFailure(_)));
    assert_eq!(state.pending_completions(), 0);

    assert_eq!(federation.run("and?").await.unwrap(), "remembered");
}

// ============================================================
// Worker lifecycle through the dispatcher
// ============================================================

#[tokio::test]
async fn delegate_returns_immediately_and_result_arrives_later() {
    let tmp = TempDir::new().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let federation = build(
        &tmp,
        ScriptedService::new(WorkerMode::Gated(gate.clone())),
        FederationOptions::default(),
    );
    let state = federation.state().clone();
    let w = spawn(&federation);
    assert_eq!(state.get_worker(&w).unwrap().status, WorkerStatus::Idle);

    federation.dispatcher().start(&w, "summarize").unwrap();
    assert_eq!(state.get_worker(&w).unwrap().status, WorkerStatus::Busy);
    assert!(state.pop_completed().is_none());

    gate.add_permits(1);
    wait_for(|| state.pending_completions() == 1).await;

    let completion = state.pop_completed().unwrap();
    assert_eq!(completion.worker_id, w);
    assert_eq!(completion.result(), Some("processed: summarize"));
    assert!(state.pop_completed().is_none());
    assert_eq!(state.get_worker(&w).unwrap().status, WorkerStatus::HasResult);

    let cleared = state.clear_context(&w).unwrap();
    assert_eq!(cleared.status, WorkerStatus::Idle);
    assert_eq!(cleared.context_messages, 0);
    assert_eq!(cleared.config.name, "general");
}

#[tokio::test]
async fn delegating_to_busy_worker_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let federation = build(
        &tmp,
        ScriptedService::new(WorkerMode::Gated(gate.clone())),
        FederationOptions::default(),
    );
    let w = spawn(&federation);

    federation.dispatcher().start(&w, "first").unwrap();
    let err = federation.dispatcher().start(&w, "second").unwrap_err();

    assert!(matches!(err, FederationError::InvalidState(_)));
    let info = federation.state().get_worker(&w).unwrap();
    assert_eq!(info.status, WorkerStatus::Busy);
    assert_eq!(info.current_task.as_deref(), Some("first"));

    gate.add_permits(1);
    federation.shutdown().await;
}

#[tokio::test]
async fn delegating_to_terminated_worker_is_invalid_state() {
    let tmp = TempDir::new().unwrap();
    let federation = build(&tmp, ScriptedService::new(WorkerMode::Echo), FederationOptions::default());
    let w = spawn(&federation);
    federation.state().terminate_worker(&w).unwrap();

    let err = federation.dispatcher().start(&w, "too late").unwrap_err();
    assert_eq!(err, FederationError::InvalidState(format!("worker {w} is terminated")));

    let err = federation.dispatcher().start("never-issued", "task").unwrap_err();
    assert!(matches!(err, FederationError::NotFound { .. }));
    assert!(federation.state().get_worker(&w).is_none());
}

#[tokio::test]
async fn worker_failure_frees_worker_and_emits_terminal_event() {
    let tmp = TempDir::new().unwrap();
    let federation = build(&tmp, ScriptedService::new(WorkerMode::Fail), FederationOptions::default());
    let events = record(&federation);
    let state = federation.state().clone();
    let w = spawn(&federation);

    federation.dispatcher().start(&w, "doomed").unwrap();
    wait_for(|| state.pending_completions() == 1).await;

    let info = state.get_worker(&w).unwrap();
    assert_eq!(info.status, WorkerStatus::Idle);
    assert!(info.last_error.unwrap().contains("model unavailable"));

    let completion = state.pop_completed().unwrap();
    assert!(matches!(completion.outcome, CompletionOutcome::Failed { .. }));

    let kinds = kinds_for(&events.lock().unwrap(), &w);
    assert_eq!(kinds.iter().filter(|k| k.is_worker_terminal()).count(), 1);
    assert!(kinds.contains(&EventKind::WorkerError));
}

#[tokio::test]
async fn terminate_during_run_discards_late_completion() {
    let tmp = TempDir::new().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let federation = build(
        &tmp,
        ScriptedService::new(WorkerMode::Gated(gate.clone())),
        FederationOptions::default(),
    );
    let events = record(&federation);
    let state = federation.state().clone();
    let w = spawn(&federation);

    federation.dispatcher().start(&w, "long task").unwrap();
    state.terminate_worker(&w).unwrap();
    gate.add_permits(1);

    wait_for(|| {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.worker_id.as_deref() == Some(w.as_str()) && e.kind.is_worker_terminal())
    })
    .await;

    assert!(state.pop_completed().is_none());
    assert!(state.get_worker(&w).is_none());
    assert!(federation.worker_table().iter().all(|row| row.id != w));
    let kinds = kinds_for(&events.lock().unwrap(), &w);
    assert!(!kinds.contains(&EventKind::WorkerDone));
}

#[tokio::test]
async fn cancel_stops_the_unit_and_frees_the_worker() {
    let tmp = TempDir::new().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let federation = build(
        &tmp,
        ScriptedService::new(WorkerMode::Gated(gate)),
        FederationOptions::default(),
    );
    let events = record(&federation);
    let state = federation.state().clone();
    let w = spawn(&federation);

    federation.dispatcher().start(&w, "never finishes").unwrap();
    assert!(federation.dispatcher().cancel(&w));
    wait_for(|| state.get_worker(&w).unwrap().status == WorkerStatus::Idle).await;

    wait_for(|| kinds_for(&events.lock().unwrap(), &w).contains(&EventKind::WorkerCancelled)).await;
    assert_eq!(state.get_worker(&w).unwrap().last_error.as_deref(), Some("cancelled"));
}

// ============================================================
// Intention chains
// ============================================================

#[tokio::test]
async fn pass_to_agent_chains_to_the_target() {
    let tmp = TempDir::new().unwrap();
    let federation = build(&tmp, ScriptedService::new(WorkerMode::Echo), FederationOptions::default());
    let events = record(&federation);
    let state = federation.state().clone();
    let a = spawn(&federation);
    let b = spawn(&federation);

    let intention = Intention::PassToAgent {
        target: b.clone(),
        transform: "Review: {result}".into(),
        then: Box::new(Intention::ReturnToUser),
    };
    federation
        .dispatcher()
        .dispatch(NewDelegation::new(&a, "draft", intention))
        .unwrap();

    wait_for(|| state.pending_completions() == 1).await;
    let completion = state.pop_completed().unwrap();

    assert_eq!(completion.worker_id, b);
    assert_eq!(completion.chain, vec![a.clone()]);
    assert_eq!(completion.result(), Some("processed: Review: processed: draft"));
    assert_eq!(state.get_worker(&a).unwrap().status, WorkerStatus::Idle);
    assert_eq!(state.get_worker(&b).unwrap().status, WorkerStatus::HasResult);
    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::DelegationChained));
    assert_run_order(&kinds_for(&events, &a));
    assert_run_order(&kinds_for(&events, &b));
}

#[tokio::test]
async fn cyclic_chain_is_rejected_before_execution() {
    let tmp = TempDir::new().unwrap();
    let federation = build(&tmp, ScriptedService::new(WorkerMode::Echo), FederationOptions::default());
    let events = record(&federation);
    let a = spawn(&federation);
    let b = spawn(&federation);

    let intention = Intention::PassToAgent {
        target: b.clone(),
        transform: "{result}".into(),
        then: Box::new(Intention::PassToAgent {
            target: a.clone(),
            transform: "{result}".into(),
            then: Box::new(Intention::ReturnToUser),
        }),
    };
    let err = federation
        .dispatcher()
        .dispatch(NewDelegation::new(&a, "draft", intention))
        .unwrap_err();

    assert!(matches!(err, FederationError::CycleDetected { .. }));
    assert_eq!(federation.state().get_worker(&a).unwrap().status, WorkerStatus::Idle);
    assert!(
        !events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.kind == EventKind::WorkerStarted)
    );
}

#[tokio::test]
async fn three_link_chain_succeeds() {
    let tmp = TempDir::new().unwrap();
    let federation = build(&tmp, ScriptedService::new(WorkerMode::Echo), FederationOptions::default());
    let state = federation.state().clone();
    let a = spawn(&federation);
    let b = spawn(&federation);
    let c = spawn(&federation);

    let intention = Intention::PassToAgent {
        target: b.clone(),
        transform: "{result}".into(),
        then: Box::new(Intention::PassToAgent {
            target: c.clone(),
            transform: "{result}".into(),
            then: Box::new(Intention::ReviewByMaster),
        }),
    };
    federation
        .dispatcher()
        .dispatch(NewDelegation::new(&a, "start", intention))
        .unwrap();

    wait_for(|| state.pending_completions() == 1).await;
    let completion = state.pop_completed().unwrap();
    assert_eq!(completion.worker_id, c);
    assert_eq!(completion.chain, vec![a, b]);
    assert_eq!(completion.intention, Intention::ReviewByMaster);
}
