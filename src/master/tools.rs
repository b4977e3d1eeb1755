//! Orchestration tools available to the master, and their dispatch.
//!
//! Results are JSON strings. Failures are rendered as `{"error": ...}` so
//! the master's model can observe the problem and adapt; nothing here ever
//! fails the master turn.

use std::time::Duration;

use serde_json::{Value, json};

use crate::completion::{ToolInvocation, ToolSpec};
use crate::error::FederationError;
use crate::orchestration::dispatcher::WorkerDispatcher;
use crate::orchestration::events::{Event, EventBus, EventKind};
use crate::orchestration::state::{NewDelegation, StateManager};
use crate::orchestration::types::{
    Completion, CompletionOutcome, Intention, SpawnRequest, WorkerConfig, WorkerStatus,
};

/// Upper bound for `get_completed`'s optional wait.
const MAX_WAIT_SECS: u64 = 120;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Schemas of every orchestration tool.
pub fn define_tools() -> Vec<ToolSpec> {
    let agent_id = json!({
        "type": "object",
        "properties": {
            "agent_id": { "type": "string", "description": "The ID of the worker agent" }
        },
        "required": ["agent_id"]
    });

    vec![
        ToolSpec::new(
            "list_agent_types",
            "View all available agent templates that can be spawned.",
            json!({ "type": "object", "properties": {} }),
        ),
        ToolSpec::new(
            "list_running_agents",
            "View all worker agents with their status and current task.",
            json!({ "type": "object", "properties": {} }),
        ),
        ToolSpec::new(
            "get_agent_detail",
            "Get detailed information about a specific worker agent, including its last result or error.",
            agent_id.clone(),
        ),
        ToolSpec::new(
            "spawn_agent",
            "Create a new idle worker agent, either from a template or from a custom configuration.",
            json!({
                "type": "object",
                "properties": {
                    "template_name": {
                        "type": "string",
                        "description": "Name of the agent template to use (e.g. 'general', 'researcher', 'coder')"
                    },
                    "config": {
                        "type": "object",
                        "description": "Custom worker configuration, used instead of a template",
                        "properties": {
                            "name": { "type": "string" },
                            "description": { "type": "string" },
                            "system_prompt": { "type": "string" },
                            "tools": { "type": "array", "items": { "type": "string" } }
                        },
                        "required": ["name", "system_prompt"]
                    }
                }
            }),
        ),
        ToolSpec::new(
            "delegate",
            "Assign a task to an idle worker agent. Returns immediately; the worker runs in the \
             background and its result is handled according to the intention. With \
             pass_to_agent the result becomes a new task for `target`, built from `transform` \
             ({result} and {output_path} are substituted).",
            json!({
                "type": "object",
                "properties": {
                    "agent_id": { "type": "string", "description": "The worker to delegate to" },
                    "task": { "type": "string", "description": "The task description for the worker" },
                    "intention": {
                        "type": "string",
                        "enum": ["return_to_user", "pass_to_agent", "review_by_master"],
                        "description": "What to do when the task completes"
                    },
                    "output_path": {
                        "type": "string",
                        "description": "Optional workspace path the worker should write its output to"
                    },
                    "target": {
                        "type": "string",
                        "description": "pass_to_agent only: the worker that receives the result"
                    },
                    "transform": {
                        "type": "string",
                        "description": "pass_to_agent only: task template for the target"
                    },
                    "then": {
                        "type": "string",
                        "enum": ["return_to_user", "review_by_master"],
                        "description": "pass_to_agent only: intention of the follow-up task (default return_to_user)"
                    }
                },
                "required": ["agent_id", "task", "intention"]
            }),
        ),
        ToolSpec::new(
            "clear_agent_context",
            "Reset an idle worker's conversation history while keeping its configuration.",
            agent_id.clone(),
        ),
        ToolSpec::new(
            "terminate_agent",
            "Shut down a worker agent. A task in progress is cancelled and its result discarded.",
            agent_id,
        ),
        ToolSpec::new(
            "get_completed",
            "Collect finished delegations (oldest first). Optionally wait up to `wait_secs` \
             for one to finish when none are ready yet.",
            json!({
                "type": "object",
                "properties": {
                    "wait_secs": {
                        "type": "integer",
                        "description": "Seconds to wait for a completion while workers are busy (default 0)"
                    }
                }
            }),
        ),
    ]
}

/// One line per tool, for the system prompt.
pub fn tool_descriptions() -> String {
    define_tools()
        .iter()
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Maps orchestration tool calls onto the registry and the dispatcher.
#[derive(Clone)]
pub struct ToolExecutor {
    state: StateManager,
    events: EventBus,
    dispatcher: WorkerDispatcher,
}

impl ToolExecutor {
    pub fn new(state: StateManager, events: EventBus, dispatcher: WorkerDispatcher) -> Self {
        Self {
            state,
            events,
            dispatcher,
        }
    }

    /// Execute one tool call and return its JSON result.
    pub async fn execute(&self, call: &ToolInvocation) -> String {
        self.events.emit(Event::master(
            EventKind::MasterToolCall,
            json!({ "tool": call.name, "arguments": call.arguments }),
        ));

        let result = match self.dispatch(call).await {
            Ok(value) => value.to_string(),
            Err(e) => {
                tracing::debug!(tool = %call.name, error = %e, "Orchestration tool failed");
                json!({ "error": e.to_string() }).to_string()
            }
        };

        self.events.emit(Event::master(
            EventKind::MasterToolResult,
            json!({ "tool": call.name, "result": result }),
        ));
        result
    }

    async fn dispatch(&self, call: &ToolInvocation) -> Result<Value, FederationError> {
        let args = &call.arguments;
        match call.name.as_str() {
            "list_agent_types" => Ok(self.list_agent_types()),
            "list_running_agents" => Ok(json!({ "agents": self.state.worker_table() })),
            "get_agent_detail" => self.get_agent_detail(required_str(args, "agent_id")?),
            "spawn_agent" => self.spawn_agent(args),
            "delegate" => self.delegate(args),
            "clear_agent_context" => self.clear_agent_context(required_str(args, "agent_id")?),
            "terminate_agent" => self.terminate_agent(required_str(args, "agent_id")?),
            "get_completed" => {
                let wait = args.get("wait_secs").and_then(Value::as_u64).unwrap_or(0);
                Ok(self.get_completed(Duration::from_secs(wait.min(MAX_WAIT_SECS))).await)
            }
            unknown => Err(FederationError::InvalidArguments(format!("Unknown tool: {unknown}"))),
        }
    }

    fn list_agent_types(&self) -> Value {
        let templates: Vec<Value> = self
            .state
            .list_templates()
            .into_iter()
            .map(|t| json!({ "name": t.name, "description": t.description, "tools": t.tools }))
            .collect();
        json!({ "templates": templates })
    }

    fn get_agent_detail(&self, agent_id: &str) -> Result<Value, FederationError> {
        let info = self
            .state
            .get_worker(agent_id)
            .ok_or_else(|| FederationError::worker_not_found(agent_id))?;
        serde_json::to_value(info).map_err(|e| FederationError::InvalidState(e.to_string()))
    }

    fn spawn_agent(&self, args: &Value) -> Result<Value, FederationError> {
        let request = match (args.get("template_name").and_then(Value::as_str), args.get("config")) {
            (Some(name), _) => SpawnRequest::Template(name.to_string()),
            (None, Some(config)) => SpawnRequest::Custom(parse_custom_config(config)?),
            (None, None) => {
                return Err(FederationError::InvalidArguments(
                    "spawn_agent needs 'template_name' or 'config'".to_string(),
                ));
            }
        };

        let worker = self.state.spawn_worker(request)?;
        tracing::info!(worker_id = %worker.id, worker_type = %worker.worker_type, "Worker spawned");
        self.events.emit(Event::worker(
            EventKind::WorkerSpawned,
            &worker.id,
            json!({ "type": worker.worker_type }),
        ));
        Ok(json!({
            "agent_id": worker.id,
            "type": worker.worker_type,
            "status": worker.status,
        }))
    }

    fn delegate(&self, args: &Value) -> Result<Value, FederationError> {
        let agent_id = required_str(args, "agent_id")?;
        let task = required_str(args, "task")?;
        let intention = parse_intention(args)?;
        let output_path = args
            .get("output_path")
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty())
            .map(str::to_string);

        let delegation = self.dispatcher.dispatch(
            NewDelegation::new(agent_id, task, intention).with_output_path(output_path),
        )?;
        Ok(json!({
            "delegation_id": delegation.id,
            "agent_id": delegation.worker_id,
            "intention": delegation.intention.label(),
            "status": "started",
        }))
    }

    fn clear_agent_context(&self, agent_id: &str) -> Result<Value, FederationError> {
        let worker = self.state.clear_context(agent_id)?;
        self.events.emit(Event::worker(EventKind::WorkerCleared, agent_id, json!({})));
        Ok(json!({ "agent_id": worker.id, "status": worker.status, "cleared": true }))
    }

    fn terminate_agent(&self, agent_id: &str) -> Result<Value, FederationError> {
        // Remove from the registry first so the unit's late result is discarded.
        let worker = self.state.terminate_worker(agent_id)?;
        self.dispatcher.cancel(agent_id);
        tracing::info!(worker_id = %agent_id, "Worker terminated");
        self.events.emit(Event::worker(EventKind::WorkerTerminated, agent_id, json!({})));
        Ok(json!({ "agent_id": worker.id, "status": WorkerStatus::Terminated }))
    }

    async fn get_completed(&self, wait: Duration) -> Value {
        let deadline = tokio::time::Instant::now() + wait;
        while self.state.pending_completions() == 0
            && self.any_busy()
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let mut completed = Vec::new();
        while let Some(completion) = self.state.pop_completed() {
            completed.push(render_completion(&completion));
        }
        let busy: Vec<String> = self
            .state
            .list_workers()
            .into_iter()
            .filter(|w| w.status == WorkerStatus::Busy)
            .map(|w| w.id)
            .collect();
        json!({ "completed": completed, "busy_agents": busy })
    }

    fn any_busy(&self) -> bool {
        self.state
            .list_workers()
            .iter()
            .any(|w| w.status == WorkerStatus::Busy)
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, FederationError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| FederationError::InvalidArguments(format!("missing or invalid '{key}' argument")))
}

fn parse_custom_config(config: &Value) -> Result<WorkerConfig, FederationError> {
    let name = required_str(config, "name")?;
    let system_prompt = required_str(config, "system_prompt")?;
    let description = config
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("Custom worker");
    let tools = config
        .get("tools")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    Ok(WorkerConfig {
        name: name.to_string(),
        description: description.to_string(),
        system_prompt: system_prompt.to_string(),
        tools,
    })
}

/// Build an intention from the flat `delegate` arguments. A structured
/// intention object is accepted as well.
fn parse_intention(args: &Value) -> Result<Intention, FederationError> {
    match args.get("intention") {
        Some(Value::String(kind)) => match kind.as_str() {
            "return_to_user" => Ok(Intention::ReturnToUser),
            "review_by_master" => Ok(Intention::ReviewByMaster),
            "pass_to_agent" => {
                let target = required_str(args, "target")?;
                let transform = args
                    .get("transform")
                    .and_then(Value::as_str)
                    .unwrap_or("{result}");
                let then = match args.get("then") {
                    None | Some(Value::Null) => Intention::ReturnToUser,
                    Some(Value::String(s)) if s == "return_to_user" => Intention::ReturnToUser,
                    Some(Value::String(s)) if s == "review_by_master" => Intention::ReviewByMaster,
                    Some(obj @ Value::Object(_)) => structured_intention(obj)?,
                    Some(other) => {
                        return Err(FederationError::InvalidArguments(format!(
                            "invalid 'then' intention: {other}"
                        )));
                    }
                };
                Ok(Intention::PassToAgent {
                    target: target.to_string(),
                    transform: transform.to_string(),
                    then: Box::new(then),
                })
            }
            other => Err(FederationError::InvalidArguments(format!("unknown intention: {other}"))),
        },
        Some(obj @ Value::Object(_)) => structured_intention(obj),
        _ => Err(FederationError::InvalidArguments(
            "missing or invalid 'intention' argument".to_string(),
        )),
    }
}

fn structured_intention(value: &Value) -> Result<Intention, FederationError> {
    serde_json::from_value(value.clone())
        .map_err(|e| FederationError::InvalidArguments(format!("invalid intention: {e}")))
}

fn render_completion(completion: &Completion) -> Value {
    let note = match (&completion.outcome, &completion.intention, &completion.chain_error) {
        (CompletionOutcome::Failed { .. }, _, _) => "The worker failed; decide whether to retry or report.".to_string(),
        (_, _, Some(err)) => format!("Passing the result on failed ({err}); handle it yourself."),
        (_, Intention::ReturnToUser, _) => "Deliver this result to the user.".to_string(),
        (_, Intention::ReviewByMaster, _) => "Review this result and decide next steps.".to_string(),
        (_, Intention::PassToAgent { .. }, _) => "Result of a chained delegation.".to_string(),
    };

    let mut value = json!({
        "delegation_id": completion.delegation_id,
        "agent_id": completion.worker_id,
        "type": completion.worker_type,
        "task": completion.task,
        "intention": completion.intention.label(),
        "note": note,
    });
    match &completion.outcome {
        CompletionOutcome::Succeeded { result } => value["result"] = json!(result),
        CompletionOutcome::Failed { error } => value["error"] = json!(error),
    }
    if let Some(path) = &completion.output_path {
        value["output_path"] = json!(path);
    }
    if !completion.chain.is_empty() {
        value["chain"] = json!(completion.chain);
    }
    value
}
