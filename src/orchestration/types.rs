//! Type definitions for the orchestration core.
//!
//! These types form the shared vocabulary between the [`super::state::StateManager`],
//! the [`super::dispatcher::WorkerDispatcher`], the delegation protocol, and the
//! master's tool executor. Snapshot types derive [`serde::Serialize`] so they can
//! be returned verbatim as JSON tool results.

use serde::{Deserialize, Serialize};

use crate::completion::ChatTurn;

/// Unique identifier for a worker. Short (8 hex chars) so it is easy for the
/// master model to quote back; uniqueness is enforced by the registry.
pub type WorkerId = String;

/// Unique identifier for a delegation (full UUID v4 string).
pub type DelegationId = String;

/// Immutable configuration for a worker type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Template name; also the spawned worker's type.
    pub name: String,
    /// One-line description shown to the master when listing templates.
    pub description: String,
    /// System instructions for the worker's own decision loop.
    pub system_prompt: String,
    /// Capability names the worker may invoke.
    pub tools: Vec<String>,
}

/// Lifecycle status of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    HasResult,
    Terminated,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::HasResult => "has_result",
            WorkerStatus::Terminated => "terminated",
        }
    }
}

/// What happens to a worker's result once its task completes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intention {
    /// Deliver the result to the user through the master.
    ReturnToUser,
    /// Hand the result to another worker as a new task.
    PassToAgent {
        target: WorkerId,
        /// Task template for the target. `{result}` and `{output_path}` are
        /// substituted from the predecessor's completion.
        transform: String,
        /// Intention of the follow-up delegation.
        #[serde(default = "default_then")]
        then: Box<Intention>,
    },
    /// Leave the result for the master to review on its next cycle.
    ReviewByMaster,
}

fn default_then() -> Box<Intention> {
    Box::new(Intention::ReturnToUser)
}

impl Intention {
    pub fn label(&self) -> &'static str {
        match self {
            Intention::ReturnToUser => "return_to_user",
            Intention::PassToAgent { .. } => "pass_to_agent",
            Intention::ReviewByMaster => "review_by_master",
        }
    }
}

/// Lifecycle of a delegation: pending -> running -> one of the resolved states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationState {
    Pending,
    Running,
    Resolved,
    Failed,
    Cancelled,
}

impl DelegationState {
    pub fn is_active(&self) -> bool {
        matches!(self, DelegationState::Pending | DelegationState::Running)
    }
}

/// A task assigned to a worker together with its post-completion intention.
#[derive(Clone, Debug, Serialize)]
pub struct Delegation {
    pub id: DelegationId,
    pub worker_id: WorkerId,
    pub task: String,
    pub output_path: Option<String>,
    pub intention: Intention,
    /// Workers that ran earlier links of the same chain, oldest first.
    pub chain: Vec<WorkerId>,
    pub state: DelegationState,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

/// Read-only view of a worker, returned by registry queries.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    #[serde(rename = "type")]
    pub worker_type: String,
    pub config: WorkerConfig,
    pub status: WorkerStatus,
    pub current_task: Option<String>,
    pub active_delegation: Option<DelegationId>,
    pub last_result: Option<String>,
    pub last_error: Option<String>,
    /// Number of messages held in the worker's conversation.
    pub context_messages: usize,
    pub created_at: String,
}

/// One row of the presentation layer's worker status table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkerRow {
    pub id: WorkerId,
    #[serde(rename = "type")]
    pub worker_type: String,
    pub status: WorkerStatus,
    pub current_task: Option<String>,
}

/// How a worker run ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionOutcome {
    Succeeded { result: String },
    Failed { error: String },
}

/// Entry in the completion queue.
#[derive(Clone, Debug, Serialize)]
pub struct Completion {
    pub delegation_id: DelegationId,
    pub worker_id: WorkerId,
    pub worker_type: String,
    pub task: String,
    pub intention: Intention,
    pub output_path: Option<String>,
    pub chain: Vec<WorkerId>,
    #[serde(flatten)]
    pub outcome: CompletionOutcome,
    pub completed_at: String,
    /// Set when a `pass_to_agent` follow-up could not be created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_error: Option<String>,
}

impl Completion {
    /// The successful result text, if the run succeeded.
    pub fn result(&self) -> Option<&str> {
        match &self.outcome {
            CompletionOutcome::Succeeded { result } => Some(result),
            CompletionOutcome::Failed { .. } => None,
        }
    }
}

/// Current activity of the master loop.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "tool", rename_all = "snake_case")]
pub enum MasterStatus {
    #[default]
    Idle,
    Thinking,
    CallingTool(String),
}

/// Worker to spawn: a registered template or an ad hoc configuration.
#[derive(Clone, Debug)]
pub enum SpawnRequest {
    Template(String),
    Custom(WorkerConfig),
}

/// Snapshot handed to the dispatcher when a worker run starts.
#[derive(Clone, Debug)]
pub struct RunAssignment {
    pub delegation_id: DelegationId,
    pub worker_id: WorkerId,
    pub config: WorkerConfig,
    pub task: String,
    pub output_path: Option<String>,
    pub conversation: Vec<ChatTurn>,
}
