//! Central registry for templates, workers, delegations and completions.
//!
//! [`StateManager`] is the single source of truth for the federation. It wraps
//! one [`FederationState`] behind `Arc<Mutex<..>>` so the master loop, the
//! tool executor and every concurrently finishing worker unit serialize
//! through the same lock. Every public operation takes the lock exactly once,
//! which makes each operation atomic with respect to the others.
//!
//! The lock is never held across an `.await` and events are never emitted
//! from inside it; callers emit after the state transition has been applied.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use uuid::Uuid;

use super::types::{
    Completion, CompletionOutcome, Delegation, DelegationId, DelegationState, Intention, MasterStatus,
    RunAssignment, SpawnRequest, WorkerConfig, WorkerId, WorkerInfo, WorkerRow, WorkerStatus,
};
use crate::completion::ChatTurn;
use crate::error::FederationError;

/// Internal entry stored in the registry. Callers see [`WorkerInfo`]
/// snapshots via `get_worker` / `list_workers`.
struct WorkerEntry {
    id: WorkerId,
    worker_type: String,
    config: WorkerConfig,
    status: WorkerStatus,
    current_task: Option<String>,
    active_delegation: Option<DelegationId>,
    /// Delegation whose result is currently held (status `HasResult`).
    result_delegation: Option<DelegationId>,
    last_result: Option<String>,
    last_error: Option<String>,
    conversation: Vec<ChatTurn>,
    created_at: String,
    spawn_seq: u64,
}

impl WorkerEntry {
    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            worker_type: self.worker_type.clone(),
            config: self.config.clone(),
            status: self.status,
            current_task: self.current_task.clone(),
            active_delegation: self.active_delegation.clone(),
            last_result: self.last_result.clone(),
            last_error: self.last_error.clone(),
            context_messages: self.conversation.len(),
            created_at: self.created_at.clone(),
        }
    }
}

/// Aggregate of everything the federation tracks.
#[derive(Default)]
struct FederationState {
    templates: BTreeMap<String, WorkerConfig>,
    workers: HashMap<WorkerId, WorkerEntry>,
    delegations: HashMap<DelegationId, Delegation>,
    completed: VecDeque<Completion>,
    master: MasterStatus,
    next_spawn_seq: u64,
    /// Every worker id ever issued, so ids stay unique after termination.
    issued_ids: HashSet<WorkerId>,
}

impl FederationState {
    fn drop_completions_of(&mut self, worker_id: &str) {
        self.completed.retain(|c| c.worker_id != worker_id);
    }

    /// Validate that `delegation_id` is the active delegation of a live worker.
    /// Returns `None` for late or stale events (terminated worker, cancelled
    /// delegation, superseded run).
    fn live_delegation(&self, delegation_id: &str) -> Option<(WorkerId, Delegation)> {
        let delegation = self.delegations.get(delegation_id)?;
        if !delegation.state.is_active() {
            return None;
        }
        let worker = self.workers.get(&delegation.worker_id)?;
        if worker.active_delegation.as_deref() != Some(delegation_id) {
            return None;
        }
        Some((worker.id.clone(), delegation.clone()))
    }

    /// Error for an id with no live worker: terminated workers are an
    /// invalid state, ids never issued are not found.
    fn absent_worker(&self, id: &str) -> FederationError {
        if self.issued_ids.contains(id) {
            terminated(id)
        } else {
            FederationError::worker_not_found(id)
        }
    }

    fn resolve_delegation(&mut self, delegation_id: &str, state: DelegationState) {
        if let Some(d) = self.delegations.get_mut(delegation_id) {
            d.state = state;
            d.resolved_at = Some(now_iso());
        }
    }
}

/// Parameters of a new delegation.
#[derive(Clone, Debug)]
pub struct NewDelegation {
    pub worker_id: WorkerId,
    pub task: String,
    pub intention: Intention,
    pub output_path: Option<String>,
    pub chain: Vec<WorkerId>,
}

impl NewDelegation {
    pub fn new(worker_id: impl Into<WorkerId>, task: impl Into<String>, intention: Intention) -> Self {
        Self {
            worker_id: worker_id.into(),
            task: task.into(),
            intention,
            output_path: None,
            chain: Vec::new(),
        }
    }

    pub fn with_output_path(mut self, output_path: Option<String>) -> Self {
        self.output_path = output_path;
        self
    }

    pub fn with_chain(mut self, chain: Vec<WorkerId>) -> Self {
        self.chain = chain;
        self
    }
}

/// Shared handle to the federation registry.
///
/// All fields are behind `Arc`, so clones are cheap and observe the same state.
#[derive(Clone, Default)]
pub struct StateManager {
    inner: Arc<Mutex<FederationState>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FederationState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Templates ---

    /// Add a named template. Fails with `AlreadyExists` on a name collision.
    pub fn register_template(&self, config: WorkerConfig) -> Result<(), FederationError> {
        if config.name.trim().is_empty() {
            return Err(FederationError::InvalidArguments(
                "template name must not be empty".to_string(),
            ));
        }
        let mut state = self.lock();
        if state.templates.contains_key(&config.name) {
            return Err(FederationError::AlreadyExists {
                kind: "template",
                id: config.name,
            });
        }
        tracing::debug!(template = %config.name, "Registered worker template");
        state.templates.insert(config.name.clone(), config);
        Ok(())
    }

    /// All templates, ordered by name.
    pub fn list_templates(&self) -> Vec<WorkerConfig> {
        self.lock().templates.values().cloned().collect()
    }

    pub fn get_template(&self, name: &str) -> Option<WorkerConfig> {
        self.lock().templates.get(name).cloned()
    }

    // --- Workers ---

    /// Create a new idle worker from a template or an ad hoc configuration.
    pub fn spawn_worker(&self, request: SpawnRequest) -> Result<WorkerInfo, FederationError> {
        let mut state = self.lock();
        let config = match request {
            SpawnRequest::Template(name) => state
                .templates
                .get(&name)
                .cloned()
                .ok_or_else(|| FederationError::template_not_found(name))?,
            SpawnRequest::Custom(config) => {
                if config.name.trim().is_empty() {
                    return Err(FederationError::InvalidArguments(
                        "custom worker config needs a name".to_string(),
                    ));
                }
                config
            }
        };

        // Short ids are friendlier for the master model to quote; collisions
        // with any id issued earlier are resolved by drawing again.
        let id = loop {
            let candidate = Uuid::new_v4().simple().to_string()[..8].to_string();
            if state.issued_ids.insert(candidate.clone()) {
                break candidate;
            }
        };

        let spawn_seq = state.next_spawn_seq;
        state.next_spawn_seq += 1;

        let entry = WorkerEntry {
            id: id.clone(),
            worker_type: config.name.clone(),
            config,
            status: WorkerStatus::Idle,
            current_task: None,
            active_delegation: None,
            result_delegation: None,
            last_result: None,
            last_error: None,
            conversation: Vec::new(),
            created_at: now_iso(),
            spawn_seq,
        };
        let info = entry.info();
        state.workers.insert(id, entry);
        Ok(info)
    }

    /// Like [`StateManager::get_worker`], failing with `InvalidState` for a
    /// terminated worker and `NotFound` for an id that was never issued.
    pub fn require_worker(&self, id: &str) -> Result<WorkerInfo, FederationError> {
        let state = self.lock();
        match state.workers.get(id) {
            Some(worker) => Ok(worker.info()),
            None => Err(state.absent_worker(id)),
        }
    }

    pub fn get_worker(&self, id: &str) -> Option<WorkerInfo> {
        self.lock().workers.get(id).map(WorkerEntry::info)
    }

    /// Snapshots of all live workers, in spawn order.
    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        let state = self.lock();
        let mut entries: Vec<&WorkerEntry> = state.workers.values().collect();
        entries.sort_by_key(|e| e.spawn_seq);
        entries.into_iter().map(WorkerEntry::info).collect()
    }

    /// Status table rows (id, type, status, current task), in spawn order.
    pub fn worker_table(&self) -> Vec<WorkerRow> {
        self.list_workers()
            .into_iter()
            .map(|w| WorkerRow {
                id: w.id,
                worker_type: w.worker_type,
                status: w.status,
                current_task: w.current_task,
            })
            .collect()
    }

    /// The worker's conversation, or `None` if the worker does not exist.
    pub fn conversation_of(&self, id: &str) -> Option<Vec<ChatTurn>> {
        self.lock().workers.get(id).map(|w| w.conversation.clone())
    }

    // --- Delegations ---

    /// Assign a task with a plain intention. See [`StateManager::assign`].
    pub fn assign_task(
        &self,
        worker_id: &str,
        task: &str,
        intention: Intention,
    ) -> Result<Delegation, FederationError> {
        self.assign(NewDelegation::new(worker_id, task, intention))
    }

    /// Create a pending delegation and mark the worker busy.
    ///
    /// Fails with `NotFound` for an unknown (or terminated) worker and with
    /// `InvalidState` if the worker already has an active delegation. Any
    /// unclaimed completion of the worker is superseded and dropped.
    pub fn assign(&self, new: NewDelegation) -> Result<Delegation, FederationError> {
        if new.task.trim().is_empty() {
            return Err(FederationError::InvalidArguments("task must not be empty".to_string()));
        }

        let mut state = self.lock();
        let worker = state
            .workers
            .get(&new.worker_id)
            .ok_or_else(|| state.absent_worker(&new.worker_id))?;

        match worker.status {
            WorkerStatus::Busy => {
                return Err(FederationError::InvalidState(format!(
                    "worker {} is busy with delegation {}",
                    worker.id,
                    worker.active_delegation.as_deref().unwrap_or("?")
                )));
            }
            WorkerStatus::Terminated => return Err(terminated(&worker.id)),
            WorkerStatus::Idle | WorkerStatus::HasResult => {}
        }

        let delegation = Delegation {
            id: Uuid::new_v4().to_string(),
            worker_id: new.worker_id.clone(),
            task: new.task.clone(),
            output_path: new.output_path,
            intention: new.intention,
            chain: new.chain,
            state: DelegationState::Pending,
            created_at: now_iso(),
            resolved_at: None,
        };

        state.drop_completions_of(&new.worker_id);
        if let Some(worker) = state.workers.get_mut(&new.worker_id) {
            worker.status = WorkerStatus::Busy;
            worker.current_task = Some(new.task);
            worker.active_delegation = Some(delegation.id.clone());
            worker.result_delegation = None;
            worker.last_error = None;
        }
        state.delegations.insert(delegation.id.clone(), delegation.clone());
        Ok(delegation)
    }

    /// Mark a pending delegation running and snapshot what its unit needs.
    pub fn begin_run(&self, delegation_id: &str) -> Result<RunAssignment, FederationError> {
        let mut state = self.lock();
        let (worker_id, delegation) = state.live_delegation(delegation_id).ok_or_else(|| {
            FederationError::InvalidState(format!("delegation {delegation_id} is not active"))
        })?;

        if let Some(d) = state.delegations.get_mut(delegation_id) {
            d.state = DelegationState::Running;
        }
        let worker = state
            .workers
            .get(&worker_id)
            .ok_or_else(|| FederationError::worker_not_found(worker_id.clone()))?;

        Ok(RunAssignment {
            delegation_id: delegation.id,
            worker_id,
            config: worker.config.clone(),
            task: delegation.task,
            output_path: delegation.output_path,
            conversation: worker.conversation.clone(),
        })
    }

    pub fn get_delegation(&self, id: &str) -> Option<Delegation> {
        self.lock().delegations.get(id).cloned()
    }

    /// Record the result of a worker's active task.
    ///
    /// A call for an unknown, terminated or non-busy worker is a silent no-op
    /// so late events after termination are tolerated.
    pub fn complete_task(&self, worker_id: &str, result: &str) -> Option<Completion> {
        let delegation_id = {
            let state = self.lock();
            let worker = state.workers.get(worker_id)?;
            if worker.status != WorkerStatus::Busy {
                return None;
            }
            worker.active_delegation.clone()?
        };
        self.complete_delegation(&delegation_id, result, None)
    }

    /// Record the result of a specific delegation: busy -> has_result and the
    /// completion is appended to the queue.
    ///
    /// Returns `None` (and changes nothing) if the delegation is no longer the
    /// worker's active one, which is how completions arriving after a
    /// terminate or cancel are discarded.
    pub fn complete_delegation(
        &self,
        delegation_id: &str,
        result: &str,
        conversation: Option<Vec<ChatTurn>>,
    ) -> Option<Completion> {
        let mut state = self.lock();
        let Some((worker_id, delegation)) = state.live_delegation(delegation_id) else {
            tracing::debug!(delegation_id, "Discarding completion for inactive delegation");
            return None;
        };

        let worker = state.workers.get_mut(&worker_id)?;
        worker.status = WorkerStatus::HasResult;
        worker.active_delegation = None;
        worker.result_delegation = Some(delegation.id.clone());
        worker.last_result = Some(result.to_string());
        if let Some(conversation) = conversation {
            worker.conversation = conversation;
        }
        let worker_type = worker.worker_type.clone();

        state.resolve_delegation(delegation_id, DelegationState::Resolved);
        let completion = Completion {
            delegation_id: delegation.id,
            worker_id,
            worker_type,
            task: delegation.task,
            intention: delegation.intention,
            output_path: delegation.output_path,
            chain: delegation.chain,
            outcome: CompletionOutcome::Succeeded {
                result: result.to_string(),
            },
            completed_at: now_iso(),
            chain_error: None,
        };
        state.completed.push_back(completion.clone());
        Some(completion)
    }

    /// Record a failed run: the worker returns to idle with `last_error` set
    /// and a failed completion is queued so the master learns about it.
    pub fn fail_delegation(&self, delegation_id: &str, error: &str) -> Option<Completion> {
        self.abort_delegation(delegation_id, error, DelegationState::Failed)
    }

    /// Like [`StateManager::fail_delegation`] for a cooperatively cancelled run.
    pub fn cancel_delegation(&self, delegation_id: &str, reason: &str) -> Option<Completion> {
        self.abort_delegation(delegation_id, reason, DelegationState::Cancelled)
    }

    fn abort_delegation(
        &self,
        delegation_id: &str,
        error: &str,
        final_state: DelegationState,
    ) -> Option<Completion> {
        let mut state = self.lock();
        let (worker_id, delegation) = state.live_delegation(delegation_id)?;

        let worker = state.workers.get_mut(&worker_id)?;
        worker.status = WorkerStatus::Idle;
        worker.active_delegation = None;
        worker.last_error = Some(error.to_string());
        let worker_type = worker.worker_type.clone();

        state.resolve_delegation(delegation_id, final_state);
        let completion = Completion {
            delegation_id: delegation.id,
            worker_id,
            worker_type,
            task: delegation.task,
            intention: delegation.intention,
            output_path: delegation.output_path,
            chain: delegation.chain,
            outcome: CompletionOutcome::Failed {
                error: error.to_string(),
            },
            completed_at: now_iso(),
            chain_error: None,
        };
        state.completed.push_back(completion.clone());
        Some(completion)
    }

    // --- Lifecycle ---

    /// Reset a worker's conversation and result while keeping its config.
    pub fn clear_context(&self, worker_id: &str) -> Result<WorkerInfo, FederationError> {
        let mut state = self.lock();
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| FederationError::worker_not_found(worker_id))?;

        if worker.status == WorkerStatus::Busy {
            return Err(FederationError::InvalidState(format!(
                "worker {worker_id} is busy; terminate it or wait for completion"
            )));
        }

        worker.status = WorkerStatus::Idle;
        worker.conversation.clear();
        worker.current_task = None;
        worker.result_delegation = None;
        worker.last_result = None;
        worker.last_error = None;
        let info = worker.info();

        state.drop_completions_of(worker_id);
        Ok(info)
    }

    /// Remove a worker from the registry immediately.
    ///
    /// Its active delegation is marked cancelled and its unclaimed completions
    /// are dropped; any completion arriving later is discarded. Returns the
    /// final snapshot with status `Terminated`.
    pub fn terminate_worker(&self, worker_id: &str) -> Result<WorkerInfo, FederationError> {
        let mut state = self.lock();
        let entry = state
            .workers
            .remove(worker_id)
            .ok_or_else(|| FederationError::worker_not_found(worker_id))?;

        if let Some(delegation_id) = &entry.active_delegation {
            state.resolve_delegation(delegation_id, DelegationState::Cancelled);
        }
        state.drop_completions_of(worker_id);

        let mut info = entry.info();
        info.status = WorkerStatus::Terminated;
        Ok(info)
    }

    // --- Completion queue ---

    /// Dequeue the oldest unclaimed completion.
    pub fn pop_completed(&self) -> Option<Completion> {
        self.lock().completed.pop_front()
    }

    /// Number of completions waiting to be claimed.
    pub fn pending_completions(&self) -> usize {
        self.lock().completed.len()
    }

    /// Remove a specific completion from the queue (used when a chain link
    /// consumes it). The producing worker goes back to idle if it still holds
    /// that result.
    pub fn claim_completion(&self, delegation_id: &str) -> Option<Completion> {
        let mut state = self.lock();
        let pos = state
            .completed
            .iter()
            .position(|c| c.delegation_id == delegation_id)?;
        let completion = state.completed.remove(pos)?;

        if let Some(worker) = state.workers.get_mut(&completion.worker_id) {
            if worker.status == WorkerStatus::HasResult
                && worker.result_delegation.as_deref() == Some(delegation_id)
            {
                worker.status = WorkerStatus::Idle;
                worker.result_delegation = None;
            }
        }
        Some(completion)
    }

    /// Attach a chaining failure to a queued completion.
    pub fn annotate_chain_error(&self, delegation_id: &str, error: &str) {
        let mut state = self.lock();
        if let Some(c) = state
            .completed
            .iter_mut()
            .find(|c| c.delegation_id == delegation_id)
        {
            c.chain_error = Some(error.to_string());
        }
    }

    // --- Master ---

    pub fn set_master_status(&self, status: MasterStatus) {
        self.lock().master = status;
    }

    pub fn master_status(&self) -> MasterStatus {
        self.lock().master.clone()
    }
}

fn terminated(id: &str) -> FederationError {
    FederationError::InvalidState(format!("worker {id} is terminated"))
}

/// Returns the current UTC time as an ISO 8601 string with milliseconds.
fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
