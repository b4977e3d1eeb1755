//! Launches and supervises worker execution units.
//!
//! Every run is an independent tokio task (fire-and-forget). Its only outward
//! signals are events and an entry in the completion queue:
//!
//! - `worker_started` is emitted synchronously in [`WorkerDispatcher::launch`]
//!   before the task is spawned, so it precedes every event of the run.
//! - exactly one terminal event (`worker_done`, `worker_error` or
//!   `worker_cancelled`) ends each run, whatever happened to it.
//!
//! **Cancellation model:** each unit gets a child of the dispatcher's root
//! [`CancellationToken`]. Cancelling a worker is cooperative; a result that
//! arrives after a cancel or terminate is discarded by the
//! [`StateManager`]'s delegation check. Cancelling the root token (shutdown)
//! cascades to every unit.
//!
//! **Supervision:** the worker loop runs in an inner task whose `JoinHandle`
//! is awaited by the supervising unit, so a panic inside the loop surfaces as
//! a `DispatchFailure` instead of leaving the worker busy forever. On cancel
//! or timeout the inner task is aborted and joined before the terminal event
//! is emitted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::delegation::{DelegationProtocol, Resolution};
use super::events::{Event, EventBus, EventKind};
use super::state::{NewDelegation, StateManager};
use super::types::{Completion, Delegation, DelegationId, Intention, RunAssignment, WorkerId};
use crate::completion::CompletionService;
use crate::error::FederationError;
use crate::worker::{WorkerOutput, WorkspaceTools, run_worker};

/// Limits applied to every worker run.
#[derive(Clone, Debug)]
pub struct DispatchSettings {
    /// Ceiling on completion calls per run.
    pub max_iterations: usize,
    /// Wall-clock limit per run; `None` disables it.
    pub run_timeout: Option<Duration>,
    /// How long `shutdown` waits for each unit after cancelling.
    pub shutdown_grace: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            run_timeout: Some(Duration::from_secs(600)),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

struct Unit {
    delegation_id: DelegationId,
    cancel_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

enum UnitOutcome {
    Finished(Result<WorkerOutput, FederationError>),
    Cancelled,
    TimedOut(Duration),
}

/// Cheaply cloneable handle; all clones share the same unit table.
#[derive(Clone)]
pub struct WorkerDispatcher {
    state: StateManager,
    events: EventBus,
    protocol: DelegationProtocol,
    service: Arc<dyn CompletionService>,
    tools: Arc<WorkspaceTools>,
    settings: DispatchSettings,
    units: Arc<Mutex<HashMap<WorkerId, Unit>>>,
    root_cancel_token: CancellationToken,
}

impl WorkerDispatcher {
    pub fn new(
        state: StateManager,
        events: EventBus,
        protocol: DelegationProtocol,
        service: Arc<dyn CompletionService>,
        tools: Arc<WorkspaceTools>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            state,
            events,
            protocol,
            service,
            tools,
            settings,
            units: Arc::new(Mutex::new(HashMap::new())),
            root_cancel_token: CancellationToken::new(),
        }
    }

    fn units(&self) -> MutexGuard<'_, HashMap<WorkerId, Unit>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign `task` to an idle worker with `return_to_user` and start it.
    /// Returns as soon as the unit is launched.
    pub fn start(&self, worker_id: &str, task: &str) -> Result<Delegation, FederationError> {
        self.dispatch(NewDelegation::new(worker_id, task, Intention::ReturnToUser))
    }

    /// Validate and record a delegation, then launch its unit.
    pub fn dispatch(&self, new: NewDelegation) -> Result<Delegation, FederationError> {
        let delegation = self.protocol.delegate(new)?;
        self.launch(&delegation)?;
        Ok(delegation)
    }

    /// Launch the unit for an already recorded pending delegation.
    ///
    /// On failure the delegation is failed (worker back to idle) so nothing
    /// is left busy without a unit behind it.
    pub fn launch(&self, delegation: &Delegation) -> Result<(), FederationError> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) if !self.root_cancel_token.is_cancelled() => handle,
            Ok(_) => return Err(self.abandon(delegation, "dispatcher is shut down")),
            Err(_) => return Err(self.abandon(delegation, "no async runtime available")),
        };

        let assignment = self.state.begin_run(&delegation.id)?;
        let cancel_token = self.root_cancel_token.child_token();

        self.events.emit(Event::worker(
            EventKind::WorkerStarted,
            &assignment.worker_id,
            json!({
                "delegation_id": assignment.delegation_id,
                "task": assignment.task,
            }),
        ));
        tracing::info!(
            worker_id = %assignment.worker_id,
            delegation_id = %assignment.delegation_id,
            "Worker unit launched"
        );

        // Register before spawning so a unit that finishes immediately can
        // still find and remove its own entry.
        let worker_id = assignment.worker_id.clone();
        self.units().insert(
            worker_id.clone(),
            Unit {
                delegation_id: assignment.delegation_id.clone(),
                cancel_token: cancel_token.clone(),
                join_handle: None,
            },
        );

        let delegation_id = assignment.delegation_id.clone();
        let handle = runtime.spawn(self.clone().supervise(assignment, cancel_token));

        if let Some(unit) = self.units().get_mut(&worker_id) {
            if unit.delegation_id == delegation_id {
                unit.join_handle = Some(handle);
            }
        }
        Ok(())
    }

    fn abandon(&self, delegation: &Delegation, reason: &str) -> FederationError {
        self.state.fail_delegation(&delegation.id, reason);
        FederationError::DispatchFailure(reason.to_string())
    }

    /// Request cooperative cancellation of a worker's current run.
    /// Returns `false` if the worker has no running unit.
    pub fn cancel(&self, worker_id: &str) -> bool {
        match self.units().get(worker_id) {
            Some(unit) => {
                unit.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of units that have not finished yet.
    pub fn running_units(&self) -> usize {
        self.units().len()
    }

    /// Cancel every unit and wait for them, each bounded by the grace period.
    pub async fn shutdown(&self) {
        self.root_cancel_token.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .units()
            .values_mut()
            .filter_map(|u| u.join_handle.take())
            .collect();

        for handle in handles {
            if tokio::time::timeout(self.settings.shutdown_grace, handle).await.is_err() {
                tracing::warn!("Worker unit did not stop within the shutdown grace period");
            }
        }
    }

    async fn supervise(self, assignment: RunAssignment, cancel_token: CancellationToken) {
        let worker_id = assignment.worker_id.clone();
        let delegation_id = assignment.delegation_id.clone();

        let mut work = {
            let service = self.service.clone();
            let tools = self.tools.clone();
            let events = self.events.clone();
            let max_iterations = self.settings.max_iterations;
            tokio::spawn(async move {
                run_worker(&assignment, service.as_ref(), &tools, &events, max_iterations).await
            })
        };

        let run_timeout = self.settings.run_timeout;
        let deadline = async move {
            match run_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            joined = &mut work => match joined {
                Ok(result) => UnitOutcome::Finished(result),
                Err(e) if e.is_panic() => UnitOutcome::Finished(Err(FederationError::DispatchFailure(
                    "worker unit panicked".to_string(),
                ))),
                Err(e) => UnitOutcome::Finished(Err(FederationError::DispatchFailure(e.to_string()))),
            },
            _ = cancel_token.cancelled() => UnitOutcome::Cancelled,
            _ = deadline => UnitOutcome::TimedOut(run_timeout.unwrap_or_default()),
        };

        // The inner task must be gone before the terminal event, or an emit
        // already in flight on another thread could follow it.
        if !matches!(outcome, UnitOutcome::Finished(_)) {
            work.abort();
            if let Err(e) = work.await {
                if !e.is_cancelled() {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Aborted worker unit failed");
                }
            }
        }

        self.finish(&worker_id, &delegation_id, outcome);

        let mut units = self.units();
        if units.get(&worker_id).is_some_and(|u| u.delegation_id == delegation_id) {
            units.remove(&worker_id);
        }
    }

    fn finish(&self, worker_id: &str, delegation_id: &str, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Finished(Ok(output)) => {
                match self
                    .state
                    .complete_delegation(delegation_id, &output.result, Some(output.conversation))
                {
                    Some(completion) => {
                        tracing::info!(worker_id, delegation_id, "Worker completed task");
                        self.events.emit(Event::worker(
                            EventKind::WorkerDone,
                            worker_id,
                            json!({ "delegation_id": delegation_id, "result": output.result }),
                        ));
                        self.events.emit(Event::worker(
                            EventKind::DelegationCompleted,
                            worker_id,
                            json!({
                                "delegation_id": delegation_id,
                                "intention": completion.intention.label(),
                            }),
                        ));
                        self.after_completion(completion);
                    }
                    None => self.emit_discarded(worker_id, delegation_id),
                }
            }
            UnitOutcome::Finished(Err(error)) => self.fail(worker_id, delegation_id, &error.to_string()),
            UnitOutcome::TimedOut(limit) => {
                self.fail(worker_id, delegation_id, &format!("timed out after {}s", limit.as_secs()))
            }
            UnitOutcome::Cancelled => {
                self.state.cancel_delegation(delegation_id, "cancelled");
                tracing::info!(worker_id, delegation_id, "Worker run cancelled");
                self.events.emit(Event::worker(
                    EventKind::WorkerCancelled,
                    worker_id,
                    json!({ "delegation_id": delegation_id }),
                ));
            }
        }
    }

    fn fail(&self, worker_id: &str, delegation_id: &str, error: &str) {
        tracing::warn!(worker_id, delegation_id, error, "Worker run failed");
        self.state.fail_delegation(delegation_id, error);
        self.events.emit(Event::worker(
            EventKind::WorkerError,
            worker_id,
            json!({ "delegation_id": delegation_id, "error": error }),
        ));
    }

    fn emit_discarded(&self, worker_id: &str, delegation_id: &str) {
        tracing::debug!(worker_id, delegation_id, "Discarded result of inactive delegation");
        self.events.emit(Event::worker(
            EventKind::WorkerCancelled,
            worker_id,
            json!({ "delegation_id": delegation_id, "discarded": true }),
        ));
    }

    fn after_completion(&self, completion: Completion) {
        if let Resolution::Chained { next, .. } = self.protocol.resolve(completion) {
            if let Err(e) = self.launch(&next) {
                tracing::warn!(
                    delegation_id = %next.id,
                    worker_id = %next.worker_id,
                    error = %e,
                    "Could not launch chained delegation"
                );
                self.events.emit(Event::worker(
                    EventKind::DelegationFailed,
                    &next.worker_id,
                    json!({ "delegation_id": next.id, "error": e.to_string() }),
                ));
            }
        }
    }
}
