//! Delegation / intention protocol.
//!
//! A delegation moves pending -> running -> resolved. When its worker
//! finishes, [`DelegationProtocol::resolve`] decides what happens next from
//! the delegation's [`Intention`]:
//!
//! - `return_to_user`: the completion stays queued for the master to deliver.
//! - `review_by_master`: the completion stays queued, no automatic follow-up.
//! - `pass_to_agent`: a new delegation is created on the target worker with a
//!   task derived from the result. The target must exist and be idle; there is
//!   no retry and no fallback target.
//!
//! Chains may never revisit a worker. The whole nested intention is checked
//! when the first delegation is created, and each link is checked again
//! against its recorded predecessors before it is created.

use serde_json::json;

use super::events::{Event, EventBus, EventKind};
use super::state::{NewDelegation, StateManager};
use super::types::{Completion, CompletionOutcome, Delegation, Intention, WorkerId, WorkerStatus};
use crate::error::FederationError;

/// Outcome of resolving a completed delegation.
#[derive(Debug)]
pub enum Resolution {
    /// `return_to_user`: queued for delivery to the caller.
    Deliver(Completion),
    /// `review_by_master`, or a failed run: queued for the master.
    Deferred(Completion),
    /// `pass_to_agent`: the follow-up delegation was created and must be started.
    Chained { from: Completion, next: Delegation },
    /// `pass_to_agent` could not be honored; the completion stays queued.
    ChainFailed {
        completion: Completion,
        error: FederationError,
    },
}

#[derive(Clone)]
pub struct DelegationProtocol {
    state: StateManager,
    events: EventBus,
    max_chain_depth: usize,
}

impl DelegationProtocol {
    pub fn new(state: StateManager, events: EventBus, max_chain_depth: usize) -> Self {
        Self {
            state,
            events,
            max_chain_depth: max_chain_depth.max(1),
        }
    }

    pub fn max_chain_depth(&self) -> usize {
        self.max_chain_depth
    }

    /// Check a nested intention before anything runs.
    ///
    /// `predecessors` are the workers of earlier links (empty for a fresh
    /// delegation) and `worker_id` is the worker about to receive the task.
    pub fn validate(
        &self,
        worker_id: &str,
        predecessors: &[WorkerId],
        intention: &Intention,
    ) -> Result<(), FederationError> {
        let mut path: Vec<WorkerId> = predecessors.to_vec();
        if path.iter().any(|w| w == worker_id) {
            return Err(FederationError::CycleDetected {
                worker_id: worker_id.to_string(),
                chain: path,
            });
        }
        path.push(worker_id.to_string());
        self.check_depth(path.len())?;

        let mut next = intention;
        while let Intention::PassToAgent { target, then, .. } = next {
            if path.iter().any(|w| w == target) {
                return Err(FederationError::CycleDetected {
                    worker_id: target.clone(),
                    chain: path,
                });
            }
            path.push(target.clone());
            self.check_depth(path.len())?;
            next = then;
        }
        Ok(())
    }

    fn check_depth(&self, depth: usize) -> Result<(), FederationError> {
        if depth > self.max_chain_depth {
            return Err(FederationError::ChainTooLong {
                depth,
                max: self.max_chain_depth,
            });
        }
        Ok(())
    }

    /// Validate and create a pending delegation, emitting `delegation_started`.
    ///
    /// Starting the worker's unit is the dispatcher's job; this only records
    /// the assignment.
    pub fn delegate(&self, new: NewDelegation) -> Result<Delegation, FederationError> {
        self.validate(&new.worker_id, &new.chain, &new.intention)?;
        let delegation = self.state.assign(new)?;

        tracing::info!(
            delegation_id = %delegation.id,
            worker_id = %delegation.worker_id,
            intention = delegation.intention.label(),
            chain_len = delegation.chain.len(),
            "Delegation created"
        );
        self.events.emit(Event::worker(
            EventKind::DelegationStarted,
            &delegation.worker_id,
            json!({
                "delegation_id": delegation.id,
                "task": delegation.task,
                "intention": delegation.intention.label(),
                "chain": delegation.chain,
            }),
        ));
        Ok(delegation)
    }

    /// Decide the post-completion action for a recorded completion.
    pub fn resolve(&self, completion: Completion) -> Resolution {
        if let CompletionOutcome::Failed { .. } = completion.outcome {
            return Resolution::Deferred(completion);
        }

        match completion.intention.clone() {
            Intention::ReturnToUser => Resolution::Deliver(completion),
            Intention::ReviewByMaster => Resolution::Deferred(completion),
            Intention::PassToAgent {
                target,
                transform,
                then,
            } => match self.chain(&completion, &target, &transform, *then) {
                Ok(next) => {
                    let from = self
                        .state
                        .claim_completion(&completion.delegation_id)
                        .unwrap_or(completion);
                    self.events.emit(Event::worker(
                        EventKind::DelegationChained,
                        &from.worker_id,
                        json!({
                            "from_delegation": from.delegation_id,
                            "to_delegation": next.id,
                            "target": next.worker_id,
                        }),
                    ));
                    Resolution::Chained { from, next }
                }
                Err(error) => {
                    tracing::warn!(
                        delegation_id = %completion.delegation_id,
                        target = %target,
                        error = %error,
                        "Chain link rejected; result left for the master"
                    );
                    self.state
                        .annotate_chain_error(&completion.delegation_id, &error.to_string());
                    self.events.emit(Event::worker(
                        EventKind::DelegationFailed,
                        &completion.worker_id,
                        json!({
                            "delegation_id": completion.delegation_id,
                            "target": target,
                            "error": error.to_string(),
                        }),
                    ));
                    Resolution::ChainFailed { completion, error }
                }
            },
        }
    }

    fn chain(
        &self,
        completion: &Completion,
        target: &str,
        transform: &str,
        then: Intention,
    ) -> Result<Delegation, FederationError> {
        let mut predecessors = completion.chain.clone();
        predecessors.push(completion.worker_id.clone());

        let target_info = self.state.require_worker(target)?;
        if target_info.status != WorkerStatus::Idle {
            return Err(FederationError::InvalidState(format!(
                "chain target {target} is {}, expected idle",
                target_info.status.as_str()
            )));
        }

        let result = completion.result().unwrap_or_default();
        let task = render_transform(transform, result, completion.output_path.as_deref());
        self.delegate(NewDelegation::new(target, task, then).with_chain(predecessors))
    }
}

/// Build the follow-up task from a transform template.
///
/// `{result}` is replaced by the predecessor's result and `{output_path}` by
/// its output location. When the template has no `{result}` placeholder the
/// result is appended.
pub fn render_transform(transform: &str, result: &str, output_path: Option<&str>) -> String {
    let mut task = transform.replace("{output_path}", output_path.unwrap_or("(none)"));
    if task.contains("{result}") {
        task = task.replace("{result}", result);
    } else {
        if !task.is_empty() {
            task.push_str("\n\n");
        }
        task.push_str("Previous result:\n");
        task.push_str(result);
    }
    task
}
