//! The master's decision loop.
//!
//! One call to [`MasterLoop::run`] handles one inbound message: the message is
//! appended to the master's conversation, then the completion service is
//! called repeatedly with the orchestration tool manifest. Tool invocations
//! are executed one at a time and their results appended; the first answer
//! without tool calls is the turn's final text.
//!
//! A failed turn (service failure, iteration limit, turn timeout) is rolled
//! back to its last answered tool call. Tool calls that already ran stay in
//! the history with their results, since they are not safe to repeat
//! (`get_completed` drains the queue). A turn that ran no tool at all is
//! removed entirely.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::tools::{ToolExecutor, define_tools};
use crate::completion::{ChatTurn, CompletionRequest, CompletionService, ToolSpec};
use crate::error::FederationError;
use crate::orchestration::events::{Event, EventBus, EventKind};
use crate::orchestration::state::StateManager;
use crate::orchestration::types::MasterStatus;

/// Bounds on a single master turn.
#[derive(Clone, Debug)]
pub struct MasterSettings {
    pub max_iterations: usize,
    pub turn_timeout: Option<Duration>,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            turn_timeout: None,
        }
    }
}

pub struct MasterLoop {
    state: StateManager,
    events: EventBus,
    service: Arc<dyn CompletionService>,
    executor: ToolExecutor,
    system_prompt: String,
    manifest: Vec<ToolSpec>,
    conversation: Vec<ChatTurn>,
    settings: MasterSettings,
}

impl MasterLoop {
    pub fn new(
        state: StateManager,
        events: EventBus,
        service: Arc<dyn CompletionService>,
        executor: ToolExecutor,
        system_prompt: String,
        settings: MasterSettings,
    ) -> Self {
        Self {
            state,
            events,
            service,
            executor,
            system_prompt,
            manifest: define_tools(),
            conversation: Vec::new(),
            settings,
        }
    }

    pub fn conversation(&self) -> &[ChatTurn] {
        &self.conversation
    }

    /// Forget the master's conversation history.
    pub fn reset(&mut self) {
        self.conversation.clear();
    }

    /// Handle one inbound message and return the turn's final text.
    ///
    /// Emits `master_done` on success and `master_error` on failure; the
    /// master status is back to idle either way.
    pub async fn run(&mut self, message: &str) -> Result<String, FederationError> {
        let checkpoint = self.conversation.len();

        let outcome = match self.settings.turn_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run_turn(message)).await {
                Ok(result) => result,
                Err(_) => Err(FederationError::ExternalServiceFailure(format!(
                    "master turn timed out after {}s",
                    limit.as_secs()
                ))),
            },
            None => self.run_turn(message).await,
        };

        self.state.set_master_status(MasterStatus::Idle);
        match &outcome {
            Ok(text) => {
                self.events
                    .emit(Event::master(EventKind::MasterDone, json!({ "text": text })));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Master turn failed");
                rollback_failed_turn(&mut self.conversation, checkpoint);
                self.events
                    .emit(Event::master(EventKind::MasterError, json!({ "error": e.to_string() })));
            }
        }
        outcome
    }

    async fn run_turn(&mut self, message: &str) -> Result<String, FederationError> {
        self.conversation.push(ChatTurn::user(message));

        for iteration in 1..=self.settings.max_iterations {
            self.state.set_master_status(MasterStatus::Thinking);
            self.events.emit(Event::master(
                EventKind::MasterThinking,
                json!({ "iteration": iteration }),
            ));

            let request = CompletionRequest {
                system: self.system_prompt.clone(),
                messages: self.conversation.clone(),
                tools: self.manifest.clone(),
            };
            let events = &self.events;
            let on_text = |chunk: &str| {
                if !chunk.is_empty() {
                    events.emit(Event::master_text(chunk));
                }
            };
            let response = self.service.complete(&request, &on_text).await?;
            self.conversation.push(response.to_turn());

            if response.tool_calls.is_empty() {
                tracing::debug!(iteration, "Master produced final answer");
                return Ok(response.text);
            }

            for call in &response.tool_calls {
                self.state
                    .set_master_status(MasterStatus::CallingTool(call.name.clone()));
                let result = self.executor.execute(call).await;
                self.conversation
                    .push(ChatTurn::tool_result(call.call_id.clone(), result));
            }
        }

        Err(FederationError::IterationLimit {
            limit: self.settings.max_iterations,
        })
    }
}

/// Drop the unanswered tail of a failed turn that started at `checkpoint`.
///
/// Tool results follow their assistant turn in call order, so a partially
/// answered assistant turn keeps only the calls that have results.
fn rollback_failed_turn(conversation: &mut Vec<ChatTurn>, checkpoint: usize) {
    let mut keep = checkpoint;
    let mut i = checkpoint + 1;
    while let Some(ChatTurn::Assistant { tool_calls, .. }) = conversation.get(i) {
        let expected = tool_calls.len();
        let answered = conversation[i + 1..]
            .iter()
            .take(expected)
            .take_while(|turn| matches!(turn, ChatTurn::Tool { .. }))
            .count();
        if answered == 0 {
            break;
        }
        if let Some(ChatTurn::Assistant { tool_calls, .. }) = conversation.get_mut(i) {
            tool_calls.truncate(answered);
        }
        keep = i + 1 + answered;
        if answered < expected {
            break;
        }
        i = keep;
    }
    conversation.truncate(keep);
}
