//! A worker's own decision loop.
//!
//! The loop is a simplified agent session: the task goes in as a user turn,
//! the completion service answers with text and/or tool calls, tool results
//! go back in, and the first answer without tool calls is the result. Text is
//! streamed to the event bus as `worker_text` while the model produces it.
//!
//! Cancellation and wall-clock limits are applied by the dispatcher around
//! this future; the loop itself only enforces the iteration ceiling.

use serde_json::json;

use super::capabilities::WorkspaceTools;
use crate::completion::{ChatTurn, CompletionRequest, CompletionService};
use crate::error::FederationError;
use crate::orchestration::events::{Event, EventBus, EventKind};
use crate::orchestration::types::RunAssignment;

/// Result text plus the conversation to store on the worker.
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub result: String,
    pub conversation: Vec<ChatTurn>,
}

/// Run a worker's task to completion.
///
/// The conversation carried in the assignment is extended, so a worker that
/// was not cleared remembers its earlier tasks.
pub async fn run_worker(
    assignment: &RunAssignment,
    service: &dyn CompletionService,
    tools: &WorkspaceTools,
    events: &EventBus,
    max_iterations: usize,
) -> Result<WorkerOutput, FederationError> {
    let worker_id = assignment.worker_id.as_str();
    let mut conversation = assignment.conversation.clone();
    conversation.push(ChatTurn::user(task_message(
        &assignment.task,
        assignment.output_path.as_deref(),
    )));

    let system = build_worker_prompt(&assignment.config.system_prompt, tools);
    let manifest = tools.manifest(&assignment.config.tools);

    for iteration in 1..=max_iterations {
        let request = CompletionRequest {
            system: system.clone(),
            messages: conversation.clone(),
            tools: manifest.clone(),
        };

        let on_text = |chunk: &str| {
            if !chunk.is_empty() {
                events.emit(Event::worker_text(worker_id, chunk));
            }
        };
        let response = service.complete(&request, &on_text).await?;
        conversation.push(response.to_turn());

        if response.tool_calls.is_empty() {
            tracing::debug!(worker_id, iteration, "Worker produced final answer");
            return Ok(WorkerOutput {
                result: response.text,
                conversation,
            });
        }

        for call in &response.tool_calls {
            events.emit(Event::worker(
                EventKind::WorkerToolCall,
                worker_id,
                json!({ "tool": call.name, "arguments": call.arguments }),
            ));
            let output = tools.execute(call, &assignment.config.tools).await;
            conversation.push(ChatTurn::tool_result(call.call_id.clone(), output));
        }
    }

    Err(FederationError::IterationLimit {
        limit: max_iterations,
    })
}

fn task_message(task: &str, output_path: Option<&str>) -> String {
    match output_path {
        Some(path) => format!("{task}\n\nWrite your output to `{path}` in the workspace."),
        None => task.to_string(),
    }
}

/// Template system prompt plus a short note about the shared workspace.
fn build_worker_prompt(template_prompt: &str, tools: &WorkspaceTools) -> String {
    format!(
        "{template_prompt}\n\n\
         You share a workspace directory with other agents. Paths passed to \
         tools are relative to it ({}). When the task is done, reply with a \
         concise final answer and no tool calls.",
        tools.root().display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_message_mentions_output_path() {
        assert_eq!(task_message("Summarize", None), "Summarize");
        assert!(task_message("Summarize", Some("out/summary.md")).contains("out/summary.md"));
    }
}
