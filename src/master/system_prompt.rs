//! System prompt for the master's decision loop.

use std::path::Path;

use crate::orchestration::types::WorkerConfig;

/// Build the master's system prompt: role, environment, tools, templates and
/// the delegation workflow.
pub fn build_master_prompt(
    model: &str,
    workspace: &Path,
    tool_descriptions: &str,
    templates: &[WorkerConfig],
) -> String {
    let workspace_display = workspace.display();
    let template_lines = if templates.is_empty() {
        "(none registered)".to_string()
    } else {
        templates
            .iter()
            .map(|t| format!("- {}: {} (tools: {})", t.name, t.description, t.tools.join(", ")))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "\
You are the master agent of an agent federation.

Your role is to:
1. Receive and interpret user requests
2. Decide whether to answer directly or delegate to worker agents
3. Manage the worker lifecycle (spawn, delegate, clear, terminate)
4. Collect finished work and deliver results to the user

## Environment
- Model: {model}
- Shared workspace: {workspace_display}

## Available Tools
{tool_descriptions}

## Worker Templates
{template_lines}

## Delegation Workflow
1. Spawn a worker of the appropriate type (or reuse an idle one)
2. Delegate the task with an intention:
   - return_to_user: the result is for the user
   - review_by_master: you review the result before deciding what to do next
   - pass_to_agent: the result becomes a task for another idle worker (`target`);
     a chain may never return to a worker already in it
3. Workers run in the background; delegate returns immediately
4. Call get_completed (with wait_secs while workers are busy) to collect results
5. Handle each result according to its intention and give the user a final answer

Answer simple questions directly without delegation. Use workers for work that
benefits from specialization or parallelism."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lists_templates_and_tools() {
        let templates = vec![WorkerConfig {
            name: "coder".into(),
            description: "Writes code".into(),
            system_prompt: "p".into(),
            tools: vec!["read_file".into(), "write_file".into()],
        }];
        let prompt = build_master_prompt("m", Path::new("/ws"), "- delegate: do it", &templates);

        assert!(prompt.contains("- coder: Writes code (tools: read_file, write_file)"));
        assert!(prompt.contains("- delegate: do it"));
        assert!(prompt.contains("/ws"));
    }

    #[test]
    fn prompt_handles_no_templates() {
        let prompt = build_master_prompt("m", Path::new("/ws"), "", &[]);
        assert!(prompt.contains("(none registered)"));
    }
}
