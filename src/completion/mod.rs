//! Seam to the external completion service.
//!
//! Both the master loop and every worker loop talk to the model through the
//! [`CompletionService`] trait. The conversation is kept in the crate's own
//! [`ChatTurn`] vocabulary so the orchestration core never depends on a
//! particular client library; [`genai_service::GenaiCompletion`] adapts it to
//! the `genai` multi-provider client.

pub mod genai_service;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FederationError;

/// A single tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Schema of a tool offered to the model.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
}

impl ToolSpec {
    pub fn new(name: &str, description: &str, schema: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            schema,
        }
    }
}

/// One message of an agent conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatTurn {
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolInvocation>,
    },
    Tool {
        call_id: String,
        content: String,
    },
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        ChatTurn::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatTurn::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatTurn::Tool {
            call_id: call_id.into(),
            content: content.into(),
        }
    }
}

/// Everything the service needs for one decision step.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<ChatTurn>,
    pub tools: Vec<ToolSpec>,
}

/// The model's answer: text, tool invocations, or both.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionResponse {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
}

impl CompletionResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tools(tool_calls: Vec<ToolInvocation>) -> Self {
        Self {
            text: String::new(),
            tool_calls,
        }
    }

    /// The assistant turn to append to the conversation.
    pub fn to_turn(&self) -> ChatTurn {
        ChatTurn::Assistant {
            content: self.text.clone(),
            tool_calls: self.tool_calls.clone(),
        }
    }
}

/// Language-model completion service.
///
/// Implementations may stream partial text through `on_text` before
/// returning. Any transport, throttling or timeout problem is reported as
/// [`FederationError::ExternalServiceFailure`]; callers treat it as a failed
/// turn or worker run, never a crash.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
        on_text: &(dyn for<'s> Fn(&'s str) + Send + Sync),
    ) -> Result<CompletionResponse, FederationError>;
}
