//! [`CompletionService`] backed by the `genai` multi-provider client.
//!
//! The provider is selected by model name (e.g. `claude-*` -> Anthropic,
//! un-prefixed names -> Ollama). Responses are streamed: text chunks are
//! forwarded to the caller's sink as they arrive, and text plus tool calls are
//! captured from the stream's end event.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use genai::Client;
use genai::chat::{ChatMessage, ChatOptions, ChatRequest, ChatStreamEvent, Tool, ToolCall, ToolResponse};

use super::{ChatTurn, CompletionRequest, CompletionResponse, CompletionService, ToolInvocation, ToolSpec};
use crate::error::FederationError;

pub struct GenaiCompletion {
    client: Client,
    model: String,
    request_timeout: Duration,
}

impl GenaiCompletion {
    pub fn new(model: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client: Client::default(),
            model: model.into(),
            request_timeout,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn stream_completion(
        &self,
        chat_req: ChatRequest,
        on_text: &(dyn for<'s> Fn(&'s str) + Send + Sync),
    ) -> Result<CompletionResponse, FederationError> {
        let chat_options = ChatOptions::default()
            .with_capture_content(true)
            .with_capture_tool_calls(true);

        let stream_res = self
            .client
            .exec_chat_stream(&self.model, chat_req, Some(&chat_options))
            .await
            .map_err(|e| FederationError::ExternalServiceFailure(format!("stream open: {e}")))?;

        let mut stream = stream_res.stream;
        let mut response: Option<CompletionResponse> = None;
        let mut last_error: Option<String> = None;

        while let Some(event) = stream.next().await {
            match event {
                Ok(ChatStreamEvent::Chunk(chunk)) => on_text(&chunk.content),
                Ok(ChatStreamEvent::End(end)) => {
                    let text = end.captured_first_text().map(str::to_string).unwrap_or_default();
                    let tool_calls = end
                        .captured_tool_calls()
                        .map(|calls| calls.into_iter().map(from_genai_call).collect())
                        .unwrap_or_default();
                    response = Some(CompletionResponse { text, tool_calls });
                }
                Ok(_) => {}
                Err(e) => {
                    // The End event may still arrive after a recoverable chunk error.
                    tracing::warn!(model = %self.model, error = %e, "Completion stream error");
                    last_error = Some(e.to_string());
                }
            }
        }

        response.ok_or_else(|| {
            FederationError::ExternalServiceFailure(
                last_error.unwrap_or_else(|| "stream ended without a final event".to_string()),
            )
        })
    }
}

#[async_trait]
impl CompletionService for GenaiCompletion {
    async fn complete(
        &self,
        request: &CompletionRequest,
        on_text: &(dyn for<'s> Fn(&'s str) + Send + Sync),
    ) -> Result<CompletionResponse, FederationError> {
        let chat_req = build_chat_request(request);
        match tokio::time::timeout(self.request_timeout, self.stream_completion(chat_req, on_text)).await {
            Ok(result) => result,
            Err(_) => Err(FederationError::ExternalServiceFailure(format!(
                "request timed out after {}s",
                self.request_timeout.as_secs()
            ))),
        }
    }
}

/// Translate a crate-level request into a genai [`ChatRequest`].
fn build_chat_request(request: &CompletionRequest) -> ChatRequest {
    let mut chat_req = ChatRequest::from_system(&request.system);
    if !request.tools.is_empty() {
        chat_req = chat_req.with_tools(request.tools.iter().map(to_genai_tool).collect::<Vec<_>>());
    }

    for turn in &request.messages {
        chat_req = match turn {
            ChatTurn::User { content } => chat_req.append_message(ChatMessage::user(content.clone())),
            ChatTurn::Assistant { content, tool_calls } if tool_calls.is_empty() => {
                chat_req.append_message(ChatMessage::assistant(content.clone()))
            }
            ChatTurn::Assistant { content, tool_calls } => {
                let chat_req = if content.is_empty() {
                    chat_req
                } else {
                    chat_req.append_message(ChatMessage::assistant(content.clone()))
                };
                let calls: Vec<ToolCall> = tool_calls.iter().map(to_genai_call).collect();
                chat_req.append_message(ChatMessage::from(calls))
            }
            ChatTurn::Tool { call_id, content } => {
                chat_req.append_message(ToolResponse::new(call_id.clone(), content.clone()))
            }
        };
    }

    chat_req
}

fn to_genai_tool(spec: &ToolSpec) -> Tool {
    Tool::new(spec.name.clone())
        .with_description(spec.description.clone())
        .with_schema(spec.schema.clone())
}

fn to_genai_call(call: &ToolInvocation) -> ToolCall {
    ToolCall {
        call_id: call.call_id.clone(),
        fn_name: call.name.clone(),
        fn_arguments: call.arguments.clone(),
        thought_signatures: None,
    }
}

fn from_genai_call(call: &ToolCall) -> ToolInvocation {
    ToolInvocation {
        call_id: call.call_id.clone(),
        name: call.fn_name.clone(),
        arguments: call.fn_arguments.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_chat_request_keeps_message_order_and_tools() {
        let request = CompletionRequest {
            system: "system".into(),
            messages: vec![
                ChatTurn::user("hi"),
                ChatTurn::Assistant {
                    content: String::new(),
                    tool_calls: vec![ToolInvocation {
                        call_id: "c1".into(),
                        name: "read_file".into(),
                        arguments: json!({"path": "a.txt"}),
                    }],
                },
                ChatTurn::tool_result("c1", "contents"),
                ChatTurn::assistant("done"),
            ],
            tools: vec![ToolSpec::new("read_file", "Read a file", json!({"type": "object"}))],
        };

        let chat_req = build_chat_request(&request);
        assert_eq!(chat_req.messages.len(), 4);
        assert_eq!(chat_req.tools.as_ref().map(|t| t.len()), Some(1));
    }

    #[test]
    fn tool_call_conversion_preserves_fields() {
        let invocation = ToolInvocation {
            call_id: "c9".into(),
            name: "search_files".into(),
            arguments: json!({"pattern": "**/*.md"}),
        };
        let back = from_genai_call(&to_genai_call(&invocation));
        assert_eq!(back, invocation);
    }
}
