use crate::adapters::sse::{post_stream, Endpoint, SseParser, Step};
use crate::domain::models::*;
use crate::domain::ports::ModelAdapter;
use crate::error::CompletionError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc::Sender;
use tracing::warn;

/// Adapter for the `chat/completions` SSE dialect shared by OpenAI and the
/// compatible backends.
pub struct OpenAIAdapter {
    client: Client,
    endpoint: Endpoint,
}

impl OpenAIAdapter {
    pub fn new(client: Client, endpoint: Endpoint) -> Self {
        Self { client, endpoint }
    }
}

// --- Request Structs ---

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    stream: bool,
    messages: Vec<OpenAIMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolSpec]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct OpenAIMessage<'a> {
    role: &'static str,
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Serialize)]
struct OpenAIToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    type_: &'static str,
    function: OpenAIFunctionCall<'a>,
}

#[derive(Serialize)]
struct OpenAIFunctionCall<'a> {
    name: &'a str,
    arguments: &'a str,
}

fn build_request(req: &CompletionRequest) -> OpenAIRequest<'_> {
    let messages = req
        .messages
        .iter()
        .map(|m| OpenAIMessage {
            role: m.role.as_str(),
            content: m.content.as_deref(),
            tool_calls: m.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|tc| OpenAIToolCall {
                        id: &tc.id,
                        type_: "function",
                        function: OpenAIFunctionCall {
                            name: &tc.name,
                            arguments: &tc.arguments,
                        },
                    })
                    .collect()
            }),
            tool_call_id: m.tool_call_id.as_deref(),
        })
        .collect();

    let tools = req.wire_tools();
    OpenAIRequest {
        model: &req.model,
        max_tokens: req.max_tokens,
        stream: true,
        messages,
        tools,
        tool_choice: tools.map(|_| "auto"),
        temperature: req.temperature,
    }
}

// --- Stream Response Structs ---

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    error: Option<OpenAIStreamError>,
}

#[derive(Deserialize)]
struct OpenAIStreamError {
    message: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIStreamDelta,
}

#[derive(Deserialize, Default)]
struct OpenAIStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAIToolCallDelta>>,
}

#[derive(Deserialize)]
struct OpenAIToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<OpenAIFunctionCallDelta>,
}

#[derive(Deserialize)]
struct OpenAIFunctionCallDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental reader for `chat/completions` chunks. Tool call fragments
/// are merged per positional `index`.
#[derive(Debug, Default)]
pub struct OpenAIStreamParser {
    tool_calls: BTreeMap<u32, PartialToolCall>,
}

impl OpenAIStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn merge(&mut self, delta: OpenAIToolCallDelta) {
        let entry = self.tool_calls.entry(delta.index).or_default();
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            if entry.id.is_empty() {
                entry.id = id;
            }
        }
        if let Some(func) = delta.function {
            if let Some(name) = func.name {
                entry.name.push_str(&name);
            }
            if let Some(args) = func.arguments {
                entry.arguments.push_str(&args);
            }
        }
    }
}

impl SseParser for OpenAIStreamParser {
    fn feed(&mut self, _event: &str, data: &str) -> Result<Step, CompletionError> {
        let data = data.trim();
        if data == "[DONE]" {
            return Ok(Step::Done);
        }
        if data.is_empty() {
            return Ok(Step::Skip);
        }

        let chunk: OpenAIStreamResponse = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("skipping malformed chunk: {}", e);
                return Ok(Step::Skip);
            }
        };

        if let Some(err) = chunk.error {
            let message = err
                .message
                .unwrap_or_else(|| "The provider reported an error".to_string());
            return Err(CompletionError::Provider(message));
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(Step::Skip);
        };

        if let Some(tool_calls) = choice.delta.tool_calls {
            for tc in tool_calls {
                self.merge(tc);
            }
        }

        match choice.delta.content {
            Some(content) if !content.is_empty() => Ok(Step::Text(content)),
            _ => Ok(Step::Skip),
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.tool_calls
            .into_iter()
            .filter(|(_, partial)| !partial.name.is_empty())
            .map(|(index, partial)| ToolCall {
                id: if partial.id.is_empty() {
                    format!("call_{}", index)
                } else {
                    partial.id
                },
                name: partial.name,
                arguments: partial.arguments,
            })
            .collect()
    }
}

#[async_trait]
impl ModelAdapter for OpenAIAdapter {
    async fn stream(
        &self,
        req: CompletionRequest,
        tx: Sender<String>,
    ) -> Result<StreamOutcome, CompletionError> {
        let body = serde_json::to_value(build_request(&req))
            .map_err(|e| CompletionError::InvalidRequest(e.to_string()))?;

        post_stream(
            &self.client,
            &self.endpoint,
            &body,
            OpenAIStreamParser::new(),
            &tx,
            &req.cancel,
        )
        .await
    }
}
