use crate::adapters::sse::{post_stream, Endpoint, SseParser, Step};
use crate::domain::models::*;
use crate::domain::ports::ModelAdapter;
use crate::error::CompletionError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc::Sender;
use tracing::{debug, warn};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: Client,
    endpoint: Endpoint,
}

impl AnthropicAdapter {
    pub fn new(client: Client, endpoint: Endpoint) -> Self {
        Self { client, endpoint }
    }
}

// --- Anthropic Request Structs ---

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    stream: bool,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize, Debug, PartialEq)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicContent>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
enum AnthropicContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Serialize, Debug, PartialEq)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

/// Split the OpenAI-shaped conversation into the vendor envelope: system
/// text goes to a top-level field, tool results travel as user-role
/// `tool_result` blocks, and assistant tool calls become `tool_use` blocks.
fn translate_messages(messages: &[Message]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system_parts = Vec::new();
    let mut out: Vec<AnthropicMessage> = Vec::new();

    for m in messages {
        let (role, content) = match m.role {
            Role::System => {
                if let Some(text) = m.content.as_deref().filter(|t| !t.is_empty()) {
                    system_parts.push(text.to_string());
                }
                continue;
            }
            Role::Tool => {
                let Some(tool_use_id) = m.tool_call_id.clone() else {
                    warn!("dropping tool message without tool_call_id");
                    continue;
                };
                (
                    "user",
                    vec![AnthropicContent::ToolResult {
                        tool_use_id,
                        content: m.content.clone().unwrap_or_default(),
                    }],
                )
            }
            Role::User | Role::Assistant => {
                let mut content = Vec::new();
                if let Some(text) = m.content.as_deref().filter(|t| !t.is_empty()) {
                    content.push(AnthropicContent::Text {
                        text: text.to_string(),
                    });
                }
                for tc in m.tool_calls.iter().flatten() {
                    let input = serde_json::from_str(&tc.arguments).unwrap_or_else(|_| json!({}));
                    content.push(AnthropicContent::ToolUse {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        input,
                    });
                }
                let role = if m.role == Role::User { "user" } else { "assistant" };
                (role, content)
            }
        };

        if content.is_empty() {
            continue;
        }

        // Consecutive same-role turns (e.g. several tool results) share one message.
        match out.last_mut() {
            Some(last) if last.role == role => last.content.extend(content),
            _ => out.push(AnthropicMessage { role, content }),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, out)
}

fn translate_tools(tools: &[ToolSpec]) -> Vec<AnthropicTool> {
    tools
        .iter()
        .map(|t| AnthropicTool {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            input_schema: t.function.parameters.clone(),
        })
        .collect()
}

fn build_request(req: &CompletionRequest) -> AnthropicRequest {
    let (system, messages) = translate_messages(&req.messages);
    let tools = req.wire_tools().map(translate_tools);

    AnthropicRequest {
        model: req.model.clone(),
        max_tokens: req.max_tokens,
        stream: true,
        messages,
        system,
        tool_choice: tools.as_ref().map(|_| json!({"type": "auto"})),
        tools,
        temperature: req.temperature,
    }
}

// --- Anthropic Stream Structs ---

#[derive(Deserialize)]
struct BlockStart {
    index: u32,
    content_block: StartBlock,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum StartBlock {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct BlockDelta {
    index: u32,
    delta: DeltaBody,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum DeltaBody {
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(rename = "input_json_delta")]
    InputJson { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct BlockStop {
    index: u32,
}

#[derive(Debug)]
enum BlockKind {
    Text,
    ToolUse { id: String, name: String },
    Other,
}

#[derive(Debug)]
struct Block {
    kind: BlockKind,
    buffer: String,
}

/// Per-content-block state machine over the typed event stream:
/// `content_block_start` opens a block, `content_block_delta` appends to its
/// buffer, `content_block_stop` closes it and freezes tool-use input.
#[derive(Debug, Default)]
pub struct AnthropicStreamParser {
    open: HashMap<u32, Block>,
    finished: Vec<ToolCall>,
}

impl AnthropicStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&mut self, start: BlockStart) {
        let kind = match start.content_block {
            StartBlock::Text => BlockKind::Text,
            StartBlock::ToolUse { id, name } => {
                debug!(index = start.index, %name, "tool_use block started");
                BlockKind::ToolUse { id, name }
            }
            StartBlock::Other => BlockKind::Other,
        };
        self.open.insert(
            start.index,
            Block {
                kind,
                buffer: String::new(),
            },
        );
    }

    fn delta(&mut self, delta: BlockDelta) -> Step {
        match delta.delta {
            DeltaBody::Text { text } => {
                let block = self.open.entry(delta.index).or_insert_with(|| Block {
                    kind: BlockKind::Text,
                    buffer: String::new(),
                });
                block.buffer.push_str(&text);
                if text.is_empty() {
                    Step::Skip
                } else {
                    Step::Text(text)
                }
            }
            DeltaBody::InputJson { partial_json } => {
                match self.open.get_mut(&delta.index) {
                    Some(block) => block.buffer.push_str(&partial_json),
                    None => warn!(index = delta.index, "input_json_delta for unknown block"),
                }
                Step::Skip
            }
            DeltaBody::Other => Step::Skip,
        }
    }

    fn stop(&mut self, stop: BlockStop) {
        let Some(block) = self.open.remove(&stop.index) else {
            return;
        };
        if let BlockKind::ToolUse { id, name } = block.kind {
            let arguments = if block.buffer.trim().is_empty() {
                "{}".to_string()
            } else {
                block.buffer
            };
            // Output position is the order in which blocks close.
            self.finished.push(ToolCall { id, name, arguments });
        }
    }
}

fn parse_as<T: for<'de> Deserialize<'de>>(kind: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("skipping malformed {} event: {}", kind, e);
            None
        }
    }
}

impl SseParser for AnthropicStreamParser {
    fn feed(&mut self, event: &str, data: &str) -> Result<Step, CompletionError> {
        if data.trim().is_empty() {
            return Ok(Step::Skip);
        }
        let value: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                warn!("skipping malformed event data: {}", e);
                return Ok(Step::Skip);
            }
        };
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(event)
            .to_string();

        let step = match kind.as_str() {
            "content_block_start" => {
                if let Some(start) = parse_as::<BlockStart>(&kind, value) {
                    self.start(start);
                }
                Step::Skip
            }
            "content_block_delta" => match parse_as::<BlockDelta>(&kind, value) {
                Some(delta) => self.delta(delta),
                None => Step::Skip,
            },
            "content_block_stop" => {
                if let Some(stop) = parse_as::<BlockStop>(&kind, value) {
                    self.stop(stop);
                }
                Step::Skip
            }
            "message_stop" => Step::Done,
            "error" => {
                let message = value
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("The provider reported an error")
                    .to_string();
                return Err(CompletionError::Provider(message));
            }
            // message_start, message_delta, ping
            _ => Step::Skip,
        };
        Ok(step)
    }

    fn finish(self) -> Vec<ToolCall> {
        if !self.open.is_empty() {
            debug!(open = self.open.len(), "discarding unfinished content blocks");
        }
        self.finished
    }
}

#[async_trait]
impl ModelAdapter for AnthropicAdapter {
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
            AnthropicStreamParser::new(),
            &tx,
            &req.cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event(kind: &str, data: Value) -> String {
        format!("event: {}\ndata: {}\n\n", kind, data)
    }

    fn tool_use_stream() -> String {
        [
            event("message_start", json!({"type": "message_start", "message": {"id": "msg_1"}})),
            event("content_block_start", json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
            event("ping", json!({"type": "ping"})),
            event("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Setting "}})),
            event("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "genre."}})),
            event("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
            event("content_block_start", json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "setGenre", "input": {}}})),
            event("content_block_delta", json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"gen"}})),
            event("content_block_delta", json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "re\": \"noir\"}"}})),
            event("content_block_stop", json!({"type": "content_block_stop", "index": 1})),
            event("message_delta", json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}})),
            event("message_stop", json!({"type": "message_stop"})),
        ]
        .concat()
    }

    #[test]
    fn test_translate_messages_envelope() {
        let messages = vec![
            Message::system("You are a story assistant."),
            Message::user("Make it noir"),
            Message::assistant_tool_calls(
                "On it.",
                vec![
                    ToolCall::new("t1", "setGenre", r#"{"genre":"noir"}"#),
                    ToolCall::new("t2", "setTone", "not json"),
                ],
            ),
            Message::tool_result("t1", r#"{"success":true}"#),
            Message::tool_result("t2", r#"{"success":false}"#),
        ];

        let (system, out) = translate_messages(&messages);
        assert_eq!(system.as_deref(), Some("You are a story assistant."));
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].role, "user");
        assert_eq!(out[1].role, "assistant");
        assert_eq!(
            out[1].content,
            vec![
                AnthropicContent::Text { text: "On it.".to_string() },
                AnthropicContent::ToolUse {
                    id: "t1".to_string(),
                    name: "setGenre".to_string(),
                    input: json!({"genre": "noir"}),
                },
                AnthropicContent::ToolUse {
                    id: "t2".to_string(),
                    name: "setTone".to_string(),
                    input: json!({}),
                },
            ]
        );
        assert_eq!(out[2].role, "user");
        assert_eq!(out[2].content.len(), 2);
        assert_eq!(
            out[2].content[0],
            AnthropicContent::ToolResult {
                tool_use_id: "t1".to_string(),
                content: r#"{"success":true}"#.to_string(),
            }
        );
    }

    #[test]
    fn test_request_body_translates_tools() {
        let mut req = CompletionRequest::new("claude-sonnet", vec![Message::user("hi")]);
        req.tools = Some(vec![ToolSpec::function(
            "setGenre",
            "Change the genre",
            json!({"type": "object", "properties": {"genre": {"type": "string"}}}),
        )]);
        req.temperature = Some(0.5);

        let body = serde_json::to_value(build_request(&req)).unwrap();
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["tool_choice"], json!({"type": "auto"}));
        assert_eq!(body["tools"][0]["name"], json!("setGenre"));
        assert_eq!(body["tools"][0]["input_schema"]["type"], json!("object"));
        assert!(body.get("system").is_none());
        assert_eq!(body["messages"][0]["content"][0]["type"], json!("text"));
    }

    #[test]
    fn test_parser_assigns_tool_indices_in_stop_order() {
        let mut parser = AnthropicStreamParser::new();
        let feed = |p: &mut AnthropicStreamParser, v: Value| p.feed("message", &v.to_string()).unwrap();

        feed(&mut parser, json!({"type": "content_block_start", "index": 3, "content_block": {"type": "tool_use", "id": "b", "name": "second"}}));
        feed(&mut parser, json!({"type": "content_block_start", "index": 2, "content_block": {"type": "tool_use", "id": "a", "name": "first"}}));
        feed(&mut parser, json!({"type": "content_block_stop", "index": 2}));
        feed(&mut parser, json!({"type": "content_block_delta", "index": 3, "delta": {"type": "input_json_delta", "partial_json": "{\"x\":1}"}}));
        feed(&mut parser, json!({"type": "content_block_stop", "index": 3}));

        let calls = parser.finish();
        assert_eq!(
            calls,
            vec![
                ToolCall::new("a", "first", "{}"),
                ToolCall::new("b", "second", r#"{"x":1}"#),
            ]
        );
    }

    #[test]
    fn test_parser_uses_event_name_when_type_missing() {
        let mut parser = AnthropicStreamParser::new();
        assert_eq!(parser.feed("message_stop", "{}").unwrap(), Step::Done);
    }

    #[test]
    fn test_parser_error_event() {
        let mut parser = AnthropicStreamParser::new();
        let err = parser
            .feed(
                "error",
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            )
            .unwrap_err();
        assert_eq!(err, CompletionError::Provider("Overloaded".to_string()));
    }

    #[test]
    fn test_unfinished_tool_block_is_dropped() {
        let mut parser = AnthropicStreamParser::new();
        parser
            .feed(
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t","name":"n"}}"#,
            )
            .unwrap();
        assert!(parser.finish().is_empty());
    }

    #[tokio::test]
    async fn test_stream_against_mock_server() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test_api_key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({"stream": true, "system": "sys"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(tool_use_stream(), "text/event-stream"),
            )
            .mount(&mock_server)
            .await;

        let endpoint = Endpoint::new(format!("{}/v1/messages", mock_server.uri()))
            .header("x-api-key", "test_api_key")
            .header("anthropic-version", ANTHROPIC_VERSION);
        let adapter = AnthropicAdapter::new(Client::new(), endpoint);
        let (tx, mut rx) = mpsc::channel(32);

        let outcome = adapter
            .stream(
                CompletionRequest::new(
                    "claude-sonnet",
                    vec![Message::system("sys"), Message::user("noir please")],
                ),
                tx,
            )
            .await
            .unwrap();

        assert!(outcome.finished);
        assert_eq!(outcome.content, "Setting genre.");
        assert_eq!(
            outcome.tool_calls,
            vec![ToolCall::new("toolu_1", "setGenre", r#"{"genre": "noir"}"#)]
        );
        assert_eq!(rx.recv().await.as_deref(), Some("Setting "));
        assert_eq!(rx.recv().await.as_deref(), Some("genre."));
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(
                json!({"type": "error", "error": {"type": "authentication_error", "message": "invalid x-api-key"}}),
            ))
            .mount(&mock_server)
            .await;

        let adapter = AnthropicAdapter::new(
            Client::new(),
            Endpoint::new(format!("{}/v1/messages", mock_server.uri())),
        );
        let (tx, _rx) = mpsc::channel(8);
        let err = adapter
            .stream(CompletionRequest::new("m", vec![Message::user("hi")]), tx)
            .await
            .unwrap_err();
        assert!(err.is_auth());
    }
}
