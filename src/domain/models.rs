use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model.
///
/// `arguments` is the JSON-encoded argument object. While a stream is in
/// flight it is a concatenation of fragments and only guaranteed to be valid
/// JSON once the call has been finalised by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse `arguments` into a JSON object. An empty string is treated as `{}`.
    pub fn parsed_arguments(&self) -> Result<Value, String> {
        let raw = self.arguments.trim();
        if raw.is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(value @ Value::Object(_)) => Ok(value),
            Ok(other) => Err(format!("expected a JSON object, got {}", other)),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// Assistant turn that requested tools. Empty text is stored as `None`.
    pub fn assistant_tool_calls(content: &str, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: if content.is_empty() {
                None
            } else {
                Some(content.to_string())
            },
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("system message at position {0} must be first")]
    MisplacedSystem(usize),

    #[error("tool message at position {0} has no tool_call_id")]
    MissingToolCallId(usize),

    #[error("tool message at position {index} references unknown tool call '{id}'")]
    UnknownToolCall { index: usize, id: String },
}

/// Check the ordering invariants of a conversation: a system message may
/// only appear first, and every tool message answers a call issued by an
/// earlier assistant message.
pub fn validate_conversation(messages: &[Message]) -> Result<(), ConversationError> {
    let mut issued: HashSet<&str> = HashSet::new();

    for (index, message) in messages.iter().enumerate() {
        match message.role {
            Role::System if index != 0 => return Err(ConversationError::MisplacedSystem(index)),
            Role::Assistant => {
                if let Some(calls) = &message.tool_calls {
                    issued.extend(calls.iter().map(|c| c.id.as_str()));
                }
            }
            Role::Tool => {
                let id = message
                    .tool_call_id
                    .as_deref()
                    .ok_or(ConversationError::MissingToolCallId(index))?;
                if !issued.contains(id) {
                    return Err(ConversationError::UnknownToolCall {
                        index,
                        id: id.to_string(),
                    });
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// Tool definition in the OpenAI `function` shape. Adapters for other
/// protocols translate it at their boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionSpec {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    /// Only sent when the target model supports tool use.
    pub tools: Option<Vec<ToolSpec>>,
    pub cancel: CancellationToken,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: 4096,
            temperature: None,
            tools: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Tools to put on the wire, `None` when absent or empty.
    pub fn wire_tools(&self) -> Option<&[ToolSpec]> {
        self.tools.as_deref().filter(|tools| !tools.is_empty())
    }
}

/// Terminal result of a successful (or cancelled) stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    /// Concatenation of every text delta sent to the chunk channel.
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// The cancel token fired before the stream finished.
    pub cancelled: bool,
    /// A protocol-level end marker (`[DONE]` / `message_stop`) was seen.
    pub finished: bool,
}

/// Outcome of one executed tool call, surfaced to the user and fed back to
/// the model as a `tool` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "type")]
    pub action_type: String,
}

impl ActionResult {
    pub fn succeeded(action_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            success: true,
            description: Some(description.into()),
            error: None,
            action_type: action_type.into(),
        }
    }

    pub fn failed(action_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            description: None,
            error: Some(error.into()),
            action_type: action_type.into(),
        }
    }

    /// The payload sent back to the model: `{success, description}` or
    /// `{success: false, error}`.
    pub fn to_tool_payload(&self) -> Value {
        if self.success {
            serde_json::json!({
                "success": true,
                "description": self.description.clone().unwrap_or_default(),
            })
        } else {
            serde_json::json!({
                "success": false,
                "error": self.error.clone().unwrap_or_default(),
            })
        }
    }
}

/// Final product of one agentic session.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub message: Message,
    pub actions: Vec<ActionResult>,
    pub iterations: u32,
    /// Full transcript the session worked on, including tool turns.
    pub messages: Vec<Message>,
    pub cancelled: bool,
}

impl AgentReply {
    /// The final answer, when it says something other than what was shown
    /// while streaming. Whitespace alone does not count as a difference.
    pub fn final_display(&self, streamed: &str) -> Option<&str> {
        let content = self.message.content.as_deref().unwrap_or_default();
        let visible = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
        (visible(content) != visible(streamed)).then_some(content)
    }
}
