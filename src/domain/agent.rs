use crate::domain::actions::ActionRegistry;
use crate::domain::extractor::{extract, strip_tool_syntax, CallSource};
use crate::domain::models::*;
use crate::domain::ports::ModelAdapter;
use crate::error::CompletionError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MAX_ITERATIONS: u32 = 5;
pub const MAX_TOOL_RESULT_CHARS: usize = 6000;
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";

#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub max_iterations: u32,
    pub max_tool_result_chars: usize,
}

impl LoopConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 4096,
            temperature: None,
            max_iterations: MAX_ITERATIONS,
            max_tool_result_chars: MAX_TOOL_RESULT_CHARS,
        }
    }
}

/// Loop-local state of one user turn. Discarded once finalised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgenticSession {
    pub iteration: u32,
    pub accumulated_text: String,
    pub action_results: Vec<ActionResult>,
    pub messages: Vec<Message>,
}

impl AgenticSession {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    fn accumulate(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.accumulated_text.is_empty() {
            self.accumulated_text.push_str("\n\n");
        }
        self.accumulated_text.push_str(text);
    }

    fn finalize(mut self, current_text: &str, cancelled: bool) -> AgentReply {
        self.accumulate(current_text);
        let content = if self.accumulated_text.is_empty() {
            current_text.trim().to_string()
        } else {
            self.accumulated_text
        };
        let message = Message::assistant(content);
        self.messages.push(message.clone());

        AgentReply {
            message,
            actions: self.action_results,
            iterations: self.iteration,
            messages: self.messages,
            cancelled,
        }
    }
}

/// A completion failure, with everything the session managed before it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct LoopFailure {
    pub error: CompletionError,
    pub partial: AgentReply,
}

/// Cut a serialized tool result to `max_chars` characters.
pub fn truncate_result(payload: &str, max_chars: usize) -> String {
    match payload.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{}", &payload[..cut], TRUNCATION_MARKER),
        None => payload.to_string(),
    }
}

/// Bounded request → tool execution → feedback cycle.
pub struct AgenticLoop {
    model: Arc<dyn ModelAdapter>,
    actions: Arc<ActionRegistry>,
    config: LoopConfig,
}

impl AgenticLoop {
    pub fn new(model: Arc<dyn ModelAdapter>, actions: Arc<ActionRegistry>, config: LoopConfig) -> Self {
        Self {
            model,
            actions,
            config,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Run one user turn to completion. `messages` is the conversation so
    /// far, ending with the user's message. Streamed text goes to `tx`.
    pub async fn run(
        &self,
        messages: Vec<Message>,
        tx: Sender<String>,
        cancel: CancellationToken,
    ) -> Result<AgentReply, LoopFailure> {
        if let Err(e) = validate_conversation(&messages) {
            warn!("refusing malformed conversation: {}", e);
            return Err(LoopFailure {
                error: CompletionError::InvalidRequest(e.to_string()),
                partial: AgenticSession::new(messages).finalize("", false),
            });
        }

        let mut session = AgenticSession::new(messages);
        let tools = Some(self.actions.tool_specs()).filter(|specs| !specs.is_empty());

        loop {
            if cancel.is_cancelled() {
                debug!(iteration = session.iteration, "cancelled before request");
                return Ok(session.finalize("", true));
            }

            session.iteration += 1;
            debug!(iteration = session.iteration, messages = session.messages.len(), "requesting completion");

            let req = CompletionRequest {
                model: self.config.model.clone(),
                messages: session.messages.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                tools: tools.clone(),
                cancel: cancel.clone(),
            };

            let outcome = match self.model.stream(req, tx.clone()).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    warn!(iteration = session.iteration, "completion failed: {}", error);
                    return Err(LoopFailure {
                        error,
                        partial: session.finalize("", false),
                    });
                }
            };

            if outcome.cancelled {
                info!(iteration = session.iteration, "stream cancelled, finalizing");
                let text = strip_tool_syntax(&outcome.content);
                return Ok(session.finalize(&text, true));
            }

            let extraction = extract(&outcome.content, &outcome.tool_calls);
            match extraction.source {
                None => return Ok(session.finalize(&extraction.display_text, false)),
                Some(CallSource::Text) => {
                    debug!(calls = extraction.calls.len(), "executing text-form tool calls");
                    for call in &extraction.calls {
                        let result = self.execute_call(call).await;
                        session.action_results.push(result);
                    }
                    return Ok(session.finalize(&extraction.display_text, false));
                }
                Some(CallSource::Structured) => {
                    debug!(calls = extraction.calls.len(), "executing structured tool calls");
                    session
                        .messages
                        .push(Message::assistant_tool_calls(&outcome.content, extraction.calls.clone()));

                    for call in &extraction.calls {
                        let result = self.execute_call(call).await;
                        let payload = result.to_tool_payload().to_string();
                        let content = truncate_result(&payload, self.config.max_tool_result_chars);
                        session.messages.push(Message::tool_result(call.id.clone(), content));
                        session.action_results.push(result);
                    }

                    session.accumulate(&extraction.display_text);

                    if session.iteration >= self.config.max_iterations {
                        info!(iterations = session.iteration, "iteration cap reached");
                        return Ok(session.finalize("", false));
                    }
                }
            }
        }
    }

    /// Handlers run one at a time; a failure is recorded and the next call
    /// still runs.
    async fn execute_call(&self, call: &ToolCall) -> ActionResult {
        let args = match call.parsed_arguments() {
            Ok(args) => args,
            Err(e) => {
                warn!(action = %call.name, "invalid arguments: {}", e);
                return ActionResult::failed(
                    call.name.clone(),
                    format!("Invalid arguments for {}: {}", call.name, e),
                );
            }
        };

        match self.actions.execute(&call.name, args).await {
            Ok(description) => {
                debug!(action = %call.name, "action succeeded");
                ActionResult::succeeded(call.name.clone(), description)
            }
            Err(e) => {
                warn!(action = %call.name, "action failed: {}", e);
                ActionResult::failed(call.name.clone(), e.to_string())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("A reply is already streaming for this conversation")]
    Busy,

    #[error(transparent)]
    Failed(#[from] LoopFailure),
}

/// Chat history owned by one conversation. At most one agentic session runs
/// against it at a time; a send while another is in flight is refused.
#[derive(Debug)]
pub struct Conversation {
    id: Uuid,
    history: Mutex<Vec<Message>>,
}

impl Conversation {
    pub fn new(system_prompt: Option<String>) -> Self {
        let history = system_prompt.map(Message::system).into_iter().collect();
        Self {
            id: Uuid::new_v4(),
            history: Mutex::new(history),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn history(&self) -> Vec<Message> {
        self.history.lock().await.clone()
    }

    /// Run a user turn. On success the user message and the final assistant
    /// message are appended; on failure the history is left untouched.
    pub async fn send(
        &self,
        agent: &AgenticLoop,
        input: impl Into<String>,
        tx: Sender<String>,
        cancel: CancellationToken,
    ) -> Result<AgentReply, SendError> {
        let mut history = self.history.try_lock().map_err(|_| {
            warn!(conversation = %self.id, "send refused, a reply is in flight");
            SendError::Busy
        })?;
        debug!(conversation = %self.id, history = history.len(), "starting turn");

        let user = Message::user(input);
        let mut messages = history.clone();
        messages.push(user.clone());

        let reply = agent.run(messages, tx, cancel).await?;
        history.push(user);
        history.push(reply.message.clone());
        Ok(reply)
    }
}
