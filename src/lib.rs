pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;

pub use adapters::router::{CompletionRouter, Protocol, ProviderDescriptor};
pub use domain::actions::{ActionError, ActionRegistry};
pub use domain::agent::{AgenticLoop, Conversation, LoopConfig, LoopFailure, SendError};
pub use domain::models::{AgentReply, CompletionRequest, Message, StreamOutcome, ToolCall};
pub use domain::ports::{ActionHandler, ModelAdapter};
pub use error::CompletionError;
