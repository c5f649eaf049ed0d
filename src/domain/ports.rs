use crate::domain::models::*;
use crate::error::CompletionError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::Sender;

/// A local capability the model may invoke.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the argument object.
    fn parameters(&self) -> Value;
    /// Perform the action, returning a human-readable description of what
    /// changed, or an error message.
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// Protocol-specific streaming completion.
///
/// Every text delta is pushed to `tx` as soon as it is decoded. The return
/// value is the single terminal outcome of the request; cancellation through
/// `req.cancel` resolves as `Ok` with `cancelled` set.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    async fn stream(
        &self,
        req: CompletionRequest,
        tx: Sender<String>,
    ) -> Result<StreamOutcome, CompletionError>;
}
