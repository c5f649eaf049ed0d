use crate::domain::models::ToolSpec;
use crate::domain::ports::ActionHandler;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("Unknown action: {0}")]
    Unknown(String),

    #[error("{0}")]
    Failed(String),
}

/// Name-keyed set of action handlers. Registration order is kept so the
/// tool definitions sent to the model are stable between requests.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    order: Vec<String>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler with the same name.
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_none() {
            self.order.push(name);
        }
    }

    pub fn with(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.order
            .iter()
            .filter_map(|name| self.handlers.get(name))
            .map(|h| ToolSpec::function(h.name(), h.description(), h.parameters()))
            .collect()
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<String, ActionError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| ActionError::Unknown(name.to_string()))?;
        handler.execute(args).await.map_err(ActionError::Failed)
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ActionHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the text argument"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, args: Value) -> Result<String, String> {
            args.get("text")
                .and_then(|v| v.as_str())
                .map(|s| format!("Echoed {}", s))
                .ok_or_else(|| "missing text".to_string())
        }
    }

    #[tokio::test]
    async fn test_execute_known_and_unknown() {
        let registry = ActionRegistry::new().with(Arc::new(Echo));

        let ok = registry.execute("echo", json!({"text": "hi"})).await;
        assert_eq!(ok, Ok("Echoed hi".to_string()));

        let failed = registry.execute("echo", json!({})).await;
        assert_eq!(failed, Err(ActionError::Failed("missing text".to_string())));

        let unknown = registry.execute("nope", json!({})).await;
        assert_eq!(unknown, Err(ActionError::Unknown("nope".to_string())));
    }

    #[test]
    fn test_tool_specs_follow_registration() {
        let registry = ActionRegistry::new().with(Arc::new(Echo)).with(Arc::new(Echo));
        let specs = registry.tool_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].kind, "function");
        assert_eq!(specs[0].function.name, "echo");
    }
}
