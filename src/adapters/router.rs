use crate::adapters::anthropic::{AnthropicAdapter, ANTHROPIC_VERSION};
use crate::adapters::openai::OpenAIAdapter;
use crate::adapters::sse::Endpoint;
use crate::domain::models::{CompletionRequest, StreamOutcome};
use crate::domain::ports::ModelAdapter;
use crate::error::CompletionError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;
use tracing::debug;

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
    Anthropic,
}

impl Protocol {
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            Protocol::OpenAiCompatible => "/chat/completions",
            Protocol::Anthropic => "/messages",
        }
    }
}

/// How the API key is attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// Raw key in the named header.
    Header(String),
}

impl AuthScheme {
    fn apply(&self, endpoint: Endpoint, api_key: &str) -> Endpoint {
        if api_key.is_empty() {
            return endpoint;
        }
        match self {
            AuthScheme::Bearer => endpoint.header("Authorization", format!("Bearer {}", api_key)),
            AuthScheme::Header(name) => endpoint.header(name.clone(), api_key),
        }
    }
}

/// Everything needed to talk to one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDescriptor {
    pub name: String,
    pub protocol: Protocol,
    pub base_url: String,
    pub endpoint: String,
    pub auth: AuthScheme,
    pub extra_headers: Vec<(String, String)>,
    pub supports_tools: bool,
    /// Models on this provider that reject tool definitions.
    pub no_tool_models: Vec<String>,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>, protocol: Protocol, base_url: impl Into<String>) -> Self {
        let auth = match protocol {
            Protocol::OpenAiCompatible => AuthScheme::Bearer,
            Protocol::Anthropic => AuthScheme::Header("x-api-key".to_string()),
        };
        let extra_headers = match protocol {
            Protocol::OpenAiCompatible => Vec::new(),
            Protocol::Anthropic => vec![
                ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
                (
                    "anthropic-dangerous-direct-browser-access".to_string(),
                    "true".to_string(),
                ),
            ],
        };
        Self {
            name: name.into(),
            protocol,
            base_url: base_url.into(),
            endpoint: protocol.default_endpoint().to_string(),
            auth,
            extra_headers,
            supports_tools: true,
            no_tool_models: Vec::new(),
        }
    }

    pub fn openai() -> Self {
        Self::new("openai", Protocol::OpenAiCompatible, "https://api.openai.com/v1")
    }

    pub fn openrouter() -> Self {
        let mut descriptor = Self::new(
            "openrouter",
            Protocol::OpenAiCompatible,
            "https://openrouter.ai/api/v1",
        );
        descriptor.extra_headers = vec![
            ("HTTP-Referer".to_string(), "https://github.com/plotline".to_string()),
            ("X-Title".to_string(), "plotline".to_string()),
        ];
        descriptor
    }

    pub fn groq() -> Self {
        Self::new("groq", Protocol::OpenAiCompatible, "https://api.groq.com/openai/v1")
    }

    pub fn anthropic() -> Self {
        Self::new("anthropic", Protocol::Anthropic, "https://api.anthropic.com/v1")
    }

    /// Built-in descriptor for a well-known provider name.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "openai" => Some(Self::openai()),
            "openrouter" => Some(Self::openrouter()),
            "groq" => Some(Self::groq()),
            "anthropic" => Some(Self::anthropic()),
            _ => None,
        }
    }

    pub fn url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = self.endpoint.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    pub fn resolve_endpoint(&self, api_key: &str) -> Endpoint {
        let endpoint = self
            .extra_headers
            .iter()
            .fold(Endpoint::new(self.url()), |ep, (name, value)| {
                ep.header(name.clone(), value.clone())
            });
        self.auth.apply(endpoint, api_key)
    }

    pub fn supports_tools_for(&self, model: &str) -> bool {
        self.supports_tools && !self.no_tool_models.iter().any(|m| m == model)
    }
}

/// Protocol-agnostic entry point: picks the adapter matching the active
/// provider and shapes requests for it.
pub struct CompletionRouter {
    descriptor: ProviderDescriptor,
    adapter: Box<dyn ModelAdapter>,
}

impl CompletionRouter {
    pub fn new(descriptor: ProviderDescriptor, api_key: &str) -> Result<Self, CompletionError> {
        let client = Client::builder().build()?;
        Ok(Self::with_client(client, descriptor, api_key))
    }

    pub fn with_client(client: Client, descriptor: ProviderDescriptor, api_key: &str) -> Self {
        let endpoint = descriptor.resolve_endpoint(api_key);
        let adapter: Box<dyn ModelAdapter> = match descriptor.protocol {
            Protocol::OpenAiCompatible => Box::new(OpenAIAdapter::new(client, endpoint)),
            Protocol::Anthropic => Box::new(AnthropicAdapter::new(client, endpoint)),
        };
        Self { descriptor, adapter }
    }

    pub fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl ModelAdapter for CompletionRouter {
    async fn stream(
        &self,
        mut req: CompletionRequest,
        tx: Sender<String>,
    ) -> Result<StreamOutcome, CompletionError> {
        if req.tools.is_some() && !self.descriptor.supports_tools_for(&req.model) {
            debug!(model = %req.model, provider = %self.descriptor.name, "model lacks tool support, omitting tools");
            req.tools = None;
        }
        debug!(
            provider = %self.descriptor.name,
            protocol = ?self.descriptor.protocol,
            model = %req.model,
            messages = req.messages.len(),
            "routing completion"
        );
        self.adapter.stream(req, tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Message, ToolSpec};
    use serde_json::json;
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    #[test]
    fn test_presets_resolve_urls_and_headers() {
        let openai = ProviderDescriptor::openai().resolve_endpoint("sk-1");
        assert_eq!(openai.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            openai.headers,
            vec![("Authorization".to_string(), "Bearer sk-1".to_string())]
        );

        let anthropic = ProviderDescriptor::anthropic().resolve_endpoint("sk-ant");
        assert_eq!(anthropic.url, "https://api.anthropic.com/v1/messages");
        assert!(anthropic
            .headers
            .contains(&("x-api-key".to_string(), "sk-ant".to_string())));
        assert!(anthropic
            .headers
            .contains(&("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string())));
        assert!(anthropic.headers.iter().any(|(k, _)| k == "anthropic-dangerous-direct-browser-access"));

        let openrouter = ProviderDescriptor::openrouter().resolve_endpoint("k");
        assert!(openrouter.headers.iter().any(|(k, _)| k == "X-Title"));
        assert!(ProviderDescriptor::preset("nope").is_none());
    }

    #[test]
    fn test_protocol_wire_names() {
        assert_eq!(serde_json::to_value(Protocol::OpenAiCompatible).unwrap(), json!("openai_compatible"));
        assert_eq!(serde_json::to_value(Protocol::Anthropic).unwrap(), json!("anthropic"));
        let parsed: Protocol = serde_json::from_value(json!("openai_compatible")).unwrap();
        assert_eq!(parsed, Protocol::OpenAiCompatible);
    }

    #[test]
    fn test_url_joins_slashes() {
        let mut descriptor = ProviderDescriptor::new("local", Protocol::OpenAiCompatible, "http://localhost:11434/v1/");
        assert_eq!(descriptor.url(), "http://localhost:11434/v1/chat/completions");
        descriptor.endpoint = "chat".to_string();
        assert_eq!(descriptor.url(), "http://localhost:11434/v1/chat");
    }

    #[test]
    fn test_empty_key_adds_no_auth_header() {
        let endpoint = ProviderDescriptor::new("local", Protocol::OpenAiCompatible, "http://x").resolve_endpoint("");
        assert!(endpoint.headers.is_empty());
    }

    #[test]
    fn test_tool_support_per_model() {
        let mut descriptor = ProviderDescriptor::openai();
        descriptor.no_tool_models = vec!["o1-mini".to_string()];
        assert!(descriptor.supports_tools_for("gpt-4o"));
        assert!(!descriptor.supports_tools_for("o1-mini"));
        descriptor.supports_tools = false;
        assert!(!descriptor.supports_tools_for("gpt-4o"));
    }

    #[tokio::test]
    async fn test_router_dispatches_vendor_protocol() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
                "text/event-stream",
            ))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut descriptor = ProviderDescriptor::anthropic();
        descriptor.base_url = format!("{}/v1", mock_server.uri());
        let router = CompletionRouter::new(descriptor, "sk-ant").unwrap();
        let (tx, _rx) = mpsc::channel(8);

        let outcome = router
            .stream(CompletionRequest::new("claude", vec![Message::user("hi")]), tx)
            .await
            .unwrap();
        assert!(outcome.finished);
    }

    #[tokio::test]
    async fn test_router_strips_tools_for_unsupported_model() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"model": "plain"})))
            .respond_with(|req: &Request| {
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                let status = if body.get("tools").is_some() { 400 } else { 200 };
                ResponseTemplate::new(status).set_body_raw("data: [DONE]\n\n", "text/event-stream")
            })
            .mount(&mock_server)
            .await;

        let mut descriptor = ProviderDescriptor::new("local", Protocol::OpenAiCompatible, mock_server.uri());
        descriptor.no_tool_models = vec!["plain".to_string()];
        let router = CompletionRouter::new(descriptor, "").unwrap();

        let mut req = CompletionRequest::new("plain", vec![Message::user("hi")]);
        req.tools = Some(vec![ToolSpec::function("a", "b", json!({"type": "object"}))]);
        let (tx, _rx) = mpsc::channel(8);

        let outcome = router.stream(req, tx).await.unwrap();
        assert!(outcome.finished);
    }
}
