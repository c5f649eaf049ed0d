//! Shared plumbing for the streaming adapters: request dispatch, HTTP
//! failure classification, and the SSE read loop.

use crate::domain::models::{StreamOutcome, ToolCall};
use crate::error::CompletionError;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Body fragments that mark an auth failure even on statuses other than 401/403.
const AUTH_HINTS: &[&str] = &[
    "invalid api key",
    "invalid_api_key",
    "incorrect api key",
    "invalid x-api-key",
    "authentication_error",
    "authentication failed",
    "unauthorized",
];

/// Fully resolved target of a completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn header_map(&self) -> Result<HeaderMap, CompletionError> {
        let mut map = HeaderMap::new();
        map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        map.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CompletionError::InvalidRequest(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| CompletionError::InvalidRequest(format!("header {}: {}", name, e)))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

/// What a parser made of one SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Skip,
    Text(String),
    Done,
}

/// Protocol-specific interpretation of decoded SSE events. One parser lives
/// for exactly one request.
pub trait SseParser: Send {
    /// `event` is the SSE event type (`message` when the server sent none).
    fn feed(&mut self, event: &str, data: &str) -> Result<Step, CompletionError>;

    /// Finalise whatever tool calls were completed.
    fn finish(self) -> Vec<ToolCall>;
}

/// Map a non-2xx response to the error taxonomy.
pub fn classify_failure(status: u16, body: &str) -> CompletionError {
    let lowered = body.to_lowercase();
    if status == 401 || status == 403 || AUTH_HINTS.iter().any(|hint| lowered.contains(hint)) {
        return CompletionError::AuthFailed;
    }

    match provider_message(body) {
        Some(message) => CompletionError::Http { status, message },
        None => CompletionError::Http {
            status,
            message: format!("Request failed ({})", status),
        },
    }
}

/// Pull the human-readable message out of an error body, if there is one.
fn provider_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let message = match value.get("error") {
        Some(Value::String(s)) => Some(s.as_str()),
        Some(err) => err.get("message").and_then(Value::as_str),
        None => None,
    }
    .or_else(|| value.get("message").and_then(Value::as_str))?;

    let message = message.trim();
    (!message.is_empty()).then(|| message.to_string())
}

/// POST `body` to `endpoint` and read the SSE response through `parser`.
pub async fn post_stream<P: SseParser>(
    client: &Client,
    endpoint: &Endpoint,
    body: &Value,
    parser: P,
    tx: &Sender<String>,
    cancel: &CancellationToken,
) -> Result<StreamOutcome, CompletionError> {
    let headers = endpoint.header_map()?;
    debug!(url = %endpoint.url, "opening completion stream");

    let send = client.post(&endpoint.url).headers(headers).json(body).send();
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("cancelled before response");
            return Ok(StreamOutcome { cancelled: true, ..Default::default() });
        }
        res = send => res?,
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), "completion request failed");
        return Err(classify_failure(status.as_u16(), &text));
    }

    read_stream(response.bytes_stream(), parser, tx, cancel).await
}

/// Re-chunk a byte stream at line ends and decode each run of complete lines
/// on its own. Invalid UTF-8 becomes U+FFFD inside its own line instead of
/// failing the stream, and no multi-byte sequence is ever split.
fn lossy_lines<S, B, E>(body: S) -> impl Stream<Item = Result<String, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    futures::stream::unfold(
        (Box::pin(body), Vec::new(), false),
        |(mut body, mut carry, done)| async move {
            if done {
                return None;
            }
            loop {
                match body.next().await {
                    Some(Ok(bytes)) => {
                        carry.extend_from_slice(bytes.as_ref());
                        if let Some(end) = carry.iter().rposition(|b| *b == b'\n') {
                            let rest = carry.split_off(end + 1);
                            let complete = std::mem::replace(&mut carry, rest);
                            return Some((Ok(decode_lossy(complete)), (body, carry, false)));
                        }
                    }
                    Some(Err(e)) => return Some((Err(e), (body, carry, false))),
                    None if carry.is_empty() => return None,
                    None => {
                        let tail = decode_lossy(std::mem::take(&mut carry));
                        return Some((Ok(tail), (body, carry, true)));
                    }
                }
            }
        },
    )
}

fn decode_lossy(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).unwrap_or_else(|e| {
        warn!("replacing invalid UTF-8 in stream: {}", e.utf8_error());
        String::from_utf8_lossy(e.as_bytes()).into_owned()
    })
}

/// Decode an SSE byte stream. Network chunks need not align with lines or
/// events; incomplete trailing input stays buffered until the rest of it
/// arrives.
pub async fn read_stream<S, B, E, P>(
    body: S,
    mut parser: P,
    tx: &Sender<String>,
    cancel: &CancellationToken,
) -> Result<StreamOutcome, CompletionError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    P: SseParser,
{
    let mut events = std::pin::pin!(lossy_lines(body).eventsource());
    let mut outcome = StreamOutcome::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                outcome.cancelled = true;
                break;
            }
            next = events.next() => next,
        };

        match next {
            None => break,
            Some(Ok(event)) => match parser.feed(&event.event, &event.data)? {
                Step::Skip => {}
                Step::Text(text) => {
                    outcome.content.push_str(&text);
                    // A full channel must not outlive the token. A dropped
                    // receiver must not end the stream.
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            outcome.cancelled = true;
                            break;
                        }
                        _ = tx.send(text) => {}
                    }
                }
                Step::Done => {
                    outcome.finished = true;
                    break;
                }
            },
            Some(Err(e)) => {
                if cancel.is_cancelled() {
                    outcome.cancelled = true;
                    break;
                }
                return Err(CompletionError::Network(e.to_string()));
            }
        }
    }

    outcome.tool_calls = parser.finish();
    debug!(
        chars = outcome.content.len(),
        tool_calls = outcome.tool_calls.len(),
        cancelled = outcome.cancelled,
        "stream finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_401_and_403_are_auth() {
        assert_eq!(classify_failure(401, ""), CompletionError::AuthFailed);
        assert_eq!(
            classify_failure(403, r#"{"error":{"message":"invalid key"}}"#),
            CompletionError::AuthFailed
        );
    }

    #[test]
    fn test_auth_hint_in_body() {
        let body = r#"{"type":"error","error":{"type":"authentication_error","message":"bad"}}"#;
        assert_eq!(classify_failure(400, body), CompletionError::AuthFailed);
    }

    #[test]
    fn test_provider_message_is_surfaced() {
        let err = classify_failure(429, r#"{"error":{"message":"Rate limit reached"}}"#);
        assert_eq!(
            err,
            CompletionError::Http {
                status: 429,
                message: "Rate limit reached".to_string()
            }
        );
        assert_eq!(err.to_string(), "Rate limit reached");

        let err = classify_failure(500, r#"{"message":"overloaded"}"#);
        assert_eq!(err.to_string(), "overloaded");

        let err = classify_failure(502, r#"{"error":"bad gateway"}"#);
        assert_eq!(err.to_string(), "bad gateway");
    }

    #[test]
    fn test_generic_message_without_body() {
        assert_eq!(classify_failure(500, "<html>oops</html>").to_string(), "Request failed (500)");
        assert_eq!(classify_failure(404, "").to_string(), "Request failed (404)");
    }

    #[tokio::test]
    async fn test_lossy_lines_keeps_multibyte_and_replaces_invalid() {
        let chunks: Vec<Result<Vec<u8>, std::convert::Infallible>> = vec![
            Ok(b"data: caf\xc3".to_vec()),
            Ok(b"\xa9\ndata: \xff!\n".to_vec()),
            Ok(b"tail".to_vec()),
        ];
        let lines: Vec<String> = lossy_lines(futures::stream::iter(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["data: caf\u{e9}\ndata: \u{fffd}!\n", "tail"]);
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let endpoint = Endpoint::new("http://localhost").header("bad header", "x");
        assert!(matches!(
            endpoint.header_map(),
            Err(CompletionError::InvalidRequest(_))
        ));
    }
}
