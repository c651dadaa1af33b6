//! HTTP transport for OpenAI-compatible backends
//!
//! Provides:
//! - Single-shot chat completions with rate-limit retry and backoff
//! - SSE streaming calls multiplexed over one stream per request
//!
//! One `reqwest::Client` (and its connection pool) is shared by every
//! request; cancelling one request only aborts that request's calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client as HttpClient;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::streaming::{StreamEvent, sse_events};
use super::types::{ChatRequest, ChatResponse, CompletionRequest, Message};
use super::{Frame, StreamSession, Transport, serve_commands};
use crate::error::{Error, Result};
use crate::registry::{BackendConfig, ModelRegistry};

/// Maximum number of attempts for rate-limited completions
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (in milliseconds)
const BACKOFF_BASE_MS: u64 = 1000;

/// Connection establishment timeout; response time is bounded by the executor
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Transport speaking the chat completions API of each registered backend
#[derive(Clone)]
pub struct HttpTransport {
    http_client: HttpClient,
    registry: Arc<ModelRegistry>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("backends", &self.registry.len())
            .finish()
    }
}

impl HttpTransport {
    /// Create a transport with its own connection pool
    pub fn new(registry: Arc<ModelRegistry>) -> Result<Self> {
        let http_client = HttpClient::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(Error::NetworkError)?;
        Ok(Self::with_client(http_client, registry))
    }

    /// Create a transport sharing an existing client
    pub fn with_client(http_client: HttpClient, registry: Arc<ModelRegistry>) -> Self {
        Self {
            http_client,
            registry,
        }
    }

    fn backend(&self, backend_id: &str) -> Result<&BackendConfig> {
        self.registry
            .get(backend_id)
            .filter(|b| b.enabled)
            .ok_or_else(|| Error::UnknownBackend(backend_id.to_string()))
    }

    async fn send_request(&self, backend: &BackendConfig, request: &ChatRequest) -> Result<String> {
        debug!(
            backend = %backend.id,
            model = %request.model,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let response = post(&self.http_client, backend, request)
            .send()
            .await
            .map_err(Error::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_for_status(&backend.id, status, response).await);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::BackendApi(format!("Failed to parse response: {}", e)))?;

        chat_response
            .content()
            .map(str::to_string)
            .ok_or_else(|| Error::BackendApi(format!("Empty response from '{}'", backend.id)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let backend = self.backend(&request.backend_id)?;
        let chat = ChatRequest::new(&backend.model, request.messages)
            .with_temperature(request.temperature.unwrap_or(backend.temperature))
            .with_max_tokens(request.max_tokens.unwrap_or(backend.max_tokens));

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.send_request(backend, &chat).await {
                Ok(text) => return Ok(text),
                Err(Error::RateLimited(wait_secs)) if attempts < MAX_RETRY_ATTEMPTS => {
                    let backoff = calculate_backoff(attempts, wait_secs);
                    warn!(
                        backend = %backend.id,
                        attempt = attempts,
                        wait_ms = backoff,
                        "Rate limited, retrying after backoff"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn open_stream(&self, request_id: Uuid) -> Result<StreamSession> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let http_client = self.http_client.clone();
        let registry = Arc::clone(&self.registry);

        tokio::spawn(serve_commands(
            request_id,
            command_rx,
            frame_tx,
            CancellationToken::new(),
            move |backend_id, messages, frames| {
                let http_client = http_client.clone();
                let backend = registry.get(&backend_id).filter(|b| b.enabled).cloned();
                async move {
                    match backend {
                        Some(backend) => stream_call(http_client, backend, messages, frames).await,
                        None => {
                            let _ = frames.send(Frame::error(
                                &backend_id,
                                Error::UnknownBackend(backend_id.clone()).to_string(),
                            ));
                        }
                    }
                }
            },
        ));

        Ok(StreamSession {
            commands: command_tx,
            frames: frame_rx,
        })
    }
}

/// Run one streaming call, forwarding its output as frames
async fn stream_call(
    http_client: HttpClient,
    backend: BackendConfig,
    messages: Vec<Message>,
    frames: mpsc::UnboundedSender<Frame>,
) {
    let request = ChatRequest::new(&backend.model, messages)
        .with_temperature(backend.temperature)
        .with_max_tokens(backend.max_tokens)
        .with_streaming(true);

    debug!(
        backend = %backend.id,
        model = %request.model,
        "Sending streaming chat completion request"
    );

    let response = match post(&http_client, &backend, &request).send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = frames.send(Frame::error(&backend.id, Error::NetworkError(e).to_string()));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let error = error_for_status(&backend.id, status, response).await;
        let _ = frames.send(Frame::error(&backend.id, error.to_string()));
        return;
    }

    let events = sse_events(response);
    futures_util::pin_mut!(events);

    while let Some(event) = events.next().await {
        match event {
            Ok(StreamEvent::Chunk(chunk)) => {
                if let Some(content) = chunk.content()
                    && !content.is_empty()
                {
                    let _ = frames.send(Frame::chunk(&backend.id, content));
                }
                if chunk.is_done() {
                    let _ = frames.send(Frame::complete(&backend.id));
                    return;
                }
            }
            Ok(StreamEvent::Done) => {
                let _ = frames.send(Frame::complete(&backend.id));
                return;
            }
            Ok(StreamEvent::Error(message)) => {
                warn!(backend = %backend.id, error = %message, "Skipping malformed stream chunk");
            }
            Err(e) => {
                let _ = frames.send(Frame::error(&backend.id, e.to_string()));
                return;
            }
        }
    }

    // Some providers close the body without a [DONE] marker
    let _ = frames.send(Frame::complete(&backend.id));
}

fn post(
    http_client: &HttpClient,
    backend: &BackendConfig,
    request: &ChatRequest,
) -> reqwest::RequestBuilder {
    let url = format!("{}/chat/completions", backend.endpoint.trim_end_matches('/'));
    let builder = http_client.post(url).json(request);
    match backend.resolved_credential() {
        Some(credential) => builder.bearer_auth(credential),
        None => builder,
    }
}

/// Map a non-success response to an error
async fn error_for_status(
    backend_id: &str,
    status: reqwest::StatusCode,
    response: reqwest::Response,
) -> Error {
    let body = response.text().await.unwrap_or_default();

    match status.as_u16() {
        401 | 403 => Error::BackendConnection {
            backend_id: backend_id.to_string(),
            message: format!("unauthorized ({}): check the backend credential", status),
        },
        429 => Error::RateLimited(extract_retry_after(&body).unwrap_or(60)),
        404 => Error::BackendApi(format!(
            "Model not found or endpoint unavailable for '{}': {}",
            backend_id, body
        )),
        500..=599 => Error::BackendConnection {
            backend_id: backend_id.to_string(),
            message: format!("server error ({}): {}", status, body),
        },
        _ => Error::BackendApi(format!("HTTP error {} from '{}': {}", status, backend_id, body)),
    }
}

/// Calculate backoff delay with jitter
fn calculate_backoff(attempt: u32, suggested_wait: u64) -> u64 {
    let base = BACKOFF_BASE_MS * 2u64.pow(attempt.saturating_sub(1));
    let delay = base.max(suggested_wait * 1000);

    // Up to 10% jitter
    let jitter = delay / 10;
    delay + (rand_jitter() % jitter.max(1))
}

fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64 % 1000)
        .unwrap_or(0)
}

/// Extract a retry-after value from an error body
fn extract_retry_after(body: &str) -> Option<u64> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    if let Some(retry_after) = json.get("retry_after").and_then(|v| v.as_u64()) {
        return Some(retry_after);
    }
    json.get("error")?.get("retry_after")?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<ModelRegistry> {
        let mut registry = ModelRegistry::new();
        registry.register(BackendConfig::new("a", "http://127.0.0.1:9/v1", "m"));
        registry.register(BackendConfig::new("off", "http://127.0.0.1:9/v1", "m").disabled());
        Arc::new(registry)
    }

    #[test]
    fn test_calculate_backoff() {
        assert!(calculate_backoff(1, 0) >= BACKOFF_BASE_MS);
        assert!(calculate_backoff(2, 0) >= BACKOFF_BASE_MS * 2);
        assert!(calculate_backoff(1, 5) >= 5000);
    }

    #[test]
    fn test_extract_retry_after() {
        assert_eq!(extract_retry_after(r#"{"retry_after": 30}"#), Some(30));
        assert_eq!(extract_retry_after(r#"{"error": {"retry_after": 60}}"#), Some(60));
        assert_eq!(extract_retry_after(r#"{"message": "rate limited"}"#), None);
        assert_eq!(extract_retry_after("not json"), None);
    }

    #[tokio::test]
    async fn test_complete_rejects_unknown_and_disabled_backends() {
        let transport = HttpTransport::new(registry()).unwrap();

        let result = transport
            .complete(CompletionRequest::new("missing", vec![Message::user("hi")]))
            .await;
        assert!(matches!(result, Err(Error::UnknownBackend(_))));

        let result = transport
            .complete(CompletionRequest::new("off", vec![Message::user("hi")]))
            .await;
        assert!(matches!(result, Err(Error::UnknownBackend(_))));
    }

    #[tokio::test]
    async fn test_stream_reports_unknown_backend_as_error_frame() {
        let transport = HttpTransport::new(registry()).unwrap();
        let mut session = transport.open_stream(Uuid::new_v4()).await.unwrap();

        session.dispatch("missing", vec![Message::user("hi")]).unwrap();
        let frame = session.frames.recv().await.unwrap();
        assert_eq!(frame.backend_id, "missing");
        assert!(matches!(frame.kind, super::super::FrameKind::Error(_)));
    }

    #[test]
    fn test_debug_hides_client() {
        let transport = HttpTransport::new(registry()).unwrap();
        assert!(format!("{:?}", transport).contains("backends"));
    }
}
