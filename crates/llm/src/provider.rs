use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::model::{Model, ModelCatalog};

/// Wire family of one configured provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Groq,
    Together,
    Fireworks,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Groq => "groq",
            Self::Together => "together",
            Self::Fireworks => "fireworks",
            Self::Ollama => "ollama",
        }
    }

    /// Local runtimes accept anonymous requests; hosted APIs do not.
    pub fn requires_api_key(self) -> bool {
        !matches!(self, Self::Ollama)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Option<Duration>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        kind: ProviderKind,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            kind,
            api_key: api_key.into().trim().to_string(),
            base_url: base_url.into().trim().to_string(),
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Chat speaker role as understood by provider APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One prompt turn. `images` holds base64 payloads without a data-URL prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl StreamRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<ProviderMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for model '{model_id}' has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("failed to finalize HTTP request body: {message}"))]
    BuildHttpRequestBody {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("provider model endpoint returned status {status}: {body}"))]
    ModelFetchStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse provider model list: {details}"))]
    ModelPayloadParse {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("provider '{provider_id}' rejected credentials (status {status}): {body}"))]
    Authentication {
        stage: &'static str,
        provider_id: String,
        status: u16,
        body: String,
    },
    #[snafu(display("transport failed on `{stage}`, {source}"))]
    Transport {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("provider stream returned status {status}: {body}"))]
    StreamStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("malformed stream line `{line}`: {source}"))]
    StreamPayload {
        stage: &'static str,
        line: String,
        source: serde_json::Error,
    },
    #[snafu(display("provider did not respond within {timeout_ms}ms on `{stage}`"))]
    Timeout { stage: &'static str, timeout_ms: u64 },
    #[snafu(display("{message}"))]
    ProviderReported {
        stage: &'static str,
        message: String,
    },
}

impl ProviderError {
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Self::MissingApiKey { .. } | Self::Authentication { .. }
        )
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::MissingApiKey { stage, .. }
            | Self::EmptyMessageSet { stage, .. }
            | Self::HttpClient { stage, .. }
            | Self::BuildHttpRequestBody { stage, .. }
            | Self::ModelFetchStatus { stage, .. }
            | Self::ModelPayloadParse { stage, .. }
            | Self::CompletionsFailed { stage, .. }
            | Self::Authentication { stage, .. }
            | Self::Transport { stage, .. }
            | Self::StreamStatus { stage, .. }
            | Self::StreamPayload { stage, .. }
            | Self::Timeout { stage, .. }
            | Self::ProviderReported { stage, .. } => stage,
        }
    }
}

/// Maps an HTTP failure status to the error the caller should see.
pub(crate) fn status_error(
    stage: &'static str,
    provider_id: &str,
    status: u16,
    body: String,
) -> ProviderError {
    if status == 401 || status == 403 {
        ProviderError::Authentication {
            stage,
            provider_id: provider_id.to_string(),
            status,
            body,
        }
    } else {
        ProviderError::StreamStatus {
            stage,
            status,
            body,
        }
    }
}

/// Bounds `future` by the configured request timeout. `None` waits forever.
pub(crate) async fn within_request_timeout<F: Future>(
    timeout: Option<Duration>,
    stage: &'static str,
    future: F,
) -> ProviderResult<F::Output> {
    let Some(timeout) = timeout else {
        return Ok(future.await);
    };
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| ProviderError::Timeout {
            stage,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })
}

/// Events yielded by an open provider stream.
///
/// A well-behaved worker ends every stream with exactly one `Done` or `Failed`.
#[derive(Debug)]
pub enum ProviderEvent {
    Token(String),
    Done,
    Failed(ProviderError),
}

pub type ProviderEventSender = mpsc::UnboundedSender<ProviderEvent>;

pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<ProviderEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    /// Builds the sender, consumer stream, and cancellation receiver for one worker.
    pub fn channel() -> (ProviderEventSender, Self, oneshot::Receiver<()>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        (
            event_tx,
            Self {
                events: event_rx,
                cancel_tx: Some(cancel_tx),
            },
            cancel_rx,
        )
    }

    pub async fn recv(&mut self) -> Option<ProviderEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProviderEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn kind(&self) -> ProviderKind;
    fn fallback_models(&self) -> &[Model];
    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>>;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}
