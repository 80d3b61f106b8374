use std::sync::Arc;

use quill_llm::{
    LlmProvider, ProviderConfig, ProviderError, ProviderEvent, ProviderMessage, ProviderResult,
    StreamRequest, create_provider,
};
use snafu::Snafu;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::chunk::{CorrelationToken, GenerationRequest, StreamChunk};
use crate::relay::ChunkRelay;
use crate::settings::{AppSettings, ProviderSettings, SettingsSource};

/// Builds adapters for resolved provider configurations.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>>;
}

/// Uses the adapter registry in `quill-llm`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn create(&self, config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
        create_provider(config)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DispatchError {
    #[snafu(display("no default chat model is set"))]
    NoDefaultModel { stage: &'static str },
    #[snafu(display("provider not found"))]
    ProviderNotFound {
        stage: &'static str,
        provider_id: Option<String>,
        model_id: String,
    },
    #[snafu(display("missing API key"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("{source}"))]
    OpenStream {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("{source}"))]
    Stream {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("provider stream ended before a terminal event"))]
    StreamClosed { stage: &'static str },
    #[snafu(display("dispatch task failed on `{stage}`: {source}"))]
    Join {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
}

impl DispatchError {
    /// Configuration problems are reported before any adapter is opened.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoDefaultModel { .. } | Self::ProviderNotFound { .. } | Self::MissingApiKey { .. }
        )
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Terminal success chunk published with `content`.
    Completed { content: String },
    /// Terminal error chunk published with `error`.
    Failed { error: String },
    /// Stopped by the caller; no terminal chunk was published.
    Cancelled,
}

/// Provider and model a request resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub model_id: String,
    pub provider: ProviderSettings,
}

/// Handle to one in-flight generation.
pub struct DispatchHandle {
    token: CorrelationToken,
    cancel_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<DispatchOutcome>,
}

impl DispatchHandle {
    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    /// Stops upstream consumption. Returns false if the request already ended.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) -> DispatchResult<DispatchOutcome> {
        self.join.await.map_err(|source| DispatchError::Join {
            stage: "dispatch-join",
            source,
        })
    }
}

/// Runs generation requests against configured providers and publishes the
/// resulting chunks on the relay.
#[derive(Clone)]
pub struct GenerationDispatcher {
    settings: Arc<dyn SettingsSource>,
    factory: Arc<dyn ProviderFactory>,
    relay: ChunkRelay,
}

impl GenerationDispatcher {
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        factory: Arc<dyn ProviderFactory>,
        relay: ChunkRelay,
    ) -> Self {
        Self {
            settings,
            factory,
            relay,
        }
    }

    pub fn relay(&self) -> &ChunkRelay {
        &self.relay
    }

    /// Spawns the request on the current tokio runtime.
    pub fn dispatch(&self, request: GenerationRequest) -> DispatchHandle {
        let token = request.correlation_token;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let dispatcher = self.clone();
        let span = tracing::info_span!(
            "dispatch",
            correlation_token = %token,
            conversation = request.conversation.map(tracing::field::display),
        );
        let join = tokio::spawn(async move { dispatcher.run(request, cancel_rx).await }.instrument(span));

        DispatchHandle {
            token,
            cancel_tx: Some(cancel_tx),
            join,
        }
    }

    /// Drives one request to completion. Every path except cancellation
    /// publishes exactly one terminal chunk.
    pub async fn run(
        &self,
        request: GenerationRequest,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> DispatchOutcome {
        let token = request.correlation_token;
        let settings = self.settings.snapshot();

        let target = match resolve_target(
            &settings,
            request.provider_id.as_deref(),
            request.model_id.as_deref(),
        ) {
            Ok(target) => target,
            Err(error) => return self.fail(token, &error),
        };

        let Some(config) = target.provider.to_provider_config() else {
            let error = DispatchError::MissingApiKey {
                stage: "dispatch-resolve-credentials",
                provider_id: target.provider.id.clone(),
            };
            return self.fail(token, &error);
        };

        tracing::info!(
            provider_id = %target.provider.id,
            model_id = %target.model_id,
            turns = request.turns.len(),
            "dispatching generation request"
        );

        let stream_request = build_stream_request(&target, request);
        let handle = match self
            .factory
            .create(config)
            .and_then(|provider| provider.stream_chat(stream_request))
        {
            Ok(handle) => handle,
            Err(source) => {
                let error = DispatchError::OpenStream {
                    stage: "dispatch-open-stream",
                    source,
                };
                return self.fail(token, &error);
            }
        };

        let worker = tokio::spawn(handle.worker);
        let mut stream = handle.stream;
        let mut content = String::new();
        let mut cancel_armed = true;

        let outcome = loop {
            tokio::select! {
                biased;
                cancelled = &mut cancel_rx, if cancel_armed => {
                    if cancelled.is_ok() {
                        stream.cancel();
                        tracing::info!(correlation_token = %token, "generation cancelled");
                        break DispatchOutcome::Cancelled;
                    }
                    // Handle dropped without cancelling; keep streaming.
                    cancel_armed = false;
                }
                event = stream.recv() => match event {
                    Some(ProviderEvent::Token(piece)) => {
                        if piece.is_empty() {
                            continue;
                        }
                        content.push_str(&piece);
                        self.relay.publish(StreamChunk::token(token, piece));
                    }
                    Some(ProviderEvent::Done) => {
                        tracing::info!(
                            correlation_token = %token,
                            chars = content.chars().count(),
                            "generation completed"
                        );
                        self.relay.publish(StreamChunk::completed(token, content.clone()));
                        break DispatchOutcome::Completed { content };
                    }
                    Some(ProviderEvent::Failed(source)) => {
                        let error = DispatchError::Stream {
                            stage: "dispatch-stream",
                            source,
                        };
                        break self.fail(token, &error);
                    }
                    None => {
                        let error = DispatchError::StreamClosed {
                            stage: "dispatch-stream-closed",
                        };
                        break self.fail(token, &error);
                    }
                },
            }
        };

        drop(stream);
        if let Err(error) = worker.await {
            tracing::warn!(correlation_token = %token, %error, "provider worker aborted");
        }
        outcome
    }

    fn fail(&self, token: CorrelationToken, error: &DispatchError) -> DispatchOutcome {
        let message = error.to_string();
        if error.is_configuration() {
            tracing::warn!(correlation_token = %token, error = %message, "generation rejected");
        } else {
            tracing::error!(correlation_token = %token, error = %message, "generation failed");
        }
        self.relay.publish(StreamChunk::failed(token, message.clone()));
        DispatchOutcome::Failed { error: message }
    }
}

/// Picks the model and the provider serving it.
///
/// An explicit provider id must exist. Without one, the provider listing the
/// model wins, then the default provider.
pub fn resolve_target(
    settings: &AppSettings,
    provider_id: Option<&str>,
    model_id: Option<&str>,
) -> DispatchResult<ResolvedTarget> {
    let model_id = model_id
        .map(str::trim)
        .filter(|model_id| !model_id.is_empty())
        .or(settings.default_chat_model_id.as_deref())
        .ok_or(DispatchError::NoDefaultModel {
            stage: "dispatch-resolve-model",
        })?;

    let provider_id = provider_id
        .map(str::trim)
        .filter(|provider_id| !provider_id.is_empty());
    let provider = match provider_id {
        Some(provider_id) => settings.provider(provider_id),
        None => settings
            .provider_for_model(model_id)
            .or_else(|| settings.default_provider()),
    };

    let provider = provider.ok_or_else(|| DispatchError::ProviderNotFound {
        stage: "dispatch-resolve-provider",
        provider_id: provider_id.map(str::to_string),
        model_id: model_id.to_string(),
    })?;

    Ok(ResolvedTarget {
        model_id: model_id.to_string(),
        provider: provider.clone(),
    })
}

fn build_stream_request(target: &ResolvedTarget, request: GenerationRequest) -> StreamRequest {
    let messages = request
        .turns
        .into_iter()
        .map(ProviderMessage::from)
        .collect::<Vec<_>>();

    let provider = &target.provider;
    let mut stream_request = StreamRequest::new(target.model_id.clone(), messages)
        .with_temperature(provider.temperature);
    if provider.max_tokens > 0 {
        stream_request = stream_request.with_max_tokens(provider.max_tokens);
    }
    if !provider.system_prompt.trim().is_empty() {
        stream_request = stream_request.with_preamble(provider.system_prompt.trim());
    }
    stream_request
}
