use std::sync::Arc;

use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::http_client::{self, HttpClientExt, NoBody};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use serde::Deserialize;
use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;

use super::model::{Model, ModelCache, ModelCatalog, default_openai_models, shared_model_cache};
use super::provider::{
    BoxFuture, CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, LlmProvider,
    MissingApiKeySnafu, ModelPayloadParseSnafu, ProviderConfig, ProviderError, ProviderEvent,
    ProviderEventSender, ProviderEventStream, ProviderKind, ProviderMessage, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, StreamRequest, status_error,
    within_request_timeout,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::completion::streaming::StreamingCompletionResponse,
>;

#[derive(Debug, Deserialize)]
struct ModelListPayload {
    data: Vec<ModelListEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelListEntry {
    id: String,
}

/// OpenAI-compatible chat adapter (OpenAI, Groq, Together, Fireworks).
pub struct RigProviderAdapter {
    config: ProviderConfig,
    fallback_models: Vec<Model>,
    model_cache: Arc<ModelCache>,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            config.has_api_key(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        let fallback_models = match config.kind {
            ProviderKind::OpenAi => default_openai_models(),
            _ => Vec::new(),
        };

        Ok(Self {
            config,
            fallback_models,
            model_cache: shared_model_cache(),
        })
    }

    pub fn with_model_cache(mut self, model_cache: Arc<ModelCache>) -> Self {
        self.model_cache = model_cache;
        self
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.base_url.is_empty() {
            builder = builder.base_url(config.base_url.trim_end_matches('/'));
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    async fn fetch_models_from_provider(&self) -> ProviderResult<Vec<Model>> {
        let client = Self::build_client(&self.config)?;
        let request = client
            .get("/models")
            .context(HttpClientSnafu {
                stage: "build-model-request",
            })?
            .body(NoBody)
            .map_err(|source| ProviderError::BuildHttpRequestBody {
                stage: "build-model-request-body",
                message: source.to_string(),
            })?;

        let response = client.send(request).await.context(HttpClientSnafu {
            stage: "send-model-request",
        })?;
        let status = response.status();
        let payload = http_client::text(response).await.context(HttpClientSnafu {
            stage: "read-model-response",
        })?;

        if !status.is_success() {
            return Err(match status_error(
                "model-http-status",
                &self.config.provider_id,
                status.as_u16(),
                payload,
            ) {
                ProviderError::StreamStatus {
                    stage,
                    status,
                    body,
                } => ProviderError::ModelFetchStatus {
                    stage,
                    status,
                    body,
                },
                other => other,
            });
        }

        parse_model_list(&payload)
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        if !message.images.is_empty() {
            tracing::debug!(
                role = message.role.as_str(),
                image_count = message.images.len(),
                "openai-compatible adapter forwards text only; dropping image parts"
            );
        }

        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig exposes a single preamble field, so system turns are folded into it.
        for message in &request.messages {
            if matches!(message.role, Role::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        // Groq, Together and Fireworks only serve `/chat/completions`.
        let client = Self::build_client(config)?.completions_api();
        let model = client.completion_model(request.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                provider_id = %config.provider_id,
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-filter-messages",
                model_id: request.model_id.clone(),
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<ProviderEvent>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(ProviderEvent::Token(text.text))
            }
            StreamedAssistantContent::Text(_)
            | StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: ProviderEventSender,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let opened = within_request_timeout(
            config.request_timeout,
            "open-stream",
            Self::open_stream(&config, &request),
        )
        .await
        .and_then(|result| result);
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                let _ = event_tx.send(ProviderEvent::Failed(error));
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Cancel the upstream Rig stream so provider IO stops promptly.
                    tracing::debug!(provider_id = %config.provider_id, "provider stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = within_request_timeout(config.request_timeout, "stream-chunk", stream.next()) => {
                    match next_item {
                        Err(error) => {
                            tracing::warn!(provider_id = %config.provider_id, error = %error, "provider stream stalled");
                            stream.cancel();
                            let _ = event_tx.send(ProviderEvent::Failed(error));
                            return;
                        }
                        Ok(Some(Ok(item))) => {
                            if let Some(event) = Self::map_stream_item(item)
                                && event_tx.send(event).is_err()
                            {
                                return;
                            }
                        }
                        Ok(Some(Err(source))) => {
                            tracing::warn!(
                                provider_id = %config.provider_id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let _ = event_tx.send(ProviderEvent::Failed(
                                ProviderError::CompletionsFailed {
                                    stage: "stream-chunk",
                                    source,
                                },
                            ));
                            return;
                        }
                        Ok(None) => break,
                    }
                }
            }
        }

        let _ = event_tx.send(ProviderEvent::Done);
    }
}

/// Parses an OpenAI-style `GET /models` payload into a sorted, de-duplicated model list.
pub fn parse_model_list(payload: &str) -> ProviderResult<Vec<Model>> {
    let parsed: ModelListPayload =
        serde_json::from_str(payload).map_err(|source| ProviderError::ModelPayloadParse {
            stage: "parse-model-response",
            details: source.to_string(),
        })?;

    let mut ids = parsed
        .data
        .into_iter()
        .map(|entry| entry.id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    ids.sort();
    ids.dedup();

    ensure!(
        !ids.is_empty(),
        ModelPayloadParseSnafu {
            stage: "parse-model-response",
            details: "no model identifiers found in provider response".to_string(),
        }
    );

    Ok(ids.into_iter().map(Model::from_id).collect())
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        match self.config.kind {
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Groq => "Groq",
            ProviderKind::Together => "Together",
            ProviderKind::Fireworks => "Fireworks",
            ProviderKind::Ollama => "OpenAI-compatible",
        }
    }

    fn kind(&self) -> ProviderKind {
        self.config.kind
    }

    fn fallback_models(&self) -> &[Model] {
        &self.fallback_models
    }

    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
        Box::pin(async move {
            Ok(self
                .model_cache
                .catalog(self.id(), &self.fallback_models, self.fetch_models_from_provider())
                .await)
        })
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                model_id: request.model_id.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = ProviderEventStream::channel();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}
