use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;

use super::model::{Model, ModelCache, ModelCatalog, shared_model_cache};
use super::provider::{
    BoxFuture, EmptyMessageSetSnafu, LlmProvider, ProviderConfig, ProviderError, ProviderEvent,
    ProviderEventSender, ProviderEventStream, ProviderKind, ProviderResult, ProviderStreamHandle,
    ProviderWorker, Role, StreamPayloadSnafu, StreamRequest, TransportSnafu, status_error,
    within_request_timeout,
};

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "ChatOptions::is_empty")]
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "has_no_images")]
    images: &'a [String],
}

fn has_no_images(images: &&[String]) -> bool {
    images.is_empty()
}

#[derive(Debug, Default, Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u64>,
}

impl ChatOptions {
    fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.num_predict.is_none()
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagsModel>,
}

#[derive(Debug, Deserialize)]
struct TagsModel {
    name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineOutcome {
    Continue,
    Done,
}

/// Splits a byte stream into newline-delimited records, holding partial lines
/// until their terminator arrives.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    pending: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(position) = self.pending.iter().position(|byte| *byte == b'\n') {
            let raw = self.pending.drain(..=position).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() { None } else { Some(line) }
    }
}

/// Adapter for a local Ollama runtime speaking `/api/chat` NDJSON.
pub struct OllamaAdapter {
    config: ProviderConfig,
    http: reqwest::Client,
    model_cache: Arc<ModelCache>,
}

impl OllamaAdapter {
    pub fn new(mut config: ProviderConfig) -> ProviderResult<Self> {
        if config.base_url.is_empty() {
            config.base_url = DEFAULT_OLLAMA_BASE_URL.to_string();
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder.build().context(TransportSnafu {
            stage: "ollama-build-client",
        })?;

        Ok(Self {
            config,
            http,
            model_cache: shared_model_cache(),
        })
    }

    pub fn with_model_cache(mut self, model_cache: Arc<ModelCache>) -> Self {
        self.model_cache = model_cache;
        self
    }

    fn endpoint(config: &ProviderConfig, path: &str) -> String {
        format!("{}{path}", config.base_url.trim_end_matches('/'))
    }

    fn build_body(request: &StreamRequest) -> ChatRequest<'_> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(preamble) = request.preamble.as_deref()
            && !preamble.trim().is_empty()
        {
            messages.push(ChatMessage {
                role: Role::System.as_str(),
                content: preamble,
                images: &[],
            });
        }

        messages.extend(request.messages.iter().map(|message| ChatMessage {
            role: message.role.as_str(),
            content: message.content.as_str(),
            images: message.images.as_slice(),
        }));

        ChatRequest {
            model: &request.model_id,
            messages,
            stream: true,
            options: ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        }
    }

    fn handle_line(line: &str, event_tx: &ProviderEventSender) -> ProviderResult<LineOutcome> {
        let chunk: ChatChunk = serde_json::from_str(line).context(StreamPayloadSnafu {
            stage: "ollama-parse-line",
            line: line.to_string(),
        })?;

        if let Some(message) = chunk.error {
            return Err(ProviderError::ProviderReported {
                stage: "ollama-stream-error",
                message,
            });
        }

        if let Some(message) = chunk.message
            && !message.content.is_empty()
        {
            let _ = event_tx.send(ProviderEvent::Token(message.content));
        }

        Ok(if chunk.done {
            LineOutcome::Done
        } else {
            LineOutcome::Continue
        })
    }

    async fn pump(
        http: &reqwest::Client,
        config: &ProviderConfig,
        request: &StreamRequest,
        event_tx: &ProviderEventSender,
    ) -> ProviderResult<()> {
        let send = http
            .post(Self::endpoint(config, "/api/chat"))
            .json(&Self::build_body(request))
            .send();
        let response = within_request_timeout(config.request_timeout, "ollama-send-chat", send)
            .await?
            .context(TransportSnafu {
                stage: "ollama-send-chat",
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(
                "ollama-chat-status",
                &config.provider_id,
                status.as_u16(),
                body,
            ));
        }

        let mut bytes = response.bytes_stream();
        let mut decoder = NdjsonDecoder::default();
        while let Some(chunk) =
            within_request_timeout(config.request_timeout, "ollama-read-chunk", bytes.next()).await?
        {
            let chunk = chunk.context(TransportSnafu {
                stage: "ollama-read-chunk",
            })?;
            for line in decoder.push(&chunk) {
                if Self::handle_line(&line, event_tx)? == LineOutcome::Done {
                    return Ok(());
                }
            }
        }

        if let Some(line) = decoder.finish()
            && Self::handle_line(&line, event_tx)? == LineOutcome::Done
        {
            return Ok(());
        }

        Err(ProviderError::ProviderReported {
            stage: "ollama-stream-eof",
            message: "connection closed before the response completed".to_string(),
        })
    }

    async fn run_stream_worker(
        http: reqwest::Client,
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: ProviderEventSender,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let outcome = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(provider_id = %config.provider_id, "ollama stream cancelled");
                return;
            }
            outcome = Self::pump(&http, &config, &request, &event_tx) => outcome,
        };

        let event = match outcome {
            Ok(()) => ProviderEvent::Done,
            Err(error) => {
                tracing::warn!(
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "ollama stream failed"
                );
                ProviderEvent::Failed(error)
            }
        };
        let _ = event_tx.send(event);
    }

    async fn fetch_models_from_provider(&self) -> ProviderResult<Vec<Model>> {
        let send = self.http.get(Self::endpoint(&self.config, "/api/tags")).send();
        let response = within_request_timeout(self.config.request_timeout, "ollama-send-tags", send)
            .await?
            .context(TransportSnafu {
                stage: "ollama-send-tags",
            })?;

        let status = response.status();
        let payload = response.text().await.context(TransportSnafu {
            stage: "ollama-read-tags",
        })?;
        if !status.is_success() {
            return Err(ProviderError::ModelFetchStatus {
                stage: "ollama-tags-status",
                status: status.as_u16(),
                body: payload,
            });
        }

        parse_tags(&payload)
    }
}

fn parse_tags(payload: &str) -> ProviderResult<Vec<Model>> {
    let tags: TagsResponse =
        serde_json::from_str(payload).map_err(|source| ProviderError::ModelPayloadParse {
            stage: "ollama-parse-tags",
            details: source.to_string(),
        })?;

    Ok(tags
        .models
        .into_iter()
        .map(|model| Model::from_id(model.name))
        .collect())
}

impl LlmProvider for OllamaAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Ollama"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn fallback_models(&self) -> &[Model] {
        &[]
    }

    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
        Box::pin(async move {
            Ok(self
                .model_cache
                .catalog(self.id(), &[], self.fetch_models_from_provider())
                .await)
        })
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "ollama-stream-chat",
                model_id: request.model_id.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = ProviderEventStream::channel();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.http.clone(),
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::provider::ProviderMessage;
    use crate::test_support::stub_server;

    #[test]
    fn decoder_reassembles_lines_split_across_chunks() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(br#"{"message":{"content":"Hel"#).is_empty());

        let lines = decoder.push(b"lo\"},\"done\":false}\n{\"done\":true}\n");
        assert_eq!(
            lines,
            vec![
                r#"{"message":{"content":"Hello"},"done":false}"#.to_string(),
                r#"{"done":true}"#.to_string(),
            ]
        );
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn decoder_flushes_unterminated_tail() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(b"\n\n{\"done\":true}").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some(r#"{"done":true}"#));
    }

    #[test]
    fn lines_forward_tokens_and_detect_completion() {
        let (event_tx, mut stream, _cancel_rx) = ProviderEventStream::channel();

        let outcome =
            OllamaAdapter::handle_line(r#"{"message":{"content":"Hi"},"done":false}"#, &event_tx);
        assert!(matches!(outcome, Ok(LineOutcome::Continue)));
        assert!(matches!(stream.try_recv(), Some(ProviderEvent::Token(token)) if token == "Hi"));

        let outcome = OllamaAdapter::handle_line(r#"{"done":true}"#, &event_tx);
        assert!(matches!(outcome, Ok(LineOutcome::Done)));
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn reported_errors_and_garbage_fail_the_stream() {
        let (event_tx, _stream, _cancel_rx) = ProviderEventStream::channel();

        let outcome = OllamaAdapter::handle_line(r#"{"error":"model not found"}"#, &event_tx);
        assert!(
            matches!(outcome, Err(ProviderError::ProviderReported { message, .. }) if message == "model not found")
        );

        let outcome = OllamaAdapter::handle_line("{oops", &event_tx);
        assert!(matches!(outcome, Err(ProviderError::StreamPayload { .. })));
    }

    #[test]
    fn request_body_carries_preamble_images_and_options() {
        let request = StreamRequest::new(
            "llama3",
            vec![
                ProviderMessage::new(Role::User, "what is this?")
                    .with_images(vec!["aGVsbG8=".to_string()]),
            ],
        )
        .with_preamble("be brief")
        .with_temperature(0.2);

        let body = serde_json::to_value(OllamaAdapter::build_body(&request)).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["images"][0], "aGVsbG8=");
        assert_eq!(body["options"]["temperature"], 0.2);
        assert!(body["options"].get("num_predict").is_none());
    }

    #[test]
    fn tags_payload_lists_model_names() {
        let models = parse_tags(r#"{"models":[{"name":"llama3:8b"},{"name":"qwen2"}]}"#).unwrap();
        assert_eq!(models[0].id, "llama3:8b");
        assert_eq!(models.len(), 2);
    }

    #[tokio::test]
    async fn silent_runtime_fails_with_timeout() {
        let (base_url, _head_rx) = stub_server(None);
        let config = ProviderConfig::new("ollama", ProviderKind::Ollama, "", base_url)
            .with_request_timeout(Duration::from_millis(100));
        let adapter = OllamaAdapter::new(config).unwrap();
        let request = StreamRequest::new("llama3.2", vec![ProviderMessage::new(Role::User, "hi")]);
        let ProviderStreamHandle { mut stream, worker } = adapter.stream_chat(request).unwrap();
        tokio::spawn(worker);

        let event = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap();
        assert!(matches!(
            event,
            Some(ProviderEvent::Failed(ProviderError::Timeout {
                stage: "ollama-send-chat",
                timeout_ms: 100
            }))
        ));
    }
}
