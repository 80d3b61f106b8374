use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use quill_core::{
    AppSettings, ChunkEffect, ConversationReconciler, CorrelationToken, DispatchOutcome,
    GenerationDispatcher, GenerationRequest, MessageStatus, ProviderFactory, ProviderSettings,
    ReconcileError, ReplyPhase, StreamChunk, Turn,
};
use quill_llm::{
    LlmProvider, Model, ModelCatalog, ProviderConfig, ProviderError, ProviderEvent,
    ProviderEventStream, ProviderKind, ProviderResult, ProviderStreamHandle, StreamRequest,
};
use quill_storage::{
    ConversationId, ConversationRecord, MemoryStore, MessageRecord, MessageRole, NewMessage,
    PersistenceGateway, StorageError, StorageResult,
};
use tokio::sync::Notify;

const MODEL_ID: &str = "scripted-model";

#[derive(Clone)]
enum Step {
    Token(&'static str),
    Wait(Arc<Notify>),
    Done,
    Fail(&'static str),
    /// Ends the worker without a terminal event.
    Close,
}

/// Replays a script chosen by the last prompt text.
struct ScriptedProvider {
    scripts: HashMap<String, Vec<Step>>,
    opened: AtomicUsize,
}

impl ScriptedProvider {
    fn new(scripts: Vec<(&str, Vec<Step>)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(prompt, steps)| (prompt.to_string(), steps))
                .collect(),
            opened: AtomicUsize::new(0),
        }
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn fallback_models(&self) -> &[Model] {
        &[]
    }

    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
        Box::pin(async { Ok(ModelCatalog::from_provider_api(vec![Model::from_id(MODEL_ID)])) })
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let prompt = request
            .messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        let steps = self.scripts.get(&prompt).cloned().unwrap_or_default();

        let (event_tx, stream, mut cancel_rx) = ProviderEventStream::channel();
        let worker = Box::pin(async move {
            for step in steps {
                match step {
                    Step::Token(piece) => {
                        let _ = event_tx.send(ProviderEvent::Token(piece.to_string()));
                    }
                    Step::Wait(gate) => {
                        tokio::select! {
                            _ = gate.notified() => {}
                            _ = &mut cancel_rx => return,
                        }
                    }
                    Step::Done => {
                        let _ = event_tx.send(ProviderEvent::Done);
                        return;
                    }
                    Step::Fail(message) => {
                        let _ = event_tx.send(ProviderEvent::Failed(
                            ProviderError::ProviderReported {
                                stage: "scripted-stream",
                                message: message.to_string(),
                            },
                        ));
                        return;
                    }
                    Step::Close => return,
                }
            }
        });

        Ok(ProviderStreamHandle { stream, worker })
    }
}

struct CountingFactory {
    provider: Arc<ScriptedProvider>,
    created: AtomicUsize,
}

impl ProviderFactory for CountingFactory {
    fn create(&self, _config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.provider.clone())
    }
}

/// Accepts prompts but refuses to save assistant replies.
struct RefusingGateway {
    inner: MemoryStore,
}

impl PersistenceGateway for RefusingGateway {
    fn create_conversation<'a>(
        &'a self,
        title: &'a str,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        self.inner.create_conversation(title)
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        self.inner.get_conversation(conversation_id)
    }

    fn conversation_exists(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<bool>> {
        self.inner.conversation_exists(conversation_id)
    }

    fn create_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        if input.role == MessageRole::Assistant {
            return Box::pin(async {
                Err(StorageError::InvariantViolation {
                    stage: "refusing-gateway",
                    details: "disk full".to_string(),
                })
            });
        }
        self.inner.create_message(conversation_id, input)
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        self.inner.list_messages(conversation_id)
    }

    fn touch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        self.inner.touch_conversation(conversation_id)
    }
}

struct Harness {
    dispatcher: GenerationDispatcher,
    factory: Arc<CountingFactory>,
    store: Arc<MemoryStore>,
}

impl Harness {
    fn new(settings: AppSettings, scripts: Vec<(&str, Vec<Step>)>) -> Self {
        let factory = Arc::new(CountingFactory {
            provider: Arc::new(ScriptedProvider::new(scripts)),
            created: AtomicUsize::new(0),
        });
        let dispatcher = GenerationDispatcher::new(
            Arc::new(ArcSwap::from_pointee(settings)),
            factory.clone(),
            Default::default(),
        );

        Self {
            dispatcher,
            factory,
            store: Arc::new(MemoryStore::new()),
        }
    }

    fn scripted(scripts: Vec<(&str, Vec<Step>)>) -> Self {
        Self::new(scripted_settings(), scripts)
    }

    fn reconciler(&self) -> ConversationReconciler {
        ConversationReconciler::new(self.store.clone())
    }

    fn adapters_opened(&self) -> usize {
        self.factory.created.load(Ordering::SeqCst)
            + self.factory.provider.opened.load(Ordering::SeqCst)
    }
}

fn scripted_settings() -> AppSettings {
    AppSettings {
        providers: vec![
            ProviderSettings::new("scripted", ProviderKind::Ollama)
                .with_models(vec![Model::from_id(MODEL_ID)]),
        ],
        default_provider_id: Some("scripted".to_string()),
        default_chat_model_id: Some(MODEL_ID.to_string()),
        ..AppSettings::default()
    }
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("pipeline stalled")
}

fn streamed_contents(effects: &[ChunkEffect]) -> Vec<String> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            ChunkEffect::Streamed { content, .. } => Some(content.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn happy_path_streams_into_the_placeholder_and_persists_once() {
    let harness = Harness::scripted(vec![(
        "Hi",
        vec![Step::Token("Hel"), Step::Token("lo"), Step::Done],
    )]);
    let mut reconciler = harness.reconciler();

    let mut submission = reconciler
        .submit(&harness.dispatcher, "Hi", Vec::new())
        .await
        .unwrap();
    assert_eq!(
        reconciler.placeholder(submission.token).unwrap().content,
        "▋"
    );

    let mut effects = Vec::new();
    within(reconciler.drive(&mut submission.receiver, |effect| {
        effects.push(effect.clone())
    }))
    .await
    .unwrap();

    assert_eq!(streamed_contents(&effects), vec!["Hel", "Hello"]);
    let Some(ChunkEffect::Finalized { message, .. }) = effects.last() else {
        panic!("reply was not finalized: {effects:?}");
    };
    assert_eq!(message.content, "Hello");
    assert!(message.error.is_none());
    assert_eq!(message.status, MessageStatus::Done);

    let outcome = submission.handle.join().await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Completed {
            content: "Hello".to_string()
        }
    );

    let conversation_id = reconciler.key().persisted_id().unwrap();
    let saved = harness.store.list_messages(conversation_id).await.unwrap();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[1].content, "Hello");
    assert_eq!(harness.store.touch_count(conversation_id).await, 1);
    assert!(reconciler.messages().iter().all(|m| !m.is_placeholder()));
}

#[tokio::test]
async fn mid_stream_failure_persists_an_error_reply() {
    let harness = Harness::scripted(vec![(
        "Hi",
        vec![Step::Token("Partial"), Step::Fail("connection reset")],
    )]);
    let mut reconciler = harness.reconciler();

    let mut submission = reconciler
        .submit(&harness.dispatcher, "Hi", Vec::new())
        .await
        .unwrap();
    let mut effects = Vec::new();
    within(reconciler.drive(&mut submission.receiver, |effect| {
        effects.push(effect.clone())
    }))
    .await
    .unwrap();

    assert_eq!(streamed_contents(&effects), vec!["Partial"]);
    let conversation_id = reconciler.key().persisted_id().unwrap();
    let saved = harness.store.list_messages(conversation_id).await.unwrap();
    let reply = saved.last().unwrap();
    assert_eq!(reply.error.as_deref(), Some("connection reset"));
    assert!(reply.content.is_empty());
    assert_eq!(harness.store.touch_count(conversation_id).await, 1);

    let visible = reconciler.messages().last().unwrap();
    assert_eq!(visible.status, MessageStatus::Error);
}

#[tokio::test]
async fn missing_default_model_short_circuits_without_opening_an_adapter() {
    let mut settings = scripted_settings();
    settings.default_chat_model_id = None;
    let harness = Harness::new(settings, Vec::new());

    let token = CorrelationToken::new();
    let mut receiver = harness.dispatcher.relay().subscribe_channel();
    let outcome = within(
        harness
            .dispatcher
            .dispatch(GenerationRequest::new(token, vec![Turn::user("Hi")]))
            .join(),
    )
    .await
    .unwrap();

    assert_eq!(
        outcome,
        DispatchOutcome::Failed {
            error: "no default chat model is set".to_string()
        }
    );
    let chunks = std::iter::from_fn(|| receiver.try_recv()).collect::<Vec<_>>();
    assert_eq!(
        chunks,
        vec![StreamChunk::failed(token, "no default chat model is set")]
    );
    assert_eq!(harness.adapters_opened(), 0);
}

#[tokio::test]
async fn configuration_errors_become_persisted_error_replies() {
    let mut settings = scripted_settings();
    settings
        .providers
        .push(ProviderSettings::new("hosted", ProviderKind::OpenAi));
    let harness = Harness::new(settings, Vec::new());

    let mut unknown = harness.reconciler().with_model(
        Some("nope".to_string()),
        Some(MODEL_ID.to_string()),
    );
    let mut submission = unknown
        .submit(&harness.dispatcher, "Hi", Vec::new())
        .await
        .unwrap();
    within(unknown.drive(&mut submission.receiver, |_| {}))
        .await
        .unwrap();
    let reply = unknown.messages().last().unwrap();
    assert_eq!(reply.error.as_deref(), Some("provider not found"));

    let mut keyless = harness.reconciler().with_model(
        Some("hosted".to_string()),
        Some("gpt-4o-mini".to_string()),
    );
    let mut submission = keyless
        .submit(&harness.dispatcher, "Hi", Vec::new())
        .await
        .unwrap();
    within(keyless.drive(&mut submission.receiver, |_| {}))
        .await
        .unwrap();
    let reply = keyless.messages().last().unwrap();
    assert_eq!(reply.error.as_deref(), Some("missing API key"));
    assert_eq!(reply.status, MessageStatus::Error);

    assert_eq!(harness.adapters_opened(), 0);
}

#[tokio::test]
async fn concurrent_replies_finalize_into_their_own_placeholders() {
    let release_first = Arc::new(Notify::new());
    let harness = Harness::scripted(vec![
        (
            "first",
            vec![
                Step::Token("A1"),
                Step::Wait(release_first.clone()),
                Step::Token("A2"),
                Step::Done,
            ],
        ),
        ("second", vec![Step::Token("B"), Step::Done]),
    ]);
    let mut reconciler = harness.reconciler();
    let mut all_chunks = harness.dispatcher.relay().subscribe_channel();

    let first = reconciler
        .submit(&harness.dispatcher, "first", Vec::new())
        .await
        .unwrap();
    let second = reconciler
        .submit(&harness.dispatcher, "second", Vec::new())
        .await
        .unwrap();
    assert_eq!(
        reconciler
            .messages()
            .iter()
            .filter(|message| message.is_placeholder())
            .count(),
        2
    );

    let mut finalized = Vec::new();
    within(reconciler.drive(&mut all_chunks, |effect| {
        if let ChunkEffect::Finalized { token, message } = effect {
            finalized.push((*token, message.content.clone()));
            if *token == second.token {
                release_first.notify_one();
            }
        }
    }))
    .await
    .unwrap();

    assert_eq!(
        finalized,
        vec![
            (second.token, "B".to_string()),
            (first.token, "A1A2".to_string())
        ]
    );

    let contents = reconciler
        .messages()
        .iter()
        .map(|message| (message.role, message.content.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        contents,
        vec![
            (MessageRole::User, "first"),
            (MessageRole::Assistant, "A1A2"),
            (MessageRole::User, "second"),
            (MessageRole::Assistant, "B"),
        ]
    );

    let conversation_id = reconciler.key().persisted_id().unwrap();
    assert_eq!(harness.store.touch_count(conversation_id).await, 2);
    assert_eq!(harness.store.message_count().await, 4);
}

#[tokio::test]
async fn empty_reply_is_a_success() {
    let harness = Harness::scripted(vec![("Hi", vec![Step::Done])]);
    let mut reconciler = harness.reconciler();

    let mut submission = reconciler
        .submit(&harness.dispatcher, "Hi", Vec::new())
        .await
        .unwrap();
    within(reconciler.drive(&mut submission.receiver, |_| {}))
        .await
        .unwrap();

    let reply = reconciler.messages().last().unwrap();
    assert_eq!(reply.status, MessageStatus::Done);
    assert!(reply.content.is_empty());
    assert!(reply.error.is_none());
    assert_eq!(reconciler.phase(submission.token), Some(ReplyPhase::Finalized));
}

#[tokio::test]
async fn conversations_only_see_their_own_tokens() {
    let harness = Harness::scripted(vec![
        ("left", vec![Step::Token("L"), Step::Done]),
        ("right", vec![Step::Token("R"), Step::Done]),
    ]);
    let mut left = harness.reconciler();
    let mut right = harness.reconciler();
    let mut left_chunks = harness.dispatcher.relay().subscribe_channel();
    let mut right_chunks = harness.dispatcher.relay().subscribe_channel();

    left.submit(&harness.dispatcher, "left", Vec::new())
        .await
        .unwrap();
    right
        .submit(&harness.dispatcher, "right", Vec::new())
        .await
        .unwrap();

    let (left_result, right_result) = within(async {
        tokio::join!(
            left.drive(&mut left_chunks, |_| {}),
            right.drive(&mut right_chunks, |_| {})
        )
    })
    .await;
    left_result.unwrap();
    right_result.unwrap();

    assert_eq!(left.messages().last().unwrap().content, "L");
    assert_eq!(right.messages().last().unwrap().content, "R");
    assert_ne!(left.key(), right.key());
}

#[tokio::test]
async fn unterminated_streams_are_reported_as_errors() {
    let harness = Harness::scripted(vec![("Hi", vec![Step::Token("half"), Step::Close])]);
    let mut reconciler = harness.reconciler();

    let mut submission = reconciler
        .submit(&harness.dispatcher, "Hi", Vec::new())
        .await
        .unwrap();
    within(reconciler.drive(&mut submission.receiver, |_| {}))
        .await
        .unwrap();

    let reply = reconciler.messages().last().unwrap();
    assert_eq!(
        reply.error.as_deref(),
        Some("provider stream ended before a terminal event")
    );
}

#[tokio::test]
async fn cancelled_requests_publish_nothing_final_and_persist_nothing() {
    let never = Arc::new(Notify::new());
    let harness = Harness::scripted(vec![(
        "Hi",
        vec![Step::Token("par"), Step::Wait(never)],
    )]);
    let mut reconciler = harness.reconciler();

    let mut submission = reconciler
        .submit(&harness.dispatcher, "Hi", Vec::new())
        .await
        .unwrap();
    let first = within(submission.receiver.recv()).await.unwrap();
    reconciler.apply_chunk(&first).await.unwrap();

    assert!(reconciler.cancel(&mut submission));
    let outcome = within(submission.handle.join()).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Cancelled);

    assert!(submission.receiver.try_recv().is_none());
    assert_eq!(reconciler.messages().len(), 1);
    assert!(!reconciler.has_active_replies());
    assert_eq!(harness.store.message_count().await, 1);
}

#[tokio::test]
async fn refused_replies_stay_visible_as_unsaved() {
    let harness = Harness::scripted(vec![("Hi", vec![Step::Token("ok"), Step::Done])]);
    let gateway = Arc::new(RefusingGateway {
        inner: MemoryStore::new(),
    });
    let mut reconciler = ConversationReconciler::new(gateway.clone());

    let mut submission = reconciler
        .submit(&harness.dispatcher, "Hi", Vec::new())
        .await
        .unwrap();
    let error = within(reconciler.drive(&mut submission.receiver, |_| {}))
        .await
        .unwrap_err();
    assert!(matches!(error, ReconcileError::PersistReply { .. }));

    let reply = reconciler.messages().last().unwrap();
    assert_eq!(reply.status, MessageStatus::Unsaved);
    assert_eq!(reply.content, "ok");
    assert!(!reply.is_placeholder());
    assert_eq!(reconciler.phase(submission.token), Some(ReplyPhase::Finalized));

    let conversation_id = reconciler.key().persisted_id().unwrap();
    assert_eq!(gateway.inner.touch_count(conversation_id).await, 0);
}
