use std::collections::HashMap;
use std::sync::Arc;

use quill_llm::Role;
use quill_storage::{
    Attachment, ConversationId, DEFAULT_CONVERSATION_TITLE, MessageRole, NewMessage,
    PersistenceGateway, StorageError,
};
use snafu::{ResultExt, Snafu, ensure};

use crate::chunk::{CorrelationToken, GenerationRequest, StreamChunk, Turn};
use crate::conversation::{
    ChatMessage, ConversationKey, MessageKey, MessageStatus, PlaceholderId, title_from_prompt,
};
use crate::dispatcher::{DispatchHandle, GenerationDispatcher};
use crate::relay::ChunkReceiver;
use crate::settings::DEFAULT_HISTORY_LIMIT;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReconcileError {
    #[snafu(display("prompt has neither text nor attachments"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("correlation token {token} already has a reply"))]
    DuplicateToken {
        stage: &'static str,
        token: CorrelationToken,
    },
    #[snafu(display("conversation {id} does not exist"))]
    ConversationNotFound {
        stage: &'static str,
        id: ConversationId,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("reply {token} could not be saved: {source}"))]
    PersistReply {
        stage: &'static str,
        token: CorrelationToken,
        source: StorageError,
    },
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Lifecycle of one assistant reply, keyed by its correlation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPhase {
    /// Placeholder inserted, nothing received yet.
    Pending,
    Streaming,
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyTransition {
    Token,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyRejection {
    AlreadyFinalized,
}

impl ReplyPhase {
    fn apply(self, transition: ReplyTransition) -> Result<Self, ReplyRejection> {
        match (self, transition) {
            (Self::Finalized, _) => Err(ReplyRejection::AlreadyFinalized),
            (Self::Pending | Self::Streaming, ReplyTransition::Token) => Ok(Self::Streaming),
            (Self::Pending | Self::Streaming, ReplyTransition::Finish) => Ok(Self::Finalized),
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, Self::Finalized)
    }
}

#[derive(Debug)]
struct Reply {
    placeholder: PlaceholderId,
    phase: ReplyPhase,
    text: String,
}

/// What one chunk did to the message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEffect {
    /// Unknown, foreign, or already finalized token.
    Ignored,
    /// Placeholder content now equals `content`.
    Streamed {
        token: CorrelationToken,
        content: String,
    },
    /// Placeholder swapped for its final message.
    Finalized {
        token: CorrelationToken,
        message: ChatMessage,
    },
}

/// Everything the caller needs to follow one submitted prompt.
pub struct Submission {
    pub token: CorrelationToken,
    pub receiver: ChunkReceiver,
    pub handle: DispatchHandle,
}

/// Owns one conversation's visible message list and keeps it consistent
/// with streamed replies and the durable store.
pub struct ConversationReconciler {
    key: ConversationKey,
    title: Option<String>,
    messages: Vec<ChatMessage>,
    replies: HashMap<CorrelationToken, Reply>,
    gateway: Arc<dyn PersistenceGateway>,
    history_limit: usize,
    provider_id: Option<String>,
    model_id: Option<String>,
    next_local_id: u64,
}

impl ConversationReconciler {
    /// A temporary conversation, written on its first prompt.
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self {
            key: ConversationKey::temporary(),
            title: None,
            messages: Vec::new(),
            replies: HashMap::new(),
            gateway,
            history_limit: DEFAULT_HISTORY_LIMIT,
            provider_id: None,
            model_id: None,
            next_local_id: 0,
        }
    }

    /// Hydrates an existing conversation from the store.
    pub async fn open(
        gateway: Arc<dyn PersistenceGateway>,
        conversation_id: ConversationId,
    ) -> ReconcileResult<Self> {
        let conversation = gateway
            .get_conversation(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "open-conversation",
            })?;
        let Some(conversation) = conversation else {
            return ConversationNotFoundSnafu {
                stage: "open-conversation",
                id: conversation_id,
            }
            .fail();
        };

        let records = gateway
            .list_messages(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "open-conversation-messages",
            })?;

        let mut reconciler = Self::new(gateway);
        reconciler.key = ConversationKey::Persisted(conversation_id);
        reconciler.title = Some(conversation.title);
        reconciler.messages = records.into_iter().map(ChatMessage::from_record).collect();
        Ok(reconciler)
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit.max(1);
        self
    }

    /// Pins the provider/model used by `submit`; `None` defers to settings.
    pub fn with_model(mut self, provider_id: Option<String>, model_id: Option<String>) -> Self {
        self.provider_id = provider_id;
        self.model_id = model_id;
        self
    }

    pub fn set_model(&mut self, provider_id: Option<String>, model_id: Option<String>) {
        self.provider_id = provider_id;
        self.model_id = model_id;
    }

    pub fn key(&self) -> ConversationKey {
        self.key
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn phase(&self, token: CorrelationToken) -> Option<ReplyPhase> {
        self.replies.get(&token).map(|reply| reply.phase)
    }

    pub fn placeholder(&self, token: CorrelationToken) -> Option<&ChatMessage> {
        let reply = self.replies.get(&token)?;
        self.position_of(&reply.placeholder)
            .map(|index| &self.messages[index])
    }

    pub fn has_active_replies(&self) -> bool {
        self.replies.values().any(|reply| reply.phase.is_active())
    }

    /// Persists a prompt, promoting a temporary conversation first.
    pub async fn add_user_message(
        &mut self,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> ReconcileResult<&ChatMessage> {
        ensure!(
            !content.trim().is_empty() || !attachments.is_empty(),
            EmptyPromptSnafu {
                stage: "add-user-message",
            }
        );

        let conversation_id = self.ensure_persisted(&title_from_prompt(content)).await?;
        let record = self
            .gateway
            .create_message(
                conversation_id,
                NewMessage::user(content).with_attachments(attachments),
            )
            .await
            .context(StorageSnafu {
                stage: "add-user-message",
            })?;

        self.messages.push(ChatMessage::from_record(record));
        let index = self.messages.len() - 1;
        Ok(&self.messages[index])
    }

    /// Inserts the placeholder for `token`. Call before subscribing so the
    /// placeholder is visible before any chunk can arrive.
    pub fn begin_reply(&mut self, token: CorrelationToken) -> ReconcileResult<PlaceholderId> {
        ensure!(
            !self.replies.contains_key(&token),
            DuplicateTokenSnafu {
                stage: "begin-reply",
                token,
            }
        );

        let placeholder = PlaceholderId::for_token(token);
        self.messages.push(ChatMessage::placeholder(placeholder.clone()));
        self.replies.insert(
            token,
            Reply {
                placeholder: placeholder.clone(),
                phase: ReplyPhase::Pending,
                text: String::new(),
            },
        );
        tracing::debug!(correlation_token = %token, placeholder = %placeholder, "reply started");
        Ok(placeholder)
    }

    /// Applies one relay chunk. Chunks for tokens this conversation does not
    /// own, or that already finalized, change nothing.
    ///
    /// When the final message cannot be saved the placeholder becomes a
    /// local-only error message, the token still counts as finalized and the
    /// storage error is returned.
    pub async fn apply_chunk(&mut self, chunk: &StreamChunk) -> ReconcileResult<ChunkEffect> {
        let token = chunk.correlation_token;
        let transition = if chunk.is_terminal() {
            ReplyTransition::Finish
        } else {
            ReplyTransition::Token
        };

        let Some(reply) = self.replies.get_mut(&token) else {
            return Ok(ChunkEffect::Ignored);
        };
        let Ok(next_phase) = reply.phase.apply(transition) else {
            tracing::debug!(correlation_token = %token, "ignoring chunk for finalized reply");
            return Ok(ChunkEffect::Ignored);
        };
        reply.phase = next_phase;

        if !chunk.is_terminal() {
            reply.text.push_str(&chunk.content);
            let content = reply.text.clone();
            let placeholder = reply.placeholder.clone();
            if let Some(index) = self.position_of(&placeholder) {
                let message = &mut self.messages[index];
                message.content = content.clone();
                message.status = MessageStatus::Streaming;
            }
            return Ok(ChunkEffect::Streamed { token, content });
        }

        let placeholder = reply.placeholder.clone();
        self.finalize(token, &placeholder, chunk).await
    }

    /// Drops the placeholder of a reply that will never finish. Nothing is
    /// persisted. Returns false for unknown or finalized tokens.
    pub fn cancel_reply(&mut self, token: CorrelationToken) -> bool {
        let Some(reply) = self.replies.get_mut(&token) else {
            return false;
        };
        if reply.phase.apply(ReplyTransition::Finish).is_err() {
            return false;
        }
        reply.phase = ReplyPhase::Finalized;

        let placeholder = reply.placeholder.clone();
        if let Some(index) = self.position_of(&placeholder) {
            self.messages.remove(index);
        }
        tracing::info!(correlation_token = %token, "reply cancelled");
        true
    }

    /// Cancels a submitted request and discards its placeholder.
    pub fn cancel(&mut self, submission: &mut Submission) -> bool {
        submission.handle.cancel();
        self.cancel_reply(submission.token)
    }

    /// Provider turns built from the saved history: placeholders and failed
    /// replies are skipped, PDF text is folded into the prompt, and only the
    /// newest `history_limit` turns are kept.
    pub fn turns(&self) -> Vec<Turn> {
        let turns = self
            .messages
            .iter()
            .filter(|message| !message.is_placeholder() && !message.is_failed())
            .map(message_to_turn)
            .collect::<Vec<_>>();

        let skip = turns.len().saturating_sub(self.history_limit);
        turns.into_iter().skip(skip).collect()
    }

    /// Persists the prompt, inserts the placeholder, subscribes and
    /// dispatches, in that order.
    pub async fn submit(
        &mut self,
        dispatcher: &GenerationDispatcher,
        prompt: &str,
        attachments: Vec<Attachment>,
    ) -> ReconcileResult<Submission> {
        self.add_user_message(prompt, attachments).await?;

        let token = CorrelationToken::new();
        self.begin_reply(token)?;
        let turns = self.turns();
        let receiver = dispatcher.relay().subscribe_token(token);

        let mut request = GenerationRequest::new(token, turns).for_conversation(self.key);
        request.provider_id = self.provider_id.clone();
        request.model_id = self.model_id.clone();
        let handle = dispatcher.dispatch(request);

        Ok(Submission {
            token,
            receiver,
            handle,
        })
    }

    /// Feeds chunks from `receiver` until no reply is in flight or the
    /// receiver closes, reporting every effective change to `on_effect`.
    pub async fn drive<F>(
        &mut self,
        receiver: &mut ChunkReceiver,
        mut on_effect: F,
    ) -> ReconcileResult<()>
    where
        F: FnMut(&ChunkEffect),
    {
        while self.has_active_replies() {
            let Some(chunk) = receiver.recv().await else {
                break;
            };
            let effect = self.apply_chunk(&chunk).await?;
            if effect != ChunkEffect::Ignored {
                on_effect(&effect);
            }
        }
        Ok(())
    }

    async fn finalize(
        &mut self,
        token: CorrelationToken,
        placeholder: &PlaceholderId,
        chunk: &StreamChunk,
    ) -> ReconcileResult<ChunkEffect> {
        let new_message = match &chunk.error {
            Some(error) => NewMessage::assistant_error(error.clone()),
            None => NewMessage::assistant(chunk.content.clone()),
        };

        let persisted = match self.ensure_persisted(DEFAULT_CONVERSATION_TITLE).await {
            Ok(conversation_id) => self
                .gateway
                .create_message(conversation_id, new_message.clone())
                .await
                .map(|record| (conversation_id, record))
                .context(PersistReplySnafu {
                    stage: "finalize-create-message",
                    token,
                }),
            Err(error) => Err(error),
        };

        let (conversation_id, record) = match persisted {
            Ok(persisted) => persisted,
            Err(error) => {
                self.keep_unsaved(placeholder, new_message);
                tracing::error!(correlation_token = %token, %error, "reply kept locally");
                return Err(error);
            }
        };

        let message = ChatMessage::from_record(record);
        if let Some(index) = self.position_of(placeholder) {
            self.messages[index] = message.clone();
        }

        self.gateway
            .touch_conversation(conversation_id)
            .await
            .context(PersistReplySnafu {
                stage: "finalize-touch-conversation",
                token,
            })?;

        tracing::info!(
            correlation_token = %token,
            failed = message.is_failed(),
            "reply finalized"
        );
        Ok(ChunkEffect::Finalized { token, message })
    }

    fn keep_unsaved(&mut self, placeholder: &PlaceholderId, new_message: NewMessage) {
        self.next_local_id += 1;
        let message = ChatMessage {
            key: MessageKey::Local(self.next_local_id),
            role: MessageRole::Assistant,
            content: new_message.content,
            error: new_message.error,
            attachments: Vec::new(),
            status: MessageStatus::Unsaved,
        };
        if let Some(index) = self.position_of(placeholder) {
            self.messages[index] = message;
        }
    }

    async fn ensure_persisted(&mut self, title: &str) -> ReconcileResult<ConversationId> {
        if let ConversationKey::Persisted(conversation_id) = self.key {
            return Ok(conversation_id);
        }

        let conversation = self
            .gateway
            .create_conversation(title)
            .await
            .context(StorageSnafu {
                stage: "promote-conversation",
            })?;
        tracing::info!(conversation_id = %conversation.id, "conversation promoted");
        self.key = ConversationKey::Persisted(conversation.id);
        self.title = Some(conversation.title);
        Ok(conversation.id)
    }

    fn position_of(&self, placeholder: &PlaceholderId) -> Option<usize> {
        self.messages.iter().position(
            |message| matches!(&message.key, MessageKey::Placeholder(id) if id == placeholder),
        )
    }
}

fn message_to_turn(message: &ChatMessage) -> Turn {
    let role = match message.role {
        MessageRole::System => Role::System,
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
    };

    let mut content = message.content.clone();
    let mut images = Vec::new();
    for attachment in &message.attachments {
        match attachment {
            Attachment::Image { data } | Attachment::ScreenCapture { data, .. } => {
                images.push(data.clone());
            }
            Attachment::Pdf {
                filename,
                extracted_text: Some(text),
                ..
            } => {
                content.push_str(&format!("\n\n--- Content from {filename} ---\n{text}"));
            }
            Attachment::Pdf { .. } => {}
        }
    }

    Turn::new(role, content.trim()).with_images(images)
}
