use std::io::Write;
use std::sync::Arc;

use quill_core::{
    ChatMessage, ChunkEffect, ChunkRelay, ConversationReconciler, DefaultProviderFactory,
    GenerationDispatcher, MessageStatus, ReconcileError, SettingsError, SettingsStore,
};
use quill_llm::{ProviderError, create_provider};
use quill_storage::{ConversationId, MessageRole, PersistenceGateway, StorageError};
use snafu::{ResultExt, Snafu};

use crate::command::{Command, HELP};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to open the conversation database: {source}"))]
    OpenDatabase { source: StorageError },
    #[snafu(display("invalid conversation id `{raw}`: {source}"))]
    ConversationId { raw: String, source: StorageError },
    #[snafu(display("{source}"))]
    Reconcile {
        stage: &'static str,
        source: ReconcileError,
    },
    #[snafu(display("failed to save settings: {source}"))]
    Settings { source: SettingsError },
    #[snafu(display("no provider is configured for the default model"))]
    NoProvider,
    #[snafu(display("model list unavailable: {source}"))]
    Models { source: ProviderError },
    #[snafu(display("terminal I/O failed on `{stage}`: {source}"))]
    Io {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// One terminal chat: the active conversation plus the shared pipeline.
pub struct ChatSession {
    settings: SettingsStore,
    gateway: Arc<dyn PersistenceGateway>,
    dispatcher: GenerationDispatcher,
    conversation: ConversationReconciler,
}

impl ChatSession {
    pub fn new(settings: SettingsStore, gateway: Arc<dyn PersistenceGateway>) -> Self {
        let dispatcher = GenerationDispatcher::new(
            settings.source(),
            Arc::new(DefaultProviderFactory),
            ChunkRelay::new(),
        );
        let conversation = ConversationReconciler::new(gateway.clone())
            .with_history_limit(settings.settings().history_limit());

        Self {
            settings,
            gateway,
            dispatcher,
            conversation,
        }
    }

    pub async fn handle<W: Write>(&mut self, command: Command, out: &mut W) -> AppResult<Flow> {
        match command {
            Command::Empty => {}
            Command::Prompt(prompt) => self.send(&prompt, out).await?,
            Command::NewConversation => {
                self.conversation = self.fresh_conversation();
                writeln!(out, "started a new conversation").context(IoSnafu { stage: "new" })?;
            }
            Command::OpenConversation(raw) => self.open(&raw, out).await?,
            Command::ListModels => self.list_models(out).await?,
            Command::SelectModel(model_id) => {
                let label = model_id.clone().unwrap_or_else(|| "default".to_string());
                self.conversation.set_model(None, model_id);
                writeln!(out, "model: {label}").context(IoSnafu {
                    stage: "select-model",
                })?;
            }
            Command::SetDefaultModel(model_id) => {
                let mut settings = (*self.settings.settings()).clone();
                settings.default_chat_model_id = Some(model_id.clone());
                self.settings.update(settings).context(SettingsSnafu)?;
                writeln!(out, "default model saved: {model_id}").context(IoSnafu {
                    stage: "set-default-model",
                })?;
            }
            Command::Help => writeln!(out, "{HELP}").context(IoSnafu { stage: "help" })?,
            Command::Quit => return Ok(Flow::Quit),
            Command::Unknown(line) => writeln!(out, "unknown command `{line}`, try /help")
                .context(IoSnafu { stage: "unknown" })?,
        }
        Ok(Flow::Continue)
    }

    fn fresh_conversation(&self) -> ConversationReconciler {
        ConversationReconciler::new(self.gateway.clone())
            .with_history_limit(self.settings.settings().history_limit())
    }

    async fn send<W: Write>(&mut self, prompt: &str, out: &mut W) -> AppResult<()> {
        let mut submission = self
            .conversation
            .submit(&self.dispatcher, prompt, Vec::new())
            .await
            .context(ReconcileSnafu { stage: "submit" })?;

        // The first write failure is reported after the reply is saved.
        let mut printed = 0;
        let mut write_error = None;
        let driven = self
            .conversation
            .drive(&mut submission.receiver, |effect| {
                let written = match effect {
                    ChunkEffect::Streamed { content, .. } => {
                        let written = write!(out, "{}", &content[printed..]).and_then(|()| out.flush());
                        printed = content.len();
                        written
                    }
                    ChunkEffect::Finalized { message, .. } => match &message.error {
                        Some(error) => writeln!(out, "\n[error] {error}"),
                        None if printed == 0 => writeln!(out, "{}", message.content),
                        None => writeln!(out),
                    },
                    ChunkEffect::Ignored => Ok(()),
                };
                if let Err(error) = written {
                    write_error.get_or_insert(error);
                }
            })
            .await;

        match driven {
            Ok(()) => {}
            Err(error @ ReconcileError::PersistReply { .. }) => {
                tracing::warn!(%error, "reply shown but not saved");
                writeln!(out, "[unsaved] {error}").context(IoSnafu {
                    stage: "report-unsaved",
                })?;
            }
            Err(source) => {
                return Err(AppError::Reconcile {
                    stage: "drive",
                    source,
                });
            }
        }

        match write_error {
            Some(source) => Err(AppError::Io {
                stage: "stream-output",
                source,
            }),
            None => Ok(()),
        }
    }

    async fn open<W: Write>(&mut self, raw: &str, out: &mut W) -> AppResult<()> {
        let conversation_id =
            ConversationId::parse(raw).context(ConversationIdSnafu { raw: raw.to_string() })?;
        let conversation = ConversationReconciler::open(self.gateway.clone(), conversation_id)
            .await
            .context(ReconcileSnafu { stage: "open" })?
            .with_history_limit(self.settings.settings().history_limit());

        writeln!(out, "# {}", conversation.title().unwrap_or_default())
            .context(IoSnafu { stage: "open-title" })?;
        for message in conversation.messages() {
            writeln!(out, "{}", render_message(message)).context(IoSnafu {
                stage: "open-history",
            })?;
        }
        self.conversation = conversation;
        Ok(())
    }

    async fn list_models<W: Write>(&self, out: &mut W) -> AppResult<()> {
        let settings = self.settings.settings();
        let config = settings
            .default_provider()
            .and_then(|provider| provider.to_provider_config())
            .ok_or(AppError::NoProvider)?;
        let provider = create_provider(config).context(ModelsSnafu)?;
        let catalog = provider.fetch_models().await.context(ModelsSnafu)?;

        if let Some(warning) = &catalog.warning {
            writeln!(out, "[warning] {warning}").context(IoSnafu { stage: "models" })?;
        }
        let default_model = settings.default_chat_model_id.as_deref();
        for model_id in catalog.model_ids() {
            let marker = if Some(model_id) == default_model { "*" } else { " " };
            writeln!(out, "{marker} {model_id}").context(IoSnafu { stage: "models" })?;
        }
        Ok(())
    }
}

fn render_message(message: &ChatMessage) -> String {
    let speaker = match message.role {
        MessageRole::System => "system",
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
    };
    match (&message.error, message.status) {
        (Some(error), _) => format!("{speaker}: [error] {error}"),
        (None, MessageStatus::Unsaved) => format!("{speaker} (unsaved): {}", message.content),
        (None, _) => format!("{speaker}: {}", message.content),
    }
}
