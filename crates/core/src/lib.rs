#![deny(unsafe_code)]

/// Wire types shared by the dispatcher, relay and reconciler.
pub mod chunk;
pub mod conversation;
/// Resolves provider settings and turns provider events into chunks.
pub mod dispatcher;
/// Per-conversation placeholder lifecycle.
pub mod reconciler;
pub mod relay;
/// Settings persistence.
pub mod settings;

pub use chunk::{CorrelationToken, GenerationRequest, StreamChunk, Turn};
pub use conversation::{
    ChatMessage, ConversationKey, MessageKey, MessageStatus, PLACEHOLDER_PREFIX, PlaceholderId,
    TYPING_SENTINEL,
};
pub use dispatcher::{
    DefaultProviderFactory, DispatchError, DispatchHandle, DispatchOutcome, DispatchResult,
    GenerationDispatcher, ProviderFactory, ResolvedTarget, resolve_target,
};
pub use reconciler::{
    ChunkEffect, ConversationReconciler, ReconcileError, ReconcileResult, ReplyPhase, Submission,
};
pub use relay::{ChunkReceiver, ChunkRelay, Subscription};
pub use settings::{
    AppSettings, ConversationSettings, ProviderSettings, SettingsError, SettingsSource,
    SettingsStore,
};
