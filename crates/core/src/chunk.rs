use std::fmt;

use quill_llm::{ProviderMessage, Role};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::ConversationKey;

/// Routing key that ties every chunk of one generation to its request.
///
/// Minted by the caller before any network I/O; a fresh token per submit
/// lets stale chunks be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(Uuid);

impl CorrelationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// One unit delivered over the relay.
///
/// Non-terminal chunks carry a token delta. The terminal chunk carries the
/// full reply on success, or an `error` and no content on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub correlation_token: CorrelationToken,
    #[serde(default)]
    pub content: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamChunk {
    pub fn token(correlation_token: CorrelationToken, content: impl Into<String>) -> Self {
        Self {
            correlation_token,
            content: content.into(),
            is_final: false,
            error: None,
        }
    }

    pub fn completed(correlation_token: CorrelationToken, content: impl Into<String>) -> Self {
        Self {
            correlation_token,
            content: content.into(),
            is_final: true,
            error: None,
        }
    }

    pub fn failed(correlation_token: CorrelationToken, error: impl Into<String>) -> Self {
        Self {
            correlation_token,
            content: String::new(),
            is_final: true,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// An error ends the reply even when `is_final` was not set.
    pub fn is_terminal(&self) -> bool {
        self.is_final || self.is_error()
    }
}

/// One prior exchange handed to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }
}

impl From<Turn> for ProviderMessage {
    fn from(turn: Turn) -> Self {
        ProviderMessage::new(turn.role, turn.content).with_images(turn.images)
    }
}

/// One user submission. `turns` is frozen once the request is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub turns: Vec<Turn>,
    pub correlation_token: CorrelationToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Owning conversation, recorded on the dispatch span. Never sent.
    #[serde(skip)]
    pub conversation: Option<ConversationKey>,
}

impl GenerationRequest {
    pub fn new(correlation_token: CorrelationToken, turns: Vec<Turn>) -> Self {
        Self {
            turns,
            correlation_token,
            model_id: None,
            provider_id: None,
            conversation: None,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn for_conversation(mut self, conversation: ConversationKey) -> Self {
        self.conversation = Some(conversation);
        self
    }
}
