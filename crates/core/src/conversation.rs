use std::fmt;

use quill_storage::{Attachment, ConversationId, MessageId, MessageRecord, MessageRole};
use uuid::Uuid;

use crate::chunk::CorrelationToken;

/// Reserved prefix of locally minted message ids.
pub const PLACEHOLDER_PREFIX: &str = "temp_";

/// Content shown in a placeholder before the first token arrives.
pub const TYPING_SENTINEL: &str = "▋";

/// Title length taken from the first prompt when a conversation is promoted.
pub const TITLE_PREFIX_CHARS: usize = 40;

/// Which store, if any, a conversation lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    /// Not yet written; promoted on its first user message.
    Temporary(Uuid),
    Persisted(ConversationId),
}

impl ConversationKey {
    pub fn temporary() -> Self {
        Self::Temporary(Uuid::new_v4())
    }

    pub fn persisted_id(&self) -> Option<ConversationId> {
        match self {
            Self::Persisted(id) => Some(*id),
            Self::Temporary(_) => None,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temporary(raw) => write!(formatter, "temp-{raw}"),
            Self::Persisted(id) => write!(formatter, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlaceholderId(String);

impl PlaceholderId {
    pub fn for_token(token: CorrelationToken) -> Self {
        Self(format!("{PLACEHOLDER_PREFIX}{token}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlaceholderId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Identity of one entry in the visible message list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Placeholder(PlaceholderId),
    Persisted(MessageId),
    /// Kept in memory only, after the store refused it.
    Local(u64),
}

impl MessageKey {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Placeholder waiting for its first token.
    Typing,
    Streaming,
    Done,
    Error,
    /// Finalized locally because persisting failed.
    Unsaved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub key: MessageKey,
    pub role: MessageRole,
    pub content: String,
    pub error: Option<String>,
    pub attachments: Vec<Attachment>,
    pub status: MessageStatus,
}

impl ChatMessage {
    pub fn placeholder(id: PlaceholderId) -> Self {
        Self {
            key: MessageKey::Placeholder(id),
            role: MessageRole::Assistant,
            content: TYPING_SENTINEL.to_string(),
            error: None,
            attachments: Vec::new(),
            status: MessageStatus::Typing,
        }
    }

    pub fn from_record(record: MessageRecord) -> Self {
        let status = if record.is_error() {
            MessageStatus::Error
        } else {
            MessageStatus::Done
        };

        Self {
            key: MessageKey::Persisted(record.id),
            role: record.role,
            content: record.content,
            error: record.error,
            attachments: record.attachments,
            status,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.key.is_placeholder()
    }

    /// Failed replies stay visible but never go back to a provider.
    pub fn is_failed(&self) -> bool {
        self.error.is_some() || matches!(self.status, MessageStatus::Error | MessageStatus::Unsaved)
    }
}

/// Title for a conversation promoted by its first prompt.
pub fn title_from_prompt(prompt: &str) -> String {
    let prompt = prompt.trim();
    let mut title = prompt.chars().take(TITLE_PREFIX_CHARS).collect::<String>();
    if prompt.chars().count() > TITLE_PREFIX_CHARS {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_ids_carry_the_reserved_prefix() {
        let token = CorrelationToken::new();
        let id = PlaceholderId::for_token(token);
        assert!(id.as_str().starts_with("temp_"));
        assert!(id.as_str().ends_with(&token.to_string()));

        let message = ChatMessage::placeholder(id);
        assert_eq!(message.content, "▋");
        assert_eq!(message.role, MessageRole::Assistant);
        assert_eq!(message.status, MessageStatus::Typing);
    }

    #[test]
    fn long_prompts_are_truncated_into_titles() {
        assert_eq!(title_from_prompt("  short  "), "short");

        let long = "é".repeat(45);
        let title = title_from_prompt(&long);
        assert_eq!(title.chars().count(), 43);
        assert!(title.ends_with("..."));
    }
}
