use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId};

/// Title given to conversations created without one.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Storage-local message role, decoupled from provider role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Binary payloads captured alongside a user prompt. `data` is base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Attachment {
    Image {
        data: String,
    },
    Pdf {
        data: String,
        filename: String,
        #[serde(rename = "extractedText", default, skip_serializing_if = "Option::is_none")]
        extracted_text: Option<String>,
    },
    ScreenCapture {
        data: String,
        #[serde(rename = "sourceId")]
        source_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub created_at_unix_seconds: u64,
    pub updated_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    pub error: Option<String>,
    pub attachments: Vec<Attachment>,
    pub created_at_unix_seconds: u64,
}

impl MessageRecord {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub error: Option<String>,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
            error: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// An assistant reply that failed; content stays empty.
    pub fn assistant_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::assistant(String::new())
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Content as stored: prompts are trimmed, replies are kept verbatim.
    pub(crate) fn stored_content(&self) -> String {
        match self.role {
            MessageRole::User => self.content.trim().to_string(),
            MessageRole::System | MessageRole::Assistant => self.content.clone(),
        }
    }
}
