pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

use futures::future::BoxFuture;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
    Attachment, ConversationRecord, DEFAULT_CONVERSATION_TITLE, MessageRecord, MessageRole,
    NewMessage,
};

/// Durable conversation store consumed by the streaming pipeline.
///
/// `create_message` validates that the conversation exists and fails with
/// [`StorageError::NotFound`] otherwise. It does not bump the conversation
/// timestamp; callers decide when to `touch_conversation`.
pub trait PersistenceGateway: Send + Sync {
    fn create_conversation<'a>(
        &'a self,
        title: &'a str,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>>;

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>>;

    fn conversation_exists(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<bool>>;

    fn create_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;

    fn touch_conversation(&self, conversation_id: ConversationId)
    -> BoxFuture<'_, StorageResult<()>>;
}

pub(crate) fn unix_timestamp_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

pub(crate) fn normalized_title(title: &str) -> String {
    let title = title.trim();
    if title.is_empty() {
        DEFAULT_CONVERSATION_TITLE.to_string()
    } else {
        title.to_string()
    }
}
