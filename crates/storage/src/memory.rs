use std::collections::HashMap;

use futures::future::BoxFuture;
use snafu::ensure;
use tokio::sync::RwLock;

use super::error::{NotFoundSnafu, StorageResult};
use super::ids::{ConversationId, MessageId};
use super::types::{ConversationRecord, MessageRecord, NewMessage};
use super::{PersistenceGateway, normalized_title, unix_timestamp_seconds};

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, ConversationRecord>,
    messages: Vec<MessageRecord>,
    touches: HashMap<ConversationId, u64>,
}

/// Process-local store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `touch_conversation` calls seen for one conversation.
    pub async fn touch_count(&self, conversation_id: ConversationId) -> u64 {
        self.state
            .read()
            .await
            .touches
            .get(&conversation_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }
}

impl PersistenceGateway for MemoryStore {
    fn create_conversation<'a>(
        &'a self,
        title: &'a str,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let now = unix_timestamp_seconds();
            let record = ConversationRecord {
                id: ConversationId::new_v7(),
                title: normalized_title(title),
                created_at_unix_seconds: now,
                updated_at_unix_seconds: now,
            };
            self.state
                .write()
                .await
                .conversations
                .insert(record.id, record.clone());
            Ok(record)
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .conversations
                .get(&conversation_id)
                .cloned())
        })
    }

    fn conversation_exists(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<bool>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .conversations
                .contains_key(&conversation_id))
        })
    }

    fn create_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            ensure!(
                state.conversations.contains_key(&conversation_id),
                NotFoundSnafu {
                    stage: "memory-create-message",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
            );

            let record = MessageRecord {
                id: MessageId::new_v7(),
                conversation_id,
                role: input.role,
                content: input.stored_content(),
                error: input.error,
                attachments: input.attachments,
                created_at_unix_seconds: unix_timestamp_seconds(),
            };
            state.messages.push(record.clone());
            Ok(record)
        })
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .messages
                .iter()
                .filter(|message| message.conversation_id == conversation_id)
                .cloned()
                .collect())
        })
    }

    fn touch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let Some(conversation) = state.conversations.get_mut(&conversation_id) else {
                return NotFoundSnafu {
                    stage: "memory-touch-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            };
            conversation.updated_at_unix_seconds = unix_timestamp_seconds();
            *state.touches.entry(conversation_id).or_default() += 1;
            Ok(())
        })
    }
}
