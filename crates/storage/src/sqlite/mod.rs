use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use futures::future::BoxFuture;
use snafu::{ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, DecodeAttachmentsSnafu, EncodeAttachmentsSnafu,
    InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::types::{Attachment, ConversationRecord, MessageRecord, MessageRole, NewMessage};
use super::{PersistenceGateway, normalized_title, unix_timestamp_seconds};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at a path or `sqlite:` URL and
    /// applies pending migrations.
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        Self::migrate(pool, database_url).await
    }

    /// A private in-memory database. The single pooled connection is never
    /// recycled, otherwise the data would vanish with it.
    pub async fn open_in_memory() -> StorageResult<Self> {
        let database_url = "sqlite::memory:".to_string();
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-memory-parse-url",
                database_url: database_url.clone(),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-memory-connect",
                database_url: database_url.clone(),
            })?;

        Self::migrate(pool, database_url).await
    }

    async fn migrate(pool: SqlitePool, database_url: String) -> StorageResult<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite store ready");
        Ok(Self { pool, database_url })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn exists(&self, conversation_id: ConversationId) -> StorageResult<bool> {
        let existing =
            sqlx::query_scalar::<_, i64>("SELECT 1 FROM conversations WHERE id = ? LIMIT 1")
                .bind(conversation_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-exists-query",
                })?;

        Ok(existing.is_some())
    }
}

impl PersistenceGateway for SqliteStore {
    fn create_conversation<'a>(
        &'a self,
        title: &'a str,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let id = ConversationId::new_v7();
            let title = normalized_title(title);
            let now = unix_timestamp_seconds();
            let now_sql = u64_to_i64(now, "create-conversation-timestamp")?;

            sqlx::query(
                "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(id.to_string())
            .bind(&title)
            .bind(now_sql)
            .bind(now_sql)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "create-conversation-insert",
            })?;

            Ok(ConversationRecord {
                id,
                title,
                created_at_unix_seconds: now,
                updated_at_unix_seconds: now,
            })
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?",
            )
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "get-conversation-query",
            })?;

            row.map(conversation_row_to_record).transpose()
        })
    }

    fn conversation_exists(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<bool>> {
        Box::pin(self.exists(conversation_id))
    }

    fn create_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            ensure!(
                self.exists(conversation_id).await?,
                NotFoundSnafu {
                    stage: "create-message-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
            );

            let id = MessageId::new_v7();
            let content = input.stored_content();
            let now = unix_timestamp_seconds();
            let attachments = encode_attachments(&input.attachments)?;

            sqlx::query(
                "INSERT INTO messages (id, conversation_id, role, content, error, attachments, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id.to_string())
            .bind(conversation_id.to_string())
            .bind(role_to_sql(input.role))
            .bind(&content)
            .bind(input.error.as_deref())
            .bind(attachments)
            .bind(u64_to_i64(now, "create-message-timestamp")?)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "create-message-insert",
            })?;

            Ok(MessageRecord {
                id,
                conversation_id,
                role: input.role,
                content,
                error: input.error,
                attachments: input.attachments,
                created_at_unix_seconds: now,
            })
        })
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, conversation_id, role, content, error, attachments, created_at \
                 FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
            )
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "list-messages-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn touch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let now = u64_to_i64(unix_timestamp_seconds(), "touch-conversation-timestamp")?;
            let result = sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(conversation_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "touch-conversation-update",
                })?;

            ensure!(
                result.rows_affected() > 0,
                NotFoundSnafu {
                    stage: "touch-conversation-update",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
            );
            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    error: Option<String>,
    attachments: Option<String>,
    created_at: i64,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        created_at_unix_seconds: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        error: row.error,
        attachments: decode_attachments(row.attachments.as_deref())?,
        created_at_unix_seconds: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn encode_attachments(attachments: &[Attachment]) -> StorageResult<Option<String>> {
    if attachments.is_empty() {
        return Ok(None);
    }

    serde_json::to_string(attachments)
        .map(Some)
        .context(EncodeAttachmentsSnafu {
            stage: "create-message-attachments",
        })
}

fn decode_attachments(raw: Option<&str>) -> StorageResult<Vec<Attachment>> {
    match raw {
        None | Some("") => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(raw).context(DecodeAttachmentsSnafu {
            stage: "message-row-attachments",
        }),
    }
}

fn role_to_sql(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "system" => Ok(MessageRole::System),
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_locations_normalize_to_sqlite_urls() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_database_url("sqlite://already.db"),
            "sqlite://already.db"
        );
        assert_eq!(
            normalize_database_url("/tmp/quill/chat.db"),
            "sqlite:///tmp/quill/chat.db"
        );
    }

    #[test]
    fn unknown_roles_are_invariant_violations() {
        let error = role_from_sql("tool").unwrap_err();
        assert!(matches!(error, StorageError::InvariantViolation { .. }));
    }

    #[tokio::test]
    async fn conversations_round_trip() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let created = store.create_conversation("Weekend plans").await.unwrap();

        let loaded = store.get_conversation(created.id).await.unwrap().unwrap();
        assert_eq!(loaded, created);
        assert!(store.conversation_exists(created.id).await.unwrap());
        assert!(
            !store
                .conversation_exists(ConversationId::new_v7())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn messages_keep_order_errors_and_attachments() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let conversation = store.create_conversation("").await.unwrap();
        assert_eq!(conversation.title, "New Conversation");

        let image = Attachment::Image {
            data: "iVBORw0KGgo=".to_string(),
        };
        store
            .create_message(
                conversation.id,
                NewMessage::user(" describe this ").with_attachments(vec![image.clone()]),
            )
            .await
            .unwrap();
        store
            .create_message(conversation.id, NewMessage::assistant_error("rate limited"))
            .await
            .unwrap();
        store
            .create_message(conversation.id, NewMessage::assistant("A cat.\n\n```\n  =^.^=\n```\n"))
            .await
            .unwrap();

        let messages = store.list_messages(conversation.id).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "describe this");
        assert_eq!(messages[0].attachments, vec![image]);
        assert!(messages[1].is_error());
        assert_eq!(messages[1].error.as_deref(), Some("rate limited"));
        assert_eq!(messages[2].content, "A cat.\n\n```\n  =^.^=\n```\n");
        assert!(messages[2].attachments.is_empty());
    }

    #[tokio::test]
    async fn messages_for_unknown_conversations_are_rejected() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let error = store
            .create_message(ConversationId::new_v7(), NewMessage::assistant("orphan"))
            .await
            .unwrap_err();
        assert!(error.is_not_found());

        let error = store
            .touch_conversation(ConversationId::new_v7())
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn creating_messages_does_not_touch_the_conversation() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let conversation = store.create_conversation("t").await.unwrap();
        sqlx::query("UPDATE conversations SET updated_at = 1 WHERE id = ?")
            .bind(conversation.id.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        store
            .create_message(conversation.id, NewMessage::user("hello"))
            .await
            .unwrap();
        let untouched = store.get_conversation(conversation.id).await.unwrap().unwrap();
        assert_eq!(untouched.updated_at_unix_seconds, 1);

        store.touch_conversation(conversation.id).await.unwrap();
        let touched = store.get_conversation(conversation.id).await.unwrap().unwrap();
        assert!(touched.updated_at_unix_seconds > 1);
    }

    #[tokio::test]
    async fn file_backed_store_creates_parent_directories() {
        let root = std::env::temp_dir().join(format!("quill-storage-{}", MessageId::new_v7()));
        let path = root.join("nested").join("chat.db");
        let location = path.display().to_string();

        let store = SqliteStore::open(&location).await.unwrap();
        let conversation = store.create_conversation("persisted").await.unwrap();
        drop(store);

        let reopened = SqliteStore::open(&location).await.unwrap();
        assert!(reopened.conversation_exists(conversation.id).await.unwrap());
        drop(reopened);
        let _ = std::fs::remove_dir_all(root);
    }
}
