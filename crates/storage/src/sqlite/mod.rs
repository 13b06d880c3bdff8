use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::feed::{FeedHub, MessageFeed, SessionFeed};
use super::ids::{ChatId, MessageId, UserId};
use super::types::{
    ChatRecord, MessageRecord, MessageSender, NewChat, NewMessage, SessionSummary, UserProfile,
};
use super::{BoxFuture, MessageStore, ProfileStore, SessionIndex};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    message_feeds: Arc<FeedHub<ChatId, MessageRecord>>,
    session_feeds: Arc<FeedHub<UserId, SessionSummary>>,
}

impl SqliteStorage {
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

        // Explicit PRAGMA writes make bootstrap behavior deterministic for QA checks.
        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        Ok(Self {
            pool,
            message_feeds: Arc::new(FeedHub::new()),
            session_feeds: Arc::new(FeedHub::new()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_sessions(&self, user_id: UserId) -> StorageResult<Vec<SessionSummary>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT chat_id, title, created_at FROM session_index WHERE user_id = ? ORDER BY created_at DESC, chat_id DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-list-query",
        })?;

        rows.into_iter().map(session_row_to_summary).collect()
    }

    async fn load_messages(&self, chat_id: ChatId) -> StorageResult<Vec<MessageRecord>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, chat_id, seq, sender, body, created_at FROM messages WHERE chat_id = ? ORDER BY seq ASC",
        )
        .bind(chat_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-list-query",
        })?;

        rows.into_iter().map(message_row_to_record).collect()
    }

    async fn require_chat(&self, chat_id: ChatId, stage: &'static str) -> StorageResult<()> {
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM chats WHERE id = ?")
            .bind(chat_id.to_string())
            .fetch_one(&self.pool)
            .await
            .context(SqliteQuerySnafu { stage })?;

        if exists == 0 {
            return NotFoundSnafu {
                stage,
                entity: "chat",
                id: chat_id.to_string(),
            }
            .fail();
        }

        Ok(())
    }
}

impl SessionIndex for SqliteStorage {
    fn create_chat(
        &self,
        user_id: UserId,
        input: NewChat,
    ) -> BoxFuture<'_, StorageResult<ChatRecord>> {
        Box::pin(async move {
            let chat_id = ChatId::new_v7();
            let now = unix_timestamp_seconds();
            let title = input.title;

            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "chat-create-begin",
            })?;

            // The chat record and its index row commit together; a reader never
            // sees a session id in the index without its message container.
            sqlx::query("INSERT INTO chats (id, title, created_at) VALUES (?, ?, ?)")
                .bind(chat_id.to_string())
                .bind(title.clone())
                .bind(now)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chat-create-insert-chat",
                })?;

            sqlx::query(
                "INSERT INTO session_index (user_id, chat_id, title, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(user_id.to_string())
            .bind(chat_id.to_string())
            .bind(title.clone())
            .bind(now)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-create-insert-index",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "chat-create-commit",
            })?;

            let snapshot = self.load_sessions(user_id).await?;
            self.session_feeds.publish(&user_id, snapshot);

            Ok(ChatRecord {
                id: chat_id,
                title,
                created_at_unix_seconds: i64_to_u64(now, "chat-create-created-at")?,
            })
        })
    }

    fn list_sessions(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<Vec<SessionSummary>>> {
        Box::pin(async move { self.load_sessions(user_id).await })
    }

    fn subscribe_sessions(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<SessionFeed>> {
        Box::pin(async move {
            let snapshot = self.load_sessions(user_id).await?;
            Ok(self.session_feeds.subscribe(user_id, snapshot))
        })
    }
}

impl MessageStore for SqliteStorage {
    fn append_message(
        &self,
        chat_id: ChatId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            self.require_chat(chat_id, "message-append-require-chat")
                .await?;

            let message_id = MessageId::new_v7();
            let now = unix_timestamp_seconds();

            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            // Sequence numbers are dense append order; assigned inside the
            // transaction so concurrent writers cannot mint duplicates.
            let seq = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE chat_id = ?",
            )
            .bind(chat_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-next-seq",
            })?;

            sqlx::query(
                "INSERT INTO messages (id, chat_id, seq, sender, body, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(chat_id.to_string())
            .bind(seq)
            .bind(input.sender.as_str())
            .bind(input.body.clone())
            .bind(now)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            let snapshot = self.load_messages(chat_id).await?;
            self.message_feeds.publish(&chat_id, snapshot);

            Ok(MessageRecord {
                id: message_id,
                chat_id,
                seq: i64_to_u64(seq, "message-append-seq")?,
                sender: input.sender,
                body: input.body,
                created_at_unix_seconds: i64_to_u64(now, "message-append-created-at")?,
            })
        })
    }

    fn list_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move { self.load_messages(chat_id).await })
    }

    fn subscribe_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<MessageFeed>> {
        Box::pin(async move {
            self.require_chat(chat_id, "message-subscribe-require-chat")
                .await?;
            let snapshot = self.load_messages(chat_id).await?;
            Ok(self.message_feeds.subscribe(chat_id, snapshot))
        })
    }
}

impl ProfileStore for SqliteStorage {
    fn upsert_profile(&self, profile: UserProfile) -> BoxFuture<'_, StorageResult<UserProfile>> {
        Box::pin(async move {
            let now = unix_timestamp_seconds();
            sqlx::query(
                "INSERT INTO users (id, display_name, email, avatar_url, created_at) VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT (id) DO UPDATE SET display_name = excluded.display_name, email = excluded.email, avatar_url = excluded.avatar_url",
            )
            .bind(profile.id.to_string())
            .bind(profile.display_name.clone())
            .bind(profile.email.clone())
            .bind(profile.avatar_url.clone())
            .bind(now)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "profile-upsert",
            })?;

            Ok(profile)
        })
    }

    fn get_profile(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<Option<UserProfile>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ProfileRow>(
                "SELECT id, display_name, email, avatar_url FROM users WHERE id = ?",
            )
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "profile-get",
            })?;

            row.map(profile_row_to_record).transpose()
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    chat_id: String,
    title: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    chat_id: String,
    seq: i64,
    sender: String,
    body: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct ProfileRow {
    id: String,
    display_name: String,
    email: String,
    avatar_url: Option<String>,
}

fn session_row_to_summary(row: SessionRow) -> StorageResult<SessionSummary> {
    Ok(SessionSummary {
        chat_id: ChatId::parse(&row.chat_id)?,
        title: row.title,
        created_at_unix_seconds: i64_to_u64(row.created_at, "session-row-created-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        chat_id: ChatId::parse(&row.chat_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        sender: MessageSender::parse(&row.sender)?,
        body: row.body,
        created_at_unix_seconds: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn profile_row_to_record(row: ProfileRow) -> StorageResult<UserProfile> {
    Ok(UserProfile {
        id: UserId::parse(&row.id)?,
        display_name: row.display_name,
        email: row.email,
        avatar_url: row.avatar_url,
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    if let Some(parent) = Path::new(database_location).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "ensure-database-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        database_location.to_string()
    } else {
        format!("sqlite://{database_location}")
    }
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    if value < 0 {
        return InvariantViolationSnafu {
            stage,
            details: format!("negative timestamp or sequence value {value}"),
        }
        .fail();
    }

    Ok(value as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    async fn open_memory() -> SqliteStorage {
        SqliteStorage::open("sqlite::memory:")
            .await
            .expect("in-memory sqlite open")
    }

    #[tokio::test]
    async fn chat_creation_registers_index_and_metadata_together() {
        let storage = open_memory().await;
        let user = UserId::new_v7();

        let chat = storage
            .create_chat(
                user,
                NewChat {
                    title: "First chat".to_string(),
                },
            )
            .await
            .expect("create chat");

        let sessions = storage.list_sessions(user).await.expect("list sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].chat_id, chat.id);
        assert_eq!(sessions[0].title, "First chat");

        let chat_title = sqlx::query_scalar::<_, String>("SELECT title FROM chats WHERE id = ?")
            .bind(chat.id.to_string())
            .fetch_one(storage.pool())
            .await
            .expect("chat row present");
        assert_eq!(chat_title, "First chat");
    }

    #[tokio::test]
    async fn session_listing_is_newest_first() {
        let storage = open_memory().await;
        let user = UserId::new_v7();

        let older = storage
            .create_chat(
                user,
                NewChat {
                    title: "older".to_string(),
                },
            )
            .await
            .expect("create older");
        let newer = storage
            .create_chat(
                user,
                NewChat {
                    title: "newer".to_string(),
                },
            )
            .await
            .expect("create newer");

        let sessions = storage.list_sessions(user).await.expect("list sessions");
        let ids = sessions
            .iter()
            .map(|session| session.chat_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn session_listings_are_scoped_per_user() {
        let storage = open_memory().await;
        let user_a = UserId::new_v7();
        let user_b = UserId::new_v7();

        storage
            .create_chat(
                user_a,
                NewChat {
                    title: "mine".to_string(),
                },
            )
            .await
            .expect("create for a");

        let sessions_b = storage.list_sessions(user_b).await.expect("list for b");
        assert!(sessions_b.is_empty());
    }

    #[tokio::test]
    async fn message_append_assigns_dense_append_order() {
        let storage = open_memory().await;
        let user = UserId::new_v7();
        let chat = storage
            .create_chat(
                user,
                NewChat {
                    title: "ordering".to_string(),
                },
            )
            .await
            .expect("create chat");

        storage
            .append_message(chat.id, NewMessage::user("one"))
            .await
            .expect("append one");
        storage
            .append_message(chat.id, NewMessage::bot("two"))
            .await
            .expect("append two");
        storage
            .append_message(chat.id, NewMessage::user("three"))
            .await
            .expect("append three");

        let messages = storage.list_messages(chat.id).await.expect("list");
        let bodies = messages
            .iter()
            .map(|message| message.body.as_str())
            .collect::<Vec<_>>();
        let seqs = messages.iter().map(|message| message.seq).collect::<Vec<_>>();
        assert_eq!(bodies, vec!["one", "two", "three"]);
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn append_to_unknown_chat_is_rejected() {
        let storage = open_memory().await;

        let result = storage
            .append_message(ChatId::new_v7(), NewMessage::user("orphan"))
            .await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn message_feed_delivers_full_snapshot_on_each_append() {
        let storage = open_memory().await;
        let user = UserId::new_v7();
        let chat = storage
            .create_chat(
                user,
                NewChat {
                    title: "feed".to_string(),
                },
            )
            .await
            .expect("create chat");

        let mut feed = storage
            .subscribe_messages(chat.id)
            .await
            .expect("subscribe");
        assert!(feed.snapshot().is_empty());

        storage
            .append_message(chat.id, NewMessage::user("hello"))
            .await
            .expect("append hello");
        let first = feed.changed().await.expect("first delivery");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].body, "hello");

        storage
            .append_message(chat.id, NewMessage::bot("world"))
            .await
            .expect("append world");
        let second = feed.changed().await.expect("second delivery");
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].body, "world");
    }

    #[tokio::test]
    async fn message_feeds_do_not_cross_chats() {
        let storage = open_memory().await;
        let user = UserId::new_v7();
        let chat_a = storage
            .create_chat(
                user,
                NewChat {
                    title: "a".to_string(),
                },
            )
            .await
            .expect("create a");
        let chat_b = storage
            .create_chat(
                user,
                NewChat {
                    title: "b".to_string(),
                },
            )
            .await
            .expect("create b");

        let mut feed_a = storage
            .subscribe_messages(chat_a.id)
            .await
            .expect("subscribe a");

        storage
            .append_message(chat_b.id, NewMessage::user("for b"))
            .await
            .expect("append to b");
        storage
            .append_message(chat_a.id, NewMessage::user("for a"))
            .await
            .expect("append to a");

        let delivery = feed_a.changed().await.expect("a delivery");
        assert_eq!(delivery.len(), 1);
        assert_eq!(delivery[0].body, "for a");
        assert_eq!(delivery[0].chat_id, chat_a.id);
    }

    #[tokio::test]
    async fn session_feed_sees_new_chats() {
        let storage = open_memory().await;
        let user = UserId::new_v7();

        let mut feed = storage
            .subscribe_sessions(user)
            .await
            .expect("subscribe sessions");
        assert!(feed.snapshot().is_empty());

        let chat = storage
            .create_chat(
                user,
                NewChat {
                    title: "fresh".to_string(),
                },
            )
            .await
            .expect("create chat");

        let delivery = feed.changed().await.expect("session delivery");
        assert_eq!(delivery.len(), 1);
        assert_eq!(delivery[0].chat_id, chat.id);
    }

    #[tokio::test]
    async fn profile_upsert_roundtrip_overwrites() {
        let storage = open_memory().await;
        let user = UserId::new_v7();

        storage
            .upsert_profile(UserProfile {
                id: user,
                display_name: "Ada".to_string(),
                email: "ada@example.com".to_string(),
                avatar_url: None,
            })
            .await
            .expect("first upsert");
        storage
            .upsert_profile(UserProfile {
                id: user,
                display_name: "Ada L.".to_string(),
                email: "ada@example.com".to_string(),
                avatar_url: Some("https://example.com/ada.png".to_string()),
            })
            .await
            .expect("second upsert");

        let profile = storage
            .get_profile(user)
            .await
            .expect("get profile")
            .expect("profile present");
        assert_eq!(profile.display_name, "Ada L.");
        assert_eq!(
            profile.avatar_url.as_deref(),
            Some("https://example.com/ada.png")
        );
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!(matches!(
            ChatId::parse("not-a-valid-uuid"),
            Err(StorageError::InvalidId { .. })
        ));
        assert!(matches!(
            MessageId::parse("not-a-valid-uuid"),
            Err(StorageError::InvalidId { .. })
        ));
        assert!(matches!(
            UserId::parse("not-a-valid-uuid"),
            Err(StorageError::InvalidId { .. })
        ));
    }
}
