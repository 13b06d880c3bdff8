pub mod error;
pub mod feed;
pub mod ids;
pub mod sqlite;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use error::{StorageError, StorageResult};
pub use feed::{MessageFeed, SessionFeed, SnapshotFeed};
pub use ids::{ChatId, MessageId, UserId};
pub use sqlite::SqliteStorage;
pub use types::{
    ChatRecord, MessageRecord, MessageSender, NewChat, NewMessage, SessionSummary, UserProfile,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-user chat history index.
///
/// `create_chat` registers the index row and the chat's own metadata record
/// as one unit: a reader never observes a chat id in the index without its
/// message container existing, nor vice versa.
pub trait SessionIndex: Send + Sync {
    fn create_chat(&self, user_id: UserId, input: NewChat)
    -> BoxFuture<'_, StorageResult<ChatRecord>>;
    fn list_sessions(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<Vec<SessionSummary>>>;
    fn subscribe_sessions(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<SessionFeed>>;
}

/// Append-only per-chat message log with full-snapshot change feeds.
pub trait MessageStore: Send + Sync {
    fn append_message(
        &self,
        chat_id: ChatId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;
    fn list_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
    fn subscribe_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<MessageFeed>>;
}

/// One-shot user profile records; no subscription surface.
pub trait ProfileStore: Send + Sync {
    fn upsert_profile(&self, profile: UserProfile) -> BoxFuture<'_, StorageResult<UserProfile>>;
    fn get_profile(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<Option<UserProfile>>>;
}

pub trait Storage: SessionIndex + MessageStore + ProfileStore {}

impl<T> Storage for T where T: SessionIndex + MessageStore + ProfileStore {}
