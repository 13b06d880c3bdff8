use super::error::{InvariantViolationSnafu, StorageResult};
use super::ids::{ChatId, MessageId, UserId};

/// Storage-local sender tag, intentionally decoupled from controller-layer enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageSender {
    User,
    Bot,
}

impl MessageSender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bot => "bot",
        }
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        match raw {
            "user" => Ok(Self::User),
            "bot" => Ok(Self::Bot),
            other => InvariantViolationSnafu {
                stage: "parse-message-sender",
                details: format!("unknown sender tag '{other}'"),
            }
            .fail(),
        }
    }
}

/// The chat's own metadata record; anchors the per-chat message container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
    pub id: ChatId,
    pub title: String,
    pub created_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChat {
    pub title: String,
}

/// One row of a user's chat history listing, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub chat_id: ChatId,
    pub title: String,
    pub created_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub chat_id: ChatId,
    // Append order within the chat; the wall-clock timestamp below is informational only.
    pub seq: u64,
    pub sender: MessageSender,
    pub body: String,
    pub created_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: MessageSender,
    pub body: String,
}

impl NewMessage {
    pub fn user(body: impl Into<String>) -> Self {
        Self {
            sender: MessageSender::User,
            body: body.into(),
        }
    }

    pub fn bot(body: impl Into<String>) -> Self {
        Self {
            sender: MessageSender::Bot,
            body: body.into(),
        }
    }
}

/// Profile data shown in the presentation header; fetched one-shot, not subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    pub avatar_url: Option<String>,
}
