use murmur_storage::{ChatId, MessageRecord, SessionSummary, UserProfile};

use crate::message::ChatMessage;

/// What the presentation layer should display.
///
/// `Welcome` (no chat selected) and an empty `Conversation` are distinct
/// states on purpose: an empty real chat still shows its conversation frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    #[default]
    Welcome,
    Conversation(ChatId),
}

/// Observable controller state; republished on every relevant change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ViewState {
    pub mode: DisplayMode,
    /// Newest-first chat history for the signed-in user.
    pub sessions: Vec<SessionSummary>,
    /// Merged view of the active chat: persisted history plus the single
    /// in-flight placeholder, in that order.
    pub messages: Vec<ChatMessage>,
    pub profile: Option<UserProfile>,
}

impl ViewState {
    pub fn active_chat(&self) -> Option<ChatId> {
        match self.mode {
            DisplayMode::Welcome => None,
            DisplayMode::Conversation(chat_id) => Some(chat_id),
        }
    }
}

/// Pure merged-view derivation: history in append order, then the
/// placeholder when one is live for the displayed chat.
pub fn merged_view(
    persisted: &[MessageRecord],
    placeholder: Option<&ChatMessage>,
) -> Vec<ChatMessage> {
    let mut merged = persisted
        .iter()
        .map(ChatMessage::from_record)
        .collect::<Vec<_>>();

    if let Some(placeholder) = placeholder {
        merged.push(placeholder.clone());
    }

    merged
}
