use std::fmt;

use murmur_storage::ChatId;

/// Presentation-facing command surface of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Activates the given chat, or shows the welcome state when `None`.
    SelectChat(Option<ChatId>),
    /// Sends one prompt to the active chat, creating it when none is active.
    SendPrompt(String),
    /// Deactivates the current chat so the next send starts a fresh one.
    NewChat,
    /// Stops the controller task; in-flight streams are cancelled.
    Shutdown,
}

/// Transient, non-fatal notice surfaced to the presentation layer.
///
/// Every failure is local to the operation that raised it; the controller
/// stays usable after any of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The prompt was blank after trimming; nothing was sent.
    EmptyPrompt,
    /// No identity is present; persistence-backed operations are refused.
    NotSignedIn,
    /// A reply is already streaming; the new prompt was rejected.
    Busy,
    /// No response provider is configured.
    ProviderNotConfigured,
    /// Session creation or message persistence failed; the send was aborted.
    Persistence(String),
    /// The provider stream failed mid-reply; the partial text was discarded.
    Stream(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPrompt => write!(formatter, "message is empty"),
            Self::NotSignedIn => write!(formatter, "sign in to start chatting"),
            Self::Busy => write!(formatter, "a reply is still in progress"),
            Self::ProviderNotConfigured => {
                write!(formatter, "no response provider is configured")
            }
            Self::Persistence(details) => write!(formatter, "could not save: {details}"),
            Self::Stream(details) => write!(formatter, "reply failed: {details}"),
        }
    }
}
