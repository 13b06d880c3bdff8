pub mod controller;
pub mod events;
pub mod identity;
pub mod message;
pub mod settings;
pub mod title;
pub mod view;

pub use controller::{ChatController, ControllerDeps, ControllerHandle};
pub use events::{Command, Notice};
pub use identity::{Identity, StaticIdentity};
pub use message::{ChatMessage, Sender, StreamKey, TurnId, TurnPhase, TurnTransition};
pub use settings::{AppSettings, SettingsStore, environment_provider_config};
pub use title::{TITLE_PROMPT_PREFIX_CHARS, derive_chat_title};
pub use view::{DisplayMode, ViewState, merged_view};
