use time::macros::format_description;
use time::{Date, OffsetDateTime};

/// How many characters of the first prompt are carried into the chat title.
pub const TITLE_PROMPT_PREFIX_CHARS: usize = 30;

const TITLE_DATE_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[month repr:short] [day], [year]");

/// Derives the immutable chat title from the first prompt and a creation date.
///
/// Deterministic and pure: the prompt prefix is truncated on a character
/// boundary, never a byte boundary. Uniqueness is carried by the chat id, not
/// the title.
pub fn derive_chat_title(prompt: &str, date: Date) -> String {
    let prefix: String = prompt.chars().take(TITLE_PROMPT_PREFIX_CHARS).collect();
    let formatted_date = date
        .format(TITLE_DATE_FORMAT)
        .unwrap_or_else(|_| date.to_string());
    format!("{prefix} - {formatted_date}")
}

/// Today's date in the local timezone, falling back to UTC when the local
/// offset cannot be determined (sandboxed environments).
pub fn today() -> Date {
    OffsetDateTime::now_local()
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .date()
}
