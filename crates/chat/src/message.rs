use murmur_storage::{ChatId, MessageId, MessageRecord, MessageSender};

/// Identifier for one prompt/reply turn.
///
/// This must change on every send so stale stream events can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    /// Creates a typed turn identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Stream routing key used for stale-event rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub chat_id: ChatId,
    pub turn: TurnId,
}

impl StreamKey {
    /// Builds a full stream key from the originating chat and turn IDs.
    pub const fn new(chat_id: ChatId, turn: TurnId) -> Self {
        Self { chat_id, turn }
    }
}

/// Chat speaker as rendered by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    User,
    Bot,
}

impl From<MessageSender> for Sender {
    fn from(value: MessageSender) -> Self {
        match value {
            MessageSender::User => Self::User,
            MessageSender::Bot => Self::Bot,
        }
    }
}

/// One entry of the merged conversation view.
///
/// Persisted entries always carry `streaming: false`; the single in-flight
/// placeholder is the only entry that may carry `streaming: true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: Sender,
    pub body: String,
    pub timestamp_unix_seconds: u64,
    pub streaming: bool,
}

impl ChatMessage {
    pub fn from_record(record: &MessageRecord) -> Self {
        Self {
            sender: record.sender.into(),
            body: record.body.clone(),
            timestamp_unix_seconds: record.created_at_unix_seconds,
            streaming: false,
        }
    }

    /// Builds the in-flight placeholder with the complete-so-far reply text.
    pub fn streaming_placeholder(body: impl Into<String>) -> Self {
        Self {
            sender: Sender::Bot,
            body: body.into(),
            timestamp_unix_seconds: 0,
            streaming: true,
        }
    }
}

/// Turn lifecycle boundary for the controller.
///
/// `AwaitingPersist` covers the window between the final reply being written
/// to the store and the store snapshot that contains it arriving: the
/// placeholder stays authoritative through that window so a reader moves
/// straight from placeholder text to identical persisted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    Streaming(StreamKey),
    AwaitingPersist {
        key: StreamKey,
        message_id: MessageId,
    },
}

/// State transition input for the turn lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnTransition {
    Start(StreamKey),
    Persisted { key: StreamKey, message_id: MessageId },
    Observed { key: StreamKey, message_id: MessageId },
    Fail(StreamKey),
}

/// Rejection reason for illegal turn transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnRejection {
    AlreadyActive {
        active: StreamKey,
        attempted: StreamKey,
    },
    NoActiveTurn,
    KeyMismatch {
        active: StreamKey,
        attempted: StreamKey,
    },
}

pub type TurnTransitionResult = Result<TurnPhase, TurnRejection>;

impl TurnPhase {
    /// Returns the key of the turn currently accepting fragments, if any.
    pub fn streaming_key(&self) -> Option<StreamKey> {
        match self {
            Self::Streaming(key) => Some(*key),
            Self::Idle | Self::AwaitingPersist { .. } => None,
        }
    }

    /// Returns the key whose placeholder is still authoritative, if any.
    pub fn placeholder_key(&self) -> Option<StreamKey> {
        match self {
            Self::Streaming(key) => Some(*key),
            Self::AwaitingPersist { key, .. } => Some(*key),
            Self::Idle => None,
        }
    }

    /// Returns true when incoming stream data matches the active turn.
    pub fn accepts_stream_event(&self, key: StreamKey) -> bool {
        matches!(self, Self::Streaming(active) if *active == key)
    }

    /// Applies one transition deterministically.
    ///
    /// Only `Idle` may start a turn; `Persisted`/`Fail` must match the
    /// streaming turn exactly; `Observed` must match the awaited message.
    pub fn apply(&self, transition: TurnTransition) -> TurnTransitionResult {
        match transition {
            TurnTransition::Start(key) => self.apply_start(key),
            TurnTransition::Persisted { key, message_id } => self.apply_persisted(key, message_id),
            TurnTransition::Observed { key, message_id } => self.apply_observed(key, message_id),
            TurnTransition::Fail(key) => self.apply_fail(key),
        }
    }

    fn apply_start(&self, key: StreamKey) -> TurnTransitionResult {
        match self {
            Self::Idle => Ok(Self::Streaming(key)),
            Self::Streaming(active) => Err(TurnRejection::AlreadyActive {
                active: *active,
                attempted: key,
            }),
            Self::AwaitingPersist { key: active, .. } => Err(TurnRejection::AlreadyActive {
                active: *active,
                attempted: key,
            }),
        }
    }

    fn apply_persisted(&self, key: StreamKey, message_id: MessageId) -> TurnTransitionResult {
        match self {
            Self::Streaming(active) if *active == key => {
                Ok(Self::AwaitingPersist { key, message_id })
            }
            Self::Streaming(active) => Err(TurnRejection::KeyMismatch {
                active: *active,
                attempted: key,
            }),
            Self::Idle | Self::AwaitingPersist { .. } => Err(TurnRejection::NoActiveTurn),
        }
    }

    fn apply_observed(&self, key: StreamKey, message_id: MessageId) -> TurnTransitionResult {
        match self {
            Self::AwaitingPersist {
                key: active,
                message_id: awaited,
            } if *active == key && *awaited == message_id => Ok(Self::Idle),
            Self::AwaitingPersist { key: active, .. } => Err(TurnRejection::KeyMismatch {
                active: *active,
                attempted: key,
            }),
            Self::Idle | Self::Streaming(_) => Err(TurnRejection::NoActiveTurn),
        }
    }

    fn apply_fail(&self, key: StreamKey) -> TurnTransitionResult {
        match self {
            Self::Streaming(active) if *active == key => Ok(Self::Idle),
            Self::Streaming(active) => Err(TurnRejection::KeyMismatch {
                active: *active,
                attempted: key,
            }),
            Self::Idle | Self::AwaitingPersist { .. } => Err(TurnRejection::NoActiveTurn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(turn: u64) -> StreamKey {
        StreamKey::new(ChatId::new_v7(), TurnId::new(turn))
    }

    #[test]
    fn only_idle_accepts_a_new_turn() {
        let first = key(1);
        let second = key(2);

        let streaming = TurnPhase::Idle
            .apply(TurnTransition::Start(first))
            .expect("start from idle");
        assert_eq!(streaming, TurnPhase::Streaming(first));

        let rejected = streaming.apply(TurnTransition::Start(second));
        assert_eq!(
            rejected,
            Err(TurnRejection::AlreadyActive {
                active: first,
                attempted: second,
            })
        );
    }

    #[test]
    fn persisted_then_observed_retires_the_turn() {
        let active = key(1);
        let message_id = MessageId::new_v7();

        let awaiting = TurnPhase::Streaming(active)
            .apply(TurnTransition::Persisted {
                key: active,
                message_id,
            })
            .expect("persist from streaming");
        assert!(matches!(awaiting, TurnPhase::AwaitingPersist { .. }));
        assert_eq!(awaiting.placeholder_key(), Some(active));
        assert_eq!(awaiting.streaming_key(), None);

        let retired = awaiting
            .apply(TurnTransition::Observed {
                key: active,
                message_id,
            })
            .expect("observe persisted row");
        assert_eq!(retired, TurnPhase::Idle);
    }

    #[test]
    fn awaiting_persist_rejects_new_turns_until_observed() {
        let active = key(1);
        let awaiting = TurnPhase::AwaitingPersist {
            key: active,
            message_id: MessageId::new_v7(),
        };

        let attempted = key(2);
        assert_eq!(
            awaiting.apply(TurnTransition::Start(attempted)),
            Err(TurnRejection::AlreadyActive {
                active,
                attempted,
            })
        );
    }

    #[test]
    fn stale_terminal_events_are_rejected_by_key() {
        let active = key(1);
        let stale = key(7);

        let streaming = TurnPhase::Streaming(active);
        assert!(streaming.accepts_stream_event(active));
        assert!(!streaming.accepts_stream_event(stale));

        assert_eq!(
            streaming.apply(TurnTransition::Fail(stale)),
            Err(TurnRejection::KeyMismatch {
                active,
                attempted: stale,
            })
        );
    }

    #[test]
    fn failure_discards_the_turn_entirely() {
        let active = key(1);
        let idle = TurnPhase::Streaming(active)
            .apply(TurnTransition::Fail(active))
            .expect("fail from streaming");
        assert_eq!(idle, TurnPhase::Idle);
        assert_eq!(idle.placeholder_key(), None);
    }

    #[test]
    fn observed_with_wrong_message_is_rejected() {
        let active = key(1);
        let awaited = MessageId::new_v7();
        let awaiting = TurnPhase::AwaitingPersist {
            key: active,
            message_id: awaited,
        };

        assert_eq!(
            awaiting.apply(TurnTransition::Observed {
                key: active,
                message_id: MessageId::new_v7(),
            }),
            Err(TurnRejection::KeyMismatch {
                active,
                attempted: active,
            })
        );
    }
}
