use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use murmur_llm::{
    PromptMessage, ProviderStreamHandle, ResponseProvider, StreamEventMapped, StreamEventPayload,
    StreamRequest, StreamTarget,
};
use murmur_storage::{
    ChatId, MessageRecord, MessageStore, NewChat, NewMessage, ProfileStore, SessionIndex,
    SessionSummary, UserId, UserProfile,
};

use crate::events::{Command, Notice};
use crate::identity::Identity;
use crate::message::{ChatMessage, StreamKey, TurnId, TurnPhase, TurnTransition};
use crate::title::{derive_chat_title, today};
use crate::view::{DisplayMode, ViewState, merged_view};

/// Injected capability seams; the controller never reaches for globals.
pub struct ControllerDeps {
    pub identity: Arc<dyn Identity>,
    pub session_index: Arc<dyn SessionIndex>,
    pub message_store: Arc<dyn MessageStore>,
    pub profile_store: Arc<dyn ProfileStore>,
    pub provider: Option<Arc<dyn ResponseProvider>>,
}

/// Presentation-side handle to a running controller.
///
/// Commands are fire-and-forget: the caller never blocks on persistence or
/// provider work. All observable effects arrive through the view receiver
/// and the notice stream.
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<ViewState>,
    notices: mpsc::UnboundedReceiver<Notice>,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn select_chat(&self, chat_id: Option<ChatId>) {
        let _ = self.commands.send(Command::SelectChat(chat_id));
    }

    pub fn send_prompt(&self, text: impl Into<String>) {
        let _ = self.commands.send(Command::SendPrompt(text.into()));
    }

    pub fn new_chat(&self) {
        let _ = self.commands.send(Command::NewChat);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Clonable view of observable controller state.
    pub fn view(&self) -> watch::Receiver<ViewState> {
        self.view.clone()
    }

    /// Awaits the next transient notice.
    pub async fn next_notice(&mut self) -> Option<Notice> {
        self.notices.recv().await
    }

    pub fn try_notice(&mut self) -> Option<Notice> {
        self.notices.try_recv().ok()
    }

    /// Waits for the controller task to finish after `shutdown`.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Events funneled into the controller's single serialized loop.
enum InternalEvent {
    Sessions(Arc<Vec<SessionSummary>>),
    Messages {
        chat_id: ChatId,
        snapshot: Arc<Vec<MessageRecord>>,
    },
    Stream(StreamEventMapped),
    StreamClosed(StreamTarget),
}

/// The single logical owner of the active chat and the streaming placeholder.
///
/// External notifications (store snapshots, provider fragments) are delivered
/// as events to one task, so state transitions apply one at a time in arrival
/// order even though the sources are asynchronous.
pub struct ChatController {
    identity: Arc<dyn Identity>,
    session_index: Arc<dyn SessionIndex>,
    message_store: Arc<dyn MessageStore>,
    profile_store: Arc<dyn ProfileStore>,
    provider: Option<Arc<dyn ResponseProvider>>,

    user: Option<UserId>,
    active_chat: Option<ChatId>,
    active_messages: Vec<MessageRecord>,
    sessions: Vec<SessionSummary>,
    profile: Option<UserProfile>,
    turn: TurnPhase,
    stream_buffer: String,
    next_turn_id: u64,

    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<InternalEvent>,
    events_tx: mpsc::UnboundedSender<InternalEvent>,
    message_feed_task: Option<JoinHandle<()>>,
    session_feed_task: Option<JoinHandle<()>>,
    stream_reader_task: Option<JoinHandle<()>>,
    stream_worker_task: Option<JoinHandle<()>>,
    view_tx: watch::Sender<ViewState>,
    notice_tx: mpsc::UnboundedSender<Notice>,
}

impl ChatController {
    /// Spawns the controller task and returns its handle.
    pub fn spawn(deps: ControllerDeps) -> ControllerHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(ViewState::default());
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let controller = Self {
            identity: deps.identity,
            session_index: deps.session_index,
            message_store: deps.message_store,
            profile_store: deps.profile_store,
            provider: deps.provider,
            user: None,
            active_chat: None,
            active_messages: Vec::new(),
            sessions: Vec::new(),
            profile: None,
            turn: TurnPhase::Idle,
            stream_buffer: String::new(),
            next_turn_id: 1,
            commands: command_rx,
            events: event_rx,
            events_tx: event_tx,
            message_feed_task: None,
            session_feed_task: None,
            stream_reader_task: None,
            stream_worker_task: None,
            view_tx,
            notice_tx,
        };

        let task = tokio::spawn(controller.run());

        ControllerHandle {
            commands: command_tx,
            view: view_rx,
            notices: notice_rx,
            task,
        }
    }

    async fn run(mut self) {
        self.bootstrap().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
            }
        }

        self.teardown();
    }

    async fn bootstrap(&mut self) {
        self.user = self.identity.current_user();

        let Some(user) = self.user else {
            // No identity: empty session list, sends refused, nothing persisted.
            tracing::info!("no identity present; starting in signed-out mode");
            self.publish_view();
            return;
        };

        match self.session_index.subscribe_sessions(user).await {
            Ok(mut feed) => {
                self.sessions = feed.snapshot().as_ref().clone();
                let events_tx = self.events_tx.clone();
                self.session_feed_task = Some(tokio::spawn(async move {
                    while let Some(snapshot) = feed.changed().await {
                        if events_tx.send(InternalEvent::Sessions(snapshot)).is_err() {
                            break;
                        }
                    }
                }));
            }
            Err(error) => {
                tracing::warn!(user_id = %user, error = %error, "failed to subscribe session feed");
                self.notify(Notice::Persistence(error.to_string()));
            }
        }

        match self.profile_store.get_profile(user).await {
            Ok(profile) => self.profile = profile,
            Err(error) => {
                tracing::warn!(user_id = %user, error = %error, "failed to load user profile");
            }
        }

        self.publish_view();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SelectChat(chat_id) => self.handle_select_chat(chat_id).await,
            Command::SendPrompt(text) => self.handle_send_prompt(text).await,
            Command::NewChat => self.handle_select_chat(None).await,
            // Intercepted by the run loop; nothing to do here.
            Command::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Sessions(snapshot) => {
                self.sessions = snapshot.as_ref().clone();
                self.publish_view();
            }
            InternalEvent::Messages { chat_id, snapshot } => {
                self.handle_messages_snapshot(chat_id, snapshot);
            }
            InternalEvent::Stream(event) => self.handle_stream_event(event).await,
            InternalEvent::StreamClosed(target) => self.handle_stream_closed(target),
        }
    }

    async fn handle_select_chat(&mut self, chat_id: Option<ChatId>) {
        if self.active_chat == chat_id {
            // Re-selecting the current value must not resubscribe the feed.
            return;
        }

        if let Some(task) = self.message_feed_task.take() {
            task.abort();
        }
        self.active_messages.clear();
        self.active_chat = chat_id;

        if let Some(chat_id) = chat_id {
            self.subscribe_active_messages(chat_id).await;
        }

        self.reconcile_pending_turn();
        self.publish_view();
    }

    async fn subscribe_active_messages(&mut self, chat_id: ChatId) {
        match self.message_store.subscribe_messages(chat_id).await {
            Ok(mut feed) => {
                self.active_messages = feed.snapshot().as_ref().clone();
                let events_tx = self.events_tx.clone();
                self.message_feed_task = Some(tokio::spawn(async move {
                    while let Some(snapshot) = feed.changed().await {
                        if events_tx
                            .send(InternalEvent::Messages { chat_id, snapshot })
                            .is_err()
                        {
                            break;
                        }
                    }
                }));
            }
            Err(error) => {
                tracing::warn!(chat_id = %chat_id, error = %error, "failed to subscribe message feed");
                self.notify(Notice::Persistence(error.to_string()));
            }
        }
    }

    async fn handle_send_prompt(&mut self, text: String) {
        let prompt = text.trim().to_string();
        if prompt.is_empty() {
            self.notify(Notice::EmptyPrompt);
            return;
        }

        let Some(user) = self.user else {
            self.notify(Notice::NotSignedIn);
            return;
        };

        if self.turn.placeholder_key().is_some() {
            // One in-flight reply per controller; a second send is rejected,
            // never queued, so two placeholders cannot coexist.
            self.notify(Notice::Busy);
            return;
        }

        let Some(provider) = self.provider.clone() else {
            self.notify(Notice::ProviderNotConfigured);
            return;
        };

        // Session resolution: the first send of a fresh conversation creates
        // and activates its chat before anything is persisted to it.
        let chat_id = match self.active_chat {
            Some(chat_id) => chat_id,
            None => {
                let title = derive_chat_title(&prompt, today());
                match self.session_index.create_chat(user, NewChat { title }).await {
                    Ok(chat) => {
                        self.handle_select_chat(Some(chat.id)).await;
                        chat.id
                    }
                    Err(error) => {
                        tracing::warn!(user_id = %user, error = %error, "chat creation failed; send aborted");
                        self.notify(Notice::Persistence(error.to_string()));
                        return;
                    }
                }
            }
        };

        // The user's turn is durable before the provider is ever invoked.
        if let Err(error) = self
            .message_store
            .append_message(chat_id, NewMessage::user(prompt.clone()))
            .await
        {
            tracing::warn!(chat_id = %chat_id, error = %error, "user message append failed; send aborted");
            self.notify(Notice::Persistence(error.to_string()));
            return;
        }

        let key = StreamKey::new(chat_id, self.alloc_turn_id());
        match self.turn.apply(TurnTransition::Start(key)) {
            Ok(next) => self.turn = next,
            Err(rejection) => {
                tracing::error!(?rejection, "turn start rejected despite idle check");
                self.notify(Notice::Busy);
                return;
            }
        }
        self.stream_buffer.clear();

        // The placeholder is visible before the first fragment arrives.
        self.publish_view();

        let request = StreamRequest::new(
            StreamTarget(key.turn.0),
            provider.default_model(),
            vec![PromptMessage::user(prompt)],
        );

        match provider.stream_reply(request) {
            Ok(handle) => self.spawn_stream_pipeline(handle),
            Err(error) => self.fail_turn(key, error.to_string()),
        }
    }

    fn alloc_turn_id(&mut self) -> TurnId {
        // Reserved immediately so retries never reuse a routing key.
        let id = TurnId::new(self.next_turn_id);
        self.next_turn_id = self.next_turn_id.saturating_add(1);
        id
    }

    fn spawn_stream_pipeline(&mut self, handle: ProviderStreamHandle) {
        let ProviderStreamHandle { mut stream, worker } = handle;
        self.stream_worker_task = Some(tokio::spawn(worker));

        let events_tx = self.events_tx.clone();
        let target = stream.target();
        self.stream_reader_task = Some(tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if events_tx.send(InternalEvent::Stream(event)).is_err() {
                    return;
                }
            }
            let _ = events_tx.send(InternalEvent::StreamClosed(target));
        }));
    }

    fn handle_messages_snapshot(&mut self, chat_id: ChatId, snapshot: Arc<Vec<MessageRecord>>) {
        if self.active_chat != Some(chat_id) {
            // Stale delivery from a previously active chat; never render it.
            return;
        }

        self.active_messages = snapshot.as_ref().clone();
        self.reconcile_pending_turn();
        self.publish_view();
    }

    /// Hands the placeholder off once the persisted reply shows up in the
    /// active snapshot: the same view publish swaps placeholder text for the
    /// identical persisted row, with no gap and no duplicate.
    ///
    /// A pending turn whose chat is no longer displayed has nothing left to
    /// observe; it is released directly so the next send is accepted.
    fn reconcile_pending_turn(&mut self) {
        let TurnPhase::AwaitingPersist { key, message_id } = self.turn else {
            return;
        };

        let observed_in_active = self.active_chat == Some(key.chat_id)
            && self
                .active_messages
                .iter()
                .any(|record| record.id == message_id);
        let unobservable = self.active_chat != Some(key.chat_id);

        if !observed_in_active && !unobservable {
            return;
        }

        match self.turn.apply(TurnTransition::Observed { key, message_id }) {
            Ok(next) => {
                self.turn = next;
                self.stream_buffer.clear();
            }
            Err(rejection) => {
                tracing::error!(?rejection, "failed to retire persisted turn");
            }
        }
    }

    async fn handle_stream_event(&mut self, event: StreamEventMapped) {
        let Some(key) = self.turn.streaming_key() else {
            return;
        };
        if key.turn.0 != event.target.0 {
            // Strict key equality prevents fragment leakage across turns.
            return;
        }

        match event.payload {
            StreamEventPayload::Delta(fragment) => {
                // The buffer always holds the complete-so-far text; observers
                // never have to reassemble deltas.
                self.stream_buffer.push_str(&fragment);
                if self.active_chat == Some(key.chat_id) {
                    self.publish_view();
                }
            }
            StreamEventPayload::Done => self.finish_turn(key).await,
            StreamEventPayload::Error(message) => self.fail_turn(key, message),
        }
    }

    fn handle_stream_closed(&mut self, target: StreamTarget) {
        let Some(key) = self.turn.streaming_key() else {
            return;
        };
        if key.turn.0 != target.0 {
            return;
        }

        // The reader drained without a terminal event; treat it as a failure.
        self.fail_turn(
            key,
            "provider stream ended before a terminal event".to_string(),
        );
    }

    async fn finish_turn(&mut self, key: StreamKey) {
        let reply = self.stream_buffer.clone();

        match self
            .message_store
            .append_message(key.chat_id, NewMessage::bot(reply))
            .await
        {
            Ok(record) => {
                match self.turn.apply(TurnTransition::Persisted {
                    key,
                    message_id: record.id,
                }) {
                    Ok(next) => self.turn = next,
                    Err(rejection) => {
                        tracing::error!(?rejection, "persist transition rejected");
                        return;
                    }
                }

                if self.active_chat != Some(key.chat_id) || self.message_feed_task.is_none() {
                    // The originating chat is not being watched, so no snapshot
                    // will carry the persisted row; retire the turn directly.
                    if let Ok(next) = self.turn.apply(TurnTransition::Observed {
                        key,
                        message_id: record.id,
                    }) {
                        self.turn = next;
                        self.stream_buffer.clear();
                        self.publish_view();
                    }
                }
                // Otherwise the snapshot carrying the row is already queued
                // behind this event; `reconcile_pending_turn` completes the
                // hand-off there.
            }
            Err(error) => {
                tracing::warn!(chat_id = %key.chat_id, error = %error, "final reply append failed");
                self.notify(Notice::Persistence(error.to_string()));
                if let Ok(next) = self.turn.apply(TurnTransition::Fail(key)) {
                    self.turn = next;
                }
                self.stream_buffer.clear();
                self.publish_view();
            }
        }

        self.stream_reader_task = None;
        self.stream_worker_task = None;
    }

    fn fail_turn(&mut self, key: StreamKey, message: String) {
        // Partial output is discarded; the user's turn stays persisted so a
        // retry is one send away.
        self.stream_buffer.clear();

        match self.turn.apply(TurnTransition::Fail(key)) {
            Ok(next) => self.turn = next,
            Err(rejection) => {
                tracing::error!(?rejection, "fail transition rejected");
                return;
            }
        }

        self.stream_reader_task = None;
        self.stream_worker_task = None;
        self.notify(Notice::Stream(message));
        self.publish_view();
    }

    fn publish_view(&self) {
        let placeholder = self
            .turn
            .placeholder_key()
            .filter(|key| self.active_chat == Some(key.chat_id))
            .map(|_| ChatMessage::streaming_placeholder(self.stream_buffer.clone()));

        let state = ViewState {
            mode: match self.active_chat {
                Some(chat_id) => DisplayMode::Conversation(chat_id),
                None => DisplayMode::Welcome,
            },
            sessions: self.sessions.clone(),
            messages: merged_view(&self.active_messages, placeholder.as_ref()),
            profile: self.profile.clone(),
        };

        let _ = self.view_tx.send(state);
    }

    fn notify(&self, notice: Notice) {
        tracing::debug!(notice = %notice, "transient notice");
        let _ = self.notice_tx.send(notice);
    }

    fn teardown(&mut self) {
        // Aborting the reader drops its ProviderEventStream, which signals
        // cancellation to the provider worker.
        for task in [
            self.message_feed_task.take(),
            self.session_feed_task.take(),
            self.stream_reader_task.take(),
            self.stream_worker_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}
