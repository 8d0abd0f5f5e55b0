//! The chat session engine.
//!
//! A [`ChatSession`] owns one conversation and its extracted memories. It
//! decides what the model sees (prompt assembly) and what observers see
//! (typed [`SessionEvent`]s after every externally visible mutation).
//!
//! An assistant turn runs as a spawned task that opens the completion
//! stream, decodes frames, and sends [`TurnUpdate`]s back over a channel.
//! The session owner applies them with [`ChatSession::apply_update`], so
//! every mutation happens on the owner's task and no lock guards the
//! message list.
//!
//! Each turn moves through `Pending -> Streaming -> {Done, Failed}`. Every
//! terminal transition clears the message's `loading` flag.

use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::ChatMessage;
use crate::core::bot::BotSummary;
use crate::core::chat_stream::{ParserState, StreamFrame, StreamFrameParser};
use crate::core::error::{MimicError, Result};
use crate::core::memory::extract_memories;
use crate::core::message::{Conversation, Memory, Message};
use crate::core::persistence::{PersistenceHandle, Snapshot};
use crate::core::prompt::build_system_prompt;
use crate::core::transport::{CompletionRequest, CompletionTransport, DEFAULT_MODEL};

pub type TurnId = u64;

pub const UNCLEAN_CLOSE_ERROR: &str = "The connection closed before the reply finished";
pub const INTERRUPTED_ERROR: &str = "The reply was interrupted before it finished";

/// What changed, delivered synchronously to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    MessageAppended { message_id: String },
    MessageUpdated { message_id: String },
    StreamDone { message_id: String, memories: usize },
    TurnFailed { message_id: String, error: String },
}

/// Produced by the stream task for the session owner to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    Connected,
    Delta(String),
    FrameError(String),
    Done,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnUpdate {
    pub turn_id: TurnId,
    pub event: TurnEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Pending,
    Streaming,
}

enum TurnOutcome {
    Done,
    Failed(String),
}

struct ActiveTurn {
    id: TurnId,
    message_id: String,
    phase: TurnPhase,
    task: JoinHandle<()>,
}

/// Token returned by [`ChatSession::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type Observer = Box<dyn FnMut(&SessionEvent) + Send>;

pub struct ChatSession {
    bot: BotSummary,
    user_name: String,
    credential: Option<String>,
    model: String,
    conversation: Conversation,
    memories: Vec<Memory>,
    observers: Vec<(Subscription, Observer)>,
    next_subscription: u64,
    transport: Arc<dyn CompletionTransport>,
    persistence: Option<PersistenceHandle>,
    updates_tx: mpsc::UnboundedSender<TurnUpdate>,
    updates_rx: mpsc::UnboundedReceiver<TurnUpdate>,
    active_turn: Option<ActiveTurn>,
    next_turn_id: TurnId,
}

impl ChatSession {
    /// A fresh conversation with `bot`. Call [`initialize`](Self::initialize)
    /// before sending anything.
    pub fn new(bot: BotSummary, transport: Arc<dyn CompletionTransport>) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            bot,
            user_name: String::new(),
            credential: None,
            model: DEFAULT_MODEL.to_string(),
            conversation: Conversation::new(),
            memories: Vec::new(),
            observers: Vec::new(),
            next_subscription: 0,
            transport,
            persistence: None,
            updates_tx,
            updates_rx,
            active_turn: None,
            next_turn_id: 1,
        }
    }

    /// Save a snapshot through `persistence` after every change.
    pub fn with_persistence(mut self, persistence: PersistenceHandle) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Bind the session to a credential and the user's display name.
    pub fn initialize(&mut self, credential: Option<String>, user_name: &str) -> Result<()> {
        let credential = credential
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                MimicError::Configuration(
                    "No OpenAI API token configured. Run `mimic setup` or set OPENAI_API_KEY."
                        .to_string(),
                )
            })?;
        self.credential = Some(credential);
        self.user_name = user_name.to_string();
        debug!(bot = %self.bot.slug, conversation = %self.conversation.id, "session initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.credential.is_some()
    }

    /// Replace history and ID with a saved conversation.
    ///
    /// Any turn still streaming is abandoned. Messages saved mid-stream are
    /// settled as interrupted so at most one message is ever loading.
    pub fn restore_conversation(&mut self, mut conversation: Conversation) {
        if let Some(turn) = self.active_turn.take() {
            turn.task.abort();
        }
        for message in conversation
            .messages
            .iter_mut()
            .filter(|message| message.is_loading())
        {
            message.loading = Some(false);
            if !message.has_error() {
                message.error = Some(INTERRUPTED_ERROR.to_string());
            }
        }
        self.conversation = conversation;
    }

    pub fn restore_memories(&mut self, memories: Vec<Memory>) {
        self.memories = memories;
    }

    pub fn bot(&self) -> &BotSummary {
        &self.bot
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.conversation.messages
    }

    pub fn memories(&self) -> &[Memory] {
        &self.memories
    }

    pub fn is_streaming(&self) -> bool {
        self.active_turn.is_some()
    }

    pub fn turn_phase(&self) -> Option<TurnPhase> {
        self.active_turn.as_ref().map(|turn| turn.phase)
    }

    /// Register an observer. Observers run synchronously, in subscription
    /// order, after every mutation.
    pub fn subscribe<F>(&mut self, handler: F) -> Subscription
    where
        F: FnMut(&SessionEvent) + Send + 'static,
    {
        let subscription = Subscription(self.next_subscription);
        self.next_subscription += 1;
        self.observers.push((subscription, Box::new(handler)));
        subscription
    }

    /// Remove an observer. Returns false if it was already removed.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(id, _)| *id != subscription);
        self.observers.len() != before
    }

    /// The system prompt as of right now.
    pub fn build_system_prompt(&self) -> String {
        self.system_prompt_at(&Local::now())
    }

    pub fn system_prompt_at<Tz>(&self, now: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        build_system_prompt(&self.bot.name, &self.bot.system, &self.user_name, now)
    }

    /// Append the user's message and start an assistant turn.
    ///
    /// Returns the new turn's ID, or `None` for blank input. Fails with
    /// [`MimicError::TurnInFlight`] while a previous reply is streaming and
    /// with [`MimicError::Configuration`] before initialization; neither
    /// failure changes any state.
    pub fn send_message(&mut self, text: &str) -> Result<Option<TurnId>> {
        if !self.is_initialized() {
            return Err(MimicError::Configuration(
                "Session has not been initialized".to_string(),
            ));
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        if self.active_turn.is_some() {
            return Err(MimicError::TurnInFlight);
        }

        let message = Message::user(text);
        let message_id = message.id.clone();
        self.conversation.messages.push(message);
        self.notify(SessionEvent::MessageAppended { message_id });

        Ok(Some(self.begin_assistant_turn()))
    }

    fn begin_assistant_turn(&mut self) -> TurnId {
        let messages = self.assemble_prompt();

        let placeholder = Message::assistant_placeholder();
        let message_id = placeholder.id.clone();
        self.conversation.messages.push(placeholder);

        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;

        let request = CompletionRequest {
            api_key: self.credential.clone().unwrap_or_default(),
            model: self.model.clone(),
            messages,
        };
        let task = tokio::spawn(stream_turn(
            Arc::clone(&self.transport),
            request,
            self.updates_tx.clone(),
            turn_id,
        ));
        self.active_turn = Some(ActiveTurn {
            id: turn_id,
            message_id: message_id.clone(),
            phase: TurnPhase::Pending,
            task,
        });

        debug!(turn = turn_id, message = %message_id, "assistant turn started");
        self.notify(SessionEvent::MessageAppended { message_id });
        turn_id
    }

    /// The system prompt followed by every settled message without an error.
    pub fn assemble_prompt(&self) -> Vec<ChatMessage> {
        std::iter::once(ChatMessage::system(self.build_system_prompt()))
            .chain(
                self.conversation
                    .messages
                    .iter()
                    .filter(|message| !message.has_error() && !message.is_loading())
                    .map(|message| ChatMessage::new(message.role.as_str(), &message.text)),
            )
            .collect()
    }

    /// Wait for the next update from the streaming task.
    pub async fn next_update(&mut self) -> Option<TurnUpdate> {
        self.updates_rx.recv().await
    }

    /// Wait for one update and apply it.
    pub async fn pump(&mut self) {
        if let Some(update) = self.next_update().await {
            self.apply_update(update);
        }
    }

    /// Apply updates until no turn is in flight.
    pub async fn run_until_idle(&mut self) {
        while self.is_streaming() {
            self.pump().await;
        }
    }

    pub fn apply_update(&mut self, update: TurnUpdate) {
        let Some(turn) = self.active_turn.as_mut() else {
            debug!(turn = update.turn_id, "update with no active turn ignored");
            return;
        };
        if turn.id != update.turn_id {
            debug!(turn = update.turn_id, active = turn.id, "stale turn update ignored");
            return;
        }

        match update.event {
            TurnEvent::Connected => {
                turn.phase = TurnPhase::Streaming;
            }
            TurnEvent::Delta(fragment) => {
                turn.phase = TurnPhase::Streaming;
                if fragment.is_empty() {
                    return;
                }
                let message_id = turn.message_id.clone();
                if let Some(message) = self.message_mut(&message_id) {
                    message.text.push_str(&fragment);
                }
                self.notify(SessionEvent::MessageUpdated { message_id });
            }
            TurnEvent::FrameError(error) => {
                let message_id = turn.message_id.clone();
                warn!(turn = update.turn_id, error = %error, "malformed stream frame");
                if let Some(message) = self.message_mut(&message_id) {
                    message.error = Some(error);
                }
                self.notify(SessionEvent::MessageUpdated { message_id });
            }
            TurnEvent::Done => self.finish_turn(TurnOutcome::Done),
            TurnEvent::Failed(error) => self.finish_turn(TurnOutcome::Failed(error)),
        }
    }

    fn finish_turn(&mut self, outcome: TurnOutcome) {
        let Some(turn) = self.active_turn.take() else {
            return;
        };
        let conversation_id = self.conversation.id.clone();
        let Some(message) = self.message_mut(&turn.message_id) else {
            return;
        };
        message.loading = Some(false);

        let event = match outcome {
            TurnOutcome::Done => {
                let extracted = extract_memories(&message.text, &conversation_id);
                let count = extracted.len();
                self.memories.extend(extracted);
                debug!(turn = turn.id, memories = count, "assistant turn finished");
                SessionEvent::StreamDone {
                    message_id: turn.message_id,
                    memories: count,
                }
            }
            TurnOutcome::Failed(error) => {
                message.error = Some(error.clone());
                warn!(turn = turn.id, error = %error, "assistant turn failed");
                SessionEvent::TurnFailed {
                    message_id: turn.message_id,
                    error,
                }
            }
        };

        self.notify(event);
        self.save_memories();
    }

    /// Memories live in the session only; writing them out is not built yet.
    fn save_memories(&self) {
        debug!(count = self.memories.len(), "memory persistence is deferred");
    }

    fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.conversation
            .messages
            .iter_mut()
            .rev()
            .find(|message| message.id == message_id)
    }

    fn notify(&mut self, event: SessionEvent) {
        for (_, observer) in self.observers.iter_mut() {
            observer(&event);
        }
        if let Some(persistence) = &self.persistence {
            persistence.enqueue(Snapshot {
                slug: self.bot.slug.clone(),
                conversation: self.conversation.clone(),
            });
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(turn) = self.active_turn.take() {
            turn.task.abort();
        }
    }
}

/// Body of the spawned turn task: open the stream, decode it, report back.
async fn stream_turn(
    transport: Arc<dyn CompletionTransport>,
    request: CompletionRequest,
    tx: mpsc::UnboundedSender<TurnUpdate>,
    turn_id: TurnId,
) {
    let send = |event: TurnEvent| tx.send(TurnUpdate { turn_id, event }).is_ok();

    let mut stream = match transport.open_stream(request).await {
        Ok(stream) => stream,
        Err(e) => {
            send(TurnEvent::Failed(e.to_string()));
            return;
        }
    };
    if !send(TurnEvent::Connected) {
        return;
    }

    let mut parser = StreamFrameParser::new();
    while let Some(chunk) = stream.next().await {
        let frames = match chunk {
            Ok(bytes) => parser.push(&bytes),
            Err(e) => {
                send(TurnEvent::Failed(e.to_string()));
                return;
            }
        };
        if !forward_frames(frames, &send) || parser.is_done() {
            return;
        }
    }

    if !forward_frames(parser.finish(), &send) {
        return;
    }
    if parser.state() == ParserState::Errored {
        send(TurnEvent::Failed(UNCLEAN_CLOSE_ERROR.to_string()));
    }
}

/// Returns false once the receiver is gone.
fn forward_frames(frames: Vec<StreamFrame>, send: &impl Fn(TurnEvent) -> bool) -> bool {
    frames.into_iter().all(|frame| {
        send(match frame {
            StreamFrame::Delta(text) => TurnEvent::Delta(text),
            StreamFrame::Malformed(error) => TurnEvent::FrameError(error),
            StreamFrame::Done => TurnEvent::Done,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Role;
    use crate::core::persistence::PersistenceQueue;
    use crate::core::storage::Store;
    use crate::core::transport::RetryPolicy;
    use crate::utils::test_utils::{
        delta_frame, done_frame, test_bot, EventLog, Script, ScriptedTransport,
    };
    use chrono::Utc;
    use tempfile::TempDir;

    fn session_with(scripts: Vec<Script>) -> (ChatSession, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(scripts));
        let mut session = ChatSession::new(test_bot(), transport.clone());
        session
            .initialize(Some("test-key".into()), "Ann")
            .expect("initialize");
        (session, transport)
    }

    fn loading_count(session: &ChatSession) -> usize {
        session.messages().iter().filter(|m| m.is_loading()).count()
    }

    #[tokio::test]
    async fn initialize_requires_a_credential() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let mut session = ChatSession::new(test_bot(), transport);
        assert!(matches!(
            session.initialize(None, "Ann"),
            Err(MimicError::Configuration(_))
        ));
        assert!(matches!(
            session.initialize(Some("  ".into()), "Ann"),
            Err(MimicError::Configuration(_))
        ));
        assert!(matches!(
            session.send_message("hi"),
            Err(MimicError::Configuration(_))
        ));
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn send_appends_and_notifies_before_the_network_answers() {
        let (mut session, _transport) = session_with(vec![Script::Hang]);
        let log = EventLog::attach(&mut session);

        let turn = session.send_message("hi").expect("send");
        assert!(turn.is_some());

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].text, "hi");
        assert!(messages[1].is_loading());
        assert!(messages[1].text.is_empty());

        let events = log.events();
        assert_eq!(
            events[0],
            SessionEvent::MessageAppended {
                message_id: messages[0].id.clone()
            }
        );
        assert_eq!(
            events[1],
            SessionEvent::MessageAppended {
                message_id: messages[1].id.clone()
            }
        );
        assert_eq!(session.turn_phase(), Some(TurnPhase::Pending));
    }

    #[tokio::test]
    async fn streamed_deltas_grow_the_reply() {
        let (mut session, _transport) = session_with(vec![Script::Chunks(vec![
            Ok(delta_frame("Hi")),
            Ok(delta_frame(" there")),
            Ok(done_frame()),
        ])]);
        let log = EventLog::attach(&mut session);

        session.send_message("hello").unwrap();
        while session.is_streaming() {
            assert!(loading_count(&session) <= 1);
            session.pump().await;
        }
        assert_eq!(loading_count(&session), 0);

        let reply = &session.messages()[1];
        assert_eq!(reply.text, "Hi there");
        assert_eq!(reply.loading, Some(false));
        assert!(reply.error.is_none());

        let updates = log
            .events()
            .iter()
            .filter(|e| matches!(e, SessionEvent::MessageUpdated { .. }))
            .count();
        assert_eq!(updates, 2);
        assert!(matches!(
            log.events().last(),
            Some(SessionEvent::StreamDone { memories: 0, .. })
        ));
    }

    #[tokio::test]
    async fn failure_before_streaming_settles_the_placeholder() {
        let (mut session, _transport) =
            session_with(vec![Script::Fail("API Error (401): bad key".into())]);
        let log = EventLog::attach(&mut session);

        session.send_message("hello").unwrap();
        session.run_until_idle().await;

        let reply = &session.messages()[1];
        assert_eq!(reply.loading, Some(false));
        assert_eq!(reply.error.as_deref(), Some("API Error (401): bad key"));
        assert!(reply.text.is_empty());
        assert!(matches!(
            log.events().last(),
            Some(SessionEvent::TurnFailed { error, .. }) if error == "API Error (401): bad key"
        ));
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn malformed_frame_is_recorded_but_streaming_continues() {
        let (mut session, _transport) = session_with(vec![Script::Chunks(vec![
            Ok(delta_frame("a")),
            Ok(b"data: {oops\n\n".to_vec()),
            Ok(delta_frame("b")),
            Ok(done_frame()),
        ])]);

        session.send_message("hello").unwrap();
        session.run_until_idle().await;

        let reply = &session.messages()[1];
        assert_eq!(reply.text, "ab");
        assert!(reply.has_error());
        assert_eq!(reply.loading, Some(false));
    }

    #[tokio::test]
    async fn close_without_done_fails_the_turn_and_keeps_partial_text() {
        let (mut session, _transport) =
            session_with(vec![Script::Chunks(vec![Ok(delta_frame("partial"))])]);
        let log = EventLog::attach(&mut session);

        session.send_message("hello").unwrap();
        session.run_until_idle().await;

        let reply = &session.messages()[1];
        assert_eq!(reply.text, "partial");
        assert_eq!(reply.error.as_deref(), Some(UNCLEAN_CLOSE_ERROR));
        assert_eq!(reply.loading, Some(false));
        assert!(matches!(
            log.events().last(),
            Some(SessionEvent::TurnFailed { .. })
        ));
    }

    #[tokio::test]
    async fn mid_stream_transport_error_fails_the_turn() {
        let (mut session, _transport) = session_with(vec![Script::Chunks(vec![
            Ok(delta_frame("half")),
            Err("Stream interrupted: reset".into()),
        ])]);

        session.send_message("hello").unwrap();
        session.run_until_idle().await;

        let reply = &session.messages()[1];
        assert_eq!(reply.text, "half");
        assert_eq!(reply.error.as_deref(), Some("Stream interrupted: reset"));
        assert_eq!(reply.loading, Some(false));
    }

    #[tokio::test]
    async fn errored_messages_are_left_out_of_the_next_prompt() {
        let (mut session, transport) = session_with(vec![Script::Chunks(vec![Ok(done_frame())])]);

        let mut convo = Conversation::new();
        convo.messages.push(Message::user("first question"));
        let mut broken = Message::assistant_placeholder();
        broken.loading = Some(false);
        broken.text = "garbled".into();
        broken.error = Some("Could not parse response".into());
        convo.messages.push(broken);
        session.restore_conversation(convo);

        session.send_message("second question").unwrap();
        session.run_until_idle().await;

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        let sent = &requests[0].messages;
        assert_eq!(sent[0].role, "system");
        assert!(sent[0].content.starts_with("You are Testy.\n"));
        let contents: Vec<&str> = sent[1..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first question", "second question"]);
        assert!(sent.iter().all(|m| m.content != "garbled"));
        assert_eq!(requests[0].api_key, "test-key");
    }

    #[tokio::test]
    async fn memories_are_extracted_when_the_reply_completes() {
        let (mut session, _transport) = session_with(vec![Script::Chunks(vec![
            Ok(delta_frame("Hello <remember>likes tea</remember> world ")),
            Ok(delta_frame("<remember>born in May</remember>")),
            Ok(done_frame()),
        ])]);
        let log = EventLog::attach(&mut session);

        session.send_message("hi").unwrap();
        session.run_until_idle().await;

        let texts: Vec<&str> = session.memories().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["likes tea", "born in May"]);
        let conversation_id = session.conversation_id().to_string();
        assert!(session
            .memories()
            .iter()
            .all(|m| m.conversation_id == conversation_id));
        assert!(matches!(
            log.events().last(),
            Some(SessionEvent::StreamDone { memories: 2, .. })
        ));
    }

    #[tokio::test]
    async fn restored_memories_are_kept_and_appended_to() {
        let (mut session, _transport) = session_with(vec![Script::Chunks(vec![
            Ok(delta_frame("<remember>new fact</remember>")),
            Ok(done_frame()),
        ])]);
        session.restore_memories(vec![Memory::new("old-convo", "old fact")]);

        session.send_message("hi").unwrap();
        session.run_until_idle().await;

        let texts: Vec<&str> = session.memories().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["old fact", "new fact"]);
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_rejected() {
        let (mut session, _transport) = session_with(vec![Script::Hang]);
        session.send_message("one").unwrap();

        assert!(matches!(
            session.send_message("two"),
            Err(MimicError::TurnInFlight)
        ));
        assert_eq!(session.messages().len(), 2);
        assert_eq!(loading_count(&session), 1);
    }

    #[tokio::test]
    async fn blank_input_is_ignored() {
        let (mut session, transport) = session_with(vec![]);
        assert_eq!(session.send_message("   ").unwrap(), None);
        assert!(session.messages().is_empty());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn unsubscribed_handler_hears_nothing_more() {
        let (mut session, _transport) = session_with(vec![Script::Chunks(vec![
            Ok(delta_frame("x")),
            Ok(done_frame()),
        ])]);
        let kept = EventLog::attach(&mut session);
        let dropped = EventLog::default();
        let sub = session.subscribe(dropped.handler());

        assert!(session.unsubscribe(sub));
        assert!(!session.unsubscribe(sub));

        session.send_message("hi").unwrap();
        session.run_until_idle().await;

        assert!(dropped.events().is_empty());
        assert!(!kept.events().is_empty());
    }

    #[tokio::test]
    async fn observers_run_in_subscription_order() {
        let (mut session, _transport) = session_with(vec![Script::Hang]);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            session.subscribe(move |_| order.lock().unwrap().push(tag));
        }

        session.send_message("hi").unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["first", "second", "first", "second"]
        );
    }

    #[tokio::test]
    async fn stale_turn_updates_are_ignored() {
        let (mut session, _transport) = session_with(vec![Script::Hang]);
        let turn = session.send_message("hi").unwrap().unwrap();

        session.apply_update(TurnUpdate {
            turn_id: turn + 41,
            event: TurnEvent::Delta("ghost".into()),
        });
        assert!(session.messages()[1].text.is_empty());

        session.apply_update(TurnUpdate {
            turn_id: turn,
            event: TurnEvent::Delta("real".into()),
        });
        assert_eq!(session.messages()[1].text, "real");
        assert_eq!(session.turn_phase(), Some(TurnPhase::Streaming));
    }

    #[tokio::test]
    async fn restore_settles_messages_saved_mid_stream() {
        let (mut session, _transport) = session_with(vec![]);
        let mut convo = Conversation::new();
        convo.messages.push(Message::user("hi"));
        convo.messages.push(Message::assistant_placeholder());
        let id = convo.id.clone();

        session.restore_conversation(convo);

        assert_eq!(session.conversation_id(), id);
        assert_eq!(loading_count(&session), 0);
        assert_eq!(
            session.messages()[1].error.as_deref(),
            Some(INTERRUPTED_ERROR)
        );
    }

    #[tokio::test]
    async fn system_prompt_uses_bot_and_user() {
        let (session, _transport) = session_with(vec![]);
        let now = Utc.with_ymd_and_hms(2023, 4, 1, 15, 5, 0).unwrap();
        let prompt = session.system_prompt_at(&now);
        assert!(prompt.starts_with("You are Testy.\nAlways answer briefly.\n"));
        assert!(prompt.ends_with("The user's name is Ann."));
        assert_eq!(prompt, session.system_prompt_at(&now));
    }

    #[tokio::test]
    async fn every_change_is_persisted() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let queue = PersistenceQueue::spawn(store.clone(), RetryPolicy::none());

        let transport = Arc::new(ScriptedTransport::new(vec![Script::Chunks(vec![
            Ok(delta_frame("saved")),
            Ok(done_frame()),
        ])]));
        let mut session =
            ChatSession::new(test_bot(), transport).with_persistence(queue.handle());
        session.initialize(Some("k".into()), "Ann").unwrap();

        session.send_message("hi").unwrap();
        session.run_until_idle().await;
        let expected = session.conversation().clone();
        drop(session);
        queue.shutdown().await;

        let stored = store.load_conversation("testy", &expected.id).unwrap();
        assert_eq!(stored, expected);
        assert_eq!(stored.messages[1].text, "saved");
        assert_eq!(stored.messages[1].loading, Some(false));
    }
}
