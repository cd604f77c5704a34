//! The "Aqua" chat assistant.
//!
//! [`ChatAssistant`] owns the transcript and an explicit state machine:
//!
//! ```text
//! Uninitialized --open ok--> Ready --submit--> AwaitingReply --end/fail--> Ready
//!       |
//!       +--open failed--> Degraded
//! ```
//!
//! Transports (the WebSocket handler, the terminal loop) drive it either step by
//! step (`submit`, `stream_opened`, `apply_chunk`, `finish_reply`, `fail_reply`)
//! or through [`ChatAssistant::send`].

use anyhow::{Context, Result};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::io::Write;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::constants;
use crate::gemini::{GeminiChatSession, GeminiClient, GeminiError, TextStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            content: content.into(),
        }
    }
}

/// Ordered, append-only list of messages. Only the final entry may be replaced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

impl Transcript {
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Swaps the final entry for an updated copy. Earlier entries are untouched.
    pub fn replace_last(&mut self, message: ChatMessage) {
        match self.messages.last_mut() {
            Some(last) => *last = message,
            None => self.messages.push(message),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Future resolving to the reply stream of one turn.
pub type PendingReply = BoxFuture<'static, Result<TextStream, GeminiError>>;

/// A conversational handle. Clones refer to the same conversation.
pub trait ChatSession: Clone + Send + 'static {
    fn send_message_stream(&self, message: String) -> PendingReply;
}

/// Something that can create chat sessions.
pub trait ChatBackend {
    type Session: ChatSession;

    fn start_session(&self, system_instruction: &str) -> Result<Self::Session, GeminiError>;
}

impl ChatSession for GeminiChatSession {
    fn send_message_stream(&self, message: String) -> PendingReply {
        let session = self.clone();
        async move { session.stream_message(message).await }.boxed()
    }
}

impl ChatBackend for GeminiClient {
    type Session = GeminiChatSession;

    fn start_session(&self, system_instruction: &str) -> Result<Self::Session, GeminiError> {
        self.start_chat(system_instruction)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPhase {
    Uninitialized,
    Ready,
    AwaitingReply,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendRejected {
    #[error("a reply is still arriving")]
    InFlight,
    #[error("no chat session is available")]
    NoSession,
    #[error("message is blank")]
    BlankInput,
}

enum ChatState<S> {
    Uninitialized,
    Ready(S),
    /// `streaming` turns true once the reply stream is open and the placeholder exists.
    AwaitingReply { session: S, streaming: bool },
    Degraded,
}

pub struct ChatAssistant<S> {
    state: ChatState<S>,
    transcript: Transcript,
    reply: String,
}

impl<S: ChatSession> Default for ChatAssistant<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ChatSession> ChatAssistant<S> {
    pub fn new() -> Self {
        Self {
            state: ChatState::Uninitialized,
            transcript: Transcript::default(),
            reply: String::new(),
        }
    }

    pub fn phase(&self) -> ChatPhase {
        match self.state {
            ChatState::Uninitialized => ChatPhase::Uninitialized,
            ChatState::Ready(_) => ChatPhase::Ready,
            ChatState::AwaitingReply { .. } => ChatPhase::AwaitingReply,
            ChatState::Degraded => ChatPhase::Degraded,
        }
    }

    /// True between a submission and the moment its reply stream opens.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self.state,
            ChatState::AwaitingReply {
                streaming: false,
                ..
            }
        )
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Creates the session on first use. Later calls change nothing.
    pub fn open<B>(&mut self, backend: &B) -> ChatPhase
    where
        B: ChatBackend<Session = S>,
    {
        if !matches!(self.state, ChatState::Uninitialized) {
            return self.phase();
        }

        match backend.start_session(constants::CHAT_PERSONA) {
            Ok(session) => {
                info!("Chat session created");
                self.state = ChatState::Ready(session);
                self.transcript.push(ChatMessage::model(constants::CHAT_GREETING));
            }
            Err(e) => {
                error!("Failed to initialize chat: {}", e);
                self.state = ChatState::Degraded;
                self.transcript
                    .push(ChatMessage::model(constants::CHAT_UNAVAILABLE_MESSAGE));
            }
        }
        self.phase()
    }

    /// Appends the user's message and returns the request to await for the reply.
    pub fn submit(&mut self, input: &str) -> Result<PendingReply, SendRejected> {
        let session = match &self.state {
            ChatState::AwaitingReply { .. } => return Err(SendRejected::InFlight),
            ChatState::Uninitialized | ChatState::Degraded => {
                return Err(SendRejected::NoSession)
            }
            ChatState::Ready(session) => session.clone(),
        };

        let message = input.trim();
        if message.is_empty() {
            return Err(SendRejected::BlankInput);
        }

        self.transcript.push(ChatMessage::user(message));
        self.reply.clear();
        self.state = ChatState::AwaitingReply {
            session: session.clone(),
            streaming: false,
        };
        Ok(session.send_message_stream(message.to_string()))
    }

    /// The reply stream is open: stop waiting and add the empty reply placeholder.
    pub fn stream_opened(&mut self) {
        if let ChatState::AwaitingReply { streaming, .. } = &mut self.state {
            if !*streaming {
                *streaming = true;
                self.transcript.push(ChatMessage::model(""));
            }
        }
    }

    pub fn apply_chunk(&mut self, chunk: &str) {
        if !matches!(self.state, ChatState::AwaitingReply { .. }) {
            warn!("Dropping reply chunk outside of a turn");
            return;
        }
        self.stream_opened();
        self.reply.push_str(chunk);
        self.transcript
            .replace_last(ChatMessage::model(self.reply.clone()));
    }

    pub fn finish_reply(&mut self) {
        self.end_turn();
    }

    /// Leaves any partial reply as it is and appends the apology. An empty
    /// placeholder is replaced by the apology instead.
    pub fn fail_reply(&mut self, cause: &GeminiError) {
        let streaming = match self.state {
            ChatState::AwaitingReply { streaming, .. } => streaming,
            _ => return,
        };
        error!("Chat error: {}", cause);
        let apology = ChatMessage::model(constants::CHAT_REPLY_FAILED_MESSAGE);
        if streaming && self.reply.is_empty() {
            self.transcript.replace_last(apology);
        } else {
            self.transcript.push(apology);
        }
        self.end_turn();
    }

    fn end_turn(&mut self) {
        let state = std::mem::replace(&mut self.state, ChatState::Uninitialized);
        self.state = match state {
            ChatState::AwaitingReply { session, .. } => ChatState::Ready(session),
            other => other,
        };
        self.reply.clear();
    }

    /// Runs a whole turn, calling `on_update` after every transcript change.
    pub async fn send<F>(&mut self, input: &str, mut on_update: F) -> Result<(), SendRejected>
    where
        F: FnMut(&Transcript),
    {
        let pending = self.submit(input)?;
        on_update(&self.transcript);

        let mut reply = match pending.await {
            Ok(reply) => reply,
            Err(e) => {
                self.fail_reply(&e);
                on_update(&self.transcript);
                return Ok(());
            }
        };
        self.stream_opened();
        on_update(&self.transcript);

        while let Some(chunk) = reply.next().await {
            match chunk {
                Ok(text) => {
                    self.apply_chunk(&text);
                    on_update(&self.transcript);
                }
                Err(e) => {
                    self.fail_reply(&e);
                    on_update(&self.transcript);
                    return Ok(());
                }
            }
        }
        self.finish_reply();
        on_update(&self.transcript);
        Ok(())
    }
}

/// Interactive chat on stdin/stdout, printing reply chunks as they arrive.
pub async fn run_terminal_chat<B: ChatBackend>(backend: &B) -> Result<()> {
    let mut assistant = ChatAssistant::new();
    assistant.open(backend);
    for message in assistant.transcript().messages() {
        println!("Aqua: {}", message.content);
    }
    if assistant.phase() == ChatPhase::Degraded {
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().context("Failed to flush stdout")?;

        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        if line.trim() == "/quit" {
            break;
        }

        // (index of the message being printed, bytes of it already printed)
        let mut cursor: Option<(usize, usize)> = None;
        let first_new = assistant.transcript().len() + 1;
        let outcome = assistant
            .send(&line, |transcript| {
                let Some(message) = transcript.last() else {
                    return;
                };
                let index = transcript.len() - 1;
                if index < first_new || message.role != Role::Model {
                    return;
                }
                let printed = match cursor {
                    Some((current, printed)) if current == index => printed,
                    Some(_) => {
                        println!();
                        0
                    }
                    None => {
                        print!("Aqua: ");
                        0
                    }
                };
                print!("{}", &message.content[printed..]);
                let _ = std::io::stdout().flush();
                cursor = Some((index, message.content.len()));
            })
            .await;

        match outcome {
            Ok(()) => println!(),
            Err(SendRejected::BlankInput) => {}
            Err(reason) => println!("({reason})"),
        }
    }
    info!("Chat session finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{future, stream, FutureExt};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    /// Scripted session: replies with the given chunks and records what was sent.
    #[derive(Clone, Default)]
    struct ScriptedSession {
        chunks: Vec<Result<String, String>>,
        fail_to_open: bool,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ChatSession for ScriptedSession {
        fn send_message_stream(&self, message: String) -> PendingReply {
            self.sent.lock().unwrap().push(message);
            if self.fail_to_open {
                return future::ready(Err(GeminiError::Api {
                    status: 503,
                    body: "unavailable".to_string(),
                }))
                .boxed();
            }
            let items: Vec<Result<String, GeminiError>> = self
                .chunks
                .iter()
                .map(|c| c.clone().map_err(GeminiError::Stream))
                .collect();
            future::ready(Ok(stream::iter(items).boxed())).boxed()
        }
    }

    struct ScriptedBackend {
        session: Option<ScriptedSession>,
        starts: AtomicUsize,
    }

    impl ScriptedBackend {
        fn with(session: ScriptedSession) -> Self {
            Self {
                session: Some(session),
                starts: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                session: None,
                starts: AtomicUsize::new(0),
            }
        }
    }

    impl ChatBackend for ScriptedBackend {
        type Session = ScriptedSession;

        fn start_session(&self, system_instruction: &str) -> Result<ScriptedSession, GeminiError> {
            assert_eq!(system_instruction, constants::CHAT_PERSONA);
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.session.clone().ok_or(GeminiError::MissingApiKey)
        }
    }

    fn chunks(parts: &[&str]) -> Vec<Result<String, String>> {
        parts.iter().map(|p| Ok(p.to_string())).collect()
    }

    #[test]
    fn test_open_seeds_greeting_once() {
        let backend = ScriptedBackend::with(ScriptedSession::default());
        let mut assistant = ChatAssistant::new();
        assert_eq!(assistant.phase(), ChatPhase::Uninitialized);

        assert_eq!(assistant.open(&backend), ChatPhase::Ready);
        assert_eq!(assistant.open(&backend), ChatPhase::Ready);

        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
        assert_eq!(
            assistant.transcript().messages(),
            &[ChatMessage::model(constants::CHAT_GREETING)]
        );
    }

    #[test]
    fn test_failed_session_creation_degrades_chat() {
        let backend = ScriptedBackend::failing();
        let mut assistant: ChatAssistant<ScriptedSession> = ChatAssistant::new();

        assert_eq!(assistant.open(&backend), ChatPhase::Degraded);
        assert_eq!(
            assistant.transcript().messages(),
            &[ChatMessage::model(constants::CHAT_UNAVAILABLE_MESSAGE)]
        );

        assert!(matches!(
            assistant.submit("hello?"),
            Err(SendRejected::NoSession)
        ));
        assert_eq!(assistant.open(&backend), ChatPhase::Degraded);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
        assert_eq!(assistant.transcript().len(), 1);
    }

    #[test]
    fn test_submit_before_open_is_rejected() {
        let mut assistant: ChatAssistant<ScriptedSession> = ChatAssistant::new();
        assert!(matches!(assistant.submit("hi"), Err(SendRejected::NoSession)));
        assert!(assistant.transcript().is_empty());
    }

    #[test]
    fn test_blank_submission_is_rejected_without_request() {
        let session = ScriptedSession::default();
        let sent = Arc::clone(&session.sent);
        let mut assistant = ChatAssistant::new();
        assistant.open(&ScriptedBackend::with(session));

        for input in ["", "   ", "\n"] {
            assert!(matches!(assistant.submit(input), Err(SendRejected::BlankInput)));
        }
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(assistant.phase(), ChatPhase::Ready);
    }

    #[test]
    fn test_second_submit_while_in_flight_is_rejected() {
        let session = ScriptedSession {
            chunks: chunks(&["ok"]),
            ..Default::default()
        };
        let sent = Arc::clone(&session.sent);
        let mut assistant = ChatAssistant::new();
        assistant.open(&ScriptedBackend::with(session));

        let _pending = assistant.submit("first").unwrap();
        assert!(assistant.is_waiting());
        assert!(matches!(assistant.submit("second"), Err(SendRejected::InFlight)));

        assistant.stream_opened();
        assert!(!assistant.is_waiting());
        assert!(matches!(assistant.submit("third"), Err(SendRejected::InFlight)));

        assert_eq!(*sent.lock().unwrap(), vec!["first".to_string()]);
        // greeting, user message, placeholder
        assert_eq!(assistant.transcript().len(), 3);
    }

    #[tokio::test]
    async fn test_send_streams_chunks_in_order() {
        let parts = ["Water ", "footprints ", "measure ", "freshwater use."];
        let session = ScriptedSession {
            chunks: chunks(&parts),
            ..Default::default()
        };
        let sent = Arc::clone(&session.sent);
        let mut assistant = ChatAssistant::new();
        assistant.open(&ScriptedBackend::with(session));

        let mut snapshots = Vec::new();
        assistant
            .send("  What is a water footprint? ", |t| {
                snapshots.push(t.last().map(|m| m.content.clone()).unwrap_or_default())
            })
            .await
            .unwrap();

        assert_eq!(*sent.lock().unwrap(), vec!["What is a water footprint?".to_string()]);
        assert_eq!(
            assistant.transcript().messages(),
            &[
                ChatMessage::model(constants::CHAT_GREETING),
                ChatMessage::user("What is a water footprint?"),
                ChatMessage::model(parts.concat()),
            ]
        );
        assert_eq!(assistant.phase(), ChatPhase::Ready);

        // user message, empty placeholder, one update per chunk, turn end
        assert_eq!(snapshots[0], "What is a water footprint?");
        assert_eq!(snapshots[1], "");
        assert_eq!(snapshots[2], "Water ");
        assert_eq!(snapshots[3], "Water footprints ");
        assert_eq!(snapshots[5], parts.concat());
        assert_eq!(snapshots.len(), 7);
    }

    #[tokio::test]
    async fn test_streaming_never_touches_earlier_messages() {
        let session = ScriptedSession {
            chunks: chunks(&["a", "b"]),
            ..Default::default()
        };
        let mut assistant = ChatAssistant::new();
        assistant.open(&ScriptedBackend::with(session));
        assistant.send("one", |_| {}).await.unwrap();
        let before = assistant.transcript().messages()[..3].to_vec();

        assistant.send("two", |_| {}).await.unwrap();
        assert_eq!(&assistant.transcript().messages()[..3], before.as_slice());
        assert_eq!(assistant.transcript().len(), 5);
        assert_eq!(assistant.transcript().messages()[4], ChatMessage::model("ab"));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_appends_apology() {
        let session = ScriptedSession {
            chunks: vec![Ok("Partial".to_string()), Err("connection reset".to_string())],
            ..Default::default()
        };
        let mut assistant = ChatAssistant::new();
        assistant.open(&ScriptedBackend::with(session));

        assistant.send("tell me", |_| {}).await.unwrap();

        let messages = assistant.transcript().messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2], ChatMessage::model("Partial"));
        assert_eq!(
            messages[3],
            ChatMessage::model(constants::CHAT_REPLY_FAILED_MESSAGE)
        );
        assert_eq!(assistant.phase(), ChatPhase::Ready);
    }

    #[tokio::test]
    async fn test_failure_before_any_text_replaces_placeholder() {
        let session = ScriptedSession {
            chunks: vec![Err("blocked".to_string())],
            ..Default::default()
        };
        let mut assistant = ChatAssistant::new();
        assistant.open(&ScriptedBackend::with(session));

        assistant.send("tell me", |_| {}).await.unwrap();

        assert_eq!(
            assistant.transcript().messages()[1..],
            [
                ChatMessage::user("tell me"),
                ChatMessage::model(constants::CHAT_REPLY_FAILED_MESSAGE)
            ]
        );
        assert_eq!(assistant.phase(), ChatPhase::Ready);
    }

    #[tokio::test]
    async fn test_failure_to_open_stream_appends_apology_and_recovers() {
        let session = ScriptedSession {
            fail_to_open: true,
            ..Default::default()
        };
        let sent = Arc::clone(&session.sent);
        let mut assistant = ChatAssistant::new();
        assistant.open(&ScriptedBackend::with(session));

        assistant.send("hello", |_| {}).await.unwrap();
        assert_eq!(
            assistant.transcript().messages()[1..],
            [
                ChatMessage::user("hello"),
                ChatMessage::model(constants::CHAT_REPLY_FAILED_MESSAGE)
            ]
        );
        assert_eq!(assistant.phase(), ChatPhase::Ready);

        assistant.send("again", |_| {}).await.unwrap();
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_chunk_outside_turn_is_ignored() {
        let mut assistant = ChatAssistant::new();
        assistant.open(&ScriptedBackend::with(ScriptedSession::default()));
        assistant.apply_chunk("stray");
        assert_eq!(assistant.transcript().len(), 1);
    }

    #[test]
    fn test_transcript_serializes_as_message_list() {
        let mut transcript = Transcript::default();
        transcript.push(ChatMessage::user("hi"));
        transcript.push(ChatMessage::model("hello"));
        assert_eq!(
            serde_json::to_value(&transcript).unwrap(),
            serde_json::json!([
                {"role": "user", "content": "hi"},
                {"role": "model", "content": "hello"}
            ])
        );
    }

    #[test]
    fn test_replace_last_on_empty_transcript_pushes() {
        let mut transcript = Transcript::default();
        transcript.replace_last(ChatMessage::model("x"));
        assert_eq!(transcript.len(), 1);
    }
}
