//! Chat service — one streamed conversation rendered as a transcript.
//!
//! DESIGN
//! ======
//! The manager owns a single provider session and the visible transcript.
//! A turn appends the user message and an empty model placeholder up
//! front, then rewrites the placeholder with the running concatenation of
//! fragments as they arrive. Provider failures never escape: the
//! placeholder is replaced by a fixed apology and the turn ends normally.
//!
//! TRADE-OFFS
//! ==========
//! On a mid-stream failure the partial reply is discarded rather than kept
//! above a separate error bubble. Every turn therefore contributes exactly
//! one user and one model message, at the cost of hiding text the user may
//! already have seen scroll by.
//!
//! State sits behind a `std::sync::Mutex` that is only held for short
//! bookkeeping, never across an `.await`. Single-flight is the `busy`
//! flag: a second `send_turn` polled while one is streaming is refused,
//! not queued. A turn whose future is dropped ends as a failed turn and
//! gives the session back.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::llm::{ChatModel, ChatSession};

pub const GREETING: &str = "Hello! How can I help with your gardening today?";
pub const FALLBACK_REPLY: &str = "Sorry, I encountered an error. Please try again.";

/// Persona sent as the system instruction when the session is created.
pub const SYSTEM_INSTRUCTION: &str = "You are a friendly and knowledgeable gardening assistant. \
Answer questions about plants, soil, watering, pests, pruning and seasonal garden care. \
Give practical, concise advice suitable for home gardeners, and say so when a question \
needs a local expert or a closer look at the plant.";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyInput,
    #[error("a reply is still streaming")]
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    #[must_use]
    pub fn model(text: impl Into<String>) -> Self {
        Self { role: Role::Model, text: text.into() }
    }
}

/// How an accepted turn ended. Either way the transcript's last entry is
/// the returned message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The stream was drained; the message holds the full reply.
    Completed(Message),
    /// Session or provider failure; the message is the fallback reply.
    Failed(Message),
}

impl TurnOutcome {
    #[must_use]
    pub fn message(&self) -> &Message {
        match self {
            Self::Completed(m) | Self::Failed(m) => m,
        }
    }
}

enum SessionSlot {
    Uninitialized,
    Initializing,
    Ready(Box<dyn ChatSession>),
    /// Taken out for the turn currently in flight.
    Lent,
    Failed(String),
}

struct ChatState {
    transcript: Vec<Message>,
    busy: bool,
    session: SessionSlot,
}

// =============================================================================
// MANAGER
// =============================================================================

pub struct ChatSessionManager {
    model: Arc<dyn ChatModel>,
    id: Uuid,
    state: Mutex<ChatState>,
}

impl ChatSessionManager {
    /// New manager with a transcript holding only the greeting. No session
    /// exists until [`Self::initialize`] runs.
    #[must_use]
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            id: Uuid::new_v4(),
            state: Mutex::new(ChatState {
                transcript: vec![Message::model(GREETING)],
                busy: false,
                session: SessionSlot::Uninitialized,
            }),
        }
    }

    /// Create the provider session. Only the first call does anything;
    /// a creation failure is remembered and reported by the next turn.
    pub async fn initialize(&self) {
        {
            let mut state = self.lock();
            if !matches!(state.session, SessionSlot::Uninitialized) {
                return;
            }
            state.session = SessionSlot::Initializing;
        }

        let created = self.model.start_chat(SYSTEM_INSTRUCTION).await;
        let mut state = self.lock();
        state.session = match created {
            Ok(session) => {
                info!(session_id = %self.id, "chat: session created");
                SessionSlot::Ready(session)
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "chat: session creation failed");
                SessionSlot::Failed(e.to_string())
            }
        };
    }

    /// Send one user turn and wait for the streamed reply.
    ///
    /// # Errors
    ///
    /// [`ChatError::EmptyInput`] for blank text, [`ChatError::Busy`] while
    /// another turn is in flight. Neither touches the transcript.
    pub async fn send_turn(&self, text: &str) -> Result<TurnOutcome, ChatError> {
        self.send_turn_with(text, |_| {}).await
    }

    /// Like [`Self::send_turn`], calling `on_update` with the last transcript
    /// entry after every change (placeholder, each fragment, final state).
    ///
    /// # Errors
    ///
    /// Same as [`Self::send_turn`].
    pub async fn send_turn_with<F>(&self, text: &str, mut on_update: F) -> Result<TurnOutcome, ChatError>
    where
        F: FnMut(&Message),
    {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyInput);
        }

        let session = {
            let mut state = self.lock();
            if state.busy {
                return Err(ChatError::Busy);
            }
            state.busy = true;
            state.transcript.push(Message::user(text));
            state.transcript.push(Message::model(""));
            match std::mem::replace(&mut state.session, SessionSlot::Lent) {
                SessionSlot::Ready(session) => Ok(session),
                other => {
                    let reason = match &other {
                        SessionSlot::Failed(reason) => reason.clone(),
                        _ => "chat session not initialized".to_string(),
                    };
                    state.session = other;
                    Err(reason)
                }
            }
        };
        let mut guard = TurnGuard { manager: self, session: None, finished: false };
        on_update(&Message::model(""));
        info!(session_id = %self.id, text_len = text.len(), "chat: turn started");

        let outcome = match session {
            Ok(session) => {
                let session = guard.session.insert(session);
                self.stream_reply(session.as_mut(), text, &mut on_update).await
            }
            Err(reason) => {
                warn!(session_id = %self.id, %reason, "chat: no usable session");
                None
            }
        };
        guard.finished = true;
        drop(guard);

        Ok(match outcome {
            Some(reply) => self.finish_turn(reply),
            None => self.fail_turn(&mut on_update),
        })
    }

    /// Drain the provider stream into the placeholder. `None` on failure.
    async fn stream_reply<F>(&self, session: &mut dyn ChatSession, text: &str, on_update: &mut F) -> Option<Message>
    where
        F: FnMut(&Message),
    {
        let mut stream = match session.send_message_stream(text).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "chat: stream failed to open");
                return None;
            }
        };

        let mut reply = String::new();
        let mut fragments = 0_usize;
        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) => {
                    reply.push_str(&fragment);
                    fragments += 1;
                    let current = Message::model(reply.clone());
                    self.replace_last(current.clone());
                    on_update(&current);
                }
                Err(e) => {
                    warn!(session_id = %self.id, fragments, error = %e, "chat: stream failed mid-reply");
                    return None;
                }
            }
        }

        info!(session_id = %self.id, fragments, reply_len = reply.len(), "chat: turn completed");
        Some(Message::model(reply))
    }

    fn finish_turn(&self, reply: Message) -> TurnOutcome {
        let mut state = self.lock();
        if let Some(last) = state.transcript.last_mut() {
            last.clone_from(&reply);
        }
        state.busy = false;
        TurnOutcome::Completed(reply)
    }

    fn fail_turn<F>(&self, on_update: &mut F) -> TurnOutcome
    where
        F: FnMut(&Message),
    {
        let fallback = Message::model(FALLBACK_REPLY);
        {
            let mut state = self.lock();
            if let Some(last) = state.transcript.last_mut() {
                last.clone_from(&fallback);
            }
            state.busy = false;
        }
        on_update(&fallback);
        TurnOutcome::Failed(fallback)
    }

    fn replace_last(&self, message: Message) {
        if let Some(last) = self.lock().transcript.last_mut() {
            *last = message;
        }
    }

    /// Snapshot of the transcript, greeting first.
    #[must_use]
    pub fn transcript(&self) -> Vec<Message> {
        self.lock().transcript.clone()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    /// `true` once a session exists (including while it is lent to a turn).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.lock().session, SessionSlot::Ready(_) | SessionSlot::Lent)
    }

    /// Identifier used to correlate log lines for this conversation.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Hands a lent session back to the manager. If the turn's future is
/// dropped before the reply is in, it also ends the turn with the fallback
/// reply and clears `busy`.
struct TurnGuard<'m> {
    manager: &'m ChatSessionManager,
    session: Option<Box<dyn ChatSession>>,
    finished: bool,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.manager.lock();
        if let Some(session) = self.session.take() {
            state.session = SessionSlot::Ready(session);
        }
        if self.finished {
            return;
        }
        warn!(session_id = %self.manager.id, "chat: turn abandoned");
        if let Some(last) = state.transcript.last_mut() {
            *last = Message::model(FALLBACK_REPLY);
        }
        state.busy = false;
    }
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
