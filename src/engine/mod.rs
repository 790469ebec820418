//! # Conversation Engine Module
//!
//! Abstraction over the realtime voice-AI service that holds the actual
//! conversation with the caller. The rest of the system only ever sees the
//! three traits defined here; the concrete WebSocket client lives in
//! [`realtime`].
//!
//! ## Key Components:
//! - **ConversationEngine**: Factory that opens one engine session per call
//! - **EngineSession**: Live session handle (feed caller audio in, end it)
//! - **EngineEvents**: Callbacks the engine fires from its own tasks
//!   (synthesized audio, interruptions, transcripts)
//!
//! ## Audio Contract:
//! Audio crosses this boundary as raw bytes in whatever encoding the
//! telephony provider negotiated. No transcoding happens anywhere in this
//! service; both sides are configured for the same format.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub mod realtime;

pub use realtime::RealtimeEngine;

/// Errors raised while talking to the conversation engine.
#[derive(Debug)]
pub enum EngineError {
    /// The session could not be established (connect/handshake failure)
    Connect(String),

    /// The established session failed while being set up
    Session(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Connect(msg) => write!(f, "Engine connect failed: {}", msg),
            EngineError::Session(msg) => write!(f, "Engine session error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

/// Callbacks invoked by the engine from its own execution context.
///
/// ## Thread Safety:
/// The engine calls these from tasks the bridge does not control, so every
/// implementation must be non-blocking and safe to call concurrently.
pub trait EngineEvents: Send + Sync {
    /// One chunk of synthesized agent audio, ready to relay to the caller.
    fn on_audio(&self, chunk: Bytes);

    /// The caller started speaking over the agent; buffered agent audio
    /// should be discarded immediately.
    fn on_interruption(&self);

    /// Text of what the agent just said.
    fn on_agent_transcript(&self, text: &str);

    /// Transcription of what the caller just said.
    fn on_user_transcript(&self, text: &str);
}

/// A live conversation session.
#[async_trait]
pub trait EngineSession: Send + Sync {
    /// Forward one chunk of caller audio to the engine.
    ///
    /// Called from the inbound socket path for every media frame; must not
    /// block and must preserve the order chunks are handed in.
    fn feed_audio(&self, chunk: Bytes);

    /// End the session and return the engine's conversation identifier,
    /// if one was ever reported.
    async fn end(self: Box<Self>) -> Option<String>;
}

/// Factory for conversation sessions, one per active call.
#[async_trait]
pub trait ConversationEngine: Send + Sync {
    /// Open a new session wired to the given event callbacks.
    ///
    /// Returns an error without side effects if the session cannot be
    /// established; the caller decides whether the call proceeds.
    async fn start_session(
        &self,
        events: Arc<dyn EngineEvents>,
    ) -> Result<Box<dyn EngineSession>, EngineError>;
}
