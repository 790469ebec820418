//! # Realtime Engine Client
//!
//! Websocket client for the engine's realtime conversation API. One
//! connection per call, opened when the media stream attaches and closed
//! when the call is finalized.
//!
//! ## Protocol:
//! - We send `conversation_initiation_client_data` once, then
//!   `user_audio_chunk` messages carrying base64 caller audio
//! - The engine sends typed JSON events: conversation metadata, synthesized
//!   audio, transcripts, interruptions, and pings that expect a pong
//!
//! ## Task model:
//! Each session runs one relay task that owns both halves of the socket.
//! Caller audio reaches it through an unbounded channel, so
//! [`EngineSession::feed_audio`] never blocks the socket actor; closing
//! that channel is the orderly-goodbye signal.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::{ConversationEngine, EngineError, EngineEvents, EngineSession};

/// How long `end` waits for the relay task after asking it to close.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Events the engine sends over the session socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerEvent {
    ConversationInitiationMetadata {
        conversation_initiation_metadata_event: InitiationMetadata,
    },
    Audio {
        audio_event: AudioEvent,
    },
    AgentResponse {
        agent_response_event: AgentResponseEvent,
    },
    UserTranscript {
        user_transcription_event: UserTranscriptEvent,
    },
    Interruption,
    Ping {
        ping_event: PingEvent,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct InitiationMetadata {
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
struct AudioEvent {
    audio_base_64: String,
}

#[derive(Debug, Deserialize)]
struct AgentResponseEvent {
    agent_response: String,
}

#[derive(Debug, Deserialize)]
struct UserTranscriptEvent {
    user_transcript: String,
}

#[derive(Debug, Deserialize)]
struct PingEvent {
    event_id: u64,
}

fn initiation_message() -> String {
    json!({"type": "conversation_initiation_client_data"}).to_string()
}

fn audio_message(chunk: &[u8]) -> String {
    json!({"user_audio_chunk": BASE64.encode(chunk)}).to_string()
}

fn pong_message(event_id: u64) -> String {
    json!({"type": "pong", "event_id": event_id}).to_string()
}

/// Engine client configured against the realtime conversation API.
pub struct RealtimeEngine {
    config: EngineConfig,
}

impl RealtimeEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConversationEngine for RealtimeEngine {
    async fn start_session(
        &self,
        events: Arc<dyn EngineEvents>,
    ) -> Result<Box<dyn EngineSession>, EngineError> {
        let url = format!("{}?agent_id={}", self.config.ws_url, self.config.agent_id);
        let mut request = url
            .into_client_request()
            .map_err(|err| EngineError::Connect(err.to_string()))?;

        if let Some(api_key) = &self.config.api_key {
            let value = api_key
                .parse()
                .map_err(|_| EngineError::Connect("API key is not a valid header value".to_string()))?;
            request.headers_mut().insert("xi-api-key", value);
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|err| EngineError::Connect(err.to_string()))?;
        let (mut write, mut read) = stream.split();

        write
            .send(Message::Text(initiation_message()))
            .await
            .map_err(|err| EngineError::Connect(err.to_string()))?;

        info!(agent_id = %self.config.agent_id, "Engine session connected");

        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel::<Bytes>();
        let conversation_id = Arc::new(Mutex::new(None::<String>));
        let task_conversation_id = conversation_id.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    incoming = read.next() => {
                        let text = match incoming {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) => {
                                info!("Engine closed the session");
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(err)) => {
                                warn!("Engine socket error: {}", err);
                                break;
                            }
                            None => break,
                        };

                        let event = match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => event,
                            Err(err) => {
                                debug!("Unparseable engine event: {}", err);
                                continue;
                            }
                        };

                        match event {
                            ServerEvent::ConversationInitiationMetadata {
                                conversation_initiation_metadata_event: metadata,
                            } => {
                                info!(
                                    conversation_id = %metadata.conversation_id,
                                    "Conversation started"
                                );
                                *task_conversation_id.lock().unwrap() =
                                    Some(metadata.conversation_id);
                            }
                            ServerEvent::Audio { audio_event } => {
                                match BASE64.decode(audio_event.audio_base_64.as_bytes()) {
                                    Ok(audio) => events.on_audio(Bytes::from(audio)),
                                    Err(err) => warn!("Engine sent invalid audio payload: {}", err),
                                }
                            }
                            ServerEvent::AgentResponse { agent_response_event } => {
                                events.on_agent_transcript(&agent_response_event.agent_response);
                            }
                            ServerEvent::UserTranscript { user_transcription_event } => {
                                events.on_user_transcript(&user_transcription_event.user_transcript);
                            }
                            ServerEvent::Interruption => {
                                events.on_interruption();
                            }
                            ServerEvent::Ping { ping_event } => {
                                let pong = Message::Text(pong_message(ping_event.event_id));
                                if write.send(pong).await.is_err() {
                                    break;
                                }
                            }
                            ServerEvent::Unknown => {
                                debug!("Ignoring unhandled engine event");
                            }
                        }
                    }
                    outgoing = audio_rx.recv() => {
                        match outgoing {
                            Some(chunk) => {
                                let message = Message::Text(audio_message(&chunk));
                                if write.send(message).await.is_err() {
                                    warn!("Could not forward caller audio, closing session");
                                    break;
                                }
                            }
                            None => {
                                // Session ended on our side; say goodbye.
                                let _ = write.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::new(RealtimeSession {
            audio_tx,
            conversation_id,
            task,
        }))
    }
}

/// One live engine conversation.
pub struct RealtimeSession {
    audio_tx: mpsc::UnboundedSender<Bytes>,
    conversation_id: Arc<Mutex<Option<String>>>,
    task: JoinHandle<()>,
}

#[async_trait]
impl EngineSession for RealtimeSession {
    fn feed_audio(&self, chunk: Bytes) {
        // A closed channel means the relay already exited; audio arriving
        // after that point is simply late and can be dropped.
        let _ = self.audio_tx.send(chunk);
    }

    async fn end(self: Box<Self>) -> Option<String> {
        let Self {
            audio_tx,
            conversation_id,
            mut task,
        } = *self;

        // Closing the channel makes the relay send a websocket close.
        drop(audio_tx);

        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            warn!("Engine session did not close in time, aborting relay task");
            task.abort();
        }

        let conversation_id = conversation_id.lock().unwrap().take();
        debug!(conversation_id = ?conversation_id, "Engine session closed");
        conversation_id
    }
}
