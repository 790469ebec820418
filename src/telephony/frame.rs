//! # Media Stream Frame Codec
//!
//! Encodes and decodes the JSON events exchanged with the telephony provider
//! over the media-stream WebSocket. Every message is a small JSON document
//! tagged with an `event` field; audio travels base64-encoded inside
//! `media.payload`.
//!
//! ## Wire Format:
//! - **Inbound**: `connected`, `start` (carries the stream SID), `media`
//!   (base64 audio), `stop`, `mark`, `clear`
//! - **Outbound**: `media` (base64 audio tagged with the stream SID) and
//!   `clear` (discard buffered playback on the provider side)
//!
//! Unrecognized or malformed messages decode to [`InboundFrame::Ignored`]
//! so a single bad frame never tears down a live call.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

/// Raw provider event as it appears on the wire.
///
/// ## Rust Concepts:
/// - **#[serde(tag = "event")]**: The `event` field selects the variant
/// - **Unit variants**: Events whose extra fields we never read (serde
///   ignores unknown fields by default)
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum WireEvent {
    /// Sent once when the provider opens the socket
    Connected,

    /// Stream metadata, including the stream SID needed for outbound frames
    Start { start: StartMeta },

    /// One chunk of base64-encoded caller audio
    Media { media: MediaPayload },

    /// The provider is done sending audio for this call
    Stop,

    /// Playback-position marker acknowledgment
    Mark,

    /// Acknowledgment of an outbound clear
    Clear,
}

#[derive(Debug, Deserialize)]
struct StartMeta {
    #[serde(rename = "streamSid")]
    stream_sid: String,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
}

/// Decoded inbound frame, ready for the bridge to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Stream opened; carries the provider-issued stream SID
    Start { stream_sid: String },

    /// Raw caller audio bytes (already base64-decoded)
    Media { audio: Bytes },

    /// Provider requested an orderly end of the stream
    Stop,

    /// Provider acknowledged a clear we sent earlier
    ClearAck,

    /// Keep-alive, unknown event type, or malformed message
    Ignored,
}

/// Stateless codec for provider media-stream messages.
///
/// ## Error Handling:
/// Decoding never fails. Anything that cannot be understood (bad JSON,
/// missing fields, invalid base64) is logged and mapped to
/// [`InboundFrame::Ignored`], keeping the connection alive.
pub struct FrameCodec;

impl FrameCodec {
    /// Decode one raw text message from the provider.
    pub fn decode(raw: &str) -> InboundFrame {
        let event = match serde_json::from_str::<WireEvent>(raw) {
            Ok(event) => event,
            Err(err) => {
                debug!("Ignoring unrecognized media-stream message: {}", err);
                return InboundFrame::Ignored;
            }
        };

        match event {
            WireEvent::Start { start } => InboundFrame::Start {
                stream_sid: start.stream_sid,
            },
            WireEvent::Media { media } => match BASE64.decode(media.payload.as_bytes()) {
                Ok(audio) => InboundFrame::Media {
                    audio: Bytes::from(audio),
                },
                Err(err) => {
                    warn!("Discarding media frame with invalid base64 payload: {}", err);
                    InboundFrame::Ignored
                }
            },
            WireEvent::Stop => InboundFrame::Stop,
            WireEvent::Clear => InboundFrame::ClearAck,
            WireEvent::Connected | WireEvent::Mark => InboundFrame::Ignored,
        }
    }

    /// Encode one chunk of agent audio as an outbound media frame.
    ///
    /// The payload is re-encoded with the standard base64 alphabet, so a
    /// decode followed by an encode is a byte-exact round trip.
    pub fn encode_media(stream_sid: &str, audio: &[u8]) -> String {
        json!({
            "event": "media",
            "streamSid": stream_sid,
            "media": { "payload": BASE64.encode(audio) },
        })
        .to_string()
    }

    /// Encode a clear frame telling the provider to drop buffered playback.
    pub fn encode_clear(stream_sid: &str) -> String {
        json!({ "event": "clear", "streamSid": stream_sid }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_round_trip_is_byte_exact() {
        let audio: Vec<u8> = vec![0x00, 0x7f, 0x80, 0xff, 0x10, 0x42];
        let wire = FrameCodec::encode_media("MZ1234", &audio);

        match FrameCodec::decode(&wire) {
            InboundFrame::Media { audio: decoded } => {
                assert_eq!(decoded.as_ref(), audio.as_slice());
            }
            other => panic!("Expected media frame, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_start_extracts_stream_sid() {
        let raw = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "start": {
                "accountSid": "AC000",
                "streamSid": "MZabc123",
                "callSid": "CA123",
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000}
            },
            "streamSid": "MZabc123"
        }"#;

        assert_eq!(
            FrameCodec::decode(raw),
            InboundFrame::Start {
                stream_sid: "MZabc123".to_string()
            }
        );
    }

    #[test]
    fn test_decode_stop_ignores_extra_fields() {
        let raw = r#"{"event": "stop", "sequenceNumber": "9", "stop": {"callSid": "CA123"}, "streamSid": "MZabc123"}"#;
        assert_eq!(FrameCodec::decode(raw), InboundFrame::Stop);
    }

    #[test]
    fn test_decode_clear_maps_to_ack() {
        let raw = r#"{"event": "clear", "streamSid": "MZabc123"}"#;
        assert_eq!(FrameCodec::decode(raw), InboundFrame::ClearAck);
    }

    #[test]
    fn test_keep_alive_events_are_ignored() {
        let connected = r#"{"event": "connected", "protocol": "Call", "version": "1.0.0"}"#;
        let mark = r#"{"event": "mark", "streamSid": "MZ1", "mark": {"name": "m1"}}"#;

        assert_eq!(FrameCodec::decode(connected), InboundFrame::Ignored);
        assert_eq!(FrameCodec::decode(mark), InboundFrame::Ignored);
    }

    #[test]
    fn test_missing_payload_field_is_ignored() {
        let raw = r#"{"event": "media", "streamSid": "MZ1", "media": {"track": "inbound"}}"#;
        assert_eq!(FrameCodec::decode(raw), InboundFrame::Ignored);
    }

    #[test]
    fn test_invalid_base64_is_ignored() {
        let raw = r#"{"event": "media", "media": {"payload": "!!!not base64!!!"}}"#;
        assert_eq!(FrameCodec::decode(raw), InboundFrame::Ignored);
    }

    #[test]
    fn test_unknown_event_and_bad_json_are_ignored() {
        assert_eq!(
            FrameCodec::decode(r#"{"event": "dtmf", "digit": "5"}"#),
            InboundFrame::Ignored
        );
        assert_eq!(FrameCodec::decode("definitely not json"), InboundFrame::Ignored);
    }

    #[test]
    fn test_encode_clear_shape() {
        let wire = FrameCodec::encode_clear("MZ77");
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();

        assert_eq!(value["event"], "clear");
        assert_eq!(value["streamSid"], "MZ77");
    }
}
