//! # Telephony Module
//!
//! Everything that speaks the provider's media-stream dialect:
//!
//! - **frame**: JSON frame codec (base64 audio in, tagged events out)
//! - **queue**: bounded output queue with a clear barrier for barge-in
//! - **bridge**: per-call duplex relay between socket and engine
//! - **registry**: at-most-one live bridge per call

pub mod bridge;
pub mod frame;
pub mod queue;
pub mod registry;

pub use bridge::{AudioBridge, BridgeEvents, FrameSink, InboundOutcome, PumpExit, SinkError};
pub use registry::{RegisterError, SessionRegistry};
