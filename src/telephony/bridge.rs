//! # Audio Bridge
//!
//! Owns the duplex audio path for one call: decoded frames from the
//! provider socket flow into the conversation engine, and synthesized audio
//! from the engine flows back out through a bounded queue and a frame sink.
//!
//! ## Lifecycle:
//! 1. **Built** when the media socket arrives, before any frame is read
//! 2. **Running** once the provider's start frame delivers the stream SID
//! 3. **Stopped** exactly once, no matter how many paths race to stop it
//!    (stop frame, socket close, status callback, process shutdown)
//!
//! ## Concurrency:
//! The inbound handler runs on the socket's delivery context, the outbound
//! pump runs on its own task, and the engine fires callbacks from tasks of
//! its own. They share only atomics, the stream SID lock, and the output
//! queue, and all observe the same running/stopping flags.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::engine::{EngineEvents, EngineSession};
use crate::telephony::frame::{FrameCodec, InboundFrame};
use crate::telephony::queue::OutputQueue;

/// Write handle for outbound frames, implemented by the socket layer.
///
/// ## Thread Safety:
/// Called from the pump task and from interruption handling; must be
/// non-blocking. A full sink reports [`SinkError::Busy`] so the caller can
/// shed the frame instead of stalling the audio path.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: String) -> Result<(), SinkError>;
}

/// Why a frame could not be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    /// No socket attached yet
    NotReady,

    /// The socket's mailbox is full; drop the frame and keep going
    Busy,

    /// The socket is gone; the pump should exit
    Closed,
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::NotReady => write!(f, "frame sink not attached"),
            SinkError::Busy => write!(f, "frame sink busy"),
            SinkError::Closed => write!(f, "frame sink closed"),
        }
    }
}

/// What the inbound handler wants its driver to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Keep reading frames
    Continue,

    /// The provider asked for an orderly stop; begin cleanup
    StopRequested,
}

/// Why the outbound pump loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The stop flag was set through the normal shutdown path
    Stopped,

    /// The socket closed underneath the pump
    SinkClosed,
}

/// The per-call duplex audio relay.
///
/// ## Thread Safety:
/// Shared as `Arc<AudioBridge>` between the socket actor, the pump task,
/// the engine callbacks, and the session registry. Flags are atomics; the
/// stream SID sits behind a read-write lock because it is written once and
/// read on every outbound frame.
pub struct AudioBridge {
    call_sid: String,

    /// Stream SID issued by the provider's start frame; required to tag
    /// every outbound frame
    stream_sid: RwLock<Option<String>>,

    /// Set by the start frame, cleared by shutdown; gates both directions
    running: AtomicBool,

    /// First shutdown caller wins this flag; everyone else no-ops
    stopping: AtomicBool,

    /// Whether any caller audio was forwarded to the engine
    saw_media: AtomicBool,

    /// Whether the provider sent an explicit stop frame
    provider_stopped: AtomicBool,

    output: Arc<OutputQueue>,
    sink: Arc<dyn FrameSink>,

    /// Taken exactly once during shutdown
    engine: Mutex<Option<Box<dyn EngineSession>>>,

    /// How long one pump iteration waits on the queue before re-checking
    /// the stop flag
    drain_wait: Duration,
}

impl AudioBridge {
    pub fn new(
        call_sid: String,
        sink: Arc<dyn FrameSink>,
        queue_capacity: usize,
        drain_wait: Duration,
    ) -> Self {
        Self {
            call_sid,
            stream_sid: RwLock::new(None),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            saw_media: AtomicBool::new(false),
            provider_stopped: AtomicBool::new(false),
            output: Arc::new(OutputQueue::new(queue_capacity)),
            sink,
            engine: Mutex::new(None),
            drain_wait,
        }
    }

    pub fn call_sid(&self) -> &str {
        &self.call_sid
    }

    /// Attach the engine session produced for this call.
    ///
    /// Done once right after the session is established, before the bridge
    /// is registered and before any media frame can arrive.
    pub fn attach_engine(&self, session: Box<dyn EngineSession>) {
        *self.engine.lock().unwrap() = Some(session);
    }

    /// Process one raw text message from the provider socket.
    ///
    /// ## Behavior by frame:
    /// - **Start**: records the stream SID and marks the bridge running
    /// - **Media**: forwards decoded audio to the engine, but only while
    ///   running and in socket-delivery order
    /// - **Stop**: marks the stop as provider-initiated and tells the
    ///   caller to begin cleanup
    /// - **ClearAck / Ignored**: no effect
    pub fn handle_inbound(&self, raw: &str) -> InboundOutcome {
        match FrameCodec::decode(raw) {
            InboundFrame::Start { stream_sid } => {
                info!(
                    call_sid = %self.call_sid,
                    stream_sid = %stream_sid,
                    "Media stream started"
                );
                *self.stream_sid.write().unwrap() = Some(stream_sid);
                self.running.store(true, Ordering::SeqCst);
                InboundOutcome::Continue
            }
            InboundFrame::Media { audio } => {
                if self.running.load(Ordering::SeqCst) {
                    let engine = self.engine.lock().unwrap();
                    if let Some(session) = engine.as_ref() {
                        session.feed_audio(audio);
                        self.saw_media.store(true, Ordering::SeqCst);
                    }
                }
                InboundOutcome::Continue
            }
            InboundFrame::Stop => {
                info!(call_sid = %self.call_sid, "Provider requested stream stop");
                self.provider_stopped.store(true, Ordering::SeqCst);
                InboundOutcome::StopRequested
            }
            InboundFrame::ClearAck | InboundFrame::Ignored => InboundOutcome::Continue,
        }
    }

    /// Queue one chunk of synthesized agent audio for the caller.
    ///
    /// Safe to call from any engine task; never blocks. Once the bridge is
    /// shut down the queue is closed and chunks are silently discarded.
    pub fn enqueue_outbound(&self, chunk: Bytes) {
        self.output.push(chunk);
    }

    /// Discard all pending agent audio and tell the provider to do the
    /// same with anything it has buffered.
    pub fn interrupt(&self) {
        self.output.clear();

        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let stream_sid = self.stream_sid.read().unwrap().clone();
        if let Some(sid) = stream_sid {
            if let Err(err) = self.sink.send_frame(FrameCodec::encode_clear(&sid)) {
                debug!(call_sid = %self.call_sid, "Could not send clear frame: {}", err);
            }
        }
    }

    /// Drain the output queue onto the socket until told to stop.
    ///
    /// ## Loop Invariants:
    /// - Each drained chunk is re-checked against the running flag and the
    ///   stream SID; chunks that arrive before the stream is ready are
    ///   dropped rather than mis-framed
    /// - A busy sink costs one frame, never a stall
    /// - A closed sink ends the loop so the caller can run cleanup
    pub async fn run_outbound_pump(&self) -> PumpExit {
        debug!(call_sid = %self.call_sid, "Outbound pump started");

        while !self.stopping.load(Ordering::SeqCst) {
            let chunk = match self.output.drain_with_timeout(self.drain_wait).await {
                Some(chunk) => chunk,
                None => continue,
            };

            if !self.running.load(Ordering::SeqCst) {
                continue;
            }

            let stream_sid = self.stream_sid.read().unwrap().clone();
            let sid = match stream_sid {
                Some(sid) => sid,
                None => {
                    debug!(call_sid = %self.call_sid, "Dropping chunk, stream not started");
                    continue;
                }
            };

            match self.sink.send_frame(FrameCodec::encode_media(&sid, &chunk)) {
                Ok(()) => {}
                Err(SinkError::Busy) | Err(SinkError::NotReady) => {
                    debug!(call_sid = %self.call_sid, "Dropped outbound frame, sink unavailable");
                }
                Err(SinkError::Closed) => {
                    warn!(call_sid = %self.call_sid, "Socket closed, outbound pump exiting");
                    return PumpExit::SinkClosed;
                }
            }
        }

        debug!(call_sid = %self.call_sid, "Outbound pump stopped");
        PumpExit::Stopped
    }

    /// Tear the bridge down exactly once.
    ///
    /// ## Idempotency:
    /// Any number of callers may race here (inbound stop, pump error,
    /// disconnect, status callback, process shutdown). The first one flips
    /// the stopping flag, stops the pump, closes the queue, and ends the
    /// engine session; the rest return immediately with `None`.
    ///
    /// ## Returns:
    /// The engine's conversation identifier, only to the caller that
    /// performed the teardown and only if the engine reported one.
    pub async fn shutdown(&self) -> Option<String> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return None;
        }

        info!(call_sid = %self.call_sid, "Shutting down audio bridge");
        self.running.store(false, Ordering::SeqCst);
        self.output.close();

        let engine = self.engine.lock().unwrap().take();
        match engine {
            Some(session) => session.end().await,
            None => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether any caller audio reached the engine during this stream.
    pub fn saw_media(&self) -> bool {
        self.saw_media.load(Ordering::SeqCst)
    }

    /// Whether the provider ended the stream with an explicit stop frame.
    pub fn provider_stopped(&self) -> bool {
        self.provider_stopped.load(Ordering::SeqCst)
    }

    pub fn stream_sid(&self) -> Option<String> {
        self.stream_sid.read().unwrap().clone()
    }

    /// Chunks currently waiting in the output queue.
    pub fn queued_output(&self) -> usize {
        self.output.len()
    }
}

/// Engine-events implementation that feeds a bridge.
///
/// Holds a weak reference so a bridge dropped after cleanup is not kept
/// alive by engine tasks that outlive it briefly.
pub struct BridgeEvents {
    call_sid: String,
    bridge: Weak<AudioBridge>,
}

impl BridgeEvents {
    pub fn new(bridge: &Arc<AudioBridge>) -> Self {
        Self {
            call_sid: bridge.call_sid().to_string(),
            bridge: Arc::downgrade(bridge),
        }
    }
}

impl EngineEvents for BridgeEvents {
    fn on_audio(&self, chunk: Bytes) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.enqueue_outbound(chunk);
        }
    }

    fn on_interruption(&self) {
        debug!(call_sid = %self.call_sid, "Caller interrupted agent, clearing output");
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.interrupt();
        }
    }

    fn on_agent_transcript(&self, text: &str) {
        info!(call_sid = %self.call_sid, "Agent said: {}", text);
    }

    fn on_user_transcript(&self, text: &str) {
        info!(call_sid = %self.call_sid, "Caller said: {}", text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockConversationEngine;
    use crate::engine::ConversationEngine;
    use crate::telephony::testing::RecordingSink;

    const DRAIN: Duration = Duration::from_millis(20);

    fn start_frame(stream_sid: &str) -> String {
        format!(
            r#"{{"event": "start", "start": {{"streamSid": "{}", "callSid": "CA123"}}}}"#,
            stream_sid
        )
    }

    fn media_frame(audio: &[u8]) -> String {
        FrameCodec::encode_media("ignored-inbound-sid", audio)
    }

    async fn bridge_with_engine(
        sink: Arc<RecordingSink>,
    ) -> (Arc<AudioBridge>, Arc<MockConversationEngine>) {
        let bridge = Arc::new(AudioBridge::new("CA123".to_string(), sink, 16, DRAIN));
        let engine = Arc::new(MockConversationEngine::new("conv-1"));
        let events: Arc<dyn EngineEvents> = Arc::new(BridgeEvents::new(&bridge));
        let session = engine.start_session(events).await.unwrap();
        bridge.attach_engine(session);
        (bridge, engine)
    }

    async fn wait_for_frames(sink: &RecordingSink, count: usize) {
        for _ in 0..100 {
            if sink.frames().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sink never received {} frames", count);
    }

    #[tokio::test]
    async fn test_start_frame_marks_running_and_records_sid() {
        let (bridge, _engine) = bridge_with_engine(RecordingSink::new()).await;
        assert!(!bridge.is_running());

        let outcome = bridge.handle_inbound(&start_frame("ST1"));

        assert_eq!(outcome, InboundOutcome::Continue);
        assert!(bridge.is_running());
        assert_eq!(bridge.stream_sid(), Some("ST1".to_string()));
    }

    #[tokio::test]
    async fn test_media_before_start_is_not_forwarded() {
        let (bridge, engine) = bridge_with_engine(RecordingSink::new()).await;

        bridge.handle_inbound(&media_frame(b"early"));

        assert!(engine.fed_audio().is_empty());
        assert!(!bridge.saw_media());
    }

    #[tokio::test]
    async fn test_media_frames_forwarded_in_order() {
        let (bridge, engine) = bridge_with_engine(RecordingSink::new()).await;
        bridge.handle_inbound(&start_frame("ST1"));

        bridge.handle_inbound(&media_frame(b"one"));
        bridge.handle_inbound(&media_frame(b"two"));
        bridge.handle_inbound(&media_frame(b"three"));

        let fed = engine.fed_audio();
        assert_eq!(fed.len(), 3);
        assert_eq!(fed[0].as_ref(), b"one");
        assert_eq!(fed[1].as_ref(), b"two");
        assert_eq!(fed[2].as_ref(), b"three");
        assert!(bridge.saw_media());
    }

    #[tokio::test]
    async fn test_malformed_media_is_ignored_and_never_reaches_engine() {
        let (bridge, engine) = bridge_with_engine(RecordingSink::new()).await;
        bridge.handle_inbound(&start_frame("ST1"));

        let outcome =
            bridge.handle_inbound(r#"{"event": "media", "media": {"track": "inbound"}}"#);

        assert_eq!(outcome, InboundOutcome::Continue);
        assert!(engine.fed_audio().is_empty());
    }

    #[tokio::test]
    async fn test_stop_frame_requests_cleanup() {
        let (bridge, _engine) = bridge_with_engine(RecordingSink::new()).await;
        bridge.handle_inbound(&start_frame("ST1"));

        let outcome = bridge.handle_inbound(r#"{"event": "stop"}"#);

        assert_eq!(outcome, InboundOutcome::StopRequested);
        assert!(bridge.provider_stopped());
    }

    #[tokio::test]
    async fn test_pump_writes_frames_in_enqueue_order() {
        let sink = RecordingSink::new();
        let (bridge, _engine) = bridge_with_engine(sink.clone()).await;
        bridge.handle_inbound(&start_frame("ST1"));

        let pump_bridge = bridge.clone();
        let pump = tokio::spawn(async move { pump_bridge.run_outbound_pump().await });

        bridge.enqueue_outbound(Bytes::from_static(b"aaa"));
        bridge.enqueue_outbound(Bytes::from_static(b"bbb"));
        bridge.enqueue_outbound(Bytes::from_static(b"ccc"));

        wait_for_frames(&sink, 3).await;
        bridge.shutdown().await;
        assert_eq!(pump.await.unwrap(), PumpExit::Stopped);

        let payloads: Vec<Vec<u8>> = sink
            .frames()
            .iter()
            .map(|frame| match FrameCodec::decode(frame) {
                InboundFrame::Media { audio } => audio.to_vec(),
                other => panic!("unexpected frame {:?}", other),
            })
            .collect();
        assert_eq!(payloads, vec![b"aaa".to_vec(), b"bbb".to_vec(), b"ccc".to_vec()]);
    }

    #[tokio::test]
    async fn test_pump_drops_audio_until_stream_starts() {
        let sink = RecordingSink::new();
        let (bridge, _engine) = bridge_with_engine(sink.clone()).await;

        let pump_bridge = bridge.clone();
        let pump = tokio::spawn(async move { pump_bridge.run_outbound_pump().await });

        // No start frame yet, so these must never hit the socket.
        bridge.enqueue_outbound(Bytes::from_static(b"greeting"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sink.frames().is_empty());

        bridge.handle_inbound(&start_frame("ST1"));
        bridge.enqueue_outbound(Bytes::from_static(b"hello"));
        wait_for_frames(&sink, 1).await;

        bridge.shutdown().await;
        pump.await.unwrap();
        assert_eq!(sink.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_clears_queue_and_sends_clear_frame() {
        let sink = RecordingSink::new();
        let (bridge, _engine) = bridge_with_engine(sink.clone()).await;
        bridge.handle_inbound(&start_frame("ST1"));

        bridge.enqueue_outbound(Bytes::from_static(b"stale"));
        bridge.enqueue_outbound(Bytes::from_static(b"audio"));
        bridge.interrupt();

        assert_eq!(bridge.queued_output(), 0);
        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(value["event"], "clear");
        assert_eq!(value["streamSid"], "ST1");
    }

    #[tokio::test]
    async fn test_engine_audio_callback_lands_in_queue() {
        let (bridge, engine) = bridge_with_engine(RecordingSink::new()).await;

        let events = engine.events().unwrap();
        events.on_audio(Bytes::from_static(b"synth"));

        assert_eq!(bridge.queued_output(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_shutdowns_end_engine_once() {
        let (bridge, engine) = bridge_with_engine(RecordingSink::new()).await;
        bridge.handle_inbound(&start_frame("ST1"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = bridge.clone();
            handles.push(tokio::spawn(async move { b.shutdown().await }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(engine.end_call_count(), 1);
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_discards_queued_output() {
        let (bridge, _engine) = bridge_with_engine(RecordingSink::new()).await;
        bridge.handle_inbound(&start_frame("ST1"));

        bridge.enqueue_outbound(Bytes::from_static(b"pending"));
        bridge.shutdown().await;

        assert_eq!(bridge.queued_output(), 0);
        bridge.enqueue_outbound(Bytes::from_static(b"late"));
        assert_eq!(bridge.queued_output(), 0);
    }

    #[tokio::test]
    async fn test_pump_exits_when_sink_closes() {
        let sink = RecordingSink::new();
        let (bridge, _engine) = bridge_with_engine(sink.clone()).await;
        bridge.handle_inbound(&start_frame("ST1"));

        sink.close();
        let pump_bridge = bridge.clone();
        let pump = tokio::spawn(async move { pump_bridge.run_outbound_pump().await });

        bridge.enqueue_outbound(Bytes::from_static(b"doomed"));

        assert_eq!(pump.await.unwrap(), PumpExit::SinkClosed);
    }
}
