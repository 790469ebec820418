//! # Call Lifecycle Service
//!
//! Orchestrates everything that happens to a call between the provider's
//! first webhook and the final status write:
//!
//! 1. **Webhook**: a call record is created in INITIALIZED
//! 2. **Media socket**: an audio bridge is built, an engine session is
//!    started, and the pair is registered under the call SID
//! 3. **Streaming**: media flows through the bridge in both directions
//! 4. **Cleanup**: exactly one of the racing teardown paths wins, the
//!    engine session is ended, and the record lands in COMPLETED or
//!    CANCELED
//!
//! ## Cleanup paths:
//! The provider's stop frame, a socket disconnect, a transport error on the
//! outbound pump, the status callback, and process shutdown all funnel into
//! [`CallLifecycleService::finalize`]. The session registry's
//! exactly-once removal is what keeps them from double-running teardown.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::calls::record::{CallRecord, CallStatus};
use crate::calls::repository::CallRepository;
use crate::engine::{ConversationEngine, EngineEvents};
use crate::error::AppError;
use crate::state::AppState;
use crate::telephony::{
    AudioBridge, BridgeEvents, FrameSink, PumpExit, RegisterError, SessionRegistry,
};

/// Which teardown path is running cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// The provider sent an explicit stop frame or status callback
    ProviderStop,

    /// The media socket disconnected without a stop frame
    Disconnect,

    /// The outbound pump lost the socket mid-write
    TransportError,

    /// The process is shutting down
    Shutdown,
}

impl CleanupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupReason::ProviderStop => "provider_stop",
            CleanupReason::Disconnect => "disconnect",
            CleanupReason::TransportError => "transport_error",
            CleanupReason::Shutdown => "shutdown",
        }
    }
}

/// Errors the service reports to the HTTP layer.
#[derive(Debug)]
pub enum CallServiceError {
    /// The call already has a live media stream
    StreamAlreadyActive(String),

    /// The concurrent stream ceiling has been reached
    CapacityExceeded(usize),

    /// The conversation engine refused or failed the session
    EngineStart(String),
}

impl fmt::Display for CallServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallServiceError::StreamAlreadyActive(sid) => {
                write!(f, "Call {} already has an active stream", sid)
            }
            CallServiceError::CapacityExceeded(max) => {
                write!(f, "Concurrent stream limit of {} reached", max)
            }
            CallServiceError::EngineStart(msg) => {
                write!(f, "Could not start engine session: {}", msg)
            }
        }
    }
}

impl From<CallServiceError> for AppError {
    fn from(err: CallServiceError) -> Self {
        match err {
            CallServiceError::StreamAlreadyActive(_) => AppError::Conflict(err.to_string()),
            CallServiceError::CapacityExceeded(_) => AppError::ServiceUnavailable(err.to_string()),
            CallServiceError::EngineStart(_) => AppError::ServiceUnavailable(err.to_string()),
        }
    }
}

/// The shared lifecycle orchestrator.
///
/// ## Thread Safety:
/// Cheap to clone; every field is an `Arc` (or `AppState`, which is itself
/// all `Arc`s). Handlers, socket actors, and spawned pump tasks each hold
/// their own clone.
#[derive(Clone)]
pub struct CallLifecycleService {
    repository: Arc<dyn CallRepository>,
    engine: Arc<dyn ConversationEngine>,
    registry: Arc<SessionRegistry>,
    state: AppState,
}

impl CallLifecycleService {
    pub fn new(
        repository: Arc<dyn CallRepository>,
        engine: Arc<dyn ConversationEngine>,
        registry: Arc<SessionRegistry>,
        state: AppState,
    ) -> Self {
        Self {
            repository,
            engine,
            registry,
            state,
        }
    }

    /// Record an incoming call announced by the provider webhook.
    ///
    /// Storage failures are logged but do not fail the webhook; the
    /// provider must still receive connect instructions or the call drops.
    pub async fn create_call(&self, sid: &str, from_number: &str, to_number: &str) -> CallRecord {
        let record = CallRecord::new(sid, from_number, to_number);

        info!(
            call_sid = %record.sid,
            from = %record.from_number,
            to = %record.to_number,
            "Incoming call"
        );

        match self.repository.create(record.clone()).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(call_sid = %sid, "Could not persist call record: {}", err);
                record
            }
        }
    }

    /// Bridge a freshly accepted media socket to a new engine session.
    ///
    /// ## Order of operations:
    /// 1. Reject calls that already have a live stream
    /// 2. Build the bridge and start the engine session
    /// 3. Register the bridge; registration is the authority on both
    ///    at-most-one-stream-per-call and the stream ceiling, so a racing
    ///    loser ends its own engine session and backs out
    /// 4. Spawn the outbound pump and mark the call STREAMING
    ///
    /// ## Returns:
    /// The live bridge, ready to receive inbound frames from the socket.
    pub async fn attach_stream(
        &self,
        call_sid: &str,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Arc<AudioBridge>, CallServiceError> {
        if self.registry.is_active(call_sid) {
            return Err(CallServiceError::StreamAlreadyActive(call_sid.to_string()));
        }

        let config = self.state.get_config();
        let max_streams = config.performance.max_concurrent_streams;

        let bridge = Arc::new(AudioBridge::new(
            call_sid.to_string(),
            sink,
            config.stream.queue_capacity,
            Duration::from_millis(config.stream.drain_wait_ms),
        ));

        let events: Arc<dyn EngineEvents> = Arc::new(BridgeEvents::new(&bridge));
        let session = match self.engine.start_session(events).await {
            Ok(session) => session,
            Err(err) => {
                warn!(call_sid = %call_sid, "Engine session failed to start: {}", err);
                self.mark_canceled(call_sid).await;
                return Err(CallServiceError::EngineStart(err.to_string()));
            }
        };
        bridge.attach_engine(session);

        if let Err(err) = self.registry.register(call_sid, bridge.clone(), max_streams) {
            // Lost an admission race; end the session we just opened.
            warn!(call_sid = %call_sid, "{}", err);
            bridge.shutdown().await;
            return Err(match err {
                RegisterError::AlreadyActive => {
                    CallServiceError::StreamAlreadyActive(call_sid.to_string())
                }
                RegisterError::AtCapacity(limit) => CallServiceError::CapacityExceeded(limit),
            });
        }
        // The gauge mirrors registry membership; its decrement pairs with
        // the removal in finalize.
        self.state.increment_active_streams();

        let pump_bridge = bridge.clone();
        let service = self.clone();
        let sid = call_sid.to_string();
        tokio::spawn(async move {
            if let PumpExit::SinkClosed = pump_bridge.run_outbound_pump().await {
                service.finalize(&sid, CleanupReason::TransportError).await;
            }
        });

        self.mark_streaming(call_sid).await;

        info!(
            call_sid = %call_sid,
            active = self.registry.active_count(),
            "Media stream attached"
        );
        Ok(bridge)
    }

    /// Tear down the call's bridge and write its terminal status.
    ///
    /// ## Idempotency:
    /// Every cleanup path calls this. Only the caller that wins the
    /// registry removal does any work; the rest observe an already
    /// finalized call and return.
    ///
    /// ## Terminal status policy:
    /// - Provider-initiated stops are COMPLETED, media or not
    /// - Anything else is COMPLETED once caller audio flowed, CANCELED if
    ///   the call died before any media
    pub async fn finalize(&self, call_sid: &str, reason: CleanupReason) {
        let bridge = match self.registry.remove(call_sid) {
            Some(bridge) => bridge,
            None => {
                debug!(call_sid = %call_sid, "Call already finalized");
                return;
            }
        };
        self.state.decrement_active_streams();

        let conversation_id = bridge.shutdown().await;

        let orderly = reason == CleanupReason::ProviderStop || bridge.provider_stopped();
        let final_status = if orderly || bridge.saw_media() {
            CallStatus::Completed
        } else {
            CallStatus::Canceled
        };

        self.write_terminal_status(call_sid, final_status, conversation_id)
            .await;

        info!(
            call_sid = %call_sid,
            reason = reason.as_str(),
            status = final_status.as_str(),
            "Call finalized"
        );
    }

    /// React to a stream status callback from the provider.
    ///
    /// ## Returns:
    /// Whether the event triggered cleanup.
    pub async fn handle_status_callback(&self, call_sid: &str, event: &str) -> bool {
        match event {
            "stream-stopped" => {
                self.finalize(call_sid, CleanupReason::ProviderStop).await;
                true
            }
            "stream-error" => {
                self.finalize(call_sid, CleanupReason::TransportError).await;
                true
            }
            other => {
                debug!(call_sid = %call_sid, event = %other, "Ignoring stream status event");
                false
            }
        }
    }

    /// Finalize every live call, for process shutdown.
    pub async fn shutdown_all(&self) {
        let sids = self.registry.active_call_sids();
        if sids.is_empty() {
            return;
        }

        info!(count = sids.len(), "Shutting down all active streams");
        for sid in sids {
            self.finalize(&sid, CleanupReason::Shutdown).await;
        }
    }

    pub async fn call_by_sid(&self, sid: &str) -> anyhow::Result<Option<CallRecord>> {
        self.repository.get_by_sid(sid).await
    }

    pub async fn repository_health(&self) -> bool {
        self.repository.health_check().await
    }

    pub fn active_stream_count(&self) -> usize {
        self.registry.active_count()
    }

    pub fn active_call_sids(&self) -> Vec<String> {
        self.registry.active_call_sids()
    }

    async fn mark_streaming(&self, call_sid: &str) {
        match self.repository.get_by_sid(call_sid).await {
            Ok(Some(mut record)) => {
                if let Err(err) = record.set_status(CallStatus::Streaming) {
                    warn!(call_sid = %call_sid, "{}", err);
                    return;
                }
                if let Err(err) = self.repository.update(record.id, record).await {
                    warn!(call_sid = %call_sid, "Could not update call record: {}", err);
                }
            }
            Ok(None) => debug!(call_sid = %call_sid, "No call record to mark streaming"),
            Err(err) => warn!(call_sid = %call_sid, "Could not load call record: {}", err),
        }
    }

    async fn mark_canceled(&self, call_sid: &str) {
        self.write_terminal_status(call_sid, CallStatus::Canceled, None)
            .await;
    }

    async fn write_terminal_status(
        &self,
        call_sid: &str,
        status: CallStatus,
        conversation_id: Option<String>,
    ) {
        match self.repository.get_by_sid(call_sid).await {
            Ok(Some(mut record)) => {
                if let Some(id) = conversation_id {
                    record.record_conversation_id(id);
                }
                if let Err(err) = record.set_status(status) {
                    warn!(call_sid = %call_sid, "{}", err);
                    return;
                }
                if let Err(err) = self.repository.update(record.id, record).await {
                    warn!(call_sid = %call_sid, "Could not update call record: {}", err);
                }
            }
            Ok(None) => debug!(call_sid = %call_sid, "No call record to finalize"),
            Err(err) => warn!(call_sid = %call_sid, "Could not load call record: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::repository::InMemoryCallRepository;
    use crate::config::AppConfig;
    use crate::engine::testing::MockConversationEngine;
    use crate::telephony::frame::FrameCodec;
    use crate::telephony::testing::RecordingSink;
    use crate::telephony::InboundOutcome;
    use async_trait::async_trait;
    use tokio::sync::Semaphore;
    use uuid::Uuid;

    struct Fixture {
        service: CallLifecycleService,
        repository: Arc<InMemoryCallRepository>,
        engine: Arc<MockConversationEngine>,
        registry: Arc<SessionRegistry>,
        state: AppState,
    }

    fn fixture_with(engine: MockConversationEngine, config: AppConfig) -> Fixture {
        let repository = Arc::new(InMemoryCallRepository::new());
        let engine = Arc::new(engine);
        let registry = Arc::new(SessionRegistry::new());
        let state = AppState::new(config);
        let service = CallLifecycleService::new(
            repository.clone(),
            engine.clone(),
            registry.clone(),
            state.clone(),
        );
        Fixture {
            service,
            repository,
            engine,
            registry,
            state,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockConversationEngine::new("conv-1"), AppConfig::default())
    }

    /// Repository that parks every lookup until the test hands out permits.
    struct GatedRepository {
        inner: InMemoryCallRepository,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl CallRepository for GatedRepository {
        async fn create(&self, record: CallRecord) -> anyhow::Result<CallRecord> {
            self.inner.create(record).await
        }

        async fn get_by_sid(&self, sid: &str) -> anyhow::Result<Option<CallRecord>> {
            let _permit = self.gate.acquire().await.unwrap();
            self.inner.get_by_sid(sid).await
        }

        async fn update(&self, id: Uuid, record: CallRecord) -> anyhow::Result<Option<CallRecord>> {
            self.inner.update(id, record).await
        }

        async fn health_check(&self) -> bool {
            self.inner.health_check().await
        }
    }

    fn start_frame(stream_sid: &str) -> String {
        format!(
            r#"{{"event": "start", "start": {{"streamSid": "{}"}}}}"#,
            stream_sid
        )
    }

    #[tokio::test]
    async fn test_create_call_persists_initialized_record() {
        let fx = fixture();

        let record = fx.service.create_call("CA123", "+1555", "+1777").await;

        assert_eq!(record.status, CallStatus::Initialized);
        let stored = fx.repository.get_by_sid("CA123").await.unwrap().unwrap();
        assert_eq!(stored.id, record.id);
    }

    #[tokio::test]
    async fn test_full_call_lifecycle() {
        let fx = fixture();
        fx.service
            .create_call("CA123", "+15551234567", "+17775551234")
            .await;

        let bridge = fx
            .service
            .attach_stream("CA123", RecordingSink::new())
            .await
            .unwrap();
        assert_eq!(fx.state.active_streams(), 1);

        bridge.handle_inbound(&start_frame("ST1"));
        bridge.handle_inbound(&FrameCodec::encode_media("ST1", b"one"));
        bridge.handle_inbound(&FrameCodec::encode_media("ST1", b"two"));
        bridge.handle_inbound(&FrameCodec::encode_media("ST1", b"three"));

        let fed = fx.engine.fed_audio();
        assert_eq!(fed.len(), 3);
        assert_eq!(fed[0].as_ref(), b"one");
        assert_eq!(fed[2].as_ref(), b"three");

        let outcome = bridge.handle_inbound(r#"{"event": "stop"}"#);
        assert_eq!(outcome, InboundOutcome::StopRequested);
        fx.service.finalize("CA123", CleanupReason::ProviderStop).await;

        assert_eq!(fx.registry.active_count(), 0);
        assert_eq!(fx.engine.end_call_count(), 1);
        assert_eq!(fx.state.active_streams(), 0);

        let record = fx.repository.get_by_sid("CA123").await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Completed);
        assert_eq!(record.engine_conversation_id.as_deref(), Some("conv-1"));
    }

    #[tokio::test]
    async fn test_second_stream_for_same_call_is_rejected() {
        let fx = fixture();
        fx.service.create_call("CA123", "+1", "+2").await;
        fx.service
            .attach_stream("CA123", RecordingSink::new())
            .await
            .unwrap();

        let result = fx.service.attach_stream("CA123", RecordingSink::new()).await;

        assert!(matches!(
            result,
            Err(CallServiceError::StreamAlreadyActive(_))
        ));
        assert_eq!(fx.registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_capacity_ceiling_is_enforced() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_streams = 1;
        let fx = fixture_with(MockConversationEngine::new("conv-1"), config);

        fx.service
            .attach_stream("CA1", RecordingSink::new())
            .await
            .unwrap();
        let result = fx.service.attach_stream("CA2", RecordingSink::new()).await;

        assert!(matches!(result, Err(CallServiceError::CapacityExceeded(1))));
        // The rejected attach ended the engine session it had opened.
        assert_eq!(fx.engine.end_call_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_attaches_cannot_overshoot_the_ceiling() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_streams = 1;
        let engine =
            MockConversationEngine::new("conv-1").with_start_delay(Duration::from_millis(20));
        let fx = fixture_with(engine, config);

        let (a, b, c, d) = tokio::join!(
            fx.service.attach_stream("CA1", RecordingSink::new()),
            fx.service.attach_stream("CA2", RecordingSink::new()),
            fx.service.attach_stream("CA3", RecordingSink::new()),
            fx.service.attach_stream("CA4", RecordingSink::new()),
        );

        let admitted = [&a, &b, &c, &d].iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1);
        assert_eq!(fx.registry.active_count(), 1);
        assert_eq!(fx.state.active_streams(), 1);
        // Every loser ended the engine session it had already opened.
        assert_eq!(fx.engine.end_call_count(), 3);
    }

    #[tokio::test]
    async fn test_engine_start_failure_cancels_call() {
        let fx = fixture_with(MockConversationEngine::failing(), AppConfig::default());
        fx.service.create_call("CA123", "+1", "+2").await;

        let result = fx.service.attach_stream("CA123", RecordingSink::new()).await;

        assert!(matches!(result, Err(CallServiceError::EngineStart(_))));
        assert_eq!(fx.registry.active_count(), 0);
        let record = fx.repository.get_by_sid("CA123").await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Canceled);
    }

    #[tokio::test]
    async fn test_disconnect_before_media_cancels() {
        let fx = fixture();
        fx.service.create_call("CA123", "+1", "+2").await;
        let bridge = fx
            .service
            .attach_stream("CA123", RecordingSink::new())
            .await
            .unwrap();
        bridge.handle_inbound(&start_frame("ST1"));

        fx.service.finalize("CA123", CleanupReason::Disconnect).await;

        let record = fx.repository.get_by_sid("CA123").await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Canceled);
    }

    #[tokio::test]
    async fn test_provider_stop_without_media_still_completes() {
        let fx = fixture();
        fx.service.create_call("CA123", "+1", "+2").await;
        fx.service
            .attach_stream("CA123", RecordingSink::new())
            .await
            .unwrap();

        fx.service.finalize("CA123", CleanupReason::ProviderStop).await;

        let record = fx.repository.get_by_sid("CA123").await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Completed);
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let fx = fixture();
        fx.service.create_call("CA123", "+1", "+2").await;
        fx.service
            .attach_stream("CA123", RecordingSink::new())
            .await
            .unwrap();

        fx.service.finalize("CA123", CleanupReason::Disconnect).await;
        fx.service.finalize("CA123", CleanupReason::Disconnect).await;

        assert_eq!(fx.engine.end_call_count(), 1);
        assert_eq!(fx.state.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_gauge_matches_registry_while_record_write_is_in_flight() {
        let gate = Arc::new(Semaphore::new(0));
        let repository = Arc::new(GatedRepository {
            inner: InMemoryCallRepository::new(),
            gate: gate.clone(),
        });
        let engine = Arc::new(MockConversationEngine::new("conv-1"));
        let registry = Arc::new(SessionRegistry::new());
        let state = AppState::new(AppConfig::default());
        let service = CallLifecycleService::new(
            repository,
            engine.clone(),
            registry.clone(),
            state.clone(),
        );

        let attach_service = service.clone();
        let attach = tokio::spawn(async move {
            attach_service
                .attach_stream("CA123", RecordingSink::new())
                .await
        });

        // The attach is parked inside its record lookup with registration
        // already done; the gauge must already reflect the stream.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.is_active("CA123"));
        assert_eq!(state.active_streams(), 1);

        // A status callback landing right now must leave the gauge clean.
        gate.add_permits(4);
        service.finalize("CA123", CleanupReason::ProviderStop).await;
        attach.await.unwrap().unwrap();

        assert_eq!(state.active_streams(), 0);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(engine.end_call_count(), 1);
    }

    #[tokio::test]
    async fn test_status_callback_stops_stream() {
        let fx = fixture();
        fx.service.create_call("CA123", "+1", "+2").await;
        fx.service
            .attach_stream("CA123", RecordingSink::new())
            .await
            .unwrap();

        let handled = fx.service.handle_status_callback("CA123", "stream-stopped").await;

        assert!(handled);
        assert_eq!(fx.registry.active_count(), 0);
        let record = fx.repository.get_by_sid("CA123").await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_status_event_is_ignored() {
        let fx = fixture();
        fx.service.create_call("CA123", "+1", "+2").await;
        fx.service
            .attach_stream("CA123", RecordingSink::new())
            .await
            .unwrap();

        let handled = fx.service.handle_status_callback("CA123", "stream-started").await;

        assert!(!handled);
        assert_eq!(fx.registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_all_finalizes_every_stream() {
        let fx = fixture();
        fx.service.create_call("CA1", "+1", "+2").await;
        fx.service.create_call("CA2", "+3", "+4").await;
        fx.service
            .attach_stream("CA1", RecordingSink::new())
            .await
            .unwrap();
        fx.service
            .attach_stream("CA2", RecordingSink::new())
            .await
            .unwrap();

        fx.service.shutdown_all().await;

        assert_eq!(fx.registry.active_count(), 0);
        assert_eq!(fx.engine.end_call_count(), 2);
        assert_eq!(fx.state.active_streams(), 0);
    }
}
