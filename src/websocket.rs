//! # Media Stream WebSocket
//!
//! Terminates the provider's per-call media stream socket. The provider
//! connects here after receiving our connect instructions, then sends JSON
//! frames: a start frame with the stream SID, base64 media frames with
//! caller audio, and eventually a stop frame.
//!
//! ## Connection Lifecycle:
//! 1. **Upgrade**: the bridge and engine session are prepared *before* the
//!    websocket handshake completes, so a call that cannot be bridged is
//!    rejected with a proper HTTP error instead of a dead socket
//! 2. **Streaming**: inbound frames go straight to the bridge; outbound
//!    frames arrive as actor messages from the bridge's pump task
//! 3. **Teardown**: stop frames, socket closure, and protocol errors all
//!    end in the lifecycle service's finalize, which is safe to reach
//!    from several of these paths at once
//!
//! ## Message Format:
//! - **Provider → Server**: JSON text frames (start/media/stop/mark)
//! - **Server → Provider**: JSON text frames (media/clear)

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use tracing::{error, info, warn};

use crate::calls::{CallLifecycleService, CleanupReason};
use crate::error::AppError;
use crate::state::AppState;
use crate::telephony::{AudioBridge, FrameSink, InboundOutcome, SinkError};

/// One encoded frame headed for the provider.
#[derive(Message)]
#[rtype(result = "()")]
pub struct OutboundFrame(pub String);

/// Frame sink backed by the socket actor's mailbox.
///
/// Built before the actor exists, because the bridge needs a sink at
/// construction time and the actor only gets an address once the websocket
/// handshake completes. `attach` closes that gap.
pub struct ActorFrameSink {
    recipient: RwLock<Option<Recipient<OutboundFrame>>>,
}

impl ActorFrameSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            recipient: RwLock::new(None),
        })
    }

    pub fn attach(&self, recipient: Recipient<OutboundFrame>) {
        *self.recipient.write().unwrap() = Some(recipient);
    }
}

impl FrameSink for ActorFrameSink {
    fn send_frame(&self, frame: String) -> Result<(), SinkError> {
        let recipient = self.recipient.read().unwrap();
        let recipient = match recipient.as_ref() {
            Some(recipient) => recipient,
            None => return Err(SinkError::NotReady),
        };

        match recipient.try_send(OutboundFrame(frame)) {
            Ok(()) => Ok(()),
            Err(SendError::Full(_)) => Err(SinkError::Busy),
            Err(SendError::Closed(_)) => Err(SinkError::Closed),
        }
    }
}

/// WebSocket actor for one call's media stream.
///
/// ## Actor Model:
/// Each provider connection is an independent actor. Inbound frames are
/// handled synchronously on the actor context; anything async (cleanup,
/// engine teardown) is spawned so the socket never blocks on it.
pub struct MediaStreamSocket {
    call_sid: String,

    /// The bridge this socket feeds
    bridge: Arc<AudioBridge>,

    /// For finalizing the call when the socket dies
    lifecycle: CallLifecycleService,

    /// Last time the provider gave any sign of life
    last_heartbeat: Instant,

    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl MediaStreamSocket {
    pub fn new(
        call_sid: String,
        bridge: Arc<AudioBridge>,
        lifecycle: CallLifecycleService,
        heartbeat_interval: Duration,
        client_timeout: Duration,
    ) -> Self {
        Self {
            call_sid,
            bridge,
            lifecycle,
            last_heartbeat: Instant::now(),
            heartbeat_interval,
            client_timeout,
        }
    }

    fn finalize_in_background(&self, reason: CleanupReason) {
        let lifecycle = self.lifecycle.clone();
        let call_sid = self.call_sid.clone();
        tokio::spawn(async move {
            lifecycle.finalize(&call_sid, reason).await;
        });
    }
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(call_sid = %self.call_sid, "Media socket connected");

        // Protocol-level pings only; a JSON ping would be an unknown event
        // in the provider's frame dialect.
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(call_sid = %act.call_sid, "Media socket heartbeat timeout, closing");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Called when the WebSocket connection stops.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(call_sid = %self.call_sid, "Media socket closed");

        // Disconnect is the catch-all teardown path; if a stop frame or
        // status callback got here first, finalize is a no-op.
        self.finalize_in_background(CleanupReason::Disconnect);
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match self.bridge.handle_inbound(&text) {
                    InboundOutcome::Continue => {}
                    InboundOutcome::StopRequested => {
                        // The provider hangs up the socket after its stop
                        // frame; cleanup must not wait for that.
                        self.finalize_in_background(CleanupReason::ProviderStop);
                    }
                }
            }
            Ok(ws::Message::Binary(data)) => {
                warn!(
                    call_sid = %self.call_sid,
                    "Unexpected {} byte binary frame on media socket",
                    data.len()
                );
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(call_sid = %self.call_sid, "Media socket close: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(call_sid = %self.call_sid, "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(call_sid = %self.call_sid, "Media socket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Deliver one outbound frame from the bridge's pump task.
impl Handler<OutboundFrame> for MediaStreamSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Media stream endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// The bridge and engine session are attached first; only if that succeeds
/// does the request upgrade. A duplicate stream or a full server therefore
/// answers with 409/503 instead of accepting and immediately dropping the
/// socket.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
    lifecycle: web::Data<CallLifecycleService>,
) -> ActixResult<HttpResponse> {
    let call_sid = path.into_inner();
    info!(
        call_sid = %call_sid,
        peer = ?req.connection_info().peer_addr(),
        "Media stream connection request"
    );

    let sink = ActorFrameSink::new();
    let bridge = match lifecycle.attach_stream(&call_sid, sink.clone()).await {
        Ok(bridge) => bridge,
        Err(err) => {
            warn!(call_sid = %call_sid, "Rejecting media stream: {}", err);
            return Err(AppError::from(err).into());
        }
    };

    let config = app_state.get_config();
    let socket = MediaStreamSocket::new(
        call_sid.clone(),
        bridge,
        lifecycle.get_ref().clone(),
        Duration::from_secs(config.stream.heartbeat_interval_secs),
        Duration::from_secs(config.stream.client_timeout_secs),
    );

    match ws::WsResponseBuilder::new(socket, &req, stream).start_with_addr() {
        Ok((addr, response)) => {
            // Outbound frames can flow as soon as the actor has an address.
            sink.attach(addr.recipient());
            Ok(response)
        }
        Err(err) => {
            error!(call_sid = %call_sid, "WebSocket handshake failed: {}", err);
            lifecycle
                .finalize(&call_sid, CleanupReason::TransportError)
                .await;
            Err(err)
        }
    }
}
