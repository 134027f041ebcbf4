//! # WebSocket Connection Handling
//!
//! One [`MediaWebSocket`] actor per client connection. The actor owns the
//! transport and nothing else.
//!
//! ## Message Flow:
//! ```text
//! client ──text──▶ MediaWebSocket ──ConnectionInput──▶ EventDispatcher ──▶ Session
//! client ◀─text─── MediaWebSocket ◀────ServerEvent──── PlaybackPipeline
//! ```
//!
//! ## Why the actor does not call the session itself:
//! Actor handlers are synchronous. Writing a chunk or finalizing a session
//! awaits file and process I/O, so the actor forwards frames to the
//! connection's dispatcher task and returns immediately. The dispatcher
//! processes them one at a time, preserving arrival order.
//!
//! ## Connection Lifecycle:
//! 1. **Upgrade**: the HTTP handler opens a session and spawns its dispatcher
//! 2. **Started**: outbound events are attached as a stream; heartbeat begins
//! 3. **Active**: text frames are forwarded; pings are answered
//! 4. **Stopped**: the reason the transport ended is sent to the dispatcher,
//!    which runs teardown (absorbed if `CLOSE` already did)

use crate::config::WebSocketConfig;
use crate::dispatcher::{ConnectionInput, EventDispatcher};
use crate::error::AppError;
use crate::protocol::ServerEvent;
use crate::session::{SessionError, TeardownTrigger};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Transport side of one client connection.
pub struct MediaWebSocket {
    session_id: String,

    /// Frames and the final termination reason go here
    inbox: mpsc::UnboundedSender<ConnectionInput>,

    /// Taken in `started` and attached to the context as a stream
    outbound: Option<mpsc::UnboundedReceiver<ServerEvent>>,

    /// Last time the client showed signs of life
    last_heartbeat: Instant,

    heartbeat_interval: Duration,
    client_timeout: Duration,

    /// Reported to the dispatcher when the actor stops
    termination: TeardownTrigger,
}

impl MediaWebSocket {
    pub fn new(
        session_id: String,
        inbox: mpsc::UnboundedSender<ConnectionInput>,
        outbound: mpsc::UnboundedReceiver<ServerEvent>,
        config: &WebSocketConfig,
    ) -> Self {
        Self {
            session_id,
            inbox,
            outbound: Some(outbound),
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.client_timeout_secs),
            termination: TeardownTrigger::TransportClosed,
        }
    }

    fn forward(&self, input: ConnectionInput, ctx: &mut ws::WebsocketContext<Self>) {
        if self.inbox.send(input).is_err() {
            // Dispatcher is gone, so nothing else this connection sends can matter
            warn!(session_id = %self.session_id, "Dispatcher unavailable, closing connection");
            ctx.stop();
        }
    }

    /// Ping the client every interval and stop if it stayed silent too long.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if act.heartbeat_expired(Instant::now()) {
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// True once the client has been silent past the timeout; records
    /// the heartbeat timeout as the reason the connection ends.
    fn heartbeat_expired(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last_heartbeat) <= self.client_timeout {
            return false;
        }
        warn!(session_id = %self.session_id, "WebSocket heartbeat timeout, closing connection");
        self.termination = TeardownTrigger::HeartbeatTimeout;
        true
    }

    fn report_termination(&self) {
        // A closed inbox is also read as a transport close, so a failed send is fine
        let _ = self.inbox.send(ConnectionInput::Terminated(self.termination));
    }
}

impl Actor for MediaWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");

        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, reason = %self.termination, "WebSocket connection stopped");
        self.report_termination();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.forward(ConnectionInput::Text(text.to_string()), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                warn!(session_id = %self.session_id, bytes = data.len(), "Ignoring binary frame");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, "WebSocket closed by client: {:?}", reason);
                self.termination = TeardownTrigger::TransportClosed;
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                self.termination = TeardownTrigger::TransportError;
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Client stream finished");
        ctx.stop();
    }
}

impl StreamHandler<ServerEvent> for MediaWebSocket {
    fn handle(&mut self, event: ServerEvent, ctx: &mut Self::Context) {
        match serde_json::to_string(&event) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(session_id = %self.session_id, "Failed to serialize outbound event: {}", err),
        }
    }

    /// Outbound events ending must not end the connection.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Outbound event stream finished");
    }
}

/// `GET /ws`: upgrade to a media session WebSocket.
///
/// Frames up to `websocket.max_frame_bytes` are accepted; a larger one is a
/// protocol error that ends the connection.
///
/// ## Responses:
/// - **101**: upgraded; the session is live until the socket ends
/// - **400**: not a valid WebSocket handshake (the session is torn down at once)
/// - **503**: the session limit is reached
pub async fn media_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let dispatcher = match EventDispatcher::open(app_state.get_ref().clone(), outbound_tx) {
        Ok(dispatcher) => dispatcher,
        Err(SessionError::LimitReached(max)) => {
            warn!(max_sessions = max, "Refusing WebSocket connection, session limit reached");
            return Err(AppError::ServiceUnavailable(format!(
                "Maximum concurrent sessions ({}) reached",
                max
            ))
            .into());
        }
        Err(err) => return Err(AppError::Internal(err.to_string()).into()),
    };

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let config = app_state.get_config();
    let websocket = MediaWebSocket::new(
        dispatcher.session_id().to_string(),
        inbox_tx,
        outbound_rx,
        &config.websocket,
    );

    // If the handshake fails the actor is dropped with its inbox sender,
    // and the dispatcher tears the fresh session down on its own
    app_state.spawn_session_task(dispatcher.run(inbox_rx));

    ws::WsResponseBuilder::new(websocket, &req, stream)
        .frame_size(config.websocket.max_frame_bytes)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::mock::MockCodecBridge;
    use crate::config::{AppConfig, MIN_FRAME_BYTES};
    use actix_web::{http::StatusCode, test, App};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn app_state() -> AppState {
        AppState::new(AppConfig::default(), Arc::new(MockCodecBridge::new()))
    }

    fn upgrade_request() -> test::TestRequest {
        test::TestRequest::get()
            .uri("/ws")
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "upgrade"))
            .insert_header(("sec-websocket-version", "13"))
            .insert_header(("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="))
    }

    #[actix_web::test]
    async fn test_handshake_opens_a_session() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(media_websocket)),
        )
        .await;

        let resp = test::call_service(&app, upgrade_request().to_request()).await;
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(state.get_metrics_snapshot().sessions_opened, 1);
    }

    #[actix_web::test]
    async fn test_session_limit_answers_503() {
        let state = app_state();
        state.registry.set_max_sessions(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let _occupying = EventDispatcher::open(state.clone(), tx).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(media_websocket)),
        )
        .await;

        let resp = test::call_service(&app, upgrade_request().to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.registry.len(), 1);
        assert_eq!(state.get_metrics_snapshot().sessions_rejected, 1);
    }

    #[actix_web::test]
    async fn test_failed_handshake_releases_session() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(media_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        for _ in 0..100 {
            if state.registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.registry.is_empty());
        assert_eq!(state.get_metrics_snapshot().sessions_finalized, 1);
    }

    /// Client frames must be masked; an all-zero key leaves the payload as is.
    fn masked_text_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x81];
        match payload.len() {
            len if len < 126 => frame.push(0x80 | len as u8),
            len if len <= usize::from(u16::MAX) => {
                frame.push(0x80 | 126);
                frame.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                frame.push(0x80 | 127);
                frame.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.extend_from_slice(payload);
        frame
    }

    /// Open a connection, send one text frame, and let the client hang up.
    async fn send_single_frame(
        max_frame_bytes: usize,
        message: &str,
    ) -> (TempDir, AppState, Arc<MockCodecBridge>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.media.audio_dir = dir.path().join("audio");
        config.media.video_dir = dir.path().join("video");
        config.media.scratch_dir = dir.path().join("frames");
        config.websocket.max_frame_bytes = max_frame_bytes;
        for sub in ["audio", "video", "frames"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        let bridge = Arc::new(MockCodecBridge::new());
        let state = AppState::new(config, bridge.clone());

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(media_websocket)),
        )
        .await;

        let req = upgrade_request()
            .set_payload(masked_text_frame(message.as_bytes()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        // Runs the connection until the client payload is exhausted
        let _ = test::try_read_body(resp).await;

        for _ in 0..200 {
            if state.registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.registry.is_empty());
        (dir, state, bridge)
    }

    fn large_video_message() -> String {
        let frame = vec![0xABu8; 100 * 1024];
        serde_json::json!({
            "eventType": "STREAM",
            "mediaSourceType": "VIDEO",
            "encodedMediaChunk": BASE64.encode(&frame),
        })
        .to_string()
    }

    #[actix_web::test]
    async fn test_stream_frame_above_codec_default_is_recorded() {
        let message = large_video_message();
        assert!(message.len() > MIN_FRAME_BYTES);

        let (_dir, state, bridge) =
            send_single_frame(AppConfig::default().websocket.max_frame_bytes, &message).await;

        let encodes = bridge.encodes();
        assert_eq!(encodes.len(), 1);
        assert_eq!(encodes[0].frames_seen.len(), 1);
        assert_eq!(state.get_metrics_snapshot().sessions_finalized, 1);
    }

    #[actix_web::test]
    async fn test_frame_over_configured_limit_ends_connection() {
        let message = large_video_message();

        let (_dir, state, bridge) = send_single_frame(MIN_FRAME_BYTES, &message).await;

        assert!(bridge.encodes().is_empty());
        assert_eq!(state.get_metrics_snapshot().sessions_finalized, 1);
    }

    #[actix_web::test]
    async fn test_silent_client_ends_in_heartbeat_teardown() {
        let state = app_state();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let dispatcher = EventDispatcher::open(state.clone(), outbound_tx).unwrap();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let config = state.get_config();
        let mut websocket = MediaWebSocket::new(
            dispatcher.session_id().to_string(),
            inbox_tx,
            outbound_rx,
            &config.websocket,
        );

        let timeout = Duration::from_secs(config.websocket.client_timeout_secs);
        let last_seen = websocket.last_heartbeat;
        assert!(!websocket.heartbeat_expired(last_seen + timeout));
        assert!(matches!(websocket.termination, TeardownTrigger::TransportClosed));

        assert!(websocket.heartbeat_expired(last_seen + timeout + Duration::from_secs(1)));
        assert!(matches!(websocket.termination, TeardownTrigger::HeartbeatTimeout));

        websocket.report_termination();
        drop(websocket);
        dispatcher.run(inbox_rx).await;

        assert!(state.registry.is_empty());
        assert_eq!(state.get_metrics_snapshot().sessions_finalized, 1);
    }
}
