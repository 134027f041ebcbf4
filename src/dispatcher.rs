//! # Event Dispatcher
//!
//! Turns inbound text frames for one connection into session operations.
//!
//! ## Per-connection ordering:
//! The WebSocket actor never touches a session directly. It forwards every
//! text frame (and finally the reason it stopped) into an unbounded inbox,
//! and a single [`EventDispatcher::run`] task drains that inbox in order.
//! That gives each connection exactly one place where its session is
//! mutated, so chunks are written in arrival order and a video encode
//! that takes seconds only delays this connection's queue.
//!
//! ## Error policy:
//! Nothing a client sends can end the connection. Malformed JSON, unknown
//! `eventType`s, bad base64, and chunks for a session that is no longer
//! open are all logged and counted as rejected messages.

use crate::protocol::{decode_chunk, parse_inbound, ClientEvent, Inbound, MediaSourceType, ServerEvent};
use crate::session::{Session, SessionError, SessionSettings, TeardownOutcome, TeardownTrigger};
use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What the connection actor feeds the dispatcher.
#[derive(Debug)]
pub enum ConnectionInput {
    /// One inbound text frame
    Text(String),
    /// The transport is gone; this is the last input
    Terminated(TeardownTrigger),
}

/// Whether the session is still accepting work after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Closed,
}

pub struct EventDispatcher {
    state: AppState,
    session_id: String,
}

impl EventDispatcher {
    /// Register a fresh session for a new connection.
    ///
    /// The id is a random v4 UUID, so it is unique per connection. Fails
    /// with [`SessionError::LimitReached`] when the registry is full.
    pub fn open(
        state: AppState,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Self, SessionError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let settings = SessionSettings::from_config(&state.get_config());
        let bridge = state.bridge.clone();

        let created = state.registry.get_or_create(&session_id, || {
            Session::new(session_id.clone(), settings, bridge, outbound)
        });
        if let Err(err) = created {
            state.record_session_rejected();
            return Err(err);
        }

        state.record_session_opened();
        info!(session_id = %session_id, "Session opened");
        Ok(Self { state, session_id })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.state.registry.get(&self.session_id)
    }

    fn reject(&self, reason: &str) {
        self.state.record_rejected_message();
        warn!(session_id = %self.session_id, "Dropped message: {}", reason);
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&self, text: &str) -> Dispatch {
        let event = match parse_inbound(text) {
            Ok(Inbound::Event(event)) => event,
            Ok(Inbound::Unrecognized(event_type)) => {
                self.state.record_rejected_message();
                warn!(session_id = %self.session_id, event_type = %event_type, "Unrecognized event type");
                return Dispatch::Continue;
            }
            Err(err) => {
                self.reject(&err.to_string());
                return Dispatch::Continue;
            }
        };

        match event {
            ClientEvent::Connect { id } => {
                info!(session_id = %self.session_id, space = %id, "Client connected to space");
                Dispatch::Continue
            }
            ClientEvent::Stream {
                media_source_type,
                encoded_media_chunk,
            } => {
                self.handle_stream(media_source_type, &encoded_media_chunk).await;
                Dispatch::Continue
            }
            ClientEvent::RequestAudioStreamPlayback => {
                self.handle_playback_request().await;
                Dispatch::Continue
            }
            ClientEvent::Close => {
                self.teardown(TeardownTrigger::CloseEvent).await;
                Dispatch::Closed
            }
        }
    }

    async fn handle_stream(&self, kind: MediaSourceType, encoded: &str) {
        let chunk = match decode_chunk(encoded) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.reject(&err.to_string());
                return;
            }
        };

        let Some(session) = self.session() else {
            self.reject(&format!("{} chunk for a session that has already closed", kind));
            return;
        };

        match session.write_chunk(kind, &chunk).await {
            Ok(()) => {
                debug!(session_id = %self.session_id, media = %kind, bytes = chunk.len(), "Chunk written");
            }
            Err(SessionError::NotOpen(stage)) => {
                self.reject(&format!("{} chunk while session is {}", kind, stage));
            }
            Err(err) => {
                // The recorder stays in place; the next chunk is tried again
                self.state.record_rejected_message();
                warn!(session_id = %self.session_id, media = %kind, "Failed to record chunk: {}", err);
            }
        }
    }

    async fn handle_playback_request(&self) {
        let Some(session) = self.session() else {
            self.reject("playback requested for a session that has already closed");
            return;
        };

        match session.start_playback().await {
            Ok(()) => self.state.record_playback_started(),
            Err(SessionError::Codec(err)) => {
                warn!(session_id = %self.session_id, "Playback could not start: {}", err);
            }
            Err(err) => {
                self.reject(&format!("playback request refused: {}", err));
            }
        }
    }

    /// Tear the session down and drop it from the registry.
    ///
    /// Safe to call any number of times; only the first call does work.
    pub async fn teardown(&self, trigger: TeardownTrigger) {
        match self.state.registry.teardown(&self.session_id, trigger).await {
            Some(TeardownOutcome::Closed(report)) => self.state.record_teardown(&report),
            Some(TeardownOutcome::Absorbed) | None => {
                debug!(session_id = %self.session_id, %trigger, "Teardown trigger absorbed");
            }
        }
    }

    /// Drain the connection inbox until the transport terminates.
    ///
    /// A closed inbox without an explicit `Terminated` is treated as a
    /// normal transport close, so a session is never left behind.
    pub async fn run(self, mut inbox: mpsc::UnboundedReceiver<ConnectionInput>) {
        while let Some(input) = inbox.recv().await {
            match input {
                ConnectionInput::Text(text) => {
                    self.handle_text(&text).await;
                }
                ConnectionInput::Terminated(trigger) => {
                    self.teardown(trigger).await;
                    return;
                }
            }
        }
        self.teardown(TeardownTrigger::TransportClosed).await;
    }
}
