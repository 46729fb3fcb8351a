//! # Streaming Session
//!
//! Owns the lifecycle of one client connection. Every state change goes through
//! the methods on [`Session`] (or [`SessionRef::begin_drain`]), which only ever
//! move the state forward:
//!
//! ```text
//! Connecting ──activate──▶ Active ──begin_drain──▶ Draining ──close──▶ Closed
//!      └──────────────begin_drain─────────────────────▲
//! ```
//!
//! ## Ownership:
//! - The ingest loop owns the [`Session`] and with it the [`Connection`].
//! - The registry only holds a [`SessionRef`], a weak back reference that can
//!   request a drain and read counters but never reaches the connection.
//! - The current state lives in a `tokio::sync::watch` channel so the ingest
//!   loop can wait for "draining" alongside its socket read.

use super::codec::{FrameCodec, ServerMessage};
use super::connection::{Connection, Outbound};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info};

/// Opaque session identifier (UUID v4 string).
pub type SessionId = String;

/// Lifecycle state of a session. The derived ordering is the lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session started winding down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DrainReason {
    ClientDisconnect,
    TransportError,
    ProtocolError,
    ProcessingFailureThreshold,
    IdleTimeout,
    ServerShutdown,
}

impl DrainReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainReason::ClientDisconnect => "client-disconnect",
            DrainReason::TransportError => "transport-error",
            DrainReason::ProtocolError => "protocol-error",
            DrainReason::ProcessingFailureThreshold => "processing-failure-threshold",
            DrainReason::IdleTimeout => "idle-timeout",
            DrainReason::ServerShutdown => "server-shutdown",
        }
    }
}

impl fmt::Display for DrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Misuse of the session API or a dead connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("session is {0}, not active")]
    NotActive(SessionState),

    #[error("session is closed")]
    Closed,

    #[error("connection closed by transport")]
    Transport,
}

/// State shared between the owning [`Session`] and any [`SessionRef`]s.
#[derive(Debug)]
struct SessionShared {
    id: SessionId,
    state: watch::Sender<SessionState>,
    drain_reason: Mutex<Option<DrainReason>>,
    sequence: AtomicU64,
    bytes_received: AtomicU64,
    last_activity: Mutex<Instant>,
    connected_at: DateTime<Utc>,
    peer: Option<String>,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `to` if the lifecycle allows it, returning the previous state.
    fn transition(&self, to: SessionState) -> Result<SessionState, SessionError> {
        let mut outcome = Ok(to);
        self.state.send_if_modified(|current| {
            let from = *current;
            let allowed = match (from, to) {
                (SessionState::Connecting, SessionState::Active) => true,
                (from, SessionState::Closed) => from != SessionState::Closed,
                _ => false,
            };
            if allowed {
                *current = to;
                outcome = Ok(from);
            } else {
                outcome = Err(SessionError::InvalidTransition { from, to });
            }
            allowed
        });
        outcome
    }

    /// Enter `Draining` unless already draining or closed.
    ///
    /// The reason is recorded under the same lock as the state change, so
    /// anyone who observes `Draining` also sees the reason.
    fn begin_drain(&self, reason: DrainReason) -> bool {
        let drained = self.state.send_if_modified(|current| {
            if *current >= SessionState::Draining {
                return false;
            }
            *current = SessionState::Draining;
            *self
                .drain_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(reason);
            true
        });

        if drained {
            info!(session_id = %self.id, reason = %reason, "Session draining");
        }
        drained
    }

    fn drain_reason(&self) -> Option<DrainReason> {
        *self
            .drain_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn snapshot(&self) -> SessionSnapshot {
        let idle = self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        SessionSnapshot {
            id: self.id.clone(),
            state: self.state(),
            chunks: self.sequence.load(Ordering::SeqCst),
            bytes: self.bytes_received.load(Ordering::SeqCst),
            connected_at: self.connected_at,
            idle_ms: idle.as_millis() as u64,
            peer: self.peer.clone(),
            drain_reason: self.drain_reason(),
        }
    }
}

/// Point-in-time view of a session, safe to serialize.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: SessionState,
    pub chunks: u64,
    pub bytes: u64,
    pub connected_at: DateTime<Utc>,
    pub idle_ms: u64,
    pub peer: Option<String>,
    pub drain_reason: Option<DrainReason>,
}

/// Server-side state for one streaming connection.
///
/// Owned by exactly one ingest loop. Dropping a session that was never
/// closed marks it closed and releases the connection.
#[derive(Debug)]
pub struct Session {
    shared: Arc<SessionShared>,
    connection: Option<Connection>,
}

impl Session {
    /// Create a session in the `Connecting` state around a fresh connection.
    pub fn new(id: SessionId, connection: Connection) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        let shared = SessionShared {
            id,
            state,
            drain_reason: Mutex::new(None),
            sequence: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            connected_at: Utc::now(),
            peer: connection.peer().map(str::to_string),
        };
        Self {
            shared: Arc::new(shared),
            connection: Some(connection),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// `true` once the session is draining or closed.
    pub fn is_winding_down(&self) -> bool {
        self.state() >= SessionState::Draining
    }

    pub fn drain_reason(&self) -> Option<DrainReason> {
        self.shared.drain_reason()
    }

    /// Number of chunks recorded so far (also the last sequence number).
    pub fn sequence(&self) -> u64 {
        self.shared.sequence.load(Ordering::SeqCst)
    }

    /// Weak handle for the registry.
    pub fn handle(&self) -> SessionRef {
        SessionRef {
            id: self.shared.id.clone(),
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Watch the session state (used by the ingest loop to notice draining).
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    /// Move `Connecting → Active` and greet the client.
    ///
    /// ## Errors:
    /// - **InvalidTransition**: the session was not `Connecting`; nothing is sent
    /// - **Transport**: the session is active but the welcome could not be queued
    pub async fn activate(&self, codec: &FrameCodec) -> Result<(), SessionError> {
        self.shared.transition(SessionState::Active)?;
        info!(session_id = %self.shared.id, peer = ?self.shared.peer, "Session active");
        self.send_message(codec, &ServerMessage::welcome()).await
    }

    /// Count one received chunk and return its sequence number (starting at 1).
    pub fn record_chunk(&self, len: usize) -> Result<u64, SessionError> {
        let state = self.state();
        if state != SessionState::Active {
            return Err(SessionError::NotActive(state));
        }
        self.shared
            .bytes_received
            .fetch_add(len as u64, Ordering::SeqCst);
        self.shared.touch();
        Ok(self.shared.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Start winding down. Returns `false` if already draining or closed.
    pub fn begin_drain(&self, reason: DrainReason) -> bool {
        self.shared.begin_drain(reason)
    }

    /// Move to `Closed` and release the connection. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Ok(previous) = self.shared.transition(SessionState::Closed) {
            info!(
                session_id = %self.shared.id,
                from = %previous,
                chunks = self.sequence(),
                reason = ?self.drain_reason().map(|r| r.as_str()),
                "Session closed"
            );
        }
        self.connection = None;
    }

    /// Encode and queue a server message.
    pub async fn send_message(
        &self,
        codec: &FrameCodec,
        message: &ServerMessage,
    ) -> Result<(), SessionError> {
        self.send(Outbound::Text(codec.encode(message))).await
    }

    /// Queue a raw command for the transport.
    pub async fn send(&self, message: Outbound) -> Result<(), SessionError> {
        let connection = self.connection.as_ref().ok_or(SessionError::Closed)?;
        if self.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        connection.send(message).await.map_err(|_| {
            debug!(session_id = %self.shared.id, "Transport gone while sending");
            SessionError::Transport
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state() != SessionState::Closed {
            self.close();
        }
    }
}

/// Registry-side reference to a session.
///
/// Does not keep the session alive. Once the owning ingest loop is gone every
/// method reports the session as closed.
#[derive(Debug, Clone)]
pub struct SessionRef {
    id: SessionId,
    shared: Weak<SessionShared>,
}

impl SessionRef {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.shared
            .upgrade()
            .map(|shared| shared.state())
            .unwrap_or(SessionState::Closed)
    }

    /// Ask the owning loop to wind down. Returns `false` if it already is.
    pub fn begin_drain(&self, reason: DrainReason) -> bool {
        self.shared
            .upgrade()
            .map(|shared| shared.begin_drain(reason))
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.shared.upgrade().map(|shared| shared.snapshot())
    }
}
