//! # Connection Handle
//!
//! The core never talks to a socket directly. A transport (the actix WebSocket
//! actor in production, plain channels in tests) feeds inbound events into a
//! bounded queue and drains outbound commands from another one.
//!
//! ```text
//!  transport ──Inbound──▶ [bounded] ──▶ Connection::recv   (ingest loop)
//!  transport ◀─Outbound── [bounded] ◀── Connection::send   (session)
//! ```
//!
//! Both queues are bounded, so a client that floods the server is slowed down
//! at the transport and a client that stops reading slows down its own session.
//! Dropping the [`Connection`] releases it: the transport sees its outbound
//! queue close and shuts the socket.

use actix_web::web::Bytes;
use tokio::sync::mpsc;

/// Events produced by the transport for the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Binary message from the client
    Binary(Bytes),
    /// Text message from the client
    Text(String),
    /// The client closed the connection
    Closed,
    /// The transport broke (reset, protocol failure, ...)
    Failed(String),
}

/// Commands the session sends to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// The session side of a streaming connection.
#[derive(Debug)]
pub struct Connection {
    inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<Outbound>,
    peer: Option<String>,
}

/// The transport side of a streaming connection.
#[derive(Debug)]
pub struct TransportEnd {
    pub inbound: mpsc::Sender<Inbound>,
    pub outbound: mpsc::Receiver<Outbound>,
}

/// Outbound queue is gone; the transport has already shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection closed by transport")]
pub struct ConnectionClosed;

/// Create a connected pair of handles with the given queue depths.
pub fn channel(
    peer: Option<String>,
    inbound_depth: usize,
    outbound_depth: usize,
) -> (Connection, TransportEnd) {
    let (inbound_tx, inbound_rx) = mpsc::channel(inbound_depth.max(1));
    let (outbound_tx, outbound_rx) = mpsc::channel(outbound_depth.max(1));

    let connection = Connection {
        inbound: inbound_rx,
        outbound: outbound_tx,
        peer,
    };
    let transport = TransportEnd {
        inbound: inbound_tx,
        outbound: outbound_rx,
    };
    (connection, transport)
}

impl Connection {
    /// Wait for the next inbound event.
    ///
    /// A transport that went away without saying goodbye is reported as
    /// [`Inbound::Closed`].
    pub async fn recv(&mut self) -> Inbound {
        self.inbound.recv().await.unwrap_or(Inbound::Closed)
    }

    /// Queue a command for the transport, waiting if the queue is full.
    pub async fn send(&self, message: Outbound) -> Result<(), ConnectionClosed> {
        self.outbound.send(message).await.map_err(|_| ConnectionClosed)
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }
}
