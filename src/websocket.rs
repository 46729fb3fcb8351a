//! # WebSocket Transport
//!
//! Actix actor that sits between a WebSocket and one session's [`Connection`].
//!
//! The actor does no protocol work of its own. It copies frames in both
//! directions:
//! - **Client → session**: binary/text frames go into the inbound queue. When
//!   the queue is full the actor waits, so a fast client is slowed down to the
//!   pace of its ingest loop.
//! - **Session → client**: text and close frames from the outbound queue are
//!   written to the socket. When the session drops its end, the actor stops.
//!
//! Ping/pong is answered here and never reaches the session.
//!
//! [`Connection`]: crate::audio::connection::Connection

use crate::audio::connection::{Inbound, Outbound, TransportEnd};
use actix::prelude::*;
use actix_web_actors::ws;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Transport-side actor for one streaming connection.
pub struct WsTransport {
    inbound: mpsc::Sender<Inbound>,
    /// Taken in `started` and turned into an actor stream
    outbound: Option<mpsc::Receiver<Outbound>>,
    peer: Option<String>,
}

impl WsTransport {
    pub fn new(transport: TransportEnd, peer: Option<String>) -> Self {
        Self {
            inbound: transport.inbound,
            outbound: Some(transport.outbound),
            peer,
        }
    }

    /// Queue a data frame for the session, pausing the actor until there is room.
    fn forward(&self, frame: Inbound, ctx: &mut ws::WebsocketContext<Self>) {
        let tx = self.inbound.clone();
        ctx.wait(
            async move { tx.send(frame).await.is_ok() }
                .into_actor(self)
                .map(|delivered, act, ctx| {
                    if !delivered {
                        // Session is gone; nothing left to stream to
                        debug!(peer = ?act.peer, "Session ended, dropping inbound frame");
                        ctx.stop();
                    }
                }),
        );
    }

    /// Report the end of the stream without waiting. If the queue is full the
    /// session still sees the closed channel once this actor is dropped.
    fn signal_end(&self, event: Inbound) {
        let _ = self.inbound.try_send(event);
    }
}

/// Build the close frame for a server-initiated close.
pub fn close_reason(code: u16, reason: String) -> ws::CloseReason {
    ws::CloseReason {
        code: ws::CloseCode::from(code),
        description: Some(reason),
    }
}

impl Actor for WsTransport {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(peer = ?self.peer, "WebSocket connection started");
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(ReceiverStream::new(outbound));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(peer = ?self.peer, "WebSocket connection stopped");
    }
}

/// Frames coming from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsTransport {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.forward(Inbound::Binary(data), ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.forward(Inbound::Text(text.to_string()), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(peer = ?self.peer, ?reason, "Client closed WebSocket");
                self.signal_end(Inbound::Closed);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                // Fragmented messages are not part of the protocol
                warn!(peer = ?self.peer, "Ignoring continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(peer = ?self.peer, error = %err, "WebSocket protocol error");
                self.signal_end(Inbound::Failed(err.to_string()));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // Socket ended without a close frame
        self.signal_end(Inbound::Closed);
        ctx.stop();
    }
}

/// Frames the session wants written to the client.
impl StreamHandler<Outbound> for WsTransport {
    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Text(text) => ctx.text(text),
            Outbound::Close { code, reason } => {
                debug!(peer = ?self.peer, code, reason = %reason, "Closing WebSocket");
                ctx.close(Some(close_reason(code, reason)));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.stop();
    }
}
