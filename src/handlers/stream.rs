//! Stream endpoint: HTTP upgrade to a WebSocket session.
//!
//! ## Upgrade flow:
//! 1. Plain GET (no upgrade headers) → 400 telling the caller where to connect
//! 2. Not admitting sessions (shutting down / at capacity) → 503
//! 3. Handshake, start the transport actor, hand the connection to the dispatcher
//!
//! The transport's frame limit sits above `max_chunk_bytes`, so oversized
//! chunks are refused by the frame codec with a 1009 close.

use crate::audio::connection::channel;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::websocket::WsTransport;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use tracing::{info, warn};

pub async fn stream_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let peer = req.connection_info().peer_addr().map(str::to_string);

    if ws::handshake(&req).is_err() {
        return Err(AppError::BadRequest(format!(
            "Use WebSocket at {}",
            state.config.stream_url()
        )));
    }

    let dispatcher = &state.dispatcher;
    if let Err(err) = dispatcher.admission() {
        warn!(peer = ?peer, error = %err, "Refusing stream connection");
        state.metrics.update(|m| m.sessions_rejected += 1);
        return Err(err.into());
    }

    let (inbound_depth, outbound_depth) = dispatcher.queue_depths();
    let (connection, transport) = channel(peer.clone(), inbound_depth, outbound_depth);

    let actor = WsTransport::new(transport, peer.clone());
    let response = ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(dispatcher.max_frame_bytes())
        .start()
        .map_err(|err| AppError::BadRequest(err.to_string()))?;

    // The welcome frame waits in the outbound queue until the actor starts.
    // If the dispatcher refuses after all, the response is dropped unsent.
    let session_id = dispatcher.on_connect(connection).await?;
    info!(session_id = %session_id, peer = ?peer, "Stream session opened");

    Ok(response)
}
