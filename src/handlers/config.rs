use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration. Read-only: stream settings are fixed for the
/// lifetime of the process.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = &state.config;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "stream": {
                "path": config.stream.path,
                "url": config.stream_url(),
                "max_chunk_bytes": config.stream.max_chunk_bytes,
                "allow_empty_chunks": config.stream.allow_empty_chunks,
                "max_processing_failures": config.stream.max_processing_failures,
                "idle_timeout_secs": config.stream.idle_timeout_secs,
                "shutdown_timeout_ms": config.stream.shutdown_timeout_ms,
                "inbound_queue_depth": config.stream.inbound_queue_depth,
                "outbound_queue_depth": config.stream.outbound_queue_depth,
                "ack_format": config.stream.ack_format
            },
            "performance": {
                "max_concurrent_sessions": config.performance.max_concurrent_sessions
            }
        }
    })))
}
