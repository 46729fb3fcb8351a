//! # Ingest Loop
//!
//! One task per session. Reads frames, hands audio to the processor and
//! acknowledges every processed chunk.
//!
//! ## Per-iteration flow:
//! 1. Stop if the session is draining (checked before every frame)
//! 2. Wait for whichever comes first: a drain signal, the next inbound event,
//!    or the idle deadline
//! 3. Audio → decode → process → `record_chunk` → ack
//! 4. Control → logged and ignored
//!
//! ## Error classes:
//! - **Protocol violation** (decode error): error frame, close, drain
//! - **Processing failure**: error frame, keep going until
//!   `max_processing_failures` consecutive failures, then close with 1011
//! - **Transport error / client disconnect**: drain silently
//!
//! Whatever ends the loop, the session is removed from the registry and
//! closed exactly once, in that order. This also holds when the task unwinds.
//! A panicking processor counts as a processing failure.

use super::codec::{close_code, Frame, FrameCodec, RawFrame, ServerMessage};
use super::connection::{Inbound, Outbound};
use super::processor::{ChunkProcessor, ProcessingError};
use super::registry::SessionRegistry;
use super::session::{DrainReason, Session, SessionId, SessionState};
use crate::state::MetricsHandle;
use actix_web::web::Bytes;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on writing the final close frame to a client that stopped reading.
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything an ingest loop needs besides its session.
pub struct IngestContext {
    pub codec: FrameCodec,
    pub processor: Arc<dyn ChunkProcessor>,
    pub registry: Arc<SessionRegistry>,
    pub metrics: MetricsHandle,
    /// Consecutive processing failures that end a session
    pub max_processing_failures: u32,
    /// `None` disables the idle deadline
    pub idle_timeout: Option<Duration>,
}

/// Removes a session from the registry when dropped.
///
/// Held by [`run`] next to its session. Locals drop before parameters, so an
/// unwinding loop deregisters the session before `Drop for Session` closes it.
struct Registration {
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.session_id);
    }
}

enum Event {
    Drained,
    Idle,
    Inbound(Inbound),
}

/// Drive an already active session until it winds down.
///
/// Returns the reason the session drained.
pub async fn run(mut session: Session, ctx: Arc<IngestContext>) -> DrainReason {
    let session_id = session.id().clone();
    let registration = Registration {
        registry: ctx.registry.clone(),
        session_id: session_id.clone(),
    };
    let mut state_rx = session.subscribe();
    let mut consecutive_failures = 0u32;

    let reason = loop {
        if session.is_winding_down() {
            break session.drain_reason().unwrap_or(DrainReason::ServerShutdown);
        }

        let event = {
            let Some(connection) = session.connection_mut() else {
                break DrainReason::TransportError;
            };
            tokio::select! {
                biased;
                _ = state_rx.wait_for(|state| *state >= SessionState::Draining) => Event::Drained,
                inbound = connection.recv() => Event::Inbound(inbound),
                _ = idle(ctx.idle_timeout) => Event::Idle,
            }
        };

        match event {
            // Top of the loop picks up the reason
            Event::Drained => continue,
            Event::Idle => {
                session.begin_drain(DrainReason::IdleTimeout);
            }
            Event::Inbound(Inbound::Closed) => {
                debug!(session_id = %session_id, "Client disconnected");
                session.begin_drain(DrainReason::ClientDisconnect);
            }
            Event::Inbound(Inbound::Failed(error)) => {
                warn!(session_id = %session_id, error = %error, "Transport error");
                session.begin_drain(DrainReason::TransportError);
            }
            Event::Inbound(Inbound::Text(text)) => {
                handle_raw(&session, &ctx, RawFrame::Text(text), &mut consecutive_failures).await;
            }
            Event::Inbound(Inbound::Binary(bytes)) => {
                handle_raw(&session, &ctx, RawFrame::Binary(bytes), &mut consecutive_failures).await;
            }
        }
    };

    match reason {
        DrainReason::ServerShutdown => {
            farewell(&session, close_code::GOING_AWAY, "Server shutting down").await;
        }
        DrainReason::IdleTimeout => {
            farewell(&session, close_code::NORMAL, "Idle timeout").await;
        }
        // Closing frames for protocol and processing failures were sent
        // inline; a departed client gets nothing.
        _ => {}
    }

    drop(registration);
    session.close();
    ctx.metrics.update(|m| m.sessions_closed += 1);

    info!(session_id = %session_id, reason = %reason, "Ingest loop finished");
    reason
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn farewell(session: &Session, code: u16, reason: &str) {
    let close = Outbound::Close {
        code,
        reason: reason.to_string(),
    };
    match tokio::time::timeout(FAREWELL_TIMEOUT, session.send(close)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(session_id = %session.id(), error = %err, "Close frame not delivered"),
        Err(_) => debug!(session_id = %session.id(), "Close frame timed out"),
    }
}

async fn handle_raw(
    session: &Session,
    ctx: &IngestContext,
    raw: RawFrame,
    consecutive_failures: &mut u32,
) {
    match ctx.codec.decode(raw) {
        Ok(Frame::Control(text)) => {
            debug!(session_id = %session.id(), len = text.len(), "Ignoring control frame");
        }
        Ok(Frame::Audio(bytes)) => {
            handle_audio(session, ctx, bytes, consecutive_failures).await;
        }
        Err(err) => {
            warn!(session_id = %session.id(), error = %err, "Protocol violation");
            ctx.metrics.update(|m| m.protocol_violations += 1);

            let _ = session
                .send_message(&ctx.codec, &ServerMessage::error(err.to_string()))
                .await;
            session.begin_drain(DrainReason::ProtocolError);
            let _ = session
                .send(Outbound::Close {
                    code: err.close_code(),
                    reason: err.close_reason().to_string(),
                })
                .await;
        }
    }
}

async fn handle_audio(
    session: &Session,
    ctx: &IngestContext,
    bytes: Bytes,
    consecutive_failures: &mut u32,
) {
    // A drain may have landed while the frame was queued
    if session.is_winding_down() {
        return;
    }

    let len = bytes.len();
    match process_chunk(ctx, session.id(), &bytes).await {
        Ok(()) => {
            *consecutive_failures = 0;

            let sequence = match session.record_chunk(len) {
                Ok(sequence) => sequence,
                Err(err) => {
                    debug!(session_id = %session.id(), error = %err, "Chunk not acknowledged");
                    return;
                }
            };
            ctx.metrics.update(|m| {
                m.chunks_processed += 1;
                m.bytes_processed += len as u64;
            });

            debug!(session_id = %session.id(), sequence, bytes = len, "Chunk processed");
            if session
                .send_message(&ctx.codec, &ServerMessage::ack(sequence, len))
                .await
                .is_err()
            {
                session.begin_drain(DrainReason::TransportError);
            }
        }
        Err(err) => {
            *consecutive_failures += 1;
            ctx.metrics.update(|m| m.processing_failures += 1);
            warn!(
                session_id = %session.id(),
                error = %err,
                consecutive_failures = *consecutive_failures,
                "Chunk processing failed"
            );

            if session
                .send_message(&ctx.codec, &ServerMessage::error(err.to_string()))
                .await
                .is_err()
            {
                session.begin_drain(DrainReason::TransportError);
                return;
            }

            if *consecutive_failures >= ctx.max_processing_failures {
                session.begin_drain(DrainReason::ProcessingFailureThreshold);
                let _ = session
                    .send(Outbound::Close {
                        code: close_code::INTERNAL_ERROR,
                        reason: "Internal server error".to_string(),
                    })
                    .await;
            }
        }
    }
}

async fn process_chunk(
    ctx: &IngestContext,
    session_id: &SessionId,
    chunk: &[u8],
) -> Result<(), ProcessingError> {
    let outcome = AssertUnwindSafe(async { ctx.processor.process(session_id, chunk).await })
        .catch_unwind()
        .await;
    match outcome {
        Ok(result) => result,
        Err(_) => {
            warn!(session_id = %session_id, "Chunk processor panicked");
            Err(ProcessingError("chunk processor panicked".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{AckFormat, WELCOME_TEXT};
    use crate::audio::connection::{channel, TransportEnd};
    use crate::audio::processor::testing::Scripted;
    use crate::audio::processor::AcknowledgeOnly;
    use tokio::task::JoinHandle;

    struct Harness {
        transport: TransportEnd,
        registry: Arc<SessionRegistry>,
        metrics: MetricsHandle,
        task: JoinHandle<DrainReason>,
    }

    async fn start(
        codec: FrameCodec,
        processor: Arc<dyn ChunkProcessor>,
        max_failures: u32,
        idle_timeout: Option<Duration>,
    ) -> Harness {
        let (conn, mut transport) = channel(None, 8, 8);
        let session = Session::new("s-1".to_string(), conn);
        let registry = Arc::new(SessionRegistry::new());
        let metrics = MetricsHandle::new();
        registry.insert("s-1".to_string(), session.handle());

        session.activate(&codec).await.unwrap();
        assert_eq!(
            transport.outbound.recv().await,
            Some(Outbound::Text(WELCOME_TEXT.to_string()))
        );

        let ctx = Arc::new(IngestContext {
            codec,
            processor,
            registry: registry.clone(),
            metrics: metrics.clone(),
            max_processing_failures: max_failures,
            idle_timeout,
        });
        let task = tokio::spawn(run(session, ctx));
        Harness {
            transport,
            registry,
            metrics,
            task,
        }
    }

    async fn send_binary(harness: &Harness, data: &'static [u8]) {
        harness
            .transport
            .inbound
            .send(Inbound::Binary(Bytes::from_static(data)))
            .await
            .unwrap();
    }

    async fn next_text(harness: &mut Harness) -> String {
        match harness.transport.outbound.recv().await {
            Some(Outbound::Text(text)) => text,
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_acks_each_chunk_in_order() {
        let mut h = start(FrameCodec::default(), Arc::new(AcknowledgeOnly), 3, None).await;

        send_binary(&h, b"\x00\x01\x02\x03\x04").await;
        assert_eq!(next_text(&mut h).await, "Received 5 bytes of audio data.");
        send_binary(&h, b"\x10\x20\x30").await;
        assert_eq!(next_text(&mut h).await, "Received 3 bytes of audio data.");

        h.transport.inbound.send(Inbound::Closed).await.unwrap();
        assert_eq!(h.task.await.unwrap(), DrainReason::ClientDisconnect);

        // Graceful disconnect: nothing else is written
        assert_eq!(h.transport.outbound.recv().await, None);
        assert!(!h.registry.contains("s-1"));

        let metrics = h.metrics.snapshot();
        assert_eq!(metrics.chunks_processed, 2);
        assert_eq!(metrics.bytes_processed, 8);
        assert_eq!(metrics.sessions_closed, 1);
    }

    #[tokio::test]
    async fn test_json_acks_carry_increasing_sequence() {
        let codec = FrameCodec::new(1024, true, AckFormat::Json);
        let mut h = start(codec, Arc::new(AcknowledgeOnly), 3, None).await;

        let payloads: [&'static [u8]; 4] = [b"a", b"bb", b"ccc", b""];
        for (i, payload) in payloads.into_iter().enumerate() {
            send_binary(&h, payload).await;
            let ack: serde_json::Value = serde_json::from_str(&next_text(&mut h).await).unwrap();
            assert_eq!(ack["type"], "ack");
            assert_eq!(ack["sequence"], (i + 1) as u64);
            assert_eq!(ack["bytes"], payload.len());
        }

        drop(h.transport.inbound);
        assert_eq!(h.task.await.unwrap(), DrainReason::ClientDisconnect);
    }

    #[tokio::test]
    async fn test_oversized_frame_never_reaches_processor() {
        let processor = Scripted::default();
        let codec = FrameCodec::new(4, true, AckFormat::Text);
        let mut h = start(codec, Arc::new(processor.clone()), 3, None).await;

        send_binary(&h, b"\x01\x02\x03\x04\x05").await;
        assert_eq!(
            next_text(&mut h).await,
            "An error occurred: audio frame of 5 bytes exceeds the 4 byte limit"
        );
        assert_eq!(
            h.transport.outbound.recv().await,
            Some(Outbound::Close {
                code: close_code::TOO_BIG,
                reason: "Message too big".to_string(),
            })
        );

        assert_eq!(h.task.await.unwrap(), DrainReason::ProtocolError);
        assert_eq!(processor.calls(), 0);
        assert_eq!(h.metrics.snapshot().protocol_violations, 1);
        assert!(!h.registry.contains("s-1"));
    }

    #[tokio::test]
    async fn test_single_processing_failure_is_recoverable() {
        let processor = Scripted::default();
        let mut h = start(FrameCodec::default(), Arc::new(processor.clone()), 3, None).await;

        send_binary(&h, b"\xFF\x00").await;
        assert_eq!(next_text(&mut h).await, "An error occurred: decoder rejected chunk");

        // Failed chunks do not consume a sequence number
        send_binary(&h, b"\x01\x02").await;
        assert_eq!(next_text(&mut h).await, "Received 2 bytes of audio data.");

        h.transport.inbound.send(Inbound::Closed).await.unwrap();
        assert_eq!(h.task.await.unwrap(), DrainReason::ClientDisconnect);
        assert_eq!(processor.calls(), 2);
        assert_eq!(h.metrics.snapshot().processing_failures, 1);
    }

    #[tokio::test]
    async fn test_repeated_processing_failures_drain_session() {
        let mut h = start(FrameCodec::default(), Arc::new(Scripted::default()), 2, None).await;

        send_binary(&h, b"\xFF").await;
        assert_eq!(next_text(&mut h).await, "An error occurred: decoder rejected chunk");
        send_binary(&h, b"\xFF").await;
        assert_eq!(next_text(&mut h).await, "An error occurred: decoder rejected chunk");
        assert_eq!(
            h.transport.outbound.recv().await,
            Some(Outbound::Close {
                code: close_code::INTERNAL_ERROR,
                reason: "Internal server error".to_string(),
            })
        );

        assert_eq!(
            h.task.await.unwrap(),
            DrainReason::ProcessingFailureThreshold
        );
    }

    #[tokio::test]
    async fn test_control_frames_are_ignored() {
        let mut h = start(FrameCodec::default(), Arc::new(AcknowledgeOnly), 3, None).await;

        h.transport
            .inbound
            .send(Inbound::Text("{\"type\":\"ping\"}".to_string()))
            .await
            .unwrap();
        send_binary(&h, b"\x01").await;
        // The first reply is the ack, not a response to the control frame
        assert_eq!(next_text(&mut h).await, "Received 1 bytes of audio data.");

        h.transport.inbound.send(Inbound::Closed).await.unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_failure_drains_silently() {
        let mut h = start(FrameCodec::default(), Arc::new(AcknowledgeOnly), 3, None).await;

        h.transport
            .inbound
            .send(Inbound::Failed("connection reset".to_string()))
            .await
            .unwrap();
        assert_eq!(h.task.await.unwrap(), DrainReason::TransportError);
        assert_eq!(h.transport.outbound.recv().await, None);
    }

    #[tokio::test]
    async fn test_external_drain_interrupts_idle_read() {
        let mut h = start(FrameCodec::default(), Arc::new(AcknowledgeOnly), 3, None).await;

        let mut handle = None;
        h.registry.for_each(|s| handle = Some(s.clone()));
        let handle = handle.unwrap();

        // Client is silent; the drain alone must end the loop
        assert!(handle.begin_drain(DrainReason::ServerShutdown));
        let reason = tokio::time::timeout(Duration::from_secs(1), &mut h.task)
            .await
            .expect("loop should exit promptly")
            .unwrap();
        assert_eq!(reason, DrainReason::ServerShutdown);
        assert_eq!(
            h.transport.outbound.recv().await,
            Some(Outbound::Close {
                code: close_code::GOING_AWAY,
                reason: "Server shutting down".to_string(),
            })
        );
        assert_eq!(handle.state(), SessionState::Closed);
        assert!(!h.registry.contains("s-1"));
    }

    #[tokio::test]
    async fn test_idle_timeout_drains_session() {
        let mut h = start(
            FrameCodec::default(),
            Arc::new(AcknowledgeOnly),
            3,
            Some(Duration::from_millis(20)),
        )
        .await;

        assert_eq!(h.task.await.unwrap(), DrainReason::IdleTimeout);
        assert_eq!(
            h.transport.outbound.recv().await,
            Some(Outbound::Close {
                code: close_code::NORMAL,
                reason: "Idle timeout".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_panicking_processor_counts_as_failure() {
        let processor = Scripted::default();
        let mut h = start(FrameCodec::default(), Arc::new(processor.clone()), 2, None).await;

        send_binary(&h, b"\xEE\x00").await;
        assert_eq!(next_text(&mut h).await, "An error occurred: chunk processor panicked");

        // The session survives a single panic
        assert!(h.registry.contains("s-1"));
        send_binary(&h, b"\x01").await;
        assert_eq!(next_text(&mut h).await, "Received 1 bytes of audio data.");

        send_binary(&h, b"\xEE").await;
        assert_eq!(next_text(&mut h).await, "An error occurred: chunk processor panicked");
        send_binary(&h, b"\xEE").await;
        assert_eq!(next_text(&mut h).await, "An error occurred: chunk processor panicked");
        assert_eq!(
            h.transport.outbound.recv().await,
            Some(Outbound::Close {
                code: close_code::INTERNAL_ERROR,
                reason: "Internal server error".to_string(),
            })
        );

        assert_eq!(
            h.task.await.unwrap(),
            DrainReason::ProcessingFailureThreshold
        );
        assert!(!h.registry.contains("s-1"));
        assert_eq!(processor.calls(), 4);
        assert_eq!(h.metrics.snapshot().processing_failures, 3);
    }

    #[tokio::test]
    async fn test_registration_is_released_when_task_unwinds() {
        let registry = Arc::new(SessionRegistry::new());
        let (conn, _transport) = channel(None, 1, 1);
        let session = Session::new("s-1".to_string(), conn);
        let handle = session.handle();
        registry.insert("s-1".to_string(), handle.clone());

        let registration = Registration {
            registry: registry.clone(),
            session_id: "s-1".to_string(),
        };
        let task = tokio::spawn(async move {
            // Same declaration order as `run`: the session outlives its registration
            let _session = session;
            let _registration = registration;
            panic!("ingest task crashed");
        });
        assert!(task.await.unwrap_err().is_panic());

        assert!(!registry.contains("s-1"));
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_failed_error_report_drains_session() {
        let mut h = start(FrameCodec::default(), Arc::new(Scripted::default()), 3, None).await;

        // The client stops reading; the inbound side stays open
        h.transport.outbound.close();
        send_binary(&h, b"\xFF").await;

        let reason = tokio::time::timeout(Duration::from_secs(1), &mut h.task)
            .await
            .expect("loop should exit once the error text cannot be delivered")
            .unwrap();
        assert_eq!(reason, DrainReason::TransportError);
        assert!(!h.registry.contains("s-1"));
        assert_eq!(h.metrics.snapshot().processing_failures, 1);
    }
}
