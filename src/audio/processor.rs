//! # Chunk Processing
//!
//! The gateway does not interpret audio itself. Each accepted chunk is handed
//! to a [`ChunkProcessor`], the seam where a decoder or speech-to-text engine
//! plugs in. A failure here is scoped to a single chunk: the ingest loop
//! reports it to the client and keeps going until failures pile up.

use super::session::SessionId;
use futures_util::future::BoxFuture;

/// A chunk could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ProcessingError(pub String);

/// Consumes audio chunks for a session.
///
/// Implementations are shared by every session, so they must not block the
/// executor and must not make one session wait on another.
pub trait ChunkProcessor: Send + Sync + 'static {
    fn process<'a>(
        &'a self,
        session_id: &'a SessionId,
        chunk: &'a [u8],
    ) -> BoxFuture<'a, Result<(), ProcessingError>>;
}

/// Accepts every chunk without looking at it.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcknowledgeOnly;

impl ChunkProcessor for AcknowledgeOnly {
    fn process<'a>(
        &'a self,
        _session_id: &'a SessionId,
        _chunk: &'a [u8],
    ) -> BoxFuture<'a, Result<(), ProcessingError>> {
        Box::pin(async { Ok(()) })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acknowledge_only_accepts_everything() {
        let id = "s".to_string();
        assert!(AcknowledgeOnly.process(&id, b"").await.is_ok());
        assert!(AcknowledgeOnly.process(&id, &[1, 2, 3]).await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_processor_fails_on_marker() {
        let processor = testing::Scripted::default();
        let id = "s".to_string();
        assert!(processor.process(&id, &[0x01]).await.is_ok());
        assert_eq!(
            processor.process(&id, &[0xFF, 0x00]).await,
            Err(ProcessingError("decoder rejected chunk".to_string()))
        );
        assert_eq!(processor.calls(), 2);
    }

    #[tokio::test]
    #[should_panic(expected = "decoder crashed")]
    async fn test_scripted_processor_panics_on_crash_marker() {
        let processor = testing::Scripted::default();
        let id = "s".to_string();
        let _ = processor.process(&id, &[0xEE]).await;
    }
}
