//! # Dispatcher
//!
//! Accepts new streaming connections and owns the set of running ingest loops.
//!
//! ## Connection flow:
//! 1. Refuse if shutting down
//! 2. Create a [`Session`] and register its weak handle, refusing if the
//!    registry already holds `max_concurrent_sessions` (checked under its lock)
//! 3. Activate it (welcome frame)
//! 4. Spawn its ingest loop and keep the `JoinHandle`
//!
//! ## Shutdown:
//! 1. Stop admitting sessions
//! 2. Ask every registered session to drain (`server-shutdown`)
//! 3. Wait up to `shutdown_timeout` for all ingest loops to finish
//! 4. Abort whatever is left; aborting drops the session, which closes it

use super::codec::{FrameCodec, TRANSPORT_FRAME_SLACK};
use super::connection::Connection;
use super::ingest::{self, IngestContext};
use super::processor::ChunkProcessor;
use super::registry::{InsertError, SessionRegistry};
use super::session::{DrainReason, Session, SessionId, SessionSnapshot};
use crate::config::StreamConfig;
use crate::state::MetricsHandle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a connection was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("server is shutting down")]
    ShuttingDown,

    #[error("maximum concurrent sessions ({0}) reached")]
    AtCapacity(usize),

    #[error("session could not be activated: {0}")]
    Activation(String),
}

/// Outcome of [`Dispatcher::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Ingest loops that finished on their own within the timeout
    pub drained: usize,
    /// Ingest loops aborted after the timeout
    pub forced: usize,
}

type TaskMap = Arc<Mutex<HashMap<SessionId, JoinHandle<()>>>>;

/// Drops an ingest task's handle from the map when the task ends, whether it
/// returns, unwinds or is aborted.
struct TaskSlot {
    tasks: TaskMap,
    session_id: SessionId,
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}

pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    ingest: Arc<IngestContext>,
    tasks: TaskMap,
    accepting: AtomicBool,
    max_sessions: usize,
    shutdown_timeout: Duration,
    inbound_depth: usize,
    outbound_depth: usize,
}

impl Dispatcher {
    pub fn new(
        stream: &StreamConfig,
        max_sessions: usize,
        processor: Arc<dyn ChunkProcessor>,
        metrics: MetricsHandle,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let codec = FrameCodec::new(
            stream.max_chunk_bytes,
            stream.allow_empty_chunks,
            stream.ack_format,
        );
        let idle_timeout =
            (stream.idle_timeout_secs > 0).then(|| Duration::from_secs(stream.idle_timeout_secs));

        Self {
            registry: registry.clone(),
            ingest: Arc::new(IngestContext {
                codec,
                processor,
                registry,
                metrics,
                max_processing_failures: stream.max_processing_failures,
                idle_timeout,
            }),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            accepting: AtomicBool::new(true),
            max_sessions,
            shutdown_timeout: Duration::from_millis(stream.shutdown_timeout_ms),
            inbound_depth: stream.inbound_queue_depth,
            outbound_depth: stream.outbound_queue_depth,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Queue depths to use when building a [`Connection`] for this dispatcher.
    pub fn queue_depths(&self) -> (usize, usize) {
        (self.inbound_depth, self.outbound_depth)
    }

    /// Largest WebSocket frame the transport should accept.
    pub fn max_frame_bytes(&self) -> usize {
        self.ingest
            .codec
            .max_chunk_bytes()
            .saturating_add(TRANSPORT_FRAME_SLACK)
    }

    /// Check whether a new session would currently be admitted.
    ///
    /// A cheap check ahead of the upgrade. `on_connect` enforces the
    /// capacity again while registering.
    pub fn admission(&self) -> Result<(), DispatchError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }
        if self.registry.count() >= self.max_sessions {
            return Err(DispatchError::AtCapacity(self.max_sessions));
        }
        Ok(())
    }

    /// Take ownership of a new connection and start streaming on it.
    pub async fn on_connect(&self, connection: Connection) -> Result<SessionId, DispatchError> {
        if let Err(err) = self.admission() {
            self.ingest.metrics.update(|m| m.sessions_rejected += 1);
            return Err(err);
        }

        let session_id = Uuid::new_v4().to_string();
        let mut session = Session::new(session_id.clone(), connection);
        match self
            .registry
            .insert_within(session_id.clone(), session.handle(), self.max_sessions)
        {
            Ok(()) => {}
            Err(InsertError::Full(_)) => {
                session.close();
                self.ingest.metrics.update(|m| m.sessions_rejected += 1);
                return Err(DispatchError::AtCapacity(self.max_sessions));
            }
            Err(InsertError::Duplicate) => {
                session.close();
                return Err(DispatchError::Activation(format!(
                    "duplicate session id {}",
                    session_id
                )));
            }
        }

        if let Err(err) = session.activate(&self.ingest.codec).await {
            warn!(session_id = %session_id, error = %err, "Session activation failed");
            self.registry.remove(&session_id);
            session.close();
            return Err(DispatchError::Activation(err.to_string()));
        }
        self.ingest.metrics.update(|m| m.sessions_opened += 1);

        let ctx = self.ingest.clone();
        let slot = TaskSlot {
            tasks: self.tasks.clone(),
            session_id: session_id.clone(),
        };

        // Hold the map lock while spawning so the task cannot deregister
        // itself before its handle is stored.
        let mut map = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            let _slot = slot;
            ingest::run(session, ctx).await;
        });
        map.insert(session_id.clone(), handle);

        Ok(session_id)
    }

    /// Snapshots of every live session.
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let mut snapshots = Vec::new();
        self.registry.for_each(|session| {
            if let Some(snapshot) = session.snapshot() {
                snapshots.push(snapshot);
            }
        });
        snapshots.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        snapshots
    }

    /// Whether `shutdown` has started.
    pub fn is_shutting_down(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }

    /// Drain every session and wait (bounded) for their loops to finish.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.accepting.store(false, Ordering::SeqCst);

        let mut signalled = 0;
        self.registry.for_each(|session| {
            if session.begin_drain(DrainReason::ServerShutdown) {
                debug!(session_id = %session.id(), "Drain requested");
                signalled += 1;
            }
        });

        let handles: Vec<(SessionId, JoinHandle<()>)> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        info!(
            sessions = handles.len(),
            signalled,
            timeout_ms = self.shutdown_timeout.as_millis() as u64,
            "Waiting for sessions to drain"
        );

        let aborts: Vec<_> = handles
            .iter()
            .map(|(id, handle)| (id.clone(), handle.abort_handle()))
            .collect();
        let total = handles.len();
        let all_done = futures_util::future::join_all(handles.into_iter().map(|(_, h)| h));

        if tokio::time::timeout(self.shutdown_timeout, all_done).await.is_ok() {
            return ShutdownReport {
                drained: total,
                forced: 0,
            };
        }

        let mut forced = 0;
        for (id, abort) in aborts {
            if abort.is_finished() {
                continue;
            }
            warn!(session_id = %id, "Session still draining after timeout, forcing close");
            // Deregister first so the registry never lists a closed session
            self.registry.remove(&id);
            abort.abort();
            forced += 1;
        }
        if forced > 0 {
            self.ingest.metrics.update(|m| m.sessions_closed += forced as u64);
        }

        ShutdownReport {
            drained: total - forced,
            forced,
        }
    }
}
