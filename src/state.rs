//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets the HTTP workers, the dispatcher and every ingest loop
//!   hold the same metrics and registry
//! - **Memory safety**: The data is dropped when the last clone goes away
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer at a time
//! - **Usage here**: Metrics are written briefly after each chunk and read by
//!   the `/metrics` endpoint; the lock is never held across an `.await`
//! - **Poisoning**: A panic while holding the lock poisons it; we recover the
//!   inner value instead of propagating the panic into unrelated sessions

use crate::audio::dispatcher::Dispatcher;
use crate::config::AppConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state shared across all HTTP request handlers.
///
/// ## Thread Safety Pattern:
/// - `config` never changes after startup, so it is shared as `Arc<AppConfig>`
/// - `metrics` is updated from middleware and ingest loops (`MetricsHandle`)
/// - `dispatcher` owns the session registry and the ingest tasks
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration (read-only at runtime)
    pub config: Arc<AppConfig>,

    /// Counters shared with the dispatcher and ingest loops
    pub metrics: MetricsHandle,

    /// Accepts streaming connections and coordinates shutdown
    pub dispatcher: Arc<Dispatcher>,

    /// When the server started (never changes, so no lock needed)
    pub start_time: Instant,
}

/// Counters collected across HTTP requests and streaming sessions.
///
/// ## Why these metrics matter:
/// - **request/error counts**: HTTP load and reliability
/// - **session counters**: how many streams came and went, and why some were refused
/// - **chunk counters**: audio throughput and processing health
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of HTTP requests that ended in a 4xx/5xx
    pub error_count: u64,

    /// Streaming sessions accepted
    pub sessions_opened: u64,

    /// Streaming sessions that reached `Closed`
    pub sessions_closed: u64,

    /// Upgrade requests refused (at capacity or shutting down)
    pub sessions_rejected: u64,

    /// Audio chunks processed and acknowledged
    pub chunks_processed: u64,

    /// Audio bytes processed and acknowledged
    pub bytes_processed: u64,

    /// Chunks the processor failed on
    pub processing_failures: u64,

    /// Frames rejected by the codec (oversized/empty)
    pub protocol_violations: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    #[serde(skip)]
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

/// Cheap, cloneable handle to the shared [`AppMetrics`].
#[derive(Debug, Default, Clone)]
pub struct MetricsHandle(Arc<RwLock<AppMetrics>>);

impl MetricsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a mutation under the write lock.
    ///
    /// ## Usage Example:
    /// ```rust,ignore
    /// metrics.update(|m| m.chunks_processed += 1);
    /// ```
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut AppMetrics),
    {
        let mut metrics = self.0.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics);
    }

    /// Record one HTTP request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.update(|metrics| {
            metrics.request_count += 1;
            if is_error {
                metrics.error_count += 1;
            }

            let endpoint_metric = metrics
                .endpoint_metrics
                .entry(endpoint.to_string())
                .or_default();
            endpoint_metric.request_count += 1;
            endpoint_metric.total_duration_ms += duration_ms;
            if is_error {
                endpoint_metric.error_count += 1;
            }
        });
    }

    /// Copy of the current counters, so no lock is held while responding.
    pub fn snapshot(&self) -> AppMetrics {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AppState {
    /// Build the state around an already constructed dispatcher.
    pub fn new(config: AppConfig, metrics: MetricsHandle, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config: Arc::new(config),
            metrics,
            dispatcher,
            start_time: Instant::now(),
        }
    }

    /// Number of sessions currently registered.
    pub fn active_sessions(&self) -> usize {
        self.dispatcher.registry().count()
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint (0.0 before the first request).
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint, from 0.0 (no errors) to 1.0 (all failed).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
