//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_STREAM__MAX_CHUNK_BYTES`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore, so field names that
//! contain single underscores survive the mapping.

use crate::audio::codec::{AckFormat, DEFAULT_MAX_CHUNK_BYTES};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, stream, performance)
/// keeps each concern readable and lets `config.toml` use one table per group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub stream: StreamConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(), // Localhost only (safe for development)
            port: 8000,
        }
    }
}

/// Streaming protocol settings.
///
/// ## Fields:
/// - `path`: URL path of the WebSocket endpoint
/// - `max_chunk_bytes`: Largest accepted audio frame; bigger frames end the session
/// - `allow_empty_chunks`: Whether zero-length audio frames are acknowledged or rejected
/// - `max_processing_failures`: Consecutive processing failures before the session is closed
/// - `idle_timeout_secs`: Drain a session that sends nothing for this long (0 = never)
/// - `shutdown_timeout_ms`: How long shutdown waits for sessions before forcing them closed
/// - `inbound_queue_depth` / `outbound_queue_depth`: Per-session frame queues; when
///   full, the sender waits (backpressure)
/// - `ack_format`: `text` for the plain legacy strings, `json` for tagged objects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub path: String,
    pub max_chunk_bytes: usize,
    pub allow_empty_chunks: bool,
    pub max_processing_failures: u32,
    pub idle_timeout_secs: u64,
    pub shutdown_timeout_ms: u64,
    pub inbound_queue_depth: usize,
    pub outbound_queue_depth: usize,
    pub ack_format: AckFormat,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES, // 1 MiB
            allow_empty_chunks: true,
            max_processing_failures: 3,
            idle_timeout_secs: 60,
            shutdown_timeout_ms: 5000,
            inbound_queue_depth: 32,
            outbound_queue_depth: 32,
            ack_format: AckFormat::Text,
        }
    }
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// Each session is one lightweight task plus two small queues, so the cap is
/// mostly about protecting the processor behind the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 64,
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_STREAM__MAX_CHUNK_BYTES=65536`: Override the chunk limit
    /// - `APP_STREAM__ACK_FORMAT=json`: Switch acknowledgment format
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Same as [`AppConfig::load`], reading the optional file `name` (any
    /// extension the `config` crate understands).
    pub fn load_from(name: &str) -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Optional file; required(false) means "don't error if missing"
            .add_source(config::File::with_name(name).required(false))
            // 3. APP_-prefixed environment variables
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        // Handle special environment variables used by deployment platforms
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup gives a clear message instead
    /// of a session that misbehaves later.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.stream.path.starts_with('/') {
            return Err(anyhow::anyhow!(
                "Stream path must start with '/', got '{}'",
                self.stream.path
            ));
        }

        if self.stream.max_chunk_bytes == 0 {
            return Err(anyhow::anyhow!("Max chunk size must be greater than 0"));
        }

        if self.stream.max_processing_failures == 0 {
            return Err(anyhow::anyhow!(
                "Max processing failures must be greater than 0"
            ));
        }

        if self.stream.inbound_queue_depth == 0 || self.stream.outbound_queue_depth == 0 {
            return Err(anyhow::anyhow!("Queue depths must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!(
                "Max concurrent sessions must be greater than 0"
            ));
        }

        Ok(())
    }

    /// URL clients should use to reach the stream endpoint.
    pub fn stream_url(&self) -> String {
        format!(
            "ws://{}:{}{}",
            self.server.host, self.server.port, self.stream.path
        )
    }
}
