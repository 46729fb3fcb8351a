//! # Audio Streaming Module
//!
//! Everything between a connected WebSocket and the chunk processor.
//!
//! ## Key Components:
//! - **Codec**: Classifies inbound frames and renders server messages
//! - **Connection**: Channel pair that decouples the transport from the ingest loop
//! - **Session**: Lifecycle state and counters for one client stream
//! - **Registry**: Process-wide set of live sessions
//! - **Processor**: Pluggable consumer of audio chunks
//! - **Ingest**: Per-session read/process/acknowledge loop
//! - **Dispatcher**: Admits connections, spawns ingest loops, coordinates shutdown
//!
//! ## WebSocket Protocol:
//! 1. Server sends a welcome text frame on connect
//! 2. Client sends binary audio frames; each is acknowledged in order
//! 3. Either side may close; a server-initiated close carries a code and reason

// The actix transport actor lives in src/websocket.rs at the root level
pub mod codec; // Frame classification and message rendering
pub mod connection; // Transport <-> session channel pair
pub mod dispatcher; // Connection admission and shutdown
pub mod ingest; // Per-session loop
pub mod processor; // Chunk processing seam
pub mod registry; // Live session bookkeeping
pub mod session; // Session state management
