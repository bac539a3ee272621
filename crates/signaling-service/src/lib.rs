//! SFU Signaling Service Library
//!
//! The signaling layer of a Selective Forwarding Unit. Clients connect over a
//! WebSocket and ask for WebRTC transports, producers (streams they send) and
//! consumers (streams they receive from other clients' producers). All media
//! work is delegated to a [`media_engine::MediaEngine`]; this crate does the
//! bookkeeping that ties engine resources to connections.
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager (process-scoped)
//! ├── opens/closes one ConnectionLifecycle per socket
//! │   └── ConnectionActor (one per connection)
//! │       └── SignalingHandler (validation + engine calls)
//! └── SessionRegistryActor (singleton)
//!     ├── ConnectionSession per connection
//!     └── global producer index (with tombstones)
//! ```
//!
//! Requests on one connection run strictly in order. Connections run
//! concurrently; every registry mutation goes through the single registry
//! actor.
//!
//! # Modules
//!
//! - [`actors`] - Registry and connection actors
//! - [`config`] - Service configuration from environment
//! - [`context`] - Process-scoped engine/registry context
//! - [`errors`] - Error types with stable client codes
//! - [`lifecycle`] - Open/close of signaling connections
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`server`] - WebSocket endpoint
//! - [`signaling`] - Wire protocol and request handler

pub mod actors;
pub mod config;
pub mod context;
pub mod errors;
pub mod lifecycle;
pub mod observability;
pub mod server;
pub mod signaling;
