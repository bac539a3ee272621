//! Actor model implementation for the signaling service.
//!
//! ```text
//! SessionRegistryActor (singleton per process)
//! │   owns every ConnectionSession and the global producer index
//! └── ConnectionActor (one per signaling connection)
//!         runs the SignalingHandler for that connection
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer**: every registry mutation goes through one mailbox, so
//!   concurrent connections never observe each other's partial state
//! - **No engine calls in the registry**: connections only serialize at
//!   bookkeeping, engine calls run in the connection that issued them
//! - **CancellationToken propagation**: connection actors run on child tokens
//!   of the manager's token, so process shutdown reaches every connection
//!
//! # Modules
//!
//! - [`registry`] - `SessionRegistryActor` and its handle
//! - [`connection`] - `ConnectionActor` per signaling connection
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::SessionRegistryHandle;
