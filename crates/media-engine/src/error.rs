//! Media engine error types.

use thiserror::Error;

/// Errors reported by a media engine backend.
///
/// Messages are surfaced verbatim to the requesting client, so backends
/// should keep them descriptive but free of host details.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine initialization (worker/router creation) failed.
    #[error("Engine initialization failed: {0}")]
    Initialize(String),

    /// An operation was attempted before `initialize` completed.
    #[error("Engine not initialized")]
    NotInitialized,

    /// WebRTC transport creation failed (e.g. port exhaustion).
    #[error("Transport creation failed: {0}")]
    TransportCreate(String),

    /// Transport connect (DTLS parameters) failed.
    #[error("Transport connect failed: {0}")]
    Connect(String),

    /// Produce failed.
    #[error("Produce failed: {0}")]
    Produce(String),

    /// Consume failed.
    #[error("Consume failed: {0}")]
    Consume(String),

    /// The engine does not know the given handle (already closed or never created).
    #[error("Unknown engine handle: {0}")]
    UnknownHandle(String),

    /// Negotiation parameters could not be converted for the backend.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// The engine died and cannot recover.
    #[error("Engine fatal error: {0}")]
    Fatal(String),
}
