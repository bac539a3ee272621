//! Signaling service error types.
//!
//! Every per-request failure is returned to the client on the same
//! request/response exchange as `{ code, message }`. Codes are stable
//! strings; internal details are logged server-side but not exposed.

use thiserror::Error;

/// Signaling error type.
///
/// Grouped by how the request failed:
/// - Validation (rejected before any engine call, no mutation)
/// - Lookup (unknown or revoked ids, closing sessions; no mutation)
/// - Engine (adapter call failed; message surfaced verbatim)
/// - Internal (actor channels, shutdown)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    /// Engine has not finished initialization.
    #[error("Media engine is not ready")]
    EngineNotReady,

    /// Kind is not audio/video, or the codec list is empty.
    #[error("Invalid RTP parameters: {0}")]
    InvalidRtpParameters(String),

    /// `producerId` missing, empty or not a valid id.
    #[error("Invalid producer id: {0}")]
    InvalidProducerId(String),

    /// Network policy disables every protocol or prefers a disabled one.
    #[error("Invalid network policy: {0}")]
    InvalidNetworkPolicy(String),

    /// DTLS parameters without fingerprints.
    #[error("Invalid DTLS parameters: {0}")]
    InvalidDtlsParameters(String),

    /// Frame is not a valid request envelope or its data does not match the event.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Event name is not recognised.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Transport is not owned by the requesting connection.
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    /// Producer was never registered in any session.
    #[error("Unknown producer: {0}")]
    UnknownProducer(String),

    /// Producer's owner disconnected (or it never existed).
    #[error("Producer is gone: {0}")]
    ProducerGone(String),

    /// Session does not exist.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Session is being torn down.
    #[error("Session is closing: {0}")]
    SessionClosing(String),

    /// A session already exists for the connection.
    #[error("Duplicate connection: {0}")]
    DuplicateConnection(String),

    #[error("{0}")]
    EngineTransportCreateFailed(String),

    #[error("{0}")]
    EngineConnectFailed(String),

    #[error("{0}")]
    EngineProduceFailed(String),

    #[error("{0}")]
    EngineConsumeFailed(String),

    /// Engine call exceeded the configured timeout.
    #[error("Media engine call timed out: {0}")]
    EngineTimeout(String),

    /// The connection already has a full queue of requests waiting.
    #[error("Too many pending requests: {0}")]
    Overloaded(String),

    /// Service is shutting down and accepts no new connections.
    #[error("Service is shutting down")]
    ShuttingDown,

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    /// Returns the stable wire code for this error.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            SignalingError::EngineNotReady => "ENGINE_NOT_READY",
            SignalingError::InvalidRtpParameters(_) => "INVALID_RTP_PARAMETERS",
            SignalingError::InvalidProducerId(_) => "INVALID_PRODUCER_ID",
            SignalingError::InvalidNetworkPolicy(_) => "INVALID_NETWORK_POLICY",
            SignalingError::InvalidDtlsParameters(_) => "INVALID_DTLS_PARAMETERS",
            SignalingError::MalformedRequest(_) => "MALFORMED_REQUEST",
            SignalingError::UnknownEvent(_) => "UNKNOWN_EVENT",
            SignalingError::UnknownTransport(_) => "UNKNOWN_TRANSPORT",
            SignalingError::UnknownProducer(_) => "UNKNOWN_PRODUCER",
            SignalingError::ProducerGone(_) => "PRODUCER_GONE",
            SignalingError::NotFound(_) => "NOT_FOUND",
            SignalingError::SessionClosing(_) => "SESSION_CLOSING",
            SignalingError::DuplicateConnection(_) => "DUPLICATE_CONNECTION",
            SignalingError::EngineTransportCreateFailed(_) => "ENGINE_TRANSPORT_CREATE_FAILED",
            SignalingError::EngineConnectFailed(_) => "ENGINE_CONNECT_FAILED",
            SignalingError::EngineProduceFailed(_) => "ENGINE_PRODUCE_FAILED",
            SignalingError::EngineConsumeFailed(_) => "ENGINE_CONSUME_FAILED",
            SignalingError::EngineTimeout(_) => "ENGINE_TIMEOUT",
            SignalingError::Overloaded(_) => "CONNECTION_OVERLOADED",
            SignalingError::ShuttingDown => "SHUTTING_DOWN",
            SignalingError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns a bounded label string for the error variant (for metrics).
    #[must_use]
    pub const fn error_type_label(&self) -> &'static str {
        match self {
            SignalingError::EngineNotReady => "engine_not_ready",
            SignalingError::InvalidRtpParameters(_) => "invalid_rtp_parameters",
            SignalingError::InvalidProducerId(_) => "invalid_producer_id",
            SignalingError::InvalidNetworkPolicy(_) => "invalid_network_policy",
            SignalingError::InvalidDtlsParameters(_) => "invalid_dtls_parameters",
            SignalingError::MalformedRequest(_) => "malformed_request",
            SignalingError::UnknownEvent(_) => "unknown_event",
            SignalingError::UnknownTransport(_) => "unknown_transport",
            SignalingError::UnknownProducer(_) => "unknown_producer",
            SignalingError::ProducerGone(_) => "producer_gone",
            SignalingError::NotFound(_) => "not_found",
            SignalingError::SessionClosing(_) => "session_closing",
            SignalingError::DuplicateConnection(_) => "duplicate_connection",
            SignalingError::EngineTransportCreateFailed(_) => "engine_transport_create_failed",
            SignalingError::EngineConnectFailed(_) => "engine_connect_failed",
            SignalingError::EngineProduceFailed(_) => "engine_produce_failed",
            SignalingError::EngineConsumeFailed(_) => "engine_consume_failed",
            SignalingError::EngineTimeout(_) => "engine_timeout",
            SignalingError::Overloaded(_) => "connection_overloaded",
            SignalingError::ShuttingDown => "shutting_down",
            SignalingError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SignalingError::Internal(_) => "An internal error occurred".to_string(),
            SignalingError::NotFound(_) => "Session not found".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the error means the session is (being) torn down.
    #[must_use]
    pub const fn is_session_gone(&self) -> bool {
        matches!(
            self,
            SignalingError::SessionClosing(_) | SignalingError::NotFound(_)
        )
    }
}
