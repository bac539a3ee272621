//! The `MediaEngine` trait and the opaque handles it hands out.

use crate::error::EngineError;
use crate::types::{
    DtlsParameters, EngineConfig, IceCandidate, IceParameters, MediaKind, RouterCapabilities,
    RtpParameters, WebRtcTransportOptions,
};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Engine-side identifier of a WebRTC transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportHandle(String);

impl TransportHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Engine-side identifier of a producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProducerHandle(String);

impl ProducerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProducerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Engine-side identifier of a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerHandle(String);

impl ConsumerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Any closable engine resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceHandle {
    Transport(TransportHandle),
    Producer(ProducerHandle),
    Consumer(ConsumerHandle),
}

impl ResourceHandle {
    /// Resource kind as a bounded metric label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ResourceHandle::Transport(_) => "transport",
            ResourceHandle::Producer(_) => "producer",
            ResourceHandle::Consumer(_) => "consumer",
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceHandle::Transport(h) => write!(f, "transport:{h}"),
            ResourceHandle::Producer(h) => write!(f, "producer:{h}"),
            ResourceHandle::Consumer(h) => write!(f, "consumer:{h}"),
        }
    }
}

impl From<TransportHandle> for ResourceHandle {
    fn from(handle: TransportHandle) -> Self {
        ResourceHandle::Transport(handle)
    }
}

impl From<ProducerHandle> for ResourceHandle {
    fn from(handle: ProducerHandle) -> Self {
        ResourceHandle::Producer(handle)
    }
}

impl From<ConsumerHandle> for ResourceHandle {
    fn from(handle: ConsumerHandle) -> Self {
        ResourceHandle::Consumer(handle)
    }
}

/// Result of a successful `create_webrtc_transport`.
#[derive(Debug, Clone)]
pub struct CreatedTransport {
    pub handle: TransportHandle,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Result of a successful `consume`.
#[derive(Debug, Clone)]
pub struct CreatedConsumer {
    pub handle: ConsumerHandle,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// One-shot, process-wide notification that the engine died.
///
/// Backends trip it from their death callback; the process supervises it
/// and exits. Tripping more than once keeps the first reason.
#[derive(Debug, Clone)]
pub struct FatalSignal {
    sender: Arc<watch::Sender<Option<String>>>,
}

impl Default for FatalSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FatalSignal {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Report that the engine died.
    pub fn trip(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.sender.borrow().is_some()
    }

    /// Wait until the signal is tripped and return the reason.
    pub async fn tripped(&self) -> String {
        let mut receiver = self.sender.subscribe();
        let reason = match receiver.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            // The sender lives in `self`, so the channel cannot close while we wait.
            Err(_) => String::from("fatal signal closed"),
        };
        reason
    }
}

/// Capability surface of the media engine.
///
/// All methods may suspend. Implementations must make `close` idempotent:
/// closing an unknown or already-closed handle is a no-op.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Start the engine and create the router. Called once per process.
    async fn initialize(
        &self,
        config: &EngineConfig,
        fatal: FatalSignal,
    ) -> Result<RouterCapabilities, EngineError>;

    /// Create a WebRTC transport with the given network options.
    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<CreatedTransport, EngineError>;

    /// Complete the DTLS handshake parameters of a transport.
    async fn connect_transport(
        &self,
        transport: &TransportHandle,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError>;

    /// Start receiving a stream on `transport`.
    async fn produce(
        &self,
        transport: &TransportHandle,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerHandle, EngineError>;

    /// Start sending `producer`'s stream on `transport`.
    async fn consume(
        &self,
        transport: &TransportHandle,
        producer: &ProducerHandle,
        capabilities: &RouterCapabilities,
    ) -> Result<CreatedConsumer, EngineError>;

    /// Close a resource. Idempotent.
    async fn close(&self, handle: &ResourceHandle);
}
