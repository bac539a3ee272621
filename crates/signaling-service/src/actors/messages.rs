//! Message types for actor communication.
//!
//! All actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Response patterns use `tokio::sync::oneshot` for request-reply semantics.

use crate::errors::SignalingError;
use crate::signaling::protocol::{InboundFrame, Notification};

use common::types::{ConnectionId, ConsumerId, ProducerId, TransportId};
use media_engine::{ConsumerHandle, MediaKind, ProducerHandle, ResourceHandle, TransportHandle};
use tokio::sync::{mpsc, oneshot};

/// Messages sent to the `SessionRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Register an empty session for a new connection.
    CreateSession {
        connection_id: ConnectionId,
        /// Where `producerClosed` notifications for this connection are sent.
        notifier: mpsc::Sender<Notification>,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    /// Get a snapshot of a session.
    GetSession {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Result<SessionSnapshot, SignalingError>>,
    },

    /// Move a session into `Closing`; later additions fail with `SessionClosing`.
    MarkClosing {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    /// Register a transport created by the engine.
    AddTransport {
        connection_id: ConnectionId,
        handle: TransportHandle,
        respond_to: oneshot::Sender<Result<TransportId, SignalingError>>,
    },

    /// Register a producer created on one of the session's transports.
    AddProducer {
        connection_id: ConnectionId,
        transport_id: TransportId,
        kind: MediaKind,
        handle: ProducerHandle,
        respond_to: oneshot::Sender<Result<ProducerId, SignalingError>>,
    },

    /// Register a consumer of a (possibly foreign) producer.
    AddConsumer {
        connection_id: ConnectionId,
        transport_id: TransportId,
        producer_id: ProducerId,
        handle: ConsumerHandle,
        respond_to: oneshot::Sender<Result<ConsumerId, SignalingError>>,
    },

    /// Look up the engine handle of an owned transport.
    GetTransport {
        connection_id: ConnectionId,
        transport_id: TransportId,
        respond_to: oneshot::Sender<Result<TransportHandle, SignalingError>>,
    },

    /// Forget an owned transport (allowed while closing). The caller closes it.
    RemoveTransport {
        connection_id: ConnectionId,
        transport_id: TransportId,
        respond_to: oneshot::Sender<Option<TransportHandle>>,
    },

    /// Resolve a producer through the global index.
    ResolveProducer {
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Result<ProducerInfo, SignalingError>>,
    },

    /// Remove a session and revoke its producers.
    DestroySession {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<SessionTeardown>,
    },

    /// Get registry counts (for logging, metrics and tests).
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
}

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// A frame received from the client, handled in arrival order.
    Frame { frame: InboundFrame },
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connection_id: ConnectionId,
    pub closing: bool,
    pub transports: Vec<TransportId>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
}

/// A producer as seen through the global index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub owner: ConnectionId,
    pub kind: MediaKind,
    pub handle: ProducerHandle,
}

/// A consumer in another session whose producer was revoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedConsumer {
    pub connection_id: ConnectionId,
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub handle: ConsumerHandle,
}

/// Engine handles released by `DestroySession`.
///
/// Empty when the session did not exist (already destroyed).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTeardown {
    pub connection_id: Option<ConnectionId>,
    pub consumers: Vec<ConsumerHandle>,
    pub producers: Vec<ProducerHandle>,
    pub transports: Vec<TransportHandle>,
    pub orphaned_consumers: Vec<OrphanedConsumer>,
}

impl SessionTeardown {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
            && self.producers.is_empty()
            && self.transports.is_empty()
            && self.orphaned_consumers.is_empty()
    }

    /// Handles in close order: consumers before the producers they read from,
    /// producers before the transports carrying them.
    #[must_use]
    pub fn handles(&self) -> Vec<ResourceHandle> {
        self.consumers
            .iter()
            .cloned()
            .map(ResourceHandle::from)
            .chain(
                self.orphaned_consumers
                    .iter()
                    .map(|orphan| ResourceHandle::from(orphan.handle.clone())),
            )
            .chain(self.producers.iter().cloned().map(ResourceHandle::from))
            .chain(self.transports.iter().cloned().map(ResourceHandle::from))
            .collect()
    }
}

/// Registry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStatus {
    pub sessions: usize,
    pub closing_sessions: usize,
    pub transports: usize,
    pub producers_active: usize,
    pub producers_revoked: usize,
    pub consumers: usize,
}
