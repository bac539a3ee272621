//! `SessionRegistryActor` - process-wide session bookkeeping.
//!
//! The registry owns every `ConnectionSession` and the global producer index.
//! It is a single-writer actor, so mutations from concurrent connections are
//! linearized without locks. It performs bookkeeping only: engine calls
//! happen in the connection that issued them, and handles released by
//! `destroy_session` are closed by the lifecycle manager.
//!
//! # Producer index
//!
//! When a session is destroyed its producers are revoked rather than removed.
//! A revoked entry (tombstone) makes concurrent consume attempts fail with
//! `ProducerGone`. Tombstones are purged after the configured retention by a
//! periodic sweep; purged ids still resolve to `ProducerGone`.

use crate::errors::SignalingError;
use crate::observability::metrics as prom;
use crate::signaling::protocol::Notification;

use super::messages::{
    OrphanedConsumer, ProducerInfo, RegistryMessage, RegistryStatus, SessionSnapshot,
    SessionTeardown,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::{ConnectionId, ConsumerId, ProducerId, TransportId};
use media_engine::{ConsumerHandle, MediaKind, ProducerHandle, TransportHandle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Upper bound on the tombstone sweep period.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Lower bound on the tombstone sweep period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Handle to the `SessionRegistryActor`.
#[derive(Clone, Debug)]
pub struct SessionRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl SessionRegistryHandle {
    /// Spawn the registry actor.
    ///
    /// Revoked producer ids are kept for `tombstone_ttl` before being purged.
    #[must_use]
    pub fn new(tombstone_ttl: Duration, metrics: Arc<ActorMetrics>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Registry, "registry"));

        let actor = SessionRegistryActor {
            receiver,
            cancel_token: cancel_token.clone(),
            tombstone_ttl,
            sessions: HashMap::new(),
            index: HashMap::new(),
            consumers_by_producer: HashMap::new(),
            mailbox: Arc::clone(&mailbox),
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        (
            Self {
                sender,
                cancel_token,
                mailbox,
            },
            task_handle,
        )
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
    ) -> Result<T, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        self.sender.send(message(tx)).await.map_err(|e| {
            self.mailbox.record_unsent();
            SignalingError::Internal(format!("channel send failed: {e}"))
        })?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    /// Register an empty session. Fails with `DuplicateConnection` if one exists.
    pub async fn create_session(
        &self,
        connection_id: ConnectionId,
        notifier: mpsc::Sender<Notification>,
    ) -> Result<(), SignalingError> {
        self.request(|respond_to| RegistryMessage::CreateSession {
            connection_id,
            notifier,
            respond_to,
        })
        .await?
    }

    pub async fn get_session(
        &self,
        connection_id: ConnectionId,
    ) -> Result<SessionSnapshot, SignalingError> {
        self.request(|respond_to| RegistryMessage::GetSession {
            connection_id,
            respond_to,
        })
        .await?
    }

    pub async fn mark_closing(&self, connection_id: ConnectionId) -> Result<(), SignalingError> {
        self.request(|respond_to| RegistryMessage::MarkClosing {
            connection_id,
            respond_to,
        })
        .await?
    }

    pub async fn add_transport(
        &self,
        connection_id: ConnectionId,
        handle: TransportHandle,
    ) -> Result<TransportId, SignalingError> {
        self.request(|respond_to| RegistryMessage::AddTransport {
            connection_id,
            handle,
            respond_to,
        })
        .await?
    }

    pub async fn add_producer(
        &self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        kind: MediaKind,
        handle: ProducerHandle,
    ) -> Result<ProducerId, SignalingError> {
        self.request(|respond_to| RegistryMessage::AddProducer {
            connection_id,
            transport_id,
            kind,
            handle,
            respond_to,
        })
        .await?
    }

    pub async fn add_consumer(
        &self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        producer_id: ProducerId,
        handle: ConsumerHandle,
    ) -> Result<ConsumerId, SignalingError> {
        self.request(|respond_to| RegistryMessage::AddConsumer {
            connection_id,
            transport_id,
            producer_id,
            handle,
            respond_to,
        })
        .await?
    }

    pub async fn get_transport(
        &self,
        connection_id: ConnectionId,
        transport_id: TransportId,
    ) -> Result<TransportHandle, SignalingError> {
        self.request(|respond_to| RegistryMessage::GetTransport {
            connection_id,
            transport_id,
            respond_to,
        })
        .await?
    }

    /// Forget an owned transport and return its handle for closing.
    pub async fn remove_transport(
        &self,
        connection_id: ConnectionId,
        transport_id: TransportId,
    ) -> Result<Option<TransportHandle>, SignalingError> {
        self.request(|respond_to| RegistryMessage::RemoveTransport {
            connection_id,
            transport_id,
            respond_to,
        })
        .await
    }

    pub async fn resolve_producer(
        &self,
        producer_id: ProducerId,
    ) -> Result<ProducerInfo, SignalingError> {
        self.request(|respond_to| RegistryMessage::ResolveProducer {
            producer_id,
            respond_to,
        })
        .await?
    }

    /// Remove a session. Idempotent: a second call returns an empty teardown.
    pub async fn destroy_session(
        &self,
        connection_id: ConnectionId,
    ) -> Result<SessionTeardown, SignalingError> {
        self.request(|respond_to| RegistryMessage::DestroySession {
            connection_id,
            respond_to,
        })
        .await
    }

    pub async fn status(&self) -> Result<RegistryStatus, SignalingError> {
        self.request(|respond_to| RegistryMessage::GetStatus { respond_to })
            .await
    }

    /// Requests sent and not yet processed.
    #[must_use]
    pub fn mailbox_depth(&self) -> usize {
        self.mailbox.current_depth()
    }

    /// Stop the registry actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[derive(Debug)]
struct OwnedProducer {
    transport_id: TransportId,
    handle: ProducerHandle,
}

#[derive(Debug)]
struct OwnedConsumer {
    transport_id: TransportId,
    producer_id: ProducerId,
    handle: ConsumerHandle,
}

#[derive(Debug)]
struct Session {
    closing: bool,
    transports: HashMap<TransportId, TransportHandle>,
    producers: HashMap<ProducerId, OwnedProducer>,
    consumers: HashMap<ConsumerId, OwnedConsumer>,
    notifier: mpsc::Sender<Notification>,
}

impl Session {
    fn snapshot(&self, connection_id: ConnectionId) -> SessionSnapshot {
        SessionSnapshot {
            connection_id,
            closing: self.closing,
            transports: self.transports.keys().copied().collect(),
            producers: self.producers.keys().copied().collect(),
            consumers: self.consumers.keys().copied().collect(),
        }
    }
}

#[derive(Debug)]
enum ProducerEntry {
    Active {
        owner: ConnectionId,
        kind: MediaKind,
        handle: ProducerHandle,
    },
    Revoked {
        revoked_at: Instant,
    },
}

/// The `SessionRegistryActor` implementation.
struct SessionRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    tombstone_ttl: Duration,
    sessions: HashMap<ConnectionId, Session>,
    /// Global producer index: producer id to owner (or tombstone).
    index: HashMap<ProducerId, ProducerEntry>,
    /// Every consumer of a producer, across sessions.
    consumers_by_producer: HashMap<ProducerId, Vec<(ConnectionId, ConsumerId)>>,
    mailbox: Arc<MailboxMonitor>,
    metrics: Arc<ActorMetrics>,
}

impl SessionRegistryActor {
    #[instrument(skip_all, name = "sfu.actor.registry")]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.registry",
            tombstone_ttl_secs = self.tombstone_ttl.as_secs(),
            "SessionRegistryActor started"
        );

        let sweep_period = self
            .tombstone_ttl
            .clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);
        let mut sweep = tokio::time::interval(sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.registry",
                        "SessionRegistryActor received cancellation signal"
                    );
                    break;
                }

                _ = sweep.tick() => {
                    self.purge_tombstones();
                }

                msg = self.receiver.recv() => {
                    if let Some(message) = msg {
                        self.handle_message(message);
                        self.mailbox.record_dequeue();
                        self.metrics.record_message_processed();
                    } else {
                        debug!(
                            target: "sfu.actor.registry",
                            "SessionRegistryActor channel closed, exiting"
                        );
                        break;
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.registry",
            sessions = self.sessions.len(),
            messages_processed = self.mailbox.messages_processed(),
            "SessionRegistryActor stopped"
        );
    }

    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::CreateSession {
                connection_id,
                notifier,
                respond_to,
            } => {
                let _ = respond_to.send(self.create_session(connection_id, notifier));
            }

            RegistryMessage::GetSession {
                connection_id,
                respond_to,
            } => {
                let result = self
                    .sessions
                    .get(&connection_id)
                    .map(|session| session.snapshot(connection_id))
                    .ok_or_else(|| SignalingError::NotFound(connection_id.to_string()));
                let _ = respond_to.send(result);
            }

            RegistryMessage::MarkClosing {
                connection_id,
                respond_to,
            } => {
                let result = match self.sessions.get_mut(&connection_id) {
                    Some(session) => {
                        session.closing = true;
                        Ok(())
                    }
                    None => Err(SignalingError::NotFound(connection_id.to_string())),
                };
                let _ = respond_to.send(result);
            }

            RegistryMessage::AddTransport {
                connection_id,
                handle,
                respond_to,
            } => {
                let result = self.open_session(connection_id).map(|session| {
                    let transport_id = TransportId::new();
                    session.transports.insert(transport_id, handle);
                    transport_id
                });
                let _ = respond_to.send(result);
            }

            RegistryMessage::AddProducer {
                connection_id,
                transport_id,
                kind,
                handle,
                respond_to,
            } => {
                let _ = respond_to.send(self.add_producer(connection_id, transport_id, kind, handle));
            }

            RegistryMessage::AddConsumer {
                connection_id,
                transport_id,
                producer_id,
                handle,
                respond_to,
            } => {
                let _ = respond_to.send(self.add_consumer(
                    connection_id,
                    transport_id,
                    producer_id,
                    handle,
                ));
            }

            RegistryMessage::GetTransport {
                connection_id,
                transport_id,
                respond_to,
            } => {
                let result = self.open_session(connection_id).and_then(|session| {
                    session
                        .transports
                        .get(&transport_id)
                        .cloned()
                        .ok_or_else(|| SignalingError::UnknownTransport(transport_id.to_string()))
                });
                let _ = respond_to.send(result);
            }

            RegistryMessage::RemoveTransport {
                connection_id,
                transport_id,
                respond_to,
            } => {
                let removed = self
                    .sessions
                    .get_mut(&connection_id)
                    .and_then(|session| session.transports.remove(&transport_id));
                let _ = respond_to.send(removed);
            }

            RegistryMessage::ResolveProducer {
                producer_id,
                respond_to,
            } => {
                let result = match self.index.get(&producer_id) {
                    Some(ProducerEntry::Active {
                        owner,
                        kind,
                        handle,
                    }) => Ok(ProducerInfo {
                        producer_id,
                        owner: *owner,
                        kind: *kind,
                        handle: handle.clone(),
                    }),
                    Some(ProducerEntry::Revoked { .. }) | None => {
                        Err(SignalingError::ProducerGone(producer_id.to_string()))
                    }
                };
                let _ = respond_to.send(result);
            }

            RegistryMessage::DestroySession {
                connection_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.destroy_session(connection_id));
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }
        }
    }

    fn create_session(
        &mut self,
        connection_id: ConnectionId,
        notifier: mpsc::Sender<Notification>,
    ) -> Result<(), SignalingError> {
        if self.sessions.contains_key(&connection_id) {
            return Err(SignalingError::DuplicateConnection(
                connection_id.to_string(),
            ));
        }

        self.sessions.insert(
            connection_id,
            Session {
                closing: false,
                transports: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
                notifier,
            },
        );
        self.update_gauges();

        debug!(
            target: "sfu.actor.registry",
            connection_id = %connection_id,
            total_sessions = self.sessions.len(),
            "Session created"
        );
        Ok(())
    }

    /// Look up a session that still accepts additions.
    fn open_session(&mut self, connection_id: ConnectionId) -> Result<&mut Session, SignalingError> {
        match self.sessions.get_mut(&connection_id) {
            Some(session) if session.closing => {
                Err(SignalingError::SessionClosing(connection_id.to_string()))
            }
            Some(session) => Ok(session),
            None => Err(SignalingError::NotFound(connection_id.to_string())),
        }
    }

    fn add_producer(
        &mut self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        kind: MediaKind,
        handle: ProducerHandle,
    ) -> Result<ProducerId, SignalingError> {
        let session = self.open_session(connection_id)?;
        if !session.transports.contains_key(&transport_id) {
            return Err(SignalingError::UnknownTransport(transport_id.to_string()));
        }

        let producer_id = ProducerId::new();
        session.producers.insert(
            producer_id,
            OwnedProducer {
                transport_id,
                handle: handle.clone(),
            },
        );
        self.index.insert(
            producer_id,
            ProducerEntry::Active {
                owner: connection_id,
                kind,
                handle,
            },
        );
        self.update_gauges();

        Ok(producer_id)
    }

    fn add_consumer(
        &mut self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        producer_id: ProducerId,
        handle: ConsumerHandle,
    ) -> Result<ConsumerId, SignalingError> {
        // Producer state is checked first so a revocation that raced the
        // engine call is reported as such, even on a fresh transport.
        match self.index.get(&producer_id) {
            Some(ProducerEntry::Active { .. }) => {}
            Some(ProducerEntry::Revoked { .. }) => {
                return Err(SignalingError::ProducerGone(producer_id.to_string()));
            }
            None => return Err(SignalingError::UnknownProducer(producer_id.to_string())),
        }

        let session = self.open_session(connection_id)?;
        if !session.transports.contains_key(&transport_id) {
            return Err(SignalingError::UnknownTransport(transport_id.to_string()));
        }

        let consumer_id = ConsumerId::new();
        session.consumers.insert(
            consumer_id,
            OwnedConsumer {
                transport_id,
                producer_id,
                handle,
            },
        );
        self.consumers_by_producer
            .entry(producer_id)
            .or_default()
            .push((connection_id, consumer_id));

        Ok(consumer_id)
    }

    fn destroy_session(&mut self, connection_id: ConnectionId) -> SessionTeardown {
        let Some(session) = self.sessions.remove(&connection_id) else {
            return SessionTeardown::default();
        };

        let mut teardown = SessionTeardown {
            connection_id: Some(connection_id),
            ..SessionTeardown::default()
        };
        let now = Instant::now();

        for (producer_id, producer) in session.producers {
            self.index
                .insert(producer_id, ProducerEntry::Revoked { revoked_at: now });

            let consumers = self
                .consumers_by_producer
                .remove(&producer_id)
                .unwrap_or_default();
            for (consumer_connection, consumer_id) in consumers {
                if consumer_connection == connection_id {
                    // Own consumers are released with the session below.
                    continue;
                }
                if let Some(orphan) =
                    self.orphan_consumer(consumer_connection, consumer_id, producer_id)
                {
                    teardown.orphaned_consumers.push(orphan);
                }
            }

            debug!(
                target: "sfu.actor.registry",
                connection_id = %connection_id,
                producer_id = %producer_id,
                transport_id = %producer.transport_id,
                "Producer revoked"
            );
            teardown.producers.push(producer.handle);
        }

        for (consumer_id, consumer) in session.consumers {
            if let Some(entries) = self.consumers_by_producer.get_mut(&consumer.producer_id) {
                entries.retain(|(_, id)| *id != consumer_id);
                if entries.is_empty() {
                    self.consumers_by_producer.remove(&consumer.producer_id);
                }
            }
            teardown.consumers.push(consumer.handle);
        }

        teardown.transports = session.transports.into_values().collect();
        self.update_gauges();

        info!(
            target: "sfu.actor.registry",
            connection_id = %connection_id,
            transports = teardown.transports.len(),
            producers = teardown.producers.len(),
            consumers = teardown.consumers.len(),
            orphaned_consumers = teardown.orphaned_consumers.len(),
            remaining_sessions = self.sessions.len(),
            "Session destroyed"
        );

        teardown
    }

    /// Detach a foreign consumer whose producer was revoked and notify its connection.
    fn orphan_consumer(
        &mut self,
        connection_id: ConnectionId,
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    ) -> Option<OrphanedConsumer> {
        let session = self.sessions.get_mut(&connection_id)?;
        let consumer = session.consumers.remove(&consumer_id)?;

        let notification = Notification::ProducerClosed {
            producer_id,
            consumer_id,
        };
        // The consumer is revoked either way; a full queue only loses the notice.
        if let Err(e) = session.notifier.try_send(notification) {
            prom::record_notification_dropped();
            warn!(
                target: "sfu.actor.registry",
                connection_id = %connection_id,
                consumer_id = %consumer_id,
                error = %e,
                "Dropped producerClosed notification"
            );
        }

        debug!(
            target: "sfu.actor.registry",
            connection_id = %connection_id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            transport_id = %consumer.transport_id,
            "Consumer orphaned by producer revocation"
        );

        Some(OrphanedConsumer {
            connection_id,
            consumer_id,
            producer_id,
            handle: consumer.handle,
        })
    }

    fn purge_tombstones(&mut self) {
        let ttl = self.tombstone_ttl;
        let before = self.index.len();
        self.index.retain(|_, entry| match entry {
            ProducerEntry::Active { .. } => true,
            ProducerEntry::Revoked { revoked_at } => revoked_at.elapsed() < ttl,
        });

        let purged = before - self.index.len();
        if purged > 0 {
            debug!(
                target: "sfu.actor.registry",
                purged = purged,
                "Purged producer tombstones"
            );
        }
    }

    fn status(&self) -> RegistryStatus {
        let producers_active = self
            .index
            .values()
            .filter(|entry| matches!(entry, ProducerEntry::Active { .. }))
            .count();

        RegistryStatus {
            sessions: self.sessions.len(),
            closing_sessions: self.sessions.values().filter(|s| s.closing).count(),
            transports: self.sessions.values().map(|s| s.transports.len()).sum(),
            producers_active,
            producers_revoked: self.index.len() - producers_active,
            consumers: self.sessions.values().map(|s| s.consumers.len()).sum(),
        }
    }

    fn update_gauges(&self) {
        let status = self.status();
        prom::set_sessions_active(status.sessions);
        prom::set_producers_active(status.producers_active);
    }
}
