//! Connection Lifecycle Manager.
//!
//! Every signaling connection is either `Open` or `Closed`. The transition
//! happens exactly once, on the channel close notification or at process
//! shutdown, and always runs the same steps in order:
//!
//! 1. Mark the session closing (new registrations are rejected)
//! 2. Destroy the session and close the released engine handles
//! 3. Release the handler (cancel the connection actor)
//!
//! A closed connection never reopens; a reconnecting client gets a fresh
//! connection id and an empty session.

use crate::actors::{
    ActorMetrics, ActorType, ConnectionActor, ConnectionActorHandle, SessionTeardown,
};
use crate::context::ServiceContext;
use crate::errors::SignalingError;
use crate::observability::metrics as prom;
use crate::signaling::handler::SignalingHandler;
use crate::signaling::protocol::{InboundFrame, ServerMessage};

use common::types::ConnectionId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffer for registry notifications addressed to one connection.
const NOTIFICATION_CHANNEL_BUFFER: usize = 64;

/// How long a closed connection's actor gets to finish its current request.
const ACTOR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// An open connection as tracked by the manager.
struct ManagedConnection {
    handle: ConnectionActorHandle,
    task: JoinHandle<()>,
}

/// Process-scoped owner of every open signaling connection.
pub struct ConnectionManager {
    context: Arc<ServiceContext>,
    metrics: Arc<ActorMetrics>,
    cancel_token: CancellationToken,
    accepting: AtomicBool,
    connections: Mutex<HashMap<ConnectionId, ManagedConnection>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("context", &self.context)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager. Connection actors run on child tokens of
    /// `cancel_token`.
    #[must_use]
    pub fn new(
        context: Arc<ServiceContext>,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            metrics,
            cancel_token,
            accepting: AtomicBool::new(true),
            connections: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    /// Open a connection: fresh id, empty session, running connection actor.
    ///
    /// Responses and notifications for the client are written to `outbound`.
    pub async fn open(
        self: &Arc<Self>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<ConnectionLifecycle, SignalingError> {
        if self.is_shutting_down() {
            return Err(SignalingError::ShuttingDown);
        }

        let connection_id = ConnectionId::new();
        let (notifier, notifications) = mpsc::channel(NOTIFICATION_CHANNEL_BUFFER);
        self.context
            .registry()
            .create_session(connection_id, notifier)
            .await?;

        let handler = SignalingHandler::new(connection_id, Arc::clone(&self.context));
        let (handle, task) = ConnectionActor::spawn(
            handler,
            notifications,
            outbound,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.connections.lock().await.insert(
            connection_id,
            ManagedConnection {
                handle: handle.clone(),
                task,
            },
        );
        self.metrics.connection_created();

        info!(
            target: "sfu.lifecycle",
            connection_id = %connection_id,
            open_connections = self.metrics.connection_count(),
            "Connection opened"
        );

        // Shutdown may have drained the map between the check above and the insert.
        if self.is_shutting_down() {
            self.close(connection_id, "shutdown").await;
            return Err(SignalingError::ShuttingDown);
        }

        Ok(ConnectionLifecycle {
            connection_id,
            handle,
            manager: Arc::clone(self),
        })
    }

    /// Close a connection. Returns `false` if it was already closed or never
    /// opened; in that case nothing is touched.
    pub async fn close(&self, connection_id: ConnectionId, reason: &str) -> bool {
        let Some(managed) = self.connections.lock().await.remove(&connection_id) else {
            debug!(
                target: "sfu.lifecycle",
                connection_id = %connection_id,
                reason = reason,
                "Close ignored, connection already closed"
            );
            return false;
        };

        let registry = self.context.registry();
        if let Err(e) = registry.mark_closing(connection_id).await {
            warn!(
                target: "sfu.lifecycle",
                connection_id = %connection_id,
                error = %e,
                "Failed to mark session closing"
            );
        }

        let teardown = match registry.destroy_session(connection_id).await {
            Ok(teardown) => teardown,
            Err(e) => {
                warn!(
                    target: "sfu.lifecycle",
                    connection_id = %connection_id,
                    error = %e,
                    "Failed to destroy session, engine resources may leak"
                );
                SessionTeardown::default()
            }
        };

        let engine = self.context.engine();
        for handle in teardown.handles() {
            engine.close(&handle).await;
            prom::record_engine_close(handle.kind());
        }

        managed.handle.cancel();
        spawn_join_watch(connection_id, managed.task, Arc::clone(&self.metrics));
        self.metrics.connection_closed();

        info!(
            target: "sfu.lifecycle",
            connection_id = %connection_id,
            reason = reason,
            transports = teardown.transports.len(),
            producers = teardown.producers.len(),
            consumers = teardown.consumers.len(),
            orphaned_consumers = teardown.orphaned_consumers.len(),
            open_connections = self.metrics.connection_count(),
            "Connection closed"
        );

        true
    }

    /// Stop accepting connections and close every open one, then cancel
    /// whatever actors are left.
    ///
    /// Returns the number of connections closed.
    pub async fn shutdown(&self) -> usize {
        self.accepting.store(false, Ordering::SeqCst);

        let ids: Vec<ConnectionId> = self.connections.lock().await.keys().copied().collect();
        info!(
            target: "sfu.lifecycle",
            open_connections = ids.len(),
            "Closing all connections for shutdown"
        );

        let mut closed = 0;
        for connection_id in ids {
            if self.close(connection_id, "shutdown").await {
                closed += 1;
            }
        }

        self.cancel_token.cancel();
        closed
    }

    pub async fn open_connections(&self) -> usize {
        self.connections.lock().await.len()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst) || self.cancel_token.is_cancelled()
    }
}

/// Wait for a cancelled connection actor in the background and report panics.
fn spawn_join_watch(connection_id: ConnectionId, task: JoinHandle<()>, metrics: Arc<ActorMetrics>) {
    tokio::spawn(async move {
        match tokio::time::timeout(ACTOR_STOP_TIMEOUT, task).await {
            Ok(Ok(())) => {
                debug!(
                    target: "sfu.lifecycle",
                    connection_id = %connection_id,
                    "Connection actor stopped"
                );
            }
            Ok(Err(join_error)) => {
                if join_error.is_panic() {
                    metrics.record_panic(ActorType::Connection);
                }
                warn!(
                    target: "sfu.lifecycle",
                    connection_id = %connection_id,
                    error = ?join_error,
                    "Connection actor task failed"
                );
            }
            Err(_) => {
                warn!(
                    target: "sfu.lifecycle",
                    connection_id = %connection_id,
                    timeout_secs = ACTOR_STOP_TIMEOUT.as_secs(),
                    "Connection actor did not stop in time"
                );
            }
        }
    });
}

/// One connection's view of its lifecycle, held by the channel task.
#[derive(Debug)]
pub struct ConnectionLifecycle {
    connection_id: ConnectionId,
    handle: ConnectionActorHandle,
    manager: Arc<ConnectionManager>,
}

impl ConnectionLifecycle {
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// True until the connection has been closed (by the channel or by
    /// process shutdown).
    pub async fn is_open(&self) -> bool {
        self.manager
            .connections
            .lock()
            .await
            .contains_key(&self.connection_id)
    }

    /// Queue a client frame for the connection actor.
    pub async fn submit(&self, frame: InboundFrame) -> Result<(), SignalingError> {
        self.handle.submit(frame).await
    }

    /// Channel close notification. Only the first call has an effect.
    pub async fn close(&self, reason: &str) -> bool {
        self.manager.close(self.connection_id, reason).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::actors::SessionRegistryHandle;
    use crate::signaling::protocol::{parse_frame, ResponseEnvelope, SignalingResponse};
    use media_engine::{EngineConfig, FatalSignal, WebRtcTransportOptions};
    use serde_json::json;
    use sfu_test_utils::{request_frame, vp8_rtp_parameters, EngineOperation, MockMediaEngine};

    struct Fixture {
        engine: Arc<MockMediaEngine>,
        manager: Arc<ConnectionManager>,
    }

    async fn fixture() -> Fixture {
        let engine = Arc::new(MockMediaEngine::new());
        let (registry, _task) =
            SessionRegistryHandle::new(Duration::from_secs(60), ActorMetrics::new());
        let context = Arc::new(ServiceContext::new(
            Arc::clone(&engine) as Arc<dyn media_engine::MediaEngine>,
            registry,
            WebRtcTransportOptions::default(),
            None,
        ));
        context
            .initialize_engine(&EngineConfig::default(), FatalSignal::new())
            .await
            .unwrap();

        let manager = ConnectionManager::new(context, ActorMetrics::new(), CancellationToken::new());
        Fixture { engine, manager }
    }

    async fn request(
        lifecycle: &ConnectionLifecycle,
        outbound: &mut mpsc::Receiver<ServerMessage>,
        id: u64,
        event: &str,
        data: serde_json::Value,
    ) -> ResponseEnvelope {
        lifecycle
            .submit(parse_frame(&request_frame(id, event, data)))
            .await
            .unwrap();
        match tokio::time::timeout(Duration::from_secs(1), outbound.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ServerMessage::Response(response) => response,
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_creates_empty_session() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);

        let lifecycle = f.manager.open(tx).await.unwrap();

        assert!(lifecycle.is_open().await);
        assert_eq!(f.manager.open_connections().await, 1);
        let session = f
            .manager
            .context()
            .registry()
            .get_session(lifecycle.connection_id())
            .await
            .unwrap();
        assert!(!session.closing);
        assert!(session.transports.is_empty());
    }

    #[tokio::test]
    async fn test_each_open_gets_fresh_id() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);

        let a = f.manager.open(tx.clone()).await.unwrap();
        a.close("client closed").await;
        let b = f.manager.open(tx).await.unwrap();

        assert_ne!(a.connection_id(), b.connection_id());
    }

    #[tokio::test]
    async fn test_close_releases_resources_exactly_once() {
        let f = fixture().await;
        let (tx, mut rx) = mpsc::channel(8);
        let lifecycle = f.manager.open(tx).await.unwrap();

        let created = request(&lifecycle, &mut rx, 1, "createTransport", json!({})).await;
        let Some(SignalingResponse::TransportCreated(info)) = created.data else {
            panic!("expected transport");
        };
        let produced = request(
            &lifecycle,
            &mut rx,
            2,
            "createProducer",
            json!({
                "transportId": info.id,
                "kind": "video",
                "rtpParameters": vp8_rtp_parameters(),
            }),
        )
        .await;
        assert!(produced.ok);

        assert!(lifecycle.close("client closed").await);
        assert!(!lifecycle.close("client closed").await, "second close is a no-op");
        assert!(!f.manager.close(lifecycle.connection_id(), "again").await);

        assert!(!lifecycle.is_open().await);
        assert_eq!(f.engine.call_count(EngineOperation::Close), 2);
        assert!(f.engine.double_closed().is_empty());
        assert!(f.engine.live_resources().is_empty());

        let result = f
            .manager
            .context()
            .registry()
            .get_session(lifecycle.connection_id())
            .await;
        assert!(matches!(result, Err(SignalingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_close_cancels_connection_actor() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);
        let lifecycle = f.manager.open(tx).await.unwrap();

        lifecycle.close("client closed").await;

        assert!(lifecycle.handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_and_rejects_new() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);
        let a = f.manager.open(tx.clone()).await.unwrap();
        let b = f.manager.open(tx.clone()).await.unwrap();

        assert_eq!(f.manager.shutdown().await, 2);

        assert!(f.manager.is_shutting_down());
        assert!(!a.is_open().await);
        assert!(!b.is_open().await);
        assert_eq!(f.manager.open_connections().await, 0);
        assert!(matches!(
            f.manager.open(tx).await,
            Err(SignalingError::ShuttingDown)
        ));

        let status = f.manager.context().registry().status().await.unwrap();
        assert_eq!(status.sessions, 0);
    }
}
