//! `ConnectionActor` - per-connection signaling actor.
//!
//! Each `ConnectionActor`:
//! - Handles exactly one signaling connection
//! - Processes request frames strictly in arrival order; a frame waits until
//!   the previous response (including its engine calls) has been sent
//! - Forwards registry notifications (`producerClosed`) to the client
//!
//! # Lifecycle
//!
//! 1. Spawned by the `ConnectionManager` when the channel opens
//! 2. Runs until its token is cancelled (disconnect or process shutdown)
//! 3. A request already in progress when the token is cancelled runs to
//!    completion; its late resources are closed by the handler

use crate::errors::SignalingError;
use crate::observability::metrics as prom;
use crate::signaling::handler::SignalingHandler;
use crate::signaling::protocol::{
    InboundFrame, Notification, ResponseEnvelope, ServerMessage, SignalingRequest,
};

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::ConnectionId;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 64;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: ConnectionId,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue a frame read from the client.
    ///
    /// Waits while the mailbox is full.
    pub async fn submit(&self, frame: InboundFrame) -> Result<(), SignalingError> {
        self.mailbox.record_enqueue();
        self.sender
            .send(ConnectionMessage::Frame { frame })
            .await
            .map_err(|e| {
                self.mailbox.record_unsent();
                SignalingError::Internal(format!("channel send failed: {e}"))
            })
    }

    /// Frames submitted and not yet answered, including the one in progress.
    #[must_use]
    pub fn mailbox_depth(&self) -> usize {
        self.mailbox.current_depth()
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: ConnectionId,
    handler: SignalingHandler,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Notifications from the registry for this connection.
    notifications: mpsc::Receiver<Notification>,
    /// Frames to write to the client.
    outbound: mpsc::Sender<ServerMessage>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        handler: SignalingHandler,
        notifications: mpsc::Receiver<Notification>,
        outbound: mpsc::Sender<ServerMessage>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let connection_id = handler.connection_id();
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            connection_id.to_string(),
        ));

        let actor = Self {
            connection_id,
            handler,
            receiver,
            notifications,
            outbound,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
            mailbox,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "sfu.actor.connection",
        fields(connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                Some(notification) = self.notifications.recv() => {
                    self.send(ServerMessage::Notification(notification)).await;
                }

                msg = self.receiver.recv() => {
                    if let Some(ConnectionMessage::Frame { frame }) = msg {
                        self.handle_frame(frame).await;
                        self.mailbox.record_dequeue();
                        self.metrics.record_message_processed();
                    } else {
                        debug!(
                            target: "sfu.actor.connection",
                            connection_id = %self.connection_id,
                            "ConnectionActor channel closed, exiting"
                        );
                        break;
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    async fn handle_frame(&mut self, frame: InboundFrame) {
        let response = match frame {
            InboundFrame::Request { id, request } => self.handle_request(id, request).await,
            InboundFrame::Invalid { id, error } => {
                prom::record_signaling_request("invalid", error.error_type_label());
                debug!(
                    target: "sfu.actor.connection",
                    connection_id = %self.connection_id,
                    request_id = ?id,
                    error = %error,
                    "Rejected undecodable frame"
                );
                ResponseEnvelope::from_result(id, Err(error))
            }
        };

        self.send(ServerMessage::Response(response)).await;
    }

    async fn handle_request(&mut self, id: u64, request: SignalingRequest) -> ResponseEnvelope {
        let event = request.event_name();
        let start = Instant::now();

        let result = self.handler.handle(request).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.error_type_label(),
        };
        prom::record_signaling_request(event, outcome);
        prom::record_signaling_latency(event, start.elapsed());

        if let Err(e) = &result {
            debug!(
                target: "sfu.actor.connection",
                connection_id = %self.connection_id,
                request_id = id,
                event = event,
                error_code = e.error_code(),
                error = %e,
                "Request failed"
            );
        }

        ResponseEnvelope::from_result(Some(id), result)
    }

    async fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!(
                target: "sfu.actor.connection",
                connection_id = %self.connection_id,
                "Outbound channel closed, dropping message"
            );
        }
    }
}
