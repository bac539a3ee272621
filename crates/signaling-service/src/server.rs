//! WebSocket signaling endpoint.
//!
//! `GET /ws` upgrades to a WebSocket carrying JSON text frames. Each socket
//! is one signaling connection: it is opened through the
//! [`ConnectionManager`] on upgrade and closed through it when the socket
//! closes or fails.

use crate::errors::SignalingError;
use crate::lifecycle::{ConnectionLifecycle, ConnectionManager};
use crate::signaling::protocol::{parse_frame, InboundFrame, ResponseEnvelope, ServerMessage};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Responses and notifications queued for one socket writer.
const OUTBOUND_CHANNEL_BUFFER: usize = 64;

/// Shared state of the signaling router.
#[derive(Clone, Debug)]
pub struct SignalingState {
    pub manager: Arc<ConnectionManager>,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
}

/// Build the signaling router.
pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn ws_handler(State(state): State<SignalingState>, ws: WebSocketUpgrade) -> Response {
    if state.manager.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            SignalingError::ShuttingDown.client_message(),
        )
            .into_response();
    }

    let manager = state.manager;
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, manager))
}

async fn handle_socket(socket: WebSocket, manager: Arc<ConnectionManager>) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);
    // Weak, so the writer still stops once the connection actor is gone.
    let rejections = outbound_tx.downgrade();

    let lifecycle = match manager.open(outbound_tx).await {
        Ok(lifecycle) => lifecycle,
        Err(e) => {
            warn!(target: "sfu.signaling", error = %e, "Failed to open signaling connection");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    let connection_id = lifecycle.connection_id();
    info!(target: "sfu.signaling", connection_id = %connection_id, "WebSocket connected");

    tokio::spawn(write_frames(sink, outbound_rx));

    let reason = loop {
        let frame = match classify(stream.next().await, &lifecycle) {
            Incoming::Frame(frame) => frame,
            Incoming::Ignored => continue,
            Incoming::Closed(reason) => break reason,
        };
        if let Err(reason) = deliver(&lifecycle, frame, &mut stream, &rejections).await {
            break reason;
        }
    };

    lifecycle.close(reason).await;
    info!(
        target: "sfu.signaling",
        connection_id = %connection_id,
        reason = reason,
        "WebSocket disconnected"
    );
}

/// What the reader makes of one item from the socket.
enum Incoming {
    Frame(InboundFrame),
    Ignored,
    Closed(&'static str),
}

fn classify(
    item: Option<Result<Message, axum::Error>>,
    lifecycle: &ConnectionLifecycle,
) -> Incoming {
    match item {
        Some(Ok(Message::Text(text))) => Incoming::Frame(parse_frame(&text)),
        Some(Ok(Message::Binary(_))) => Incoming::Frame(InboundFrame::Invalid {
            id: None,
            error: SignalingError::MalformedRequest("binary frames are not supported".to_string()),
        }),
        // Pings are answered by the WebSocket layer.
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => Incoming::Ignored,
        Some(Ok(Message::Close(_))) => Incoming::Closed("client closed"),
        Some(Err(e)) => {
            debug!(
                target: "sfu.signaling",
                connection_id = %lifecycle.connection_id(),
                error = %e,
                "WebSocket read failed"
            );
            Incoming::Closed("read error")
        }
        None => Incoming::Closed("stream ended"),
    }
}

/// Hand `frame` to the connection actor.
///
/// While the mailbox is full the socket is still read, so a close is seen
/// even if the request in progress never finishes. Frames that arrive in
/// the meantime are answered with `CONNECTION_OVERLOADED`.
async fn deliver(
    lifecycle: &ConnectionLifecycle,
    frame: InboundFrame,
    stream: &mut SplitStream<WebSocket>,
    rejections: &mpsc::WeakSender<ServerMessage>,
) -> Result<(), &'static str> {
    let submission = lifecycle.submit(frame);
    tokio::pin!(submission);

    loop {
        tokio::select! {
            biased;

            result = &mut submission => {
                return result.map_err(|e| {
                    debug!(
                        target: "sfu.signaling",
                        connection_id = %lifecycle.connection_id(),
                        error = %e,
                        "Dropping frame for closed connection"
                    );
                    "connection closed"
                });
            }

            item = stream.next() => match classify(item, lifecycle) {
                Incoming::Frame(frame) => reject_overloaded(lifecycle, rejections, &frame),
                Incoming::Ignored => {}
                Incoming::Closed(reason) => return Err(reason),
            },
        }
    }
}

fn reject_overloaded(
    lifecycle: &ConnectionLifecycle,
    rejections: &mpsc::WeakSender<ServerMessage>,
    frame: &InboundFrame,
) {
    warn!(
        target: "sfu.signaling",
        connection_id = %lifecycle.connection_id(),
        request_id = ?frame.request_id(),
        "Request queue full, rejecting frame"
    );
    let error = SignalingError::Overloaded("request queue is full".to_string());
    let response = ResponseEnvelope::from_result(frame.request_id(), Err(error));
    if let Some(outbound) = rejections.upgrade() {
        if outbound.try_send(ServerMessage::Response(response)).is_err() {
            debug!(
                target: "sfu.signaling",
                connection_id = %lifecycle.connection_id(),
                "Outbound queue full, dropping overload response"
            );
        }
    }
}

/// Serialize queued messages onto the socket until the connection actor
/// drops its sender or the client goes away.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!(target: "sfu.signaling", error = %e, "Failed to encode server message");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, SessionRegistryHandle};
    use crate::context::ServiceContext;
    use axum::body::Body;
    use axum::http::Request;
    use media_engine::WebRtcTransportOptions;
    use sfu_test_utils::MockMediaEngine;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    fn state() -> SignalingState {
        let (registry, _task) =
            SessionRegistryHandle::new(Duration::from_secs(60), ActorMetrics::new());
        let context = Arc::new(ServiceContext::new(
            Arc::new(MockMediaEngine::new()),
            registry,
            WebRtcTransportOptions::default(),
            None,
        ));
        SignalingState {
            manager: ConnectionManager::new(context, ActorMetrics::new(), CancellationToken::new()),
            max_message_size: 64 * 1024,
        }
    }

    #[tokio::test]
    async fn test_plain_get_is_rejected() {
        let app = signaling_router(state());

        let request = Request::builder()
            .uri("/ws")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app.oneshot(request).await.expect("Failed to execute request");

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let app = signaling_router(state());

        let request = Request::builder()
            .uri("/signaling")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app.oneshot(request).await.expect("Failed to execute request");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
