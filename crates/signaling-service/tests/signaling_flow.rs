//! End-to-end signaling flows through the connection lifecycle.
//!
//! Each test drives real `ConnectionManager` connections (registry actor,
//! connection actors, signaling handler) against `MockMediaEngine`, and
//! asserts on both the client-visible responses and the engine side
//! effects.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::types::ProducerId;
use media_engine::{EngineConfig, FatalSignal, MediaEngine, MediaKind, WebRtcTransportOptions};
use serde_json::{json, Value};
use sfu_test_utils::{
    empty_rtp_parameters, request_frame, vp8_rtp_parameters, EngineOperation, MockMediaEngine,
};
use signaling_service::actors::{ActorMetrics, SessionRegistryHandle};
use signaling_service::context::ServiceContext;
use signaling_service::lifecycle::{ConnectionLifecycle, ConnectionManager};
use signaling_service::signaling::protocol::ResponseEnvelope;
use signaling_service::signaling::{parse_frame, Notification, ServerMessage, SignalingResponse};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test harness
// ============================================================================

struct Sfu {
    engine: Arc<MockMediaEngine>,
    manager: Arc<ConnectionManager>,
}

impl Sfu {
    async fn start() -> Self {
        let engine = Arc::new(MockMediaEngine::new());
        let (registry, _task) =
            SessionRegistryHandle::new(Duration::from_secs(60), ActorMetrics::new());
        let context = Arc::new(ServiceContext::new(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            registry,
            WebRtcTransportOptions::default(),
            None,
        ));
        context
            .initialize_engine(&EngineConfig::default(), FatalSignal::new())
            .await
            .unwrap();

        let manager =
            ConnectionManager::new(context, ActorMetrics::new(), CancellationToken::new());
        Self { engine, manager }
    }

    async fn connect(&self) -> Client {
        let (tx, outbound) = mpsc::channel(32);
        let lifecycle = self.manager.open(tx).await.unwrap();
        Client {
            lifecycle,
            outbound,
            notifications: Vec::new(),
            next_id: 0,
        }
    }
}

struct Client {
    lifecycle: ConnectionLifecycle,
    outbound: mpsc::Receiver<ServerMessage>,
    notifications: Vec<Notification>,
    next_id: u64,
}

impl Client {
    async fn send(&mut self, event: &str, data: Value) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.lifecycle
            .submit(parse_frame(&request_frame(id, event, data)))
            .await
            .unwrap();
        id
    }

    async fn response(&mut self, id: u64) -> ResponseEnvelope {
        loop {
            let message = tokio::time::timeout(RESPONSE_TIMEOUT, self.outbound.recv())
                .await
                .expect("timed out waiting for response")
                .expect("outbound channel closed");
            match message {
                ServerMessage::Response(response) => {
                    assert_eq!(response.id, Some(id), "responses arrive in request order");
                    return response;
                }
                ServerMessage::Notification(notification) => self.notifications.push(notification),
            }
        }
    }

    async fn request(&mut self, event: &str, data: Value) -> ResponseEnvelope {
        let id = self.send(event, data).await;
        self.response(id).await
    }

    async fn create_transport(&mut self) -> String {
        match self.request("createTransport", json!({})).await.data {
            Some(SignalingResponse::TransportCreated(info)) => info.id,
            other => panic!("expected transport, got {other:?}"),
        }
    }

    async fn create_producer(&mut self, transport_id: &str) -> String {
        let response = self
            .request(
                "createProducer",
                json!({
                    "transportId": transport_id,
                    "kind": "video",
                    "rtpParameters": vp8_rtp_parameters(),
                }),
            )
            .await;
        match response.data {
            Some(SignalingResponse::ProducerCreated { id }) => id,
            other => panic!("expected producer, got {other:?} ({:?})", response.error),
        }
    }

    async fn create_consumer(&mut self, producer_id: &str) -> ResponseEnvelope {
        self.request("createConsumer", json!({ "producerId": producer_id }))
            .await
    }

    async fn next_notification(&mut self) -> Notification {
        if !self.notifications.is_empty() {
            return self.notifications.remove(0);
        }
        match tokio::time::timeout(RESPONSE_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("outbound channel closed")
        {
            ServerMessage::Notification(notification) => notification,
            other => panic!("expected notification, got {other:?}"),
        }
    }

    async fn disconnect(&self) -> bool {
        self.lifecycle.close("client closed").await
    }
}

fn error_code(response: &ResponseEnvelope) -> &str {
    assert!(!response.ok, "expected failure, got {response:?}");
    response.error.as_ref().map_or("", |e| e.code.as_str())
}

// ============================================================================
// Scenario
// ============================================================================

#[tokio::test]
async fn test_produce_consume_disconnect_scenario() {
    let sfu = Sfu::start().await;
    let mut a = sfu.connect().await;
    let mut b = sfu.connect().await;
    let mut c = sfu.connect().await;

    let transport_a = a.create_transport().await;
    let producer_a = a.create_producer(&transport_a).await;

    let consumed = b.create_consumer(&producer_a).await;
    assert!(consumed.ok);
    match consumed.data {
        Some(SignalingResponse::ConsumerCreated {
            producer_id, kind, ..
        }) => {
            assert_eq!(producer_id, producer_a);
            assert_eq!(kind, MediaKind::Video);
        }
        other => panic!("expected consumer, got {other:?}"),
    }

    assert!(a.disconnect().await);

    let response = c.create_consumer(&producer_a).await;
    assert_eq!(error_code(&response), "PRODUCER_GONE");
    assert!(response.data.is_none());
}

// ============================================================================
// Disconnect cleanup
// ============================================================================

#[tokio::test]
async fn test_disconnect_closes_everything_exactly_once() {
    let sfu = Sfu::start().await;
    let mut a = sfu.connect().await;
    let mut b = sfu.connect().await;

    let transport_a = a.create_transport().await;
    let producer_a = a.create_producer(&transport_a).await;
    let _second_transport = a.create_transport().await;
    assert!(b.create_consumer(&producer_a).await.ok);

    // A: 2 transports + 1 producer. B: 1 transport + 1 consumer.
    assert_eq!(sfu.engine.live_resources().len(), 5);

    assert!(a.disconnect().await);
    assert!(!a.disconnect().await, "second disconnect is a no-op");
    assert!(b.disconnect().await);
    assert!(!b.disconnect().await);

    assert!(sfu.engine.live_resources().is_empty());
    assert!(sfu.engine.double_closed().is_empty());
    assert_eq!(sfu.engine.call_count(EngineOperation::Close), 5);

    let status = sfu.manager.context().registry().status().await.unwrap();
    assert_eq!(status.sessions, 0);
    assert_eq!(status.transports, 0);
    assert_eq!(status.producers_active, 0);
    assert_eq!(status.consumers, 0);
    assert_eq!(sfu.manager.open_connections().await, 0);
}

#[tokio::test]
async fn test_consumer_is_notified_when_producer_owner_leaves() {
    let sfu = Sfu::start().await;
    let mut a = sfu.connect().await;
    let mut b = sfu.connect().await;

    let transport_a = a.create_transport().await;
    let producer_a = a.create_producer(&transport_a).await;
    let consumer_b = match b.create_consumer(&producer_a).await.data {
        Some(SignalingResponse::ConsumerCreated { id, .. }) => id,
        other => panic!("expected consumer, got {other:?}"),
    };

    a.disconnect().await;

    let Notification::ProducerClosed {
        producer_id,
        consumer_id,
    } = b.next_notification().await;
    assert_eq!(producer_id.to_string(), producer_a);
    assert_eq!(consumer_id.to_string(), consumer_b);

    // The consumer was closed with its producer, and B's teardown does not
    // close it again.
    assert_eq!(sfu.engine.live_count("consumer"), 0);
    b.disconnect().await;
    assert!(sfu.engine.double_closed().is_empty());
}

#[tokio::test]
async fn test_late_transport_is_closed_after_disconnect() {
    let sfu = Sfu::start().await;
    let mut a = sfu.connect().await;

    sfu.engine.hold(EngineOperation::CreateTransport);
    let id = a.send("createTransport", json!({})).await;
    sfu.engine
        .wait_for_calls(EngineOperation::CreateTransport, 1)
        .await;

    // Disconnect while the engine call is in flight: nothing is registered yet.
    assert!(a.disconnect().await);
    assert_eq!(sfu.engine.call_count(EngineOperation::Close), 0);

    sfu.engine.release(EngineOperation::CreateTransport);
    let response = a.response(id).await;
    assert!(matches!(
        error_code(&response),
        "SESSION_CLOSING" | "NOT_FOUND"
    ));

    tokio::time::timeout(
        RESPONSE_TIMEOUT,
        sfu.engine.wait_for_calls(EngineOperation::Close, 1),
    )
    .await
    .expect("late transport was not closed");

    assert!(sfu.engine.live_resources().is_empty());
    assert!(sfu.engine.double_closed().is_empty());
    let status = sfu.manager.context().registry().status().await.unwrap();
    assert_eq!(status.sessions, 0);
    assert_eq!(status.transports, 0);
}

#[tokio::test]
async fn test_producer_revoked_during_consume_is_producer_gone() {
    let sfu = Sfu::start().await;
    let mut a = sfu.connect().await;
    let mut b = sfu.connect().await;
    let transport_a = a.create_transport().await;
    let producer_a = a.create_producer(&transport_a).await;

    sfu.engine.hold(EngineOperation::Consume);
    let id = b
        .send("createConsumer", json!({ "producerId": producer_a }))
        .await;
    sfu.engine.wait_for_calls(EngineOperation::Consume, 1).await;

    // The producer's owner leaves while the consume call is in flight.
    assert!(a.disconnect().await);
    sfu.engine.release(EngineOperation::Consume);

    let response = b.response(id).await;
    assert_eq!(error_code(&response), "PRODUCER_GONE");
    assert!(response.data.is_none());

    // B's fresh transport went with the failed consume; nothing else survives.
    assert!(sfu.engine.live_resources().is_empty());
    assert!(sfu.engine.double_closed().is_empty());
    let session = sfu
        .manager
        .context()
        .registry()
        .get_session(b.lifecycle.connection_id())
        .await
        .unwrap();
    assert!(session.transports.is_empty());
    assert!(session.consumers.is_empty());
}

#[tokio::test]
async fn test_disconnect_during_consume_leaves_no_consumer() {
    let sfu = Sfu::start().await;
    let mut a = sfu.connect().await;
    let mut b = sfu.connect().await;
    let transport_a = a.create_transport().await;
    let producer_a = a.create_producer(&transport_a).await;

    sfu.engine.hold(EngineOperation::Consume);
    let id = b
        .send("createConsumer", json!({ "producerId": producer_a }))
        .await;
    sfu.engine.wait_for_calls(EngineOperation::Consume, 1).await;

    // The consuming side leaves mid-call: its teardown closes the fresh transport.
    assert!(b.disconnect().await);
    sfu.engine.release(EngineOperation::Consume);

    let response = b.response(id).await;
    assert!(matches!(
        error_code(&response),
        "ENGINE_CONSUME_FAILED" | "SESSION_CLOSING" | "NOT_FOUND"
    ));

    assert_eq!(sfu.engine.live_count("consumer"), 0);
    assert!(sfu.engine.double_closed().is_empty());
    // A is untouched.
    assert_eq!(sfu.engine.live_count("transport"), 1);
    assert_eq!(sfu.engine.live_count("producer"), 1);
    let status = sfu.manager.context().registry().status().await.unwrap();
    assert_eq!(status.sessions, 1);
    assert_eq!(status.producers_active, 1);
    assert_eq!(status.consumers, 0);
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_empty_codecs_never_reach_engine() {
    let sfu = Sfu::start().await;
    let mut a = sfu.connect().await;
    let transport_a = a.create_transport().await;

    let response = a
        .request(
            "createProducer",
            json!({
                "transportId": transport_a,
                "kind": "video",
                "rtpParameters": empty_rtp_parameters(),
            }),
        )
        .await;

    assert_eq!(error_code(&response), "INVALID_RTP_PARAMETERS");
    assert_eq!(sfu.engine.call_count(EngineOperation::Produce), 0);
}

#[tokio::test]
async fn test_consume_of_unknown_producer_never_returns_consumer() {
    let sfu = Sfu::start().await;
    let mut b = sfu.connect().await;

    let never_created = ProducerId::new().to_string();
    let response = b.create_consumer(&never_created).await;
    assert_eq!(error_code(&response), "PRODUCER_GONE");

    let response = b.create_consumer("not-an-id").await;
    assert_eq!(error_code(&response), "INVALID_PRODUCER_ID");

    let response = b.request("createConsumer", json!({})).await;
    assert_eq!(error_code(&response), "INVALID_PRODUCER_ID");

    assert_eq!(sfu.engine.call_count(EngineOperation::Consume), 0);
    assert_eq!(sfu.engine.live_count("consumer"), 0);
}

#[tokio::test]
async fn test_engine_failure_leaves_connection_usable() {
    let sfu = Sfu::start().await;
    let mut a = sfu.connect().await;

    sfu.engine
        .fail(EngineOperation::CreateTransport, "port range exhausted");
    let response = a.request("createTransport", json!({})).await;
    assert_eq!(error_code(&response), "ENGINE_TRANSPORT_CREATE_FAILED");
    let message = response.error.as_ref().map(|e| e.message.clone());
    assert!(message.unwrap().contains("port range exhausted"));

    sfu.engine.clear_failure(EngineOperation::CreateTransport);
    let transport_a = a.create_transport().await;
    a.create_producer(&transport_a).await;
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_concurrent_producers_never_collide() {
    let sfu = Sfu::start().await;
    let mut a = sfu.connect().await;
    let mut b = sfu.connect().await;
    let transport_a = a.create_transport().await;
    let transport_b = b.create_transport().await;

    let mut produced_a = Vec::new();
    let mut produced_b = Vec::new();
    for _ in 0..10 {
        let (pa, pb) = tokio::join!(
            a.create_producer(&transport_a),
            b.create_producer(&transport_b)
        );
        produced_a.push(pa);
        produced_b.push(pb);
    }

    let all: HashSet<&String> = produced_a.iter().chain(produced_b.iter()).collect();
    assert_eq!(all.len(), 20, "producer ids are unique across connections");

    let registry = sfu.manager.context().registry();
    for (client, produced) in [(&a, &produced_a), (&b, &produced_b)] {
        let session = registry
            .get_session(client.lifecycle.connection_id())
            .await
            .unwrap();
        let owned: HashSet<String> = session.producers.iter().map(ToString::to_string).collect();
        let expected: HashSet<String> = produced.iter().cloned().collect();
        assert_eq!(owned, expected, "a session holds only its own producers");
    }
}

// ============================================================================
// Engine death
// ============================================================================

#[tokio::test]
async fn test_engine_death_trips_fatal_signal() {
    let engine = Arc::new(MockMediaEngine::new());
    let fatal = FatalSignal::new();
    engine
        .initialize(&EngineConfig::default(), fatal.clone())
        .await
        .unwrap();

    engine.kill("worker died");

    let reason = tokio::time::timeout(RESPONSE_TIMEOUT, fatal.tripped())
        .await
        .unwrap();
    assert_eq!(reason, "worker died");
}
