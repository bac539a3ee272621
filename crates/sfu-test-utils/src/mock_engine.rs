//! Scriptable in-process media engine.
//!
//! `MockMediaEngine` implements [`MediaEngine`] without any media. It records
//! every call so tests can assert on adapter side effects:
//!
//! - per-operation call counts (`call_count`, `wait_for_calls`)
//! - per-handle close counts (`close_count`), to prove exactly-once cleanup
//! - live resources (created and not yet closed)
//!
//! Behaviour can be scripted with failure injection (`fail` / `clear_failure`)
//! and per-operation gates (`hold` / `release`) that suspend calls until the
//! test lets them continue.

use async_trait::async_trait;
use media_engine::{
    ConsumerHandle, CreatedConsumer, CreatedTransport, DtlsFingerprint, DtlsParameters,
    EngineConfig, EngineError, FatalSignal, IceCandidate, IceParameters, MediaEngine, MediaKind,
    ProducerHandle, ResourceHandle, RouterCapabilities, RtpParameters, TransportHandle,
    WebRtcTransportOptions,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Engine operations that can be counted, failed or held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOperation {
    Initialize,
    CreateTransport,
    ConnectTransport,
    Produce,
    Consume,
    Close,
}

#[derive(Debug)]
struct OperationState {
    calls: watch::Sender<usize>,
    held: watch::Sender<bool>,
    failure: Mutex<Option<String>>,
}

impl OperationState {
    fn new() -> Self {
        Self {
            calls: watch::Sender::new(0),
            held: watch::Sender::new(false),
            failure: Mutex::new(None),
        }
    }
}

#[derive(Debug, Clone)]
struct ProducedStream {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

/// Mock media engine for signaling tests.
#[derive(Debug)]
pub struct MockMediaEngine {
    capabilities: RouterCapabilities,
    initialize: OperationState,
    create_transport: OperationState,
    connect_transport: OperationState,
    produce: OperationState,
    consume: OperationState,
    close: OperationState,
    next_id: AtomicU64,
    fatal: Mutex<Option<FatalSignal>>,
    transport_options: Mutex<Vec<WebRtcTransportOptions>>,
    producers: Mutex<HashMap<ProducerHandle, ProducedStream>>,
    live: Mutex<HashSet<ResourceHandle>>,
    close_counts: Mutex<HashMap<ResourceHandle, usize>>,
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockMediaEngine {
    /// Create a mock engine with default capabilities and no scripted failures.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a new MockMediaEngine builder.
    #[must_use]
    pub fn builder() -> MockMediaEngineBuilder {
        MockMediaEngineBuilder::default()
    }

    fn state(&self, op: EngineOperation) -> &OperationState {
        match op {
            EngineOperation::Initialize => &self.initialize,
            EngineOperation::CreateTransport => &self.create_transport,
            EngineOperation::ConnectTransport => &self.connect_transport,
            EngineOperation::Produce => &self.produce,
            EngineOperation::Consume => &self.consume,
            EngineOperation::Close => &self.close,
        }
    }

    /// Count the call, wait at the gate, then report any scripted failure.
    async fn enter(&self, op: EngineOperation) -> Option<String> {
        let state = self.state(op);
        state.calls.send_modify(|calls| *calls += 1);

        let mut held = state.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        lock(&state.failure).clone()
    }

    fn next_handle(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("mock-{prefix}-{n}")
    }

    /// Number of calls made to an operation (including held and failed calls).
    #[must_use]
    pub fn call_count(&self, op: EngineOperation) -> usize {
        *self.state(op).calls.borrow()
    }

    /// Wait until at least `count` calls have reached `op`.
    pub async fn wait_for_calls(&self, op: EngineOperation, count: usize) {
        let mut calls = self.state(op).calls.subscribe();
        let _ = calls.wait_for(|calls| *calls >= count).await;
    }

    /// Make subsequent calls to `op` fail with `message`.
    pub fn fail(&self, op: EngineOperation, message: impl Into<String>) {
        *lock(&self.state(op).failure) = Some(message.into());
    }

    /// Stop failing calls to `op`.
    pub fn clear_failure(&self, op: EngineOperation) {
        *lock(&self.state(op).failure) = None;
    }

    /// Suspend calls to `op` until [`release`](Self::release).
    pub fn hold(&self, op: EngineOperation) {
        self.state(op).held.send_replace(true);
    }

    /// Let held calls to `op` continue.
    pub fn release(&self, op: EngineOperation) {
        self.state(op).held.send_replace(false);
    }

    /// How many times `handle` was closed.
    #[must_use]
    pub fn close_count(&self, handle: &ResourceHandle) -> usize {
        lock(&self.close_counts).get(handle).copied().unwrap_or(0)
    }

    /// Every handle that was closed more than once.
    #[must_use]
    pub fn double_closed(&self) -> Vec<ResourceHandle> {
        lock(&self.close_counts)
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(handle, _)| handle.clone())
            .collect()
    }

    /// Resources created and not yet closed.
    #[must_use]
    pub fn live_resources(&self) -> Vec<ResourceHandle> {
        lock(&self.live).iter().cloned().collect()
    }

    /// Number of live resources of the given kind ("transport", "producer", "consumer").
    #[must_use]
    pub fn live_count(&self, kind: &str) -> usize {
        lock(&self.live)
            .iter()
            .filter(|handle| handle.kind() == kind)
            .count()
    }

    /// Network options passed to every `create_webrtc_transport` call, in order.
    #[must_use]
    pub fn transport_options(&self) -> Vec<WebRtcTransportOptions> {
        lock(&self.transport_options).clone()
    }

    /// Simulate the engine dying after initialization.
    ///
    /// # Panics
    ///
    /// Panics if `initialize` was never called.
    pub fn kill(&self, reason: &str) {
        let fatal = lock(&self.fatal).clone();
        fatal
            .expect("kill() requires an initialized engine")
            .trip(reason);
    }

    fn mock_transport(handle: TransportHandle) -> CreatedTransport {
        CreatedTransport {
            ice_parameters: IceParameters {
                username_fragment: format!("ufrag-{handle}"),
                password: format!("pwd-{handle}"),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                address: "127.0.0.1".to_string(),
                protocol: "udp".to_string(),
                port: 10_000,
                candidate_type: "host".to_string(),
                tcp_type: None,
            }],
            dtls_parameters: DtlsParameters {
                role: Some("auto".to_string()),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: "AA:BB:CC:DD".to_string(),
                }],
            },
            handle,
        }
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn initialize(
        &self,
        _config: &EngineConfig,
        fatal: FatalSignal,
    ) -> Result<RouterCapabilities, EngineError> {
        if let Some(message) = self.enter(EngineOperation::Initialize).await {
            return Err(EngineError::Initialize(message));
        }
        *lock(&self.fatal) = Some(fatal);
        Ok(self.capabilities.clone())
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<CreatedTransport, EngineError> {
        lock(&self.transport_options).push(options.clone());
        if let Some(message) = self.enter(EngineOperation::CreateTransport).await {
            return Err(EngineError::TransportCreate(message));
        }

        let handle = TransportHandle::new(self.next_handle("transport"));
        lock(&self.live).insert(handle.clone().into());
        Ok(Self::mock_transport(handle))
    }

    async fn connect_transport(
        &self,
        transport: &TransportHandle,
        _dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        if let Some(message) = self.enter(EngineOperation::ConnectTransport).await {
            return Err(EngineError::Connect(message));
        }
        if !lock(&self.live).contains(&ResourceHandle::from(transport.clone())) {
            return Err(EngineError::UnknownHandle(transport.to_string()));
        }
        Ok(())
    }

    async fn produce(
        &self,
        transport: &TransportHandle,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerHandle, EngineError> {
        if let Some(message) = self.enter(EngineOperation::Produce).await {
            return Err(EngineError::Produce(message));
        }
        if !lock(&self.live).contains(&ResourceHandle::from(transport.clone())) {
            return Err(EngineError::UnknownHandle(transport.to_string()));
        }

        let handle = ProducerHandle::new(self.next_handle("producer"));
        lock(&self.producers).insert(
            handle.clone(),
            ProducedStream {
                kind,
                rtp_parameters: rtp_parameters.clone(),
            },
        );
        lock(&self.live).insert(handle.clone().into());
        Ok(handle)
    }

    async fn consume(
        &self,
        transport: &TransportHandle,
        producer: &ProducerHandle,
        _capabilities: &RouterCapabilities,
    ) -> Result<CreatedConsumer, EngineError> {
        if let Some(message) = self.enter(EngineOperation::Consume).await {
            return Err(EngineError::Consume(message));
        }
        if !lock(&self.live).contains(&ResourceHandle::from(transport.clone())) {
            return Err(EngineError::UnknownHandle(transport.to_string()));
        }
        let stream = lock(&self.producers)
            .get(producer)
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandle(producer.to_string()))?;

        let handle = ConsumerHandle::new(self.next_handle("consumer"));
        lock(&self.live).insert(handle.clone().into());
        Ok(CreatedConsumer {
            handle,
            kind: stream.kind,
            rtp_parameters: stream.rtp_parameters,
        })
    }

    async fn close(&self, handle: &ResourceHandle) {
        let _ = self.enter(EngineOperation::Close).await;

        *lock(&self.close_counts).entry(handle.clone()).or_insert(0) += 1;
        lock(&self.live).remove(handle);
        if let ResourceHandle::Producer(producer) = handle {
            lock(&self.producers).remove(producer);
        }
    }
}

/// Builder for MockMediaEngine configuration.
#[derive(Debug, Default)]
pub struct MockMediaEngineBuilder {
    capabilities: Option<RouterCapabilities>,
    failures: Vec<(EngineOperation, String)>,
    held: Vec<EngineOperation>,
}

impl MockMediaEngineBuilder {
    /// Set the router capabilities returned by `initialize`.
    #[must_use]
    pub fn capabilities(mut self, capabilities: RouterCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Fail every call to `op` with `message`.
    #[must_use]
    pub fn fail(mut self, op: EngineOperation, message: impl Into<String>) -> Self {
        self.failures.push((op, message.into()));
        self
    }

    /// Start with calls to `op` held.
    #[must_use]
    pub fn hold(mut self, op: EngineOperation) -> Self {
        self.held.push(op);
        self
    }

    /// Build the MockMediaEngine.
    #[must_use]
    pub fn build(self) -> MockMediaEngine {
        let capabilities = self
            .capabilities
            .unwrap_or_else(crate::fixtures::router_capabilities);

        let engine = MockMediaEngine {
            capabilities,
            initialize: OperationState::new(),
            create_transport: OperationState::new(),
            connect_transport: OperationState::new(),
            produce: OperationState::new(),
            consume: OperationState::new(),
            close: OperationState::new(),
            next_id: AtomicU64::new(0),
            fatal: Mutex::new(None),
            transport_options: Mutex::new(Vec::new()),
            producers: Mutex::new(HashMap::new()),
            live: Mutex::new(HashSet::new()),
            close_counts: Mutex::new(HashMap::new()),
        };
        for (op, message) in self.failures {
            engine.fail(op, message);
        }
        for op in self.held {
            engine.hold(op);
        }
        engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{router_capabilities, vp8_rtp_parameters};
    use std::sync::Arc;
    use std::time::Duration;

    async fn initialized() -> MockMediaEngine {
        let engine = MockMediaEngine::new();
        engine
            .initialize(&EngineConfig::default(), FatalSignal::new())
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_initialize_returns_default_codecs() {
        let engine = MockMediaEngine::new();
        let caps = engine
            .initialize(&EngineConfig::default(), FatalSignal::new())
            .await
            .unwrap();

        assert_eq!(caps.codecs.len(), 2);
        assert_eq!(engine.call_count(EngineOperation::Initialize), 1);
    }

    #[tokio::test]
    async fn test_produce_consume_and_close_accounting() {
        let engine = initialized().await;
        let options = WebRtcTransportOptions::default();

        let send = engine.create_webrtc_transport(&options).await.unwrap();
        let producer = engine
            .produce(&send.handle, MediaKind::Video, &vp8_rtp_parameters())
            .await
            .unwrap();

        let recv = engine.create_webrtc_transport(&options).await.unwrap();
        let consumer = engine
            .consume(&recv.handle, &producer, &router_capabilities())
            .await
            .unwrap();

        assert_eq!(consumer.kind, MediaKind::Video);
        assert_eq!(engine.live_count("transport"), 2);
        assert_eq!(engine.live_count("producer"), 1);
        assert_eq!(engine.live_count("consumer"), 1);

        let handle: ResourceHandle = consumer.handle.into();
        engine.close(&handle).await;
        engine.close(&handle).await;

        assert_eq!(engine.close_count(&handle), 2);
        assert_eq!(engine.double_closed(), vec![handle]);
        assert_eq!(engine.live_count("consumer"), 0);
    }

    #[tokio::test]
    async fn test_consume_closed_producer_fails() {
        let engine = initialized().await;
        let options = WebRtcTransportOptions::default();
        let transport = engine.create_webrtc_transport(&options).await.unwrap();
        let producer = engine
            .produce(&transport.handle, MediaKind::Audio, &vp8_rtp_parameters())
            .await
            .unwrap();

        engine.close(&producer.clone().into()).await;

        let result = engine
            .consume(&transport.handle, &producer, &router_capabilities())
            .await;
        assert!(matches!(result, Err(EngineError::UnknownHandle(_))));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let engine = MockMediaEngine::builder()
            .fail(EngineOperation::CreateTransport, "no more ports")
            .build();

        let result = engine
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await;
        assert!(
            matches!(result, Err(EngineError::TransportCreate(msg)) if msg == "no more ports")
        );
        assert_eq!(engine.call_count(EngineOperation::CreateTransport), 1);
        assert_eq!(engine.live_count("transport"), 0);

        engine.clear_failure(EngineOperation::CreateTransport);
        assert!(engine
            .create_webrtc_transport(&WebRtcTransportOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_hold_and_release() {
        let engine = Arc::new(MockMediaEngine::new());
        engine.hold(EngineOperation::CreateTransport);

        let call = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .create_webrtc_transport(&WebRtcTransportOptions::default())
                    .await
            })
        };

        tokio::time::timeout(
            Duration::from_secs(1),
            engine.wait_for_calls(EngineOperation::CreateTransport, 1),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!call.is_finished());

        engine.release(EngineOperation::CreateTransport);
        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_kill_trips_fatal_signal() {
        let engine = MockMediaEngine::new();
        let fatal = FatalSignal::new();
        engine
            .initialize(&EngineConfig::default(), fatal.clone())
            .await
            .unwrap();

        engine.kill("worker exited");
        assert_eq!(fatal.tripped().await, "worker exited");
    }

    #[tokio::test]
    async fn test_transport_options_recorded() {
        let engine = MockMediaEngine::new();
        let options = WebRtcTransportOptions {
            enable_udp: false,
            prefer_udp: false,
            prefer_tcp: true,
            ..WebRtcTransportOptions::default()
        };
        engine.create_webrtc_transport(&options).await.unwrap();

        assert_eq!(engine.transport_options(), vec![options]);
    }
}
