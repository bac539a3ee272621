//! mediasoup-backed [`MediaEngine`].
//!
//! One worker, one router. mediasoup objects close when their last clone is
//! dropped, so the engine keeps every live transport/producer/consumer in a
//! map keyed by its mediasoup id and `close` simply removes the entry.
//!
//! Negotiation types are converted to mediasoup's through their shared JSON
//! representation.

use crate::engine::{
    ConsumerHandle, CreatedConsumer, CreatedTransport, FatalSignal, MediaEngine, ProducerHandle,
    ResourceHandle, TransportHandle,
};
use crate::error::EngineError;
use crate::types::{
    DtlsParameters, EngineConfig, IceCandidate, IceParameters, MediaKind, RouterCapabilities,
    RtpParameters, WebRtcTransportOptions,
};

use ::mediasoup::prelude::{
    Consumer, ConsumerOptions, ListenInfo, Producer, ProducerOptions, Protocol, Router,
    RouterOptions, Transport, WebRtcTransport, WebRtcTransportListenInfos,
    WebRtcTransportOptions as MsWebRtcTransportOptions, WebRtcTransportRemoteParameters, Worker,
    WorkerManager, WorkerSettings,
};
use ::mediasoup::rtp_parameters as ms;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};

struct Initialized {
    // Kept alive for the lifetime of the engine; dropping it kills the worker.
    _worker: Worker,
    router: Router,
}

/// Media engine backed by a single mediasoup worker and router.
pub struct MediasoupEngine {
    worker_manager: WorkerManager,
    state: OnceCell<Initialized>,
    port_range: Mutex<Option<(u16, u16)>>,
    transports: Mutex<HashMap<String, WebRtcTransport>>,
    producers: Mutex<HashMap<String, Producer>>,
    consumers: Mutex<HashMap<String, Consumer>>,
}

impl Default for MediasoupEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MediasoupEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            worker_manager: WorkerManager::new(),
            state: OnceCell::new(),
            port_range: Mutex::new(None),
            transports: Mutex::new(HashMap::new()),
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    fn router(&self) -> Result<&Router, EngineError> {
        self.state
            .get()
            .map(|state| &state.router)
            .ok_or(EngineError::NotInitialized)
    }

    async fn transport(&self, handle: &TransportHandle) -> Result<WebRtcTransport, EngineError> {
        self.transports
            .lock()
            .await
            .get(handle.as_str())
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))
    }
}

/// Convert between our negotiation types and mediasoup's via JSON.
fn convert<T: Serialize, U: DeserializeOwned>(value: &T) -> Result<U, EngineError> {
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|e| EngineError::InvalidParameters(e.to_string()))
}

fn to_ms_kind(kind: MediaKind) -> ms::MediaKind {
    match kind {
        MediaKind::Audio => ms::MediaKind::Audio,
        MediaKind::Video => ms::MediaKind::Video,
    }
}

fn from_ms_kind(kind: ms::MediaKind) -> MediaKind {
    match kind {
        ms::MediaKind::Audio => MediaKind::Audio,
        ms::MediaKind::Video => MediaKind::Video,
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn initialize(
        &self,
        config: &EngineConfig,
        fatal: FatalSignal,
    ) -> Result<RouterCapabilities, EngineError> {
        if config.rtc_min_port > config.rtc_max_port {
            return Err(EngineError::Initialize(format!(
                "invalid RTC port range {}-{}",
                config.rtc_min_port, config.rtc_max_port
            )));
        }
        *self.port_range.lock().await = Some((config.rtc_min_port, config.rtc_max_port));

        let media_codecs: Vec<ms::RtpCodecCapability> = convert(&config.media_codecs)?;

        let state = self
            .state
            .get_or_try_init(|| async {
                let worker = self
                    .worker_manager
                    .create_worker(WorkerSettings::default())
                    .await
                    .map_err(|e| EngineError::Initialize(format!("worker: {e}")))?;

                worker
                    .on_dead(move |reason| {
                        error!(
                            target: "sfu.engine",
                            reason = ?reason,
                            "mediasoup worker died"
                        );
                        fatal.trip(format!("mediasoup worker died: {reason:?}"));
                    })
                    .detach();

                let router = worker
                    .create_router(RouterOptions::new(media_codecs))
                    .await
                    .map_err(|e| EngineError::Initialize(format!("router: {e}")))?;

                info!(
                    target: "sfu.engine",
                    worker_id = %worker.id(),
                    router_id = %router.id(),
                    "mediasoup worker and router created"
                );

                Ok::<_, EngineError>(Initialized {
                    _worker: worker,
                    router,
                })
            })
            .await?;

        convert(state.router.rtp_capabilities())
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<CreatedTransport, EngineError> {
        let router = self.router()?;
        let port_range = (*self.port_range.lock().await).map(|(min, max)| min..=max);

        let listen_info = |protocol| ListenInfo {
            protocol,
            ip: options.listen_ip,
            announced_address: options.announced_address.clone(),
            expose_internal_ip: false,
            port: None,
            port_range: port_range.clone(),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        };

        let mut protocols = Vec::new();
        if options.enable_udp {
            protocols.push(Protocol::Udp);
        }
        if options.enable_tcp {
            protocols.push(Protocol::Tcp);
        }
        if options.prefer_tcp {
            protocols.reverse();
        }
        let mut protocols = protocols.into_iter();
        let first = protocols.next().ok_or_else(|| {
            EngineError::TransportCreate("neither UDP nor TCP enabled".to_string())
        })?;
        let mut listen_infos = WebRtcTransportListenInfos::new(listen_info(first));
        for protocol in protocols {
            listen_infos = listen_infos.insert(listen_info(protocol));
        }

        let transport = router
            .create_webrtc_transport(MsWebRtcTransportOptions::new(listen_infos))
            .await
            .map_err(|e| EngineError::TransportCreate(e.to_string()))?;

        let ice_parameters: IceParameters = convert(transport.ice_parameters())?;
        let ice_candidates: Vec<IceCandidate> = convert(transport.ice_candidates())?;
        let dtls_parameters: DtlsParameters = convert(&transport.dtls_parameters())?;

        let handle = TransportHandle::new(transport.id().to_string());
        self.transports
            .lock()
            .await
            .insert(handle.as_str().to_string(), transport);

        debug!(target: "sfu.engine", transport = %handle, "WebRTC transport created");

        Ok(CreatedTransport {
            handle,
            ice_parameters,
            ice_candidates,
            dtls_parameters,
        })
    }

    async fn connect_transport(
        &self,
        transport: &TransportHandle,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        let webrtc_transport = self.transport(transport).await?;
        let dtls_parameters = convert(dtls_parameters)?;

        webrtc_transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| EngineError::Connect(e.to_string()))
    }

    async fn produce(
        &self,
        transport: &TransportHandle,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerHandle, EngineError> {
        let webrtc_transport = self.transport(transport).await?;
        let rtp_parameters: ms::RtpParameters = convert(rtp_parameters)?;

        let producer = webrtc_transport
            .produce(ProducerOptions::new(to_ms_kind(kind), rtp_parameters))
            .await
            .map_err(|e| EngineError::Produce(e.to_string()))?;

        let handle = ProducerHandle::new(producer.id().to_string());
        self.producers
            .lock()
            .await
            .insert(handle.as_str().to_string(), producer);

        Ok(handle)
    }

    async fn consume(
        &self,
        transport: &TransportHandle,
        producer: &ProducerHandle,
        capabilities: &RouterCapabilities,
    ) -> Result<CreatedConsumer, EngineError> {
        let webrtc_transport = self.transport(transport).await?;
        let producer_id = self
            .producers
            .lock()
            .await
            .get(producer.as_str())
            .map(Producer::id)
            .ok_or_else(|| EngineError::UnknownHandle(producer.to_string()))?;
        let rtp_capabilities: ms::RtpCapabilities = convert(capabilities)?;

        let consumer = webrtc_transport
            .consume(ConsumerOptions::new(producer_id, rtp_capabilities))
            .await
            .map_err(|e| EngineError::Consume(e.to_string()))?;

        let kind = from_ms_kind(consumer.kind());
        let rtp_parameters: RtpParameters = convert(consumer.rtp_parameters())?;
        let handle = ConsumerHandle::new(consumer.id().to_string());
        self.consumers
            .lock()
            .await
            .insert(handle.as_str().to_string(), consumer);

        Ok(CreatedConsumer {
            handle,
            kind,
            rtp_parameters,
        })
    }

    async fn close(&self, handle: &ResourceHandle) {
        // Dropping the last clone closes the object inside the worker.
        let removed = match handle {
            ResourceHandle::Transport(h) => {
                self.transports.lock().await.remove(h.as_str()).is_some()
            }
            ResourceHandle::Producer(h) => self.producers.lock().await.remove(h.as_str()).is_some(),
            ResourceHandle::Consumer(h) => self.consumers.lock().await.remove(h.as_str()).is_some(),
        };

        if removed {
            debug!(target: "sfu.engine", resource = %handle, "Engine resource closed");
        } else {
            warn!(
                target: "sfu.engine",
                resource = %handle,
                "Close requested for unknown engine resource"
            );
        }
    }
}
