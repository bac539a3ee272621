//! Per-connection signaling handler.
//!
//! One handler serves one connection. Requests arrive strictly in order (the
//! connection actor awaits each response before taking the next frame), so
//! the only suspension points are the awaited engine calls and registry
//! round-trips.
//!
//! # Late resources
//!
//! A disconnect can land while an engine call is suspended. When the call
//! completes, registering the new resource fails with `SessionClosing` or
//! `NotFound`; the handler then closes the resource through the engine
//! immediately, so it is never added to the registry and closed exactly once.

use crate::context::ServiceContext;
use crate::errors::SignalingError;
use crate::observability::metrics as prom;

use super::protocol::{NetworkPolicy, SignalingRequest, SignalingResponse, TransportInfo};

use common::types::{ConnectionId, ProducerId, TransportId};
use media_engine::{
    CreatedConsumer, CreatedTransport, DtlsParameters, EngineError, MediaKind, ProducerHandle,
    ResourceHandle, RtpParameters, WebRtcTransportOptions,
};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Something an engine call may leave behind that must be closed if the
/// caller stopped waiting for it.
trait LateResource {
    fn late_handle(&self) -> Option<ResourceHandle>;
}

impl LateResource for () {
    fn late_handle(&self) -> Option<ResourceHandle> {
        None
    }
}

impl LateResource for CreatedTransport {
    fn late_handle(&self) -> Option<ResourceHandle> {
        Some(self.handle.clone().into())
    }
}

impl LateResource for ProducerHandle {
    fn late_handle(&self) -> Option<ResourceHandle> {
        Some(self.clone().into())
    }
}

impl LateResource for CreatedConsumer {
    fn late_handle(&self) -> Option<ResourceHandle> {
        Some(self.handle.clone().into())
    }
}

fn transport_info(transport_id: TransportId, created: CreatedTransport) -> TransportInfo {
    TransportInfo {
        id: transport_id.to_string(),
        ice_parameters: created.ice_parameters,
        ice_candidates: created.ice_candidates,
        dtls_parameters: created.dtls_parameters,
    }
}

/// Signaling handler for one connection.
#[derive(Debug, Clone)]
pub struct SignalingHandler {
    connection_id: ConnectionId,
    context: Arc<ServiceContext>,
}

impl SignalingHandler {
    #[must_use]
    pub fn new(connection_id: ConnectionId, context: Arc<ServiceContext>) -> Self {
        Self {
            connection_id,
            context,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Handle one request.
    pub async fn handle(
        &self,
        request: SignalingRequest,
    ) -> Result<SignalingResponse, SignalingError> {
        match request {
            SignalingRequest::GetRouterRtpCapabilities => self.get_router_capabilities(),
            SignalingRequest::CreateTransport { network_policy } => {
                self.create_transport(&network_policy).await
            }
            SignalingRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self.connect_transport(&transport_id, dtls_parameters).await,
            SignalingRequest::CreateProducer {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                self.create_producer(&transport_id, &kind, rtp_parameters)
                    .await
            }
            SignalingRequest::CreateConsumer { producer_id } => {
                self.create_consumer(producer_id.as_deref()).await
            }
        }
    }

    /// Process-wide router capabilities.
    pub fn get_router_capabilities(&self) -> Result<SignalingResponse, SignalingError> {
        let capabilities = self.context.capabilities()?;
        Ok(SignalingResponse::RouterCapabilities(capabilities.clone()))
    }

    /// Create a transport with the configured defaults, overridden by `policy`.
    pub async fn create_transport(
        &self,
        policy: &NetworkPolicy,
    ) -> Result<SignalingResponse, SignalingError> {
        let options = policy.resolve(self.context.transport_defaults())?;
        self.context.capabilities()?;

        let (transport_id, created) = self.create_registered_transport(options).await?;

        debug!(
            target: "sfu.signaling",
            connection_id = %self.connection_id,
            transport_id = %transport_id,
            "Transport created"
        );
        Ok(SignalingResponse::TransportCreated(transport_info(
            transport_id,
            created,
        )))
    }

    /// Hand the client's DTLS parameters to an owned transport.
    pub async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<SignalingResponse, SignalingError> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(SignalingError::InvalidDtlsParameters(
                "at least one fingerprint is required".to_string(),
            ));
        }
        self.context.capabilities()?;

        let transport_id = parse_transport_id(transport_id)?;
        let transport = self
            .context
            .registry()
            .get_transport(self.connection_id, transport_id)
            .await?;

        let engine = Arc::clone(self.context.engine());
        self.engine_call(
            "connectTransport",
            SignalingError::EngineConnectFailed,
            async move { engine.connect_transport(&transport, &dtls_parameters).await },
        )
        .await?;

        debug!(
            target: "sfu.signaling",
            connection_id = %self.connection_id,
            transport_id = %transport_id,
            "Transport connected"
        );
        Ok(SignalingResponse::TransportConnected { connected: true })
    }

    /// Start receiving a stream on an owned transport.
    pub async fn create_producer(
        &self,
        transport_id: &str,
        kind: &str,
        rtp_parameters: RtpParameters,
    ) -> Result<SignalingResponse, SignalingError> {
        let kind: MediaKind = kind
            .parse()
            .map_err(|e| SignalingError::InvalidRtpParameters(format!("{e}")))?;
        if rtp_parameters.codecs.is_empty() {
            return Err(SignalingError::InvalidRtpParameters(
                "at least one codec is required".to_string(),
            ));
        }
        self.context.capabilities()?;

        let transport_id = parse_transport_id(transport_id)?;
        let registry = self.context.registry();
        let transport = registry
            .get_transport(self.connection_id, transport_id)
            .await?;

        let engine = Arc::clone(self.context.engine());
        let handle = self
            .engine_call(
                "produce",
                SignalingError::EngineProduceFailed,
                async move { engine.produce(&transport, kind, &rtp_parameters).await },
            )
            .await?;

        let added = registry
            .add_producer(self.connection_id, transport_id, kind, handle.clone())
            .await;
        let producer_id = self.register(handle.into(), added).await?;

        debug!(
            target: "sfu.signaling",
            connection_id = %self.connection_id,
            transport_id = %transport_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        Ok(SignalingResponse::ProducerCreated {
            id: producer_id.to_string(),
        })
    }

    /// Consume a producer (possibly owned by another connection) on a fresh transport.
    pub async fn create_consumer(
        &self,
        producer_id: Option<&str>,
    ) -> Result<SignalingResponse, SignalingError> {
        let raw = producer_id
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| SignalingError::InvalidProducerId("producerId is required".to_string()))?;
        let producer_id: ProducerId = raw.parse().map_err(|_| {
            SignalingError::InvalidProducerId(format!("'{raw}' is not a valid producer id"))
        })?;
        let capabilities = self.context.capabilities()?.clone();

        let registry = self.context.registry();
        let producer = registry.resolve_producer(producer_id).await?;

        let (transport_id, transport) = self
            .create_registered_transport(self.context.transport_defaults().clone())
            .await?;

        let engine = Arc::clone(self.context.engine());
        let transport_handle = transport.handle.clone();
        let producer_handle = producer.handle.clone();
        let consumed = self
            .engine_call(
                "consume",
                SignalingError::EngineConsumeFailed,
                async move {
                    engine
                        .consume(&transport_handle, &producer_handle, &capabilities)
                        .await
                },
            )
            .await;

        let consumer = match consumed {
            Ok(consumer) => consumer,
            Err(e) => {
                self.discard_transport(transport_id).await;
                // The engine rejects a producer that was closed under us.
                if registry.resolve_producer(producer_id).await.is_err() {
                    return Err(SignalingError::ProducerGone(producer_id.to_string()));
                }
                return Err(e);
            }
        };

        let added = registry
            .add_consumer(
                self.connection_id,
                transport_id,
                producer_id,
                consumer.handle.clone(),
            )
            .await;
        let consumer_id = match self.register(consumer.handle.clone().into(), added).await {
            Ok(consumer_id) => consumer_id,
            Err(SignalingError::ProducerGone(_) | SignalingError::UnknownProducer(_)) => {
                self.discard_transport(transport_id).await;
                return Err(SignalingError::ProducerGone(producer_id.to_string()));
            }
            Err(e) => {
                if !e.is_session_gone() {
                    self.discard_transport(transport_id).await;
                }
                return Err(e);
            }
        };

        debug!(
            target: "sfu.signaling",
            connection_id = %self.connection_id,
            producer_id = %producer_id,
            producer_owner = %producer.owner,
            consumer_id = %consumer_id,
            transport_id = %transport_id,
            "Consumer created"
        );
        Ok(SignalingResponse::ConsumerCreated {
            id: consumer_id.to_string(),
            producer_id: producer_id.to_string(),
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
            transport: transport_info(transport_id, transport),
        })
    }

    async fn create_registered_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<(TransportId, CreatedTransport), SignalingError> {
        let engine = Arc::clone(self.context.engine());
        let created = self
            .engine_call(
                "createWebRtcTransport",
                SignalingError::EngineTransportCreateFailed,
                async move { engine.create_webrtc_transport(&options).await },
            )
            .await?;

        let added = self
            .context
            .registry()
            .add_transport(self.connection_id, created.handle.clone())
            .await;
        let transport_id = self.register(created.handle.clone().into(), added).await?;
        Ok((transport_id, created))
    }

    /// Remove a transport this request created and close it.
    ///
    /// If the session was already destroyed the transport went out with its
    /// teardown, so nothing is closed here.
    async fn discard_transport(&self, transport_id: TransportId) {
        match self
            .context
            .registry()
            .remove_transport(self.connection_id, transport_id)
            .await
        {
            Ok(Some(handle)) => {
                self.context.engine().close(&handle.into()).await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    transport_id = %transport_id,
                    error = %e,
                    "Failed to discard transport"
                );
            }
        }
    }

    /// Close `handle` if registering it failed.
    async fn register<T>(
        &self,
        handle: ResourceHandle,
        added: Result<T, SignalingError>,
    ) -> Result<T, SignalingError> {
        if let Err(e) = &added {
            self.context.engine().close(&handle).await;
            if e.is_session_gone() {
                prom::record_late_resource_closed(handle.kind());
                debug!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    resource = %handle,
                    "Closed resource created after disconnect"
                );
            }
        }
        added
    }

    /// Run an engine call, bounded by the configured timeout if any.
    ///
    /// A timed-out call keeps running in the background; whatever it creates
    /// is closed as soon as it completes.
    async fn engine_call<T, F>(
        &self,
        operation: &'static str,
        fail: fn(String) -> SignalingError,
        call: F,
    ) -> Result<T, SignalingError>
    where
        T: LateResource + Send + 'static,
        F: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let Some(limit) = self.context.engine_call_timeout() else {
            return call.await.map_err(|e| fail(e.to_string()));
        };

        let mut task = tokio::spawn(call);
        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(result)) => result.map_err(|e| fail(e.to_string())),
            Ok(Err(e)) => Err(SignalingError::Internal(format!(
                "engine call task failed: {e}"
            ))),
            Err(_) => {
                warn!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    operation = operation,
                    timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    "Engine call timed out"
                );

                let engine = Arc::clone(self.context.engine());
                let connection_id = self.connection_id;
                tokio::spawn(async move {
                    let Ok(Ok(resource)) = task.await else {
                        return;
                    };
                    if let Some(handle) = resource.late_handle() {
                        engine.close(&handle).await;
                        prom::record_late_resource_closed(handle.kind());
                        debug!(
                            target: "sfu.signaling",
                            connection_id = %connection_id,
                            resource = %handle,
                            "Closed resource from timed-out engine call"
                        );
                    }
                });

                Err(SignalingError::EngineTimeout(operation.to_string()))
            }
        }
    }
}

fn parse_transport_id(raw: &str) -> Result<TransportId, SignalingError> {
    raw.parse()
        .map_err(|_| SignalingError::UnknownTransport(raw.to_string()))
}
