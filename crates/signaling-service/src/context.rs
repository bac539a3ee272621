//! Process-scoped service context.
//!
//! Holds what every connection shares: the media engine, the session
//! registry, the router capabilities (set once by engine initialization) and
//! the transport defaults from configuration.

use crate::actors::SessionRegistryHandle;
use crate::errors::SignalingError;

use media_engine::{
    EngineConfig, EngineError, FatalSignal, MediaEngine, RouterCapabilities,
    WebRtcTransportOptions,
};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::info;

/// Shared state injected into every signaling handler.
pub struct ServiceContext {
    engine: Arc<dyn MediaEngine>,
    registry: SessionRegistryHandle,
    capabilities: OnceLock<RouterCapabilities>,
    transport_defaults: WebRtcTransportOptions,
    engine_call_timeout: Option<Duration>,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("ready", &self.is_ready())
            .field("transport_defaults", &self.transport_defaults)
            .field("engine_call_timeout", &self.engine_call_timeout)
            .finish_non_exhaustive()
    }
}

impl ServiceContext {
    #[must_use]
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        registry: SessionRegistryHandle,
        transport_defaults: WebRtcTransportOptions,
        engine_call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            engine,
            registry,
            capabilities: OnceLock::new(),
            transport_defaults,
            engine_call_timeout,
        }
    }

    /// Initialize the engine and publish the router capabilities.
    ///
    /// Only the first successful call has an effect; later calls return the
    /// capabilities already published without touching the engine.
    pub async fn initialize_engine(
        &self,
        config: &EngineConfig,
        fatal: FatalSignal,
    ) -> Result<&RouterCapabilities, EngineError> {
        if let Some(capabilities) = self.capabilities.get() {
            return Ok(capabilities);
        }

        let capabilities = self.engine.initialize(config, fatal).await?;
        info!(
            target: "sfu.engine",
            codecs = capabilities.codecs.len(),
            rtc_min_port = config.rtc_min_port,
            rtc_max_port = config.rtc_max_port,
            "Media engine initialized"
        );
        Ok(self.capabilities.get_or_init(|| capabilities))
    }

    /// Router capabilities, or `EngineNotReady` before initialization.
    pub fn capabilities(&self) -> Result<&RouterCapabilities, SignalingError> {
        self.capabilities.get().ok_or(SignalingError::EngineNotReady)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.capabilities.get().is_some()
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistryHandle {
        &self.registry
    }

    #[must_use]
    pub fn transport_defaults(&self) -> &WebRtcTransportOptions {
        &self.transport_defaults
    }

    #[must_use]
    pub fn engine_call_timeout(&self) -> Option<Duration> {
        self.engine_call_timeout
    }
}
