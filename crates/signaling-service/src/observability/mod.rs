//! Observability for the SFU signaling service.
//!
//! - `health`: liveness and readiness probes
//! - `metrics`: Prometheus metric definitions and recorder setup

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
