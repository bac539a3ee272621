//! Health endpoints for the SFU signaling service.
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (engine initialized, not shutting down)
//!
//! The `/metrics` endpoint is merged into the same router by the binary and
//! rendered by `metrics-exporter-prometheus`.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness for Kubernetes probes.
#[derive(Debug)]
pub struct HealthState {
    /// Always true after startup.
    live: AtomicBool,
    /// True once the media engine published its router capabilities, false
    /// again as soon as shutdown starts.
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Create the health router with liveness and readiness endpoints.
///
/// `/health` returns 200 while the process runs. `/ready` returns 200 when
/// the service accepts signaling connections and 503 otherwise.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn get_status(app: Router, uri: &str) -> StatusCode {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");

        app.oneshot(request)
            .await
            .expect("Failed to execute request")
            .status()
    }

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready before the engine starts");
    }

    #[test]
    fn test_health_state_transitions() {
        let state = HealthState::default();

        state.set_ready();
        assert!(state.is_ready());

        state.set_not_ready();
        assert!(!state.is_ready(), "Shutdown clears readiness");
        assert!(state.is_live(), "Shutdown does not affect liveness");
    }

    #[tokio::test]
    async fn test_liveness_endpoint() {
        let app = health_router(Arc::new(HealthState::new()));
        assert_eq!(get_status(app, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_endpoint_follows_state() {
        let state = Arc::new(HealthState::new());

        let status = get_status(health_router(Arc::clone(&state)), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready();
        let status = get_status(health_router(Arc::clone(&state)), "/ready").await;
        assert_eq!(status, StatusCode::OK);

        state.set_not_ready();
        let status = get_status(health_router(state), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let app = health_router(Arc::new(HealthState::new()));
        assert_eq!(get_status(app, "/unknown").await, StatusCode::NOT_FOUND);
    }
}
