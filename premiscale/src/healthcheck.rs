//! Healthcheck HTTP server (spec.md §6): two unauthenticated `GET`
//! endpoints on a configurable bind address, backed by `Arc<HealthState>`
//! that the Supervisor and MetricsCollector flip as they reach the
//! corresponding milestones.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

#[derive(Default)]
pub struct HealthState {
    supervisor_alive: AtomicBool,
    ready: AtomicBool,
}

impl HealthState {
    pub fn new() -> Arc<Self> {
        Arc::new(HealthState::default())
    }

    pub fn mark_supervisor_alive(&self) {
        self.supervisor_alive.store(true, Ordering::SeqCst);
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.supervisor_alive.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

async fn healthz(axum::extract::State(state): axum::extract::State<Arc<HealthState>>) -> impl axum::response::IntoResponse {
    if state.is_alive() {
        (axum::http::StatusCode::OK, Json(json!({"status": "OK"})))
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "unhealthy"})))
    }
}

async fn ready(axum::extract::State(state): axum::extract::State<Arc<HealthState>>) -> impl axum::response::IntoResponse {
    if state.is_ready() {
        (axum::http::StatusCode::OK, Json(json!({"status": "OK"})))
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "not ready"})))
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ready", get(ready))
        .with_state(state)
}

pub async fn serve(host: &str, port: u16, state: Arc<HealthState>) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    info!(%addr, "starting healthcheck server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_unhealthy_before_supervisor_marks_alive() {
        let state = HealthState::new();
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn healthz_ok_after_supervisor_marks_alive() {
        let state = HealthState::new();
        state.mark_supervisor_alive();
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_ok_after_mark_ready() {
        let state = HealthState::new();
        state.mark_ready();
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
