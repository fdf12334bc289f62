use crate::sampler::SamplerStatus;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;

#[derive(Clone)]
pub struct HttpState {
    pub status: watch::Receiver<Option<SamplerStatus>>,
}

impl HttpState {
    fn current(&self) -> Option<SamplerStatus> {
        self.status.borrow().clone()
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_snapshot(State(state): State<HttpState>) -> Response {
    match state.current() {
        Some(status) => Json(status.snapshot).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_status(State(state): State<HttpState>) -> Response {
    match state.current() {
        Some(status) => Json(status).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/snapshot", get(get_snapshot))
        .route("/v1/status", get(get_status))
        .with_state(state)
}

pub async fn serve(bind: &str, state: HttpState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind status listener on {bind}"))?;
    tracing::info!(bind = %bind, "status HTTP listening");
    axum::serve(listener, router(state))
        .await
        .context("status HTTP server failed")
}
