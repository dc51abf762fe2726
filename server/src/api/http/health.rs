//! Health check handler

use axum::{extract::State, Json};
use serde::Serialize;

use crate::{AppState, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_sessions: usize,
    pub providers: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    let active_sessions = state.orchestrator.list_active_sessions().await?.len();

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_sessions,
        providers: state.factory.providers().len(),
    }))
}
