//! Session HTTP handlers

use std::collections::HashMap;
use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::domain::environment::{
    BackendType, CommandResult, ConfigurationKind, ExecOptions, LogOptions, LogOutput,
};
use crate::domain::session::{StartSessionOptions, WorkshopSession};
use crate::service::session::SessionStatusView;
use crate::service::validation::{RulesReport, StepValidationResult};
use crate::{AppState, Error, Result};

/// Start session request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub template_id: String,
    pub user_id: String,
    pub backend: Option<BackendType>,
    pub provider_name: Option<String>,
    pub duration_minutes: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// List sessions response
#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<WorkshopSession>,
    pub total: usize,
}

/// Execute command request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandRequest {
    pub command: String,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Logs query parameters
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub target: Option<String>,
    #[serde(default)]
    pub follow: bool,
    pub tail: Option<usize>,
    pub since: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: String,
}

/// Apply configuration request
#[derive(Debug, Deserialize)]
pub struct ApplyConfigurationRequest {
    pub kind: ConfigurationKind,
    pub payload: String,
}

/// Start a session
pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> Result<Json<WorkshopSession>> {
    if req.template_id.is_empty() {
        return Err(Error::InvalidRequest("templateId is required".to_string()));
    }

    let options = StartSessionOptions {
        backend: req.backend,
        provider_name: req.provider_name,
        duration_minutes: req.duration_minutes,
        env: req.env,
    };
    let session = state
        .orchestrator
        .start_session(&req.template_id, &req.user_id, options)
        .await?;
    Ok(Json(session))
}

/// List active sessions
pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<ListSessionsResponse>> {
    let sessions = state.orchestrator.list_active_sessions().await?;
    let total = sessions.len();
    Ok(Json(ListSessionsResponse { sessions, total }))
}

/// Get session status
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatusView>> {
    Ok(Json(state.orchestrator.get_session_status(&id).await?))
}

/// End a session and destroy its sandbox
pub async fn end_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkshopSession>> {
    Ok(Json(state.orchestrator.end_session(&id).await?))
}

/// Run a command in the session's sandbox
pub async fn execute_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteCommandRequest>,
) -> Result<Json<CommandResult>> {
    let options = ExecOptions {
        timeout_ms: req.timeout_ms,
        env: req.env,
    };
    let result = state
        .orchestrator
        .execute_command(&id, &req.command, options)
        .await?;
    Ok(Json(result))
}

/// Validate one step
pub async fn validate_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
) -> Result<Json<StepValidationResult>> {
    Ok(Json(state.orchestrator.validate_step(&id, &step_id).await?))
}

/// Fetch logs, or stream them as server-sent events when `follow=true`
pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response> {
    let options = LogOptions {
        follow: query.follow,
        tail: query.tail,
        since: query.since,
    };
    let output = state
        .orchestrator
        .get_session_logs(&id, query.target.as_deref(), options)
        .await?;

    Ok(match output {
        LogOutput::Text(logs) => Json(LogsResponse { logs }).into_response(),
        LogOutput::Stream(stream) => {
            let events = stream.map(|line| {
                Ok::<_, Infallible>(match line {
                    Ok(line) => Event::default().data(line.trim_end()),
                    Err(e) => Event::default().event("error").data(e.to_string()),
                })
            });
            Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
    })
}

/// Apply declarative configuration
pub async fn apply_configuration(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ApplyConfigurationRequest>,
) -> Result<Json<serde_json::Value>> {
    state
        .orchestrator
        .apply_configuration(&id, &req.payload, req.kind)
        .await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Pause a session
pub async fn pause_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkshopSession>> {
    Ok(Json(state.orchestrator.pause_session(&id).await?))
}

/// Evaluate the template's rules against the sandbox
pub async fn evaluate_rules(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RulesReport>> {
    Ok(Json(state.orchestrator.evaluate_rules(&id).await?))
}
