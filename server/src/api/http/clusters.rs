//! Cluster registry HTTP handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::domain::cluster::{ClusterMetrics, ClusterRecord, CreateClusterParams, UpdateClusterParams};
use crate::{AppState, Result};

/// List clusters response
#[derive(Debug, Serialize)]
pub struct ListClustersResponse {
    pub clusters: Vec<ClusterRecord>,
    pub total: usize,
}

/// Register a cluster
pub async fn add_cluster(
    State(state): State<AppState>,
    Json(req): Json<CreateClusterParams>,
) -> Result<Json<ClusterRecord>> {
    Ok(Json(state.registry.add_cluster(req).await?))
}

/// List registered clusters
pub async fn list_clusters(State(state): State<AppState>) -> Result<Json<ListClustersResponse>> {
    let clusters = state.registry.list_clusters().await?;
    let total = clusters.len();
    Ok(Json(ListClustersResponse { clusters, total }))
}

/// Get a cluster by id
pub async fn get_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ClusterRecord>> {
    Ok(Json(state.registry.get_cluster(&id).await?))
}

/// Update a cluster
pub async fn update_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateClusterParams>,
) -> Result<Json<ClusterRecord>> {
    Ok(Json(state.registry.update_cluster(&id, req).await?))
}

/// Remove a cluster
pub async fn remove_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.registry.remove_cluster(&id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Probe a cluster now
pub async fn test_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ClusterRecord>> {
    Ok(Json(state.registry.test_connection(&id).await?))
}

/// Aggregated capacity and usage
pub async fn get_metrics(State(state): State<AppState>) -> Result<Json<ClusterMetrics>> {
    Ok(Json(state.registry.get_metrics().await?))
}
