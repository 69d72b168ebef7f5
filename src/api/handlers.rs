//! API Handlers
//!
//! HTTP request handlers for each cache server endpoint.

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Value;

use crate::cache::{EntryInfo, Invalidation, MaintenanceReport, StatsSnapshot, TieredCache};
use crate::error::{CacheError, Result};
use crate::models::{
    DeleteResponse, GetResponse, HealthResponse, InvalidateResponse, SetRequest, SetResponse,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Shared cache handle; clones use the same tiers
    pub cache: TieredCache,
}

impl AppState {
    /// Creates a new AppState around the given cache.
    pub fn new(cache: TieredCache) -> Self {
        Self { cache }
    }
}

/// Handler for PUT /set
///
/// Stores a JSON value under a key in both tiers.
pub async fn set_handler(
    State(state): State<AppState>,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    state.cache.set(&req.key, &req.value, req.options).await?;

    Ok(Json(SetResponse::new(req.key)))
}

/// Handler for GET /get/:key
///
/// Retrieves a value, falling back to the durable tier on a memory miss.
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>> {
    let value: Value = state
        .cache
        .get(&key)
        .await?
        .ok_or_else(|| CacheError::NotFound(key.clone()))?;

    Ok(Json(GetResponse::new(key, value)))
}

/// Handler for DELETE /del/:key
///
/// Deletes a key from both tiers; 404 when neither held it.
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeleteResponse>> {
    if !state.cache.delete(&key).await? {
        return Err(CacheError::NotFound(key));
    }

    Ok(Json(DeleteResponse::new(key)))
}

/// Handler for POST /invalidate
///
/// Body is one of `{"tag": ..}`, `{"pattern": ..}`, `{"dependencies": [..]}`.
pub async fn invalidate_handler(
    State(state): State<AppState>,
    Json(criterion): Json<Invalidation>,
) -> Result<Json<InvalidateResponse>> {
    let removed = state.cache.invalidate(criterion).await?;
    Ok(Json(InvalidateResponse::new(removed)))
}

/// Handler for GET /inspect/:key
///
/// Memory-tier metadata; does not count as a read.
pub async fn inspect_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<EntryInfo>> {
    match state.cache.inspect(&key).await {
        Some(info) => Ok(Json(info)),
        None => Err(CacheError::NotFound(key)),
    }
}

/// Handler for POST /maintenance
///
/// Runs one sweep immediately.
pub async fn maintenance_handler(State(state): State<AppState>) -> Json<MaintenanceReport> {
    Json(state.cache.run_maintenance().await)
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.cache.stats().await)
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}
