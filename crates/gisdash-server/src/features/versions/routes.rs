//! Dataset version routes
//!
//! Read-only views of what the dashboard currently serves.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use super::queries::{
    get_active::handle as handle_get_active, list_versions::handle as handle_list_versions,
    GetActiveVersionQuery, ListVersionsQuery,
};
use crate::api::response::ApiResponse;
use crate::error::AppError;
use crate::features::FeatureState;

pub fn versions_routes() -> Router<FeatureState> {
    Router::new()
        .route("/versions", get(list_versions))
        .route("/versions/active/:country_iso", get(get_active_version))
}

/// GET /versions?country_iso=PHL
#[tracing::instrument(skip(state))]
async fn list_versions(
    State(state): State<FeatureState>,
    Query(query): Query<ListVersionsQuery>,
) -> Result<Response, AppError> {
    let versions = handle_list_versions(state.db.clone(), query).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(versions))).into_response())
}

/// GET /versions/active/:country_iso
#[tracing::instrument(skip(state))]
async fn get_active_version(
    State(state): State<FeatureState>,
    Path(country_iso): Path<String>,
) -> Result<Response, AppError> {
    let active = handle_get_active(state.db.clone(), GetActiveVersionQuery { country_iso }).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(active))).into_response())
}
