//! Read and refresh stored raster reports of the configured bucket.

use crate::{
    errors::AppError, handlers::webhook_handlers::authorize, models::report::StoredReport,
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
};
use serde::Deserialize;

const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ListReportsQuery {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
}

/// `GET /reports?prefix=&limit=`
pub async fn list_reports(
    State(state): State<AppState>,
    Query(q): Query<ListReportsQuery>,
) -> Result<Json<Vec<StoredReport>>, AppError> {
    let reports = state
        .events
        .reports
        .list(
            &state.events.bucket,
            q.prefix.as_deref(),
            q.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        )
        .await?;
    Ok(Json(reports))
}

/// `GET /reports/{*key}`
pub async fn get_report(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<StoredReport>, AppError> {
    state
        .events
        .reports
        .get(&state.events.bucket, &key)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("no report for `{}`", key)))
}

/// `POST /reports/{*key}`: download and profile the object now.
pub async fn refresh_report(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StoredReport>, AppError> {
    authorize(&state, &headers)?;
    let stored = state.events.profile_and_store(&key, "manual").await?;
    Ok(Json(stored))
}
