//! Job routes
//!
//! - `POST /convert` runs the pipeline inside the request
//! - `POST /jobs` enqueues a job (or, with `mode: "auto"`, may run it inline)
//! - `GET /jobs`, `GET /jobs/:job_id` report queue state

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use super::commands::{
    submit::handle as handle_submit, SubmitConversionCommand, SubmitError, SubmitMode,
    SubmitOutcome,
};
use super::queries::{
    get_job::handle as handle_get_job, list_jobs::handle as handle_list_jobs, GetJobQuery,
    ListJobsQuery,
};
use crate::api::response::ApiResponse;
use crate::error::AppError;
use crate::features::FeatureState;
use crate::ingest::{Job, PipelineReport};

pub fn jobs_routes() -> Router<FeatureState> {
    Router::new()
        .route("/convert", post(convert))
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:job_id", get(get_job))
}

#[derive(Debug, Serialize)]
struct Converted {
    ok: bool,
    message: String,
    #[serde(flatten)]
    report: PipelineReport,
}

#[derive(Debug, Serialize)]
struct Enqueued {
    ok: bool,
    job_id: Uuid,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct Rejected {
    ok: bool,
    error: String,
    kind: &'static str,
}

fn completed(report: PipelineReport) -> Response {
    let message = format!(
        "Published {} features to version {}",
        report.feature_count, report.version_id
    );
    let body = Converted {
        ok: true,
        message,
        report,
    };
    (StatusCode::OK, Json(body)).into_response()
}

fn enqueued(job: Job) -> Response {
    let body = Enqueued {
        ok: true,
        job_id: job.id,
        status: job.status.as_str(),
    };
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

fn rejected(err: SubmitError) -> Response {
    let status = if err.is_validation() {
        tracing::debug!(error = %err, "Rejected conversion request");
        StatusCode::BAD_REQUEST
    } else {
        tracing::error!(error = %err, kind = err.kind(), "Conversion failed");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = Rejected {
        ok: false,
        error: err.to_string(),
        kind: err.kind(),
    };
    (status, Json(body)).into_response()
}

fn respond(result: Result<SubmitOutcome, SubmitError>) -> Response {
    match result {
        Ok(SubmitOutcome::Completed(report)) => completed(report),
        Ok(SubmitOutcome::Enqueued(job)) => enqueued(job),
        Err(e) => rejected(e),
    }
}

/// Missing fields and malformed JSON share the validation error envelope
fn command(
    payload: Result<Json<SubmitConversionCommand>, JsonRejection>,
) -> Result<SubmitConversionCommand, Response> {
    payload
        .map(|Json(command)| command)
        .map_err(|rejection| rejected(SubmitError::Body(rejection.body_text())))
}

/// Convert synchronously
///
/// POST /convert
#[tracing::instrument(skip(state, payload))]
async fn convert(
    State(state): State<FeatureState>,
    payload: Result<Json<SubmitConversionCommand>, JsonRejection>,
) -> Response {
    let mut command = match command(payload) {
        Ok(command) => command,
        Err(response) => return response,
    };
    command.mode = SubmitMode::Sync;
    respond(handle_submit(state.queue.clone(), state.pipeline.clone(), command).await)
}

/// Submit a conversion job
///
/// POST /jobs
#[tracing::instrument(skip(state, payload))]
async fn submit_job(
    State(state): State<FeatureState>,
    payload: Result<Json<SubmitConversionCommand>, JsonRejection>,
) -> Response {
    match command(payload) {
        Ok(command) => {
            respond(handle_submit(state.queue.clone(), state.pipeline.clone(), command).await)
        },
        Err(response) => response,
    }
}

/// List jobs
///
/// GET /jobs?status=failed&country_iso=PHL&limit=50&offset=0
#[tracing::instrument(skip(state))]
async fn list_jobs(
    State(state): State<FeatureState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Response, AppError> {
    let response = handle_list_jobs(state.db.clone(), query).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(response))).into_response())
}

/// Get a specific job by ID
///
/// GET /jobs/:job_id
#[tracing::instrument(skip(state))]
async fn get_job(
    State(state): State<FeatureState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let job = handle_get_job(state.queue.as_ref(), GetJobQuery { job_id }).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(job))).into_response())
}
