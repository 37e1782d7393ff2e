use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::analysis::status::JobStatusView;
use crate::domains::analysis::validation::FieldViolation;
use crate::kernel::jobs::{JobStoreError, NewAnalysisJob, QueueStats};
use crate::server::app::AppState;

/// Body of `POST /api/analyses`. Missing fields are reported by validation
/// together with every other violation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAnalysisRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<FieldViolation>,
}

/// Store errors mapped to HTTP responses.
pub struct ApiError(JobStoreError);

impl From<JobStoreError> for ApiError {
    fn from(e: JobStoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, violations) = match &self.0 {
            JobStoreError::Validation(v) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_failed",
                v.violations.clone(),
            ),
            JobStoreError::TokenInUse => (StatusCode::CONFLICT, "token_in_use", Vec::new()),
            JobStoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", Vec::new()),
            e if e.is_client_error() => (StatusCode::CONFLICT, "invalid_state", Vec::new()),
            e => {
                tracing::error!(error = %e, "job store request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", Vec::new())
            }
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal server error".to_string()
        } else {
            self.0.to_string()
        };

        (
            status,
            Json(ErrorBody {
                error,
                message,
                violations,
            }),
        )
            .into_response()
    }
}

fn not_found(what: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "not_found",
            message: what,
            violations: Vec::new(),
        }),
    )
        .into_response()
}

/// `POST /api/analyses`
pub async fn create_analysis(
    Extension(state): Extension<AppState>,
    Json(body): Json<CreateAnalysisRequest>,
) -> Result<(StatusCode, Json<JobStatusView>), ApiError> {
    let new = NewAnalysisJob::builder()
        .token(body.token)
        .url(body.url)
        .max_retries(body.max_retries.unwrap_or(state.default_max_retries))
        .build();

    let job = state.store.create_job(new).await?;
    tracing::info!(job_id = %job.id, url = %job.url, "analysis job created");

    Ok((
        StatusCode::CREATED,
        Json(JobStatusView::project(job, chrono::Utc::now())),
    ))
}

/// `GET /api/analyses/:id`
pub async fn get_analysis(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    Ok(match state.status.get_status(job_id).await? {
        Some(view) => Json(view).into_response(),
        None => not_found(format!("job {job_id} not found")),
    })
}

/// `GET /api/analyses?token=...`
pub async fn get_analysis_by_token(
    Extension(state): Extension<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    Ok(match state.status.get_status_by_token(&query.token).await? {
        Some(view) => Json(view).into_response(),
        None => not_found("no job for this token".to_string()),
    })
}

/// `GET /api/queue/stats`
pub async fn queue_stats_handler(
    Extension(state): Extension<AppState>,
) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.status.queue_stats().await?))
}
