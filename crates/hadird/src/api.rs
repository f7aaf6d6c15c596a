//! HTTP interface.
//!
//! Errors are returned as `{ "error": message }`. A recognition conflict
//! additionally carries the matched student under `match` so a client can
//! say who was already checked in.

use crate::photo::content_type;
use crate::service::{
    AttendanceService, DayRoll, EnrollRequest, EnrollResponse, MarkRequest, MatchedStudent,
    RecognizeRequest, RecognizeResponse, ServiceError, ServiceStatus,
};
use crate::store::AttendanceRecord;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub fn router(service: AttendanceService, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/students/:id/enroll-face", post(enroll_face))
        .route("/attendance", get(day_roll))
        .route("/attendance/recognize", post(recognize))
        .route("/attendance/mark", post(mark))
        .route("/uploads/:file", get(upload))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(service)
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Body(#[from] JsonRejection),
    #[error("{0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    matched: Option<MatchedStudent>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, matched) = match self {
            ApiError::Service(ServiceError::Validation(msg)) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::Service(ServiceError::NotFound(msg)) => (StatusCode::NOT_FOUND, msg, None),
            ApiError::Service(ServiceError::PayloadTooLarge(msg)) => {
                (StatusCode::PAYLOAD_TOO_LARGE, msg, None)
            }
            ApiError::Service(ServiceError::AlreadyRecorded { matched }) => (
                StatusCode::CONFLICT,
                "attendance already recorded today".to_string(),
                matched,
            ),
            ApiError::Service(e) => {
                tracing::error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, internal_message(&e), None)
            }
            ApiError::Body(rejection) => {
                let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::BAD_REQUEST
                };
                (status, rejection.body_text(), None)
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string(), None),
        };
        (status, Json(ErrorBody { error, matched })).into_response()
    }
}

fn internal_message(e: &ServiceError) -> String {
    if cfg!(debug_assertions) {
        e.to_string()
    } else {
        "internal error".to_string()
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(svc): State<AttendanceService>) -> Result<Json<ServiceStatus>, ApiError> {
    Ok(Json(svc.status().await?))
}

async fn enroll_face(
    State(svc): State<AttendanceService>,
    Path(id): Path<String>,
    body: Result<Json<EnrollRequest>, JsonRejection>,
) -> Result<Json<EnrollResponse>, ApiError> {
    let Json(request) = body?;
    Ok(Json(svc.enroll_face(&id, request).await?))
}

async fn recognize(
    State(svc): State<AttendanceService>,
    body: Result<Json<RecognizeRequest>, JsonRejection>,
) -> Result<Json<RecognizeResponse>, ApiError> {
    let Json(request) = body?;
    Ok(Json(svc.recognize(request).await?))
}

async fn mark(
    State(svc): State<AttendanceService>,
    body: Result<Json<MarkRequest>, JsonRejection>,
) -> Result<Json<AttendanceRecord>, ApiError> {
    let Json(request) = body?;
    Ok(Json(svc.mark(request).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RollQuery {
    #[serde(default)]
    class_id: String,
    date: Option<String>,
}

async fn day_roll(
    State(svc): State<AttendanceService>,
    Query(query): Query<RollQuery>,
) -> Result<Json<DayRoll>, ApiError> {
    let date = match query.date.as_deref().filter(|d| !d.is_empty()) {
        Some(raw) => Some(
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|_| ApiError::BadRequest(format!("invalid date: {raw}")))?,
        ),
        None => None,
    };
    Ok(Json(svc.day_roll(&query.class_id, date).await?))
}

async fn upload(
    State(svc): State<AttendanceService>,
    Path(file): Path<String>,
) -> Result<Response, ApiError> {
    let path = svc.photos().resolve(&file).ok_or(ApiError::NotFound)?;
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, content_type(&file))], bytes).into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ApiError::NotFound),
        Err(e) => Err(ServiceError::Io(e).into()),
    }
}
