//! Axum Handlers for the REST API
//!
//! Read access to completed examinations, scoped by the `x-device-id` header.
//! It uses `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::{
    models::{ErrorResponse, SavedSession},
    state::AppState,
};

pub const DEVICE_ID_HEADER: &str = "x-device-id";

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn device_id(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(DEVICE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{} header is required", DEVICE_ID_HEADER)))
}

/// List completed sessions for a device, newest first.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "Up to 50 sessions, newest first", body = [SavedSession]),
        (status = 400, description = "Missing device id", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("x-device-id" = String, Header, description = "The device the sessions belong to")
    )
)]
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SavedSession>>, ApiError> {
    let device_id = device_id(&headers)?;
    let sessions = state.store.load_sessions(device_id).await?;
    Ok(Json(sessions))
}

/// Get a specific session by its ID.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    responses(
        (status = 200, description = "Session details", body = SavedSession),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-device-id" = String, Header, description = "The device the session belongs to")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let device_id = device_id(&headers)?;

    let session = state
        .store
        .load_session(id, device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session with id '{}' not found", id)))?;

    Ok((StatusCode::OK, Json(session)))
}
