//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use incident::IncidentError;
use ingest::IngestError;
use schedule::InvalidScheduleError;
use store::StorageError;

/// Unified error type for route handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Incident(#[from] IncidentError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Schedule(#[from] InvalidScheduleError),
    #[error("rate limit exceeded")]
    RateLimited,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Ingest(IngestError::UnknownToken) => StatusCode::NOT_FOUND,
            Self::Ingest(IngestError::MonitorDisabled) => StatusCode::FORBIDDEN,
            Self::Ingest(IngestError::Incident(e)) => incident_status(e),
            Self::Ingest(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Incident(e) => incident_status(e),
            Self::Storage(StorageError::NotFound) => StatusCode::NOT_FOUND,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Schedule(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

fn incident_status(e: &IncidentError) -> StatusCode {
    match e {
        IncidentError::NotFound(_) => StatusCode::NOT_FOUND,
        IncidentError::InvalidTransition { .. } => StatusCode::CONFLICT,
        IncidentError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        IncidentError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
