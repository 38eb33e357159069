//! Ping Route
//!
//! The hot path: jobs hit this with curl from cron lines, so both GET and
//! POST are accepted and every parameter is optional.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use ingest::{PingEvent, PingState};

use crate::error::ApiError;
use crate::AppState;

/// Query parameters for the ping endpoint
#[derive(Debug, Default, Deserialize)]
pub struct PingQuery {
    #[serde(default)]
    pub state: Option<PingState>,
    #[serde(rename = "durationMs")]
    pub duration_ms: Option<u64>,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
}

/// Record a ping for the monitor owning `token`.
pub async fn handle_ping(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(params): Query<PingQuery>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    if state.limiter.check_key(&token).is_err() {
        return Err(ApiError::RateLimited);
    }

    let event = PingEvent {
        state: params.state.unwrap_or(PingState::Success),
        duration_ms: params.duration_ms,
        exit_code: params.exit_code,
        output_bytes: (!body.is_empty()).then(|| body.len() as u64),
    };

    let ack = state.processor.handle(&token, event, Utc::now()).await?;
    Ok(Json(json!({
        "status": "ok",
        "message": ack.message,
        "nextDueAt": ack.next_due_at,
    })))
}
