//! Monitor Routes

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use schedule::{compute_next_due_at, ScheduleSpec};
use store::Monitor;

use crate::error::ApiError;
use crate::AppState;

/// Request body for monitor creation
#[derive(Debug, Deserialize)]
pub struct CreateMonitorRequest {
    pub org_id: Uuid,
    pub name: String,
    pub schedule: ScheduleSpec,
    #[serde(default)]
    pub grace_sec: u32,
    pub timeout_sec: Option<u32>,
    /// Ping routing key; generated when omitted
    pub token: Option<String>,
}

/// Create a monitor, validating its schedule and seeding the first due time.
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateMonitorRequest>,
) -> Result<(StatusCode, Json<Monitor>), ApiError> {
    req.schedule.validate()?;
    let now = Utc::now();
    let next_due_at = compute_next_due_at(&req.schedule, now)?;

    let token = req
        .token
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let mut monitor = Monitor::new(req.org_id, req.name, token, req.schedule, req.grace_sec);
    monitor.timeout_sec = req.timeout_sec;
    monitor.next_due_at = Some(next_due_at);

    state.repo.insert_monitor(monitor.clone())?;
    info!(monitor_id = %monitor.id, name = %monitor.name, "monitor created");
    Ok((StatusCode::CREATED, Json(monitor)))
}

pub async fn list(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Monitor>>, ApiError> {
    Ok(Json(state.repo.list_monitors()?))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Monitor>, ApiError> {
    Ok(Json(state.repo.monitor(id)?))
}
