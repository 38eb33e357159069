//! Incident Routes
//!
//! Operator actions. Each lifecycle transition is applied synchronously and
//! its notification fan-out enqueued; the HTTP response never waits on a
//! channel delivery.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use incident::SnoozeRequest;
use store::{Incident, IncidentEvent, IncidentStatus, IncidentTransition, WorkItem};

use crate::error::ApiError;
use crate::AppState;

/// Query parameters for incident listing
#[derive(Debug, Deserialize)]
pub struct IncidentQuery {
    pub status: Option<IncidentStatus>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct IncidentListResponse {
    pub data: Vec<Incident>,
    pub count: usize,
    pub open_count: usize,
}

/// Body for operator transitions; the actor lands in the audit trail.
#[derive(Debug, Default, Deserialize)]
pub struct ActionRequest {
    #[serde(default = "default_actor")]
    pub actor: String,
}

fn default_actor() -> String {
    "operator".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SnoozeBody {
    pub minutes: Option<u64>,
    pub until: Option<DateTime<Utc>>,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Serialize)]
pub struct IncidentDetail {
    #[serde(flatten)]
    pub incident: Incident,
    pub events: Vec<IncidentEvent>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IncidentQuery>,
) -> Result<Json<IncidentListResponse>, ApiError> {
    let data = state.repo.list_incidents(params.status, params.limit)?;
    Ok(Json(IncidentListResponse {
        count: data.len(),
        open_count: state.repo.open_incident_count(),
        data,
    }))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<IncidentDetail>, ApiError> {
    let incident = state.repo.incident(id)?;
    let events = state.repo.events_for(id)?;
    Ok(Json(IncidentDetail { incident, events }))
}

pub async fn acknowledge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ActionRequest>,
) -> Result<Json<Incident>, ApiError> {
    let incident = state.incidents.acknowledge(id, &req.actor, Utc::now())?;
    state
        .enqueue(WorkItem::Transition {
            incident_id: id,
            transition: IncidentTransition::Acknowledged,
        })
        .await;
    Ok(Json(incident))
}

pub async fn resolve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ActionRequest>,
) -> Result<Json<Incident>, ApiError> {
    let incident = state.incidents.resolve(id, &req.actor, Utc::now())?;
    state
        .enqueue(WorkItem::Transition {
            incident_id: id,
            transition: IncidentTransition::Resolved,
        })
        .await;
    Ok(Json(incident))
}

/// Snooze is not a lifecycle transition; nothing fans out.
pub async fn snooze(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<SnoozeBody>,
) -> Result<Json<Incident>, ApiError> {
    let incident = state.incidents.snooze(
        id,
        SnoozeRequest {
            minutes: req.minutes,
            until: req.until,
        },
        &req.actor,
        Utc::now(),
    )?;
    Ok(Json(incident))
}

pub async fn unsnooze(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(req): Query<ActionRequest>,
) -> Result<Json<Incident>, ApiError> {
    let incident = state.incidents.unsnooze(id, &req.actor, Utc::now())?;
    Ok(Json(incident))
}
