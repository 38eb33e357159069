//! Cronwatch API Server
//!
//! HTTP surface and wiring: ping ingestion, monitor and incident management,
//! the background missed-run scanner, and the pipeline workers that turn
//! detections into incidents and alerts.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use alerting::{AlertDispatcher, AlertSender, DispatcherConfig, HttpSenders, SuppressionGate};
use incident::IncidentManager;
use ingest::PingProcessor;
use scanner::{MissedRunScanner, ScannerConfig};
use store::{Repository, WorkItem};

mod config;
mod error;
mod pipeline;
mod rate_limit;
mod routes;

pub use config::{AppConfig, ConfigError, PipelineConfig, ScannerSettings, ServerConfig};
pub use error::ApiError;
pub use pipeline::{process, spawn_workers};
pub use rate_limit::{ping_limiter, TokenRateLimiter};

/// Application state shared across handlers
pub struct AppState {
    pub repo: Arc<Repository>,
    pub processor: PingProcessor,
    pub incidents: Arc<IncidentManager>,
    pub queue: mpsc::Sender<WorkItem>,
    pub limiter: TokenRateLimiter,
    pub version: String,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Enqueue without awaiting downstream; only a full queue blocks.
    pub async fn enqueue(&self, item: WorkItem) {
        if let Err(mpsc::error::TrySendError::Full(item)) = self.queue.try_send(item) {
            if self.queue.send(item).await.is_err() {
                warn!("work queue closed, dropping work item");
            }
        }
    }
}

/// A wired service: shared state plus its background tasks.
pub struct Service {
    pub state: Arc<AppState>,
    pub scanner: MissedRunScanner,
    pub workers: Vec<JoinHandle<()>>,
}

/// Wire the pipeline around a repository and an alert sender.
pub fn build_service(
    repo: Arc<Repository>,
    config: &AppConfig,
    sender: Arc<dyn AlertSender>,
) -> Service {
    let (tx, rx) = mpsc::channel(config.pipeline.queue_depth);

    let incidents = Arc::new(IncidentManager::new(Arc::clone(&repo)));
    let dispatcher = Arc::new(AlertDispatcher::new(
        Arc::clone(&repo),
        SuppressionGate::new(Arc::clone(&repo)),
        sender,
        DispatcherConfig::default(),
    ));
    let workers = pipeline::spawn_workers(
        config.pipeline.workers,
        rx,
        Arc::clone(&incidents),
        dispatcher,
    );

    let scanner = MissedRunScanner::new(
        Arc::clone(&repo),
        tx.clone(),
        ScannerConfig {
            sweep_interval: Duration::from_secs(config.scanner.sweep_interval_sec),
        },
    );

    let processor = PingProcessor::new(
        Arc::clone(&repo),
        IncidentManager::new(Arc::clone(&repo)),
        tx.clone(),
    );

    let state = Arc::new(AppState {
        repo,
        processor,
        incidents,
        queue: tx,
        limiter: rate_limit::ping_limiter(config.server.ping_rate_per_minute),
        version: env!("CARGO_PKG_VERSION").to_string(),
        start_time: std::time::Instant::now(),
    });

    Service {
        state,
        scanner,
        workers,
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub metrics: SystemMetrics,
}

/// System metrics
#[derive(Debug, Serialize)]
pub struct SystemMetrics {
    pub monitor_count: usize,
    pub open_incident_count: usize,
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route(
            "/api/v1/ping/:token",
            get(routes::ping::handle_ping).post(routes::ping::handle_ping),
        )
        .route(
            "/api/v1/monitors",
            get(routes::monitors::list).post(routes::monitors::create),
        )
        .route("/api/v1/monitors/:id", get(routes::monitors::get))
        .route("/api/v1/incidents", get(routes::incidents::list))
        .route("/api/v1/incidents/:id", get(routes::incidents::get))
        .route("/api/v1/incidents/:id/ack", post(routes::incidents::acknowledge))
        .route(
            "/api/v1/incidents/:id/resolve",
            post(routes::incidents::resolve),
        )
        .route(
            "/api/v1/incidents/:id/snooze",
            post(routes::incidents::snooze).delete(routes::incidents::unsnooze),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let response = HealthResponse {
        status: "healthy".to_string(),
        timestamp,
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        metrics: SystemMetrics {
            monitor_count: state.repo.monitor_count(),
            open_incident_count: state.repo.open_incident_count(),
        },
    };

    (StatusCode::OK, Json(response))
}

/// Initialize logging
pub fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();

    // A second init (tests) keeps the first subscriber.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Run the server
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let repo = Arc::new(Repository::new());
    let service = build_service(Arc::clone(&repo), &config, Arc::new(HttpSenders::new()));

    let scanner = service.scanner;
    tokio::spawn(async move { scanner.run().await });

    let app = create_router(service.state);
    let addr = config.bind_addr();
    info!(%addr, "starting cronwatch API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use incident::IncidentManager;
    use schedule::ScheduleSpec;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use store::{
        AlertChannel, ChannelConfig, IncidentKind, IncidentStatus, IncidentTransition, Monitor,
        MonitorStatus,
    };
    use uuid::Uuid;

    /// Records every note instead of sending it anywhere.
    struct RecordingSender {
        sent: Mutex<Vec<(IncidentKind, IncidentTransition)>>,
    }

    impl RecordingSender {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AlertSender for RecordingSender {
        async fn send(
            &self,
            _config: &ChannelConfig,
            note: &alerting::AlertNote,
        ) -> Result<Option<String>, alerting::SenderError> {
            self.sent
                .lock()
                .unwrap()
                .push((note.kind, note.transition));
            Ok(None)
        }
    }

    /// Full pipeline, driven with explicit clocks: a monitor on a 3600s
    /// interval with 300s grace gets no ping, the sweep past the grace
    /// cutoff opens exactly one MISSED incident, and a later success ping
    /// auto-resolves it.
    #[tokio::test]
    async fn test_missed_then_recovered_end_to_end() {
        let repo = Arc::new(Repository::new());
        let t0 = Utc::now();

        let mut monitor = Monitor::new(
            Uuid::new_v4(),
            "nightly-backup",
            "tok-e2e",
            ScheduleSpec::interval(3600),
            300,
        );
        monitor.next_due_at = Some(t0 + ChronoDuration::seconds(3600));
        repo.insert_monitor(monitor.clone()).unwrap();
        repo.insert_channel(AlertChannel {
            id: Uuid::new_v4(),
            org_id: monitor.org_id,
            name: "hooks".to_string(),
            config: ChannelConfig::Webhook {
                url: "https://example.invalid/hook".to_string(),
                headers: HashMap::new(),
            },
        })
        .unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let incidents = IncidentManager::new(Arc::clone(&repo));
        let sender = Arc::new(RecordingSender::new());
        let dispatcher = AlertDispatcher::new(
            Arc::clone(&repo),
            SuppressionGate::new(Arc::clone(&repo)),
            Arc::clone(&sender) as Arc<dyn AlertSender>,
            DispatcherConfig::default(),
        );
        let sweeper =
            MissedRunScanner::new(Arc::clone(&repo), tx.clone(), ScannerConfig::default());
        let processor = PingProcessor::new(
            Arc::clone(&repo),
            IncidentManager::new(Arc::clone(&repo)),
            tx.clone(),
        );

        // Past due + grace with no ping: the sweep classifies MISSED and
        // advances the schedule past the missed occurrence.
        let summary = sweeper
            .sweep(t0 + ChronoDuration::seconds(3901))
            .await
            .unwrap();
        assert_eq!(summary.missed, 1);
        let missed = repo.monitor(monitor.id).unwrap();
        assert_eq!(missed.status, MonitorStatus::Missed);
        assert_eq!(
            missed.next_due_at,
            Some(t0 + ChronoDuration::seconds(3901 + 3600))
        );

        // A second sweep sees the future due time and adds nothing.
        let summary = sweeper
            .sweep(t0 + ChronoDuration::seconds(3960))
            .await
            .unwrap();
        assert_eq!(summary.missed, 0);

        while let Ok(item) = rx.try_recv() {
            pipeline::process(&incidents, &dispatcher, item).await;
        }
        let open = repo
            .list_incidents(Some(IncidentStatus::Open), 10)
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, IncidentKind::Missed);

        // The job finally reports in, inside the fresh grace window.
        processor
            .handle(
                "tok-e2e",
                ingest::PingEvent {
                    state: ingest::PingState::Success,
                    duration_ms: Some(1200),
                    ..ingest::PingEvent::default()
                },
                t0 + ChronoDuration::seconds(4000),
            )
            .await
            .unwrap();

        while let Ok(item) = rx.try_recv() {
            pipeline::process(&incidents, &dispatcher, item).await;
        }

        let recovered = repo.monitor(monitor.id).unwrap();
        assert_eq!(recovered.status, MonitorStatus::Ok);
        assert_eq!(
            recovered.next_due_at,
            Some(t0 + ChronoDuration::seconds(4000 + 3600))
        );
        assert!(repo
            .list_incidents(Some(IncidentStatus::Open), 10)
            .unwrap()
            .is_empty());
        let resolved = repo
            .list_incidents(Some(IncidentStatus::Resolved), 10)
            .unwrap();
        assert_eq!(resolved.len(), 1);

        // The channel saw the open and the resolution, nothing else.
        let sent = sender.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![
                (IncidentKind::Missed, IncidentTransition::Opened),
                (IncidentKind::Missed, IncidentTransition::Resolved),
            ]
        );
    }

    /// A started run past grace is flagged LATE by the sweep; the late
    /// completion ping that follows must collapse into that same incident,
    /// not open a second one.
    #[tokio::test]
    async fn test_sweep_and_late_ping_converge_on_one_incident() {
        let repo = Arc::new(Repository::new());
        let t0 = Utc::now();
        let mut monitor = Monitor::new(
            Uuid::new_v4(),
            "nightly-backup",
            "tok-late",
            ScheduleSpec::interval(3600),
            300,
        );
        let due = t0 - ChronoDuration::hours(1);
        monitor.next_due_at = Some(due);
        repo.insert_monitor(monitor.clone()).unwrap();
        repo.insert_run(store::Run::started(monitor.id, due))
            .unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let incidents = IncidentManager::new(Arc::clone(&repo));
        let sender = Arc::new(RecordingSender::new());
        let dispatcher = AlertDispatcher::new(
            Arc::clone(&repo),
            SuppressionGate::new(Arc::clone(&repo)),
            Arc::clone(&sender) as Arc<dyn AlertSender>,
            DispatcherConfig::default(),
        );
        let sweeper =
            MissedRunScanner::new(Arc::clone(&repo), tx.clone(), ScannerConfig::default());
        let processor = PingProcessor::new(
            Arc::clone(&repo),
            IncidentManager::new(Arc::clone(&repo)),
            tx.clone(),
        );

        sweeper.sweep(t0).await.unwrap();
        processor
            .handle(
                "tok-late",
                ingest::PingEvent {
                    state: ingest::PingState::Success,
                    duration_ms: Some(900),
                    ..ingest::PingEvent::default()
                },
                t0,
            )
            .await
            .unwrap();

        while let Ok(item) = rx.try_recv() {
            pipeline::process(&incidents, &dispatcher, item).await;
        }

        let open = repo
            .list_incidents(Some(IncidentStatus::Open), 10)
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, IncidentKind::Late);
    }

    #[tokio::test]
    async fn test_workers_drain_the_queue() {
        let repo = Arc::new(Repository::new());
        let t0 = Utc::now();
        let mut monitor = Monitor::new(
            Uuid::new_v4(),
            "hourly-sync",
            "tok-worker",
            ScheduleSpec::interval(3600),
            300,
        );
        monitor.next_due_at = Some(t0 - ChronoDuration::hours(1));
        repo.insert_monitor(monitor.clone()).unwrap();

        let config = AppConfig::default();
        let sender = Arc::new(RecordingSender::new());
        let service = build_service(
            Arc::clone(&repo),
            &config,
            Arc::clone(&sender) as Arc<dyn AlertSender>,
        );

        service.scanner.sweep(t0).await.unwrap();

        // Closing the queue lets the workers finish what they picked up.
        drop(service.scanner);
        drop(service.state);
        for worker in service.workers {
            worker.await.unwrap();
        }

        let open = repo
            .list_incidents(Some(IncidentStatus::Open), 10)
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, IncidentKind::Missed);
    }
}
