//! Sync distributor: HTTP surface, WebSocket fan-out and refresh triggers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arbor_protocol::{
    ArchiveFeatureRequest, CommandResponse, CreateFeatureRequest, CreateFromBranchRequest,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::engine::SnapshotEngine;
use crate::error::EngineError;
use crate::websocket::ws_handler;

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
    /// Coarse timer that refreshes even when nothing on disk changed.
    pub refresh_interval: Duration,
    pub debounce: Duration,
    /// Directories watched for changes.
    pub watch_roots: Vec<PathBuf>,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 4100,
            ws_path: "/ws".into(),
            refresh_interval: Duration::from_secs(10),
            debounce: Duration::from_millis(250),
            watch_roots: Vec::new(),
        }
    }
}

impl DistributorConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SnapshotEngine>,
}

/// Routes: the WebSocket at `ws_path`, `/health`, and the operator API.
/// Anything else is a 404.
pub fn router(engine: Arc<SnapshotEngine>, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/features", post(create_feature_handler))
        .route("/api/features/from-branch", post(create_from_branch_handler))
        .route("/api/features/archive", post(archive_feature_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(AppState { engine })
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidName { .. } | EngineError::UnknownProject(_) => {
            StatusCode::BAD_REQUEST
        }
        EngineError::AlreadyExists(_) => StatusCode::CONFLICT,
        EngineError::Mutation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Discovery(_) | EngineError::NotReflected { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn command_reply(
    action: &'static str,
    result: Result<Option<String>, EngineError>,
) -> (StatusCode, Json<CommandResponse>) {
    match result {
        Ok(path) => (StatusCode::OK, Json(CommandResponse::ok(path))),
        Err(err) => {
            warn!(
                component = "api",
                event = "api.command.failed",
                action,
                code = err.code(),
                error = %err,
            );
            (
                status_for(&err),
                Json(CommandResponse::failed(err.code(), err.to_string())),
            )
        }
    }
}

async fn create_feature_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateFeatureRequest>,
) -> (StatusCode, Json<CommandResponse>) {
    let result = state
        .engine
        .create_feature(&req.project, &req.name)
        .await
        .map(|path| Some(path.to_string_lossy().into_owned()));
    command_reply("create_feature", result)
}

async fn create_from_branch_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateFromBranchRequest>,
) -> (StatusCode, Json<CommandResponse>) {
    let result = state
        .engine
        .create_from_branch(&req.project, &req.remote_branch, &req.local_name)
        .await
        .map(|path| Some(path.to_string_lossy().into_owned()));
    command_reply("create_from_branch", result)
}

async fn archive_feature_handler(
    State(state): State<AppState>,
    Json(req): Json<ArchiveFeatureRequest>,
) -> (StatusCode, Json<CommandResponse>) {
    let result = state
        .engine
        .archive_feature(&req.project, Path::new(&req.path), &req.feature)
        .await
        .map(|()| None);
    command_reply("archive_feature", result)
}

/// What asked for a refresh. Decides whether a busy engine skips the
/// request or queues one trailing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// Periodic tick: skipped while a refresh runs, the next tick catches up.
    Timer,
    /// Something changed on disk: must be observed by a later pass.
    Watcher,
}

impl RefreshTrigger {
    fn as_str(self) -> &'static str {
        match self {
            RefreshTrigger::Timer => "timer",
            RefreshTrigger::Watcher => "watcher",
        }
    }
}

pub async fn trigger_refresh(engine: &SnapshotEngine, trigger: RefreshTrigger) {
    let outcome = match trigger {
        RefreshTrigger::Timer => engine.try_refresh().await,
        RefreshTrigger::Watcher => Some(engine.request_refresh().await),
    };
    match outcome {
        None => debug!(
            component = "distributor",
            event = "distributor.refresh.skipped",
            trigger = trigger.as_str(),
        ),
        Some(Ok(changed)) => debug!(
            component = "distributor",
            event = "distributor.refresh.done",
            trigger = trigger.as_str(),
            changed,
        ),
        // Already logged and broadcast by the engine.
        Some(Err(_)) => {}
    }
}

/// Refresh immediately, then every `interval`.
pub fn spawn_refresh_timer(engine: Arc<SnapshotEngine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            component = "distributor",
            event = "distributor.timer.started",
            interval_ms = interval.as_millis() as u64,
        );
        loop {
            ticker.tick().await;
            trigger_refresh(&engine, RefreshTrigger::Timer).await;
        }
    })
}
