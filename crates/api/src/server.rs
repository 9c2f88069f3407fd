//! Axum router and handlers for the control plane.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chainflow_collector::supervisor::{
    BackfillProgress, HealthReport, StartOutcome, StatusReport, StopOutcome, Supervisor,
};
use chainflow_core::StopReason;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The in-process engine supervisor.
    pub supervisor: Arc<Supervisor>,
}

#[derive(Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct StartResponse {
    started_at: i64,
}

#[derive(Serialize)]
struct StopResponse {
    stopped_at: i64,
    reason: StopReason,
}

#[derive(Serialize)]
struct ProgressResponse {
    chains: Vec<BackfillProgress>,
}

fn conflict(msg: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::CONFLICT,
        Json(ErrorResponse { error: msg.into() }),
    )
}

fn service_unavailable(msg: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse { error: msg.into() }),
    )
}

/// Build the control-plane router for the given state.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/backfill-progress", get(backfill_progress))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the control plane until shutdown, then drain the engine.
pub async fn run_with_config(supervisor: Arc<Supervisor>, port: u16) -> anyhow::Result<()> {
    let state = AppState {
        supervisor: Arc::clone(&supervisor),
    };
    let app = build_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("control plane listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain the run (if any) before the process exits.
    let _ = supervisor.stop().await;
    supervisor.storage().close().await;
    info!("control plane shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {}", err);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: "chainflow",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn start(
    State(state): State<AppState>,
) -> Result<Json<StartResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.supervisor.start().await {
        StartOutcome::Started { started_at } => Ok(Json(StartResponse { started_at })),
        StartOutcome::AlreadyRunning => Err(conflict("already_running")),
        StartOutcome::StoreUnreachable(reason) => {
            Err(service_unavailable(format!("store unreachable: {}", reason)))
        }
        StartOutcome::Rejected(reason) => Err(service_unavailable(reason)),
    }
}

async fn stop(
    State(state): State<AppState>,
) -> Result<Json<StopResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.supervisor.stop().await {
        StopOutcome::Stopped { stopped_at, reason } => {
            Ok(Json(StopResponse { stopped_at, reason }))
        }
        StopOutcome::NotRunning => Err(conflict("not_running")),
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.supervisor.status().await)
}

/// Always 200; the body carries the classification.
async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.supervisor.health().await)
}

async fn backfill_progress(State(state): State<AppState>) -> Json<ProgressResponse> {
    Json(ProgressResponse {
        chains: state.supervisor.backfill_progress().await,
    })
}
