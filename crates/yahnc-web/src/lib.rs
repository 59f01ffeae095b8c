//! HTTP triggers for the poll and cleanup ticks.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};
use yahnc_core::ItemId;
use yahnc_storage::RecordStore;
use yahnc_sync::{Expirer, Reconciler, SyncRuntime, TickSummary};

pub const CRATE_NAME: &str = "yahnc-web";

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub expirer: Arc<Expirer>,
    pub store: Arc<dyn RecordStore>,
}

impl AppState {
    pub fn from_runtime(runtime: &SyncRuntime) -> Self {
        Self {
            reconciler: runtime.reconciler(),
            expirer: runtime.expirer(),
            store: runtime.store(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    service: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/poll", get(poll_handler).post(poll_handler))
        .route("/cleanup", get(cleanup_handler).post(cleanup_handler))
        .route("/records/{item_id}", get(record_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "web triggers listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub fn port_from_env() -> u16 {
    std::env::var("YAHNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

async fn health_handler() -> Json<Health> {
    Json(Health {
        status: "ok",
        service: CRATE_NAME,
    })
}

async fn poll_handler(State(state): State<Arc<AppState>>) -> Response {
    tick_response(state.reconciler.run_tick().await)
}

async fn cleanup_handler(State(state): State<Arc<AppState>>) -> Response {
    tick_response(state.expirer.run_tick().await)
}

async fn record_handler(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<i64>,
) -> Response {
    match state.store.get(ItemId(item_id)).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(%item_id, error = %err, "record lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

fn tick_response(summary: TickSummary) -> Response {
    let status = if summary.is_completed() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(summary)).into_response()
}
