use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::MasterConfig;
use crate::dispatch::allocator::RangeAllocator;
use crate::error::Result;

#[derive(Clone, Default)]
pub struct MasterState {
    pub allocator: Arc<RangeAllocator>,
}

impl MasterState {
    pub fn new(allocator: Arc<RangeAllocator>) -> Self {
        Self { allocator }
    }
}

/// Routes served by the master:
///
/// - `GET /get-range/:job_key/:total_calls/:chunk_size` → `"{start}-{end}"` or `"-1"`
/// - `GET /api/allocations` → JSON list of per-job cursors
pub fn router(state: MasterState) -> Router {
    Router::new()
        .route(
            "/get-range/:job_key/:total_calls/:chunk_size",
            get(get_range_handler),
        )
        .route("/api/allocations", get(list_allocations_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve range allocations on an already bound listener until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    state: MasterState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Starting range allocation server");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    tracing::info!(addr = %addr, "Range allocation server stopped");
    Ok(())
}

/// Bind the configured address and serve until `shutdown` fires.
pub async fn run_master(
    config: &MasterConfig,
    state: MasterState,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %config.listen_addr, error = %e, "Failed to bind master server");
            return Err(e.into());
        }
    };
    serve(listener, state, shutdown).await
}

async fn get_range_handler(
    State(state): State<MasterState>,
    Path((job_key, total_calls, chunk_size)): Path<(String, u64, u64)>,
    remote: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let remote_host = remote
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    match state
        .allocator
        .get_range(&job_key, total_calls, chunk_size)
        .await
    {
        Ok(range) => {
            tracing::info!(job_key = %job_key, range = %range, remote_host = %remote_host, "Sending range");
            (StatusCode::OK, range.to_string()).into_response()
        }
        Err(e) => {
            tracing::warn!(job_key = %job_key, remote_host = %remote_host, error = %e, "Rejected range request");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}

async fn list_allocations_handler(State(state): State<MasterState>) -> impl IntoResponse {
    Json(state.allocator.allocations().await)
}
