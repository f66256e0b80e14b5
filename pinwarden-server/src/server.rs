use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use pinwarden_core::{Result, WardenSnapshot};
use std::future::Future;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ServerState {
    pub snapshots: watch::Receiver<Option<WardenSnapshot>>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server<F>(bind_addr: &str, state: ServerState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("reporting server listening on {}", bind_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let last_snapshot = state
        .snapshots
        .borrow()
        .as_ref()
        .map(|snapshot| snapshot.taken_at.to_rfc3339());

    let response = serde_json::json!({
        "status": "ok",
        "last_snapshot": last_snapshot,
    });

    (StatusCode::OK, Json(response))
}

async fn stats_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let snapshot = state.snapshots.borrow().clone();
    match snapshot {
        Some(snapshot) => (StatusCode::OK, Json(serde_json::json!(snapshot))),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "no snapshot taken yet" })),
        ),
    }
}
