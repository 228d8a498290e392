// Root and health endpoints
// - `/` responds with a simple HTML string (smoke-test endpoint)
// - `/healthz` is used by orchestrators/containers to check liveness; it
//   answers 503 while the KV is unreachable, since every status read would
//   degrade to "offline" in that state.
use axum::{extract::State, http::StatusCode, response::Html, routing::get, Router};
use crate::state::AppState;

/// Build the router for root/health endpoints.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
}

/// GET /
/// Minimal HTML so hitting the gateway in a browser shows it is up.
async fn root(State(state): State<AppState>) -> Html<String> {
    Html(format!("Presence gateway up ({} sessions)", state.registry.len()))
}

/// GET /healthz
async fn healthz(State(state): State<AppState>) -> Result<&'static str, (StatusCode, String)> {
    match state.kv.ping().await {
        Ok(()) => Ok("ok"),
        Err(e) => {
            tracing::warn!(err = %e, "health probe failed against the kv");
            Err((StatusCode::SERVICE_UNAVAILABLE, "kv unreachable".to_string()))
        }
    }
}
