// WebSocket endpoint `/ws`
//
// Flow:
// 1) HTTP GET upgrades to WebSocket via `WebSocketUpgrade`.
// 2) The caller must present a valid JWT (query `token` or
//    `Authorization: Bearer`); presence sessions are never anonymous, so a
//    missing or bad token rejects the upgrade with 401.
// 3) The accepted socket is handed to `session::run`, which owns it until
//    disconnect.
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use serde::Deserialize;

use crate::session;
use crate::state::{extract_token, AppState};

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Build router for WebSocket upgrades.
pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

/// HTTP handler that performs the WS upgrade and defers to `session::run`.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    let token = q.token.clone().or_else(|| extract_token(&headers));
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };
    let self_user = match auth::user_from_token(&token) {
        Ok(user) => user,
        Err(e) => {
            tracing::debug!(err = %e, "rejecting ws upgrade");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    };

    ws.on_upgrade(move |socket| session::run(socket, state, self_user))
        .into_response()
}
