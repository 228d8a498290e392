// Synchronous presence query
//
// GET /presence/leaderboard?limit=N returns the caller's mutuals with their
// effective statuses, online users first. The heavy lifting lives in the
// roster crate; this handler does auth, parameter validation, and display
// name enrichment.
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde_json::json;
use std::collections::HashMap;

use domain::now_epoch;
use graph::FollowGraph;
use roster::RosterError;

use crate::state::{extract_token, AppState};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

pub fn router() -> Router<AppState> {
    Router::new().route("/presence/leaderboard", get(leaderboard))
}

async fn leaderboard(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let token = extract_token(&headers)
        .ok_or((StatusCode::UNAUTHORIZED, "missing authorization".to_string()))?;
    let requester = auth::user_from_token(&token)
        .map_err(|_| (StatusCode::UNAUTHORIZED, "invalid token".to_string()))?;

    let limit = match q.get("limit") {
        None => DEFAULT_LIMIT,
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if (1..=MAX_LIMIT).contains(&n) => n,
            _ => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    format!("limit must be between 1 and {}", MAX_LIMIT),
                ))
            }
        },
    };

    let now = now_epoch();
    let friends = roster::online_friends(requester, limit, state.graph.as_ref(), &state.presence, now)
        .await
        .map_err(|e| match e {
            RosterError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "presence data unavailable".to_string(),
            ),
            RosterError::Graph(err) => {
                tracing::warn!(err = %err, "leaderboard lost the graph store");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "social graph unavailable".to_string(),
                )
            }
        })?;

    let mut entries = Vec::with_capacity(friends.len());
    for f in friends {
        let profile_name = state.graph.profile_name(f.user_id).await.ok().flatten();
        entries.push(json!({
            "user_id": f.user_id,
            "profile_name": profile_name,
            "status": f.status,
            "last_seen": f.last_seen,
        }));
    }
    Ok(Json(json!({ "friends": entries })))
}
