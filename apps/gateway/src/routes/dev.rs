// Dev utilities (local-only helpers)
//
// These endpoints are not meant for production; they help during local
// development to mint tokens and seed the in-memory follow graph. They are
// mounted only when DEV_ROUTES=1.
use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::post, Json, Router};
use serde::Deserialize;
use serde_json::json;

use domain::UserId;

use crate::state::AppState;

/// Build router for dev-only helpers (unsafe for prod).
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/dev/token", post(mint_token))
        .route("/dev/follow", post(add_follow))
        .route("/dev/profile", post(set_profile))
}

#[derive(Deserialize)]
struct TokenRequest {
    user_id: UserId,
    ttl_secs: Option<usize>,
}

/// POST /dev/token — mint a JWT for a user id (dev only).
async fn mint_token(
    Json(req): Json<TokenRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let token = auth::create_jwt(req.user_id, req.ttl_secs.unwrap_or(3600))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "user_id": req.user_id, "token": token })))
}

#[derive(Deserialize)]
struct FollowRequest {
    follower: UserId,
    followee: UserId,
    /// When set, also create the reciprocal edge.
    mutual: Option<bool>,
}

/// POST /dev/follow — seed a follow edge into the in-memory graph.
async fn add_follow(
    State(state): State<AppState>,
    Json(req): Json<FollowRequest>,
) -> Json<serde_json::Value> {
    let backend = state.graph.backend();
    backend.follow(req.follower, req.followee);
    if req.mutual.unwrap_or(false) {
        backend.follow(req.followee, req.follower);
    }
    Json(json!({ "ok": true }))
}

#[derive(Deserialize)]
struct ProfileRequest {
    user_id: UserId,
    name: String,
}

/// POST /dev/profile — set a display name in the in-memory graph.
async fn set_profile(
    State(state): State<AppState>,
    Json(req): Json<ProfileRequest>,
) -> Json<serde_json::Value> {
    state.graph.backend().set_profile_name(req.user_id, req.name);
    Json(json!({ "ok": true }))
}
