// Route module aggregator
//
// Each submodule defines a focused set of routes. This module exposes a
// single `all()` function to compose them into one router which is then
// wired up in main.rs.
use axum::Router;
use crate::state::AppState;

pub mod dev;
pub mod leaderboard;
pub mod root;
pub mod ws;

/// Merge all route groups into a single router. Dev helpers are only
/// mounted when explicitly asked for (`DEV_ROUTES=1`).
pub fn all(dev_routes: bool) -> Router<AppState> {
    let mut router = Router::new()
        .merge(root::router())
        .merge(ws::router())
        .merge(leaderboard::router());
    if dev_routes {
        router = router.merge(dev::router());
    }
    router
}
