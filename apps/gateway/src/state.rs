// App state and shared helpers
//
// This module defines:
// - AppState: the shared services the app uses (KV, bus, graph, presence
//   store, session registry, config). We store them in Arc<> so they can be
//   cheaply cloned and used by async handlers across threads.
// - SessionRegistry: the per-process record of live sockets.
// - A small token extraction helper used by the HTTP and WS routes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::HeaderMap;
use parking_lot::RwLock;

use bus::Bus;
use domain::UserId;
use graph::{CachedGraph, MemGraph};
use kv::Kv;
use presence::{PresenceConfig, PresenceStore};

/// Shared app state cloned into request handlers via `State(AppState)`.
#[derive(Clone)]
pub struct AppState {
    pub kv: Arc<Kv>,
    pub bus: Arc<Bus>,
    pub graph: Arc<CachedGraph<MemGraph>>,
    pub presence: Arc<PresenceStore>,
    pub registry: Arc<SessionRegistry>,
    pub cfg: Arc<PresenceConfig>,
}

/// Live sockets on this instance. Written only on connect/disconnect; the
/// lock is a plain reader/writer lock and is never held across an await.
#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: RwLock<HashMap<u64, UserId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user: UserId) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().insert(id, user);
        id
    }

    pub fn unregister(&self, id: u64) {
        self.sessions.write().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }
}

/// Read a bearer token from the Authorization header (not verified here).
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|hv| hv.to_str().ok())
        .and_then(|s| {
            let s_trim = s.trim();
            if s_trim.len() > 7 && s_trim[..7].eq_ignore_ascii_case("bearer ") {
                Some(s_trim[7..].to_string())
            } else {
                None
            }
        })
}
