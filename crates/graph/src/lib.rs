// Follow-graph adapter.
//
// Presence subscriptions are gated on mutual follow, so the only questions
// this crate answers are "are these two users mutuals?", "who are this
// user's mutuals?" and "what is this user's display name?". The durable
// social-graph store lives elsewhere; `MemGraph` is the in-process backend
// used for dev and tests, and `CachedGraph` is the wrapper the gateway puts
// in front of whichever backend is wired in.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use domain::UserId;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph store unavailable: {0}")]
    Unavailable(String),
}

/// The social-graph interface the presence plane depends on. Callers treat
/// `Unavailable` as authorization denied rather than guessing.
#[async_trait]
pub trait FollowGraph: Send + Sync {
    /// Mutual-follow check, short-circuiting: false as soon as `a -> b` is
    /// absent, otherwise the answer is `b -> a`.
    async fn is_mutual(&self, a: UserId, b: UserId) -> Result<bool, GraphError>;

    /// All users mutually followed with `user`.
    async fn mutuals_of(&self, user: UserId) -> Result<Vec<UserId>, GraphError>;

    /// Display name, if the graph store has one for this user.
    async fn profile_name(&self, user: UserId) -> Result<Option<String>, GraphError>;
}

#[derive(Default)]
struct MemState {
    follows: HashSet<(UserId, UserId)>,
    names: HashMap<UserId, String>,
}

/// In-memory follow graph. Writes happen on the dev seeding routes and in
/// tests; reads are lock-held only long enough to scan.
#[derive(Default)]
pub struct MemGraph {
    state: RwLock<MemState>,
}

impl MemGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn follow(&self, follower: UserId, followee: UserId) {
        self.state.write().follows.insert((follower, followee));
    }

    pub fn unfollow(&self, follower: UserId, followee: UserId) {
        self.state.write().follows.remove(&(follower, followee));
    }

    pub fn set_profile_name(&self, user: UserId, name: impl Into<String>) {
        self.state.write().names.insert(user, name.into());
    }
}

#[async_trait]
impl FollowGraph for MemGraph {
    async fn is_mutual(&self, a: UserId, b: UserId) -> Result<bool, GraphError> {
        let st = self.state.read();
        if !st.follows.contains(&(a, b)) {
            return Ok(false);
        }
        Ok(st.follows.contains(&(b, a)))
    }

    async fn mutuals_of(&self, user: UserId) -> Result<Vec<UserId>, GraphError> {
        let st = self.state.read();
        let mut out: Vec<UserId> = st
            .follows
            .iter()
            .filter(|(a, b)| *a == user && st.follows.contains(&(*b, *a)))
            .map(|(_, b)| *b)
            .collect();
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }

    async fn profile_name(&self, user: UserId) -> Result<Option<String>, GraphError> {
        Ok(self.state.read().names.get(&user).cloned())
    }
}

/// Default bound on cached pairs; enough to absorb a subscribe burst from a
/// reconnecting fleet without growing unbounded.
const CACHE_CAPACITY: usize = 4096;

/// How long a positive answer may be served from cache.
const CACHE_TTL: Duration = Duration::from_secs(60);

/// Wraps a `FollowGraph` with a bounded LRU of positive `is_mutual` answers.
///
/// Negatives are never cached: a just-reciprocated follow must become
/// visible on the next subscribe, and a stale negative would spuriously deny
/// it. A stale positive only extends an authorization that held within the
/// last minute.
pub struct CachedGraph<G> {
    inner: G,
    cache: Mutex<LruCache<(UserId, UserId), Instant>>,
    ttl: Duration,
}

impl<G> CachedGraph<G> {
    pub fn new(inner: G) -> Self {
        Self::with_ttl(inner, CACHE_TTL)
    }

    pub fn with_ttl(inner: G, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(CACHE_CAPACITY).expect("cache capacity is nonzero");
        Self {
            inner,
            cache: Mutex::new(LruCache::new(cap)),
            ttl,
        }
    }

    /// Access to the wrapped backend (dev seeding routes use this).
    pub fn backend(&self) -> &G {
        &self.inner
    }

    fn cache_key(a: UserId, b: UserId) -> (UserId, UserId) {
        // Mutuality is symmetric, so one entry serves both directions.
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

#[async_trait]
impl<G: FollowGraph> FollowGraph for CachedGraph<G> {
    async fn is_mutual(&self, a: UserId, b: UserId) -> Result<bool, GraphError> {
        let key = Self::cache_key(a, b);
        {
            let mut cache = self.cache.lock();
            match cache.get(&key) {
                Some(at) if at.elapsed() < self.ttl => return Ok(true),
                Some(_) => {
                    cache.pop(&key);
                }
                None => {}
            }
        }
        let answer = self.inner.is_mutual(a, b).await?;
        if answer {
            self.cache.lock().put(key, Instant::now());
        }
        Ok(answer)
    }

    async fn mutuals_of(&self, user: UserId) -> Result<Vec<UserId>, GraphError> {
        self.inner.mutuals_of(user).await
    }

    async fn profile_name(&self, user: UserId) -> Result<Option<String>, GraphError> {
        self.inner.profile_name(user).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mutuality_requires_both_directions() {
        let g = MemGraph::new();
        g.follow(3, 7);
        assert!(!g.is_mutual(3, 7).await.unwrap());
        g.follow(7, 3);
        assert!(g.is_mutual(3, 7).await.unwrap());
        assert!(g.is_mutual(7, 3).await.unwrap());
    }

    #[tokio::test]
    async fn mutuals_of_lists_reciprocated_edges_only() {
        let g = MemGraph::new();
        g.follow(1, 2);
        g.follow(2, 1);
        g.follow(1, 3); // not reciprocated
        g.follow(4, 1); // wrong direction only
        assert_eq!(g.mutuals_of(1).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn negatives_are_never_cached() {
        let g = CachedGraph::new(MemGraph::new());
        g.backend().follow(3, 7);
        assert!(!g.is_mutual(3, 7).await.unwrap());

        // Reciprocation must be visible on the very next check.
        g.backend().follow(7, 3);
        assert!(g.is_mutual(3, 7).await.unwrap());
    }

    #[tokio::test]
    async fn positives_are_served_from_cache_within_ttl() {
        let g = CachedGraph::new(MemGraph::new());
        g.backend().follow(3, 7);
        g.backend().follow(7, 3);
        assert!(g.is_mutual(3, 7).await.unwrap());

        // An unfollow is masked for up to the TTL; the cached positive wins.
        g.backend().unfollow(7, 3);
        assert!(g.is_mutual(3, 7).await.unwrap());
        assert!(g.is_mutual(7, 3).await.unwrap());
    }

    #[tokio::test]
    async fn expired_positives_fall_through_to_the_backend() {
        let g = CachedGraph::with_ttl(MemGraph::new(), Duration::from_secs(0));
        g.backend().follow(3, 7);
        g.backend().follow(7, 3);
        assert!(g.is_mutual(3, 7).await.unwrap());

        g.backend().unfollow(7, 3);
        assert!(!g.is_mutual(3, 7).await.unwrap());
    }
}
