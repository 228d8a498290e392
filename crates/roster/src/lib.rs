// Compute "who is online among my mutuals" for synchronous callers.
//
// Responsibilities:
// - fetch the requester's mutuals from the graph adapter
// - read their effective statuses with batched KV reads
// - sort online-first, most-recently-updated second, and truncate

use serde::Serialize;
use thiserror::Error;

use domain::{Status, UserId};
use graph::{FollowGraph, GraphError};
use kv::KvError;
use presence::PresenceStore;

#[derive(Debug, Error)]
pub enum RosterError {
    /// The KV could not answer; HTTP callers surface this as 503.
    #[error("presence data unavailable")]
    Unavailable,
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl From<KvError> for RosterError {
    fn from(e: KvError) -> Self {
        tracing::warn!(err = %e, "roster query lost the kv");
        RosterError::Unavailable
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FriendStatus {
    pub user_id: UserId,
    pub status: Status,
    pub last_seen: i64,
}

/// Up to `limit` of `requester`'s mutuals, online users first, each group
/// most-recently-updated first.
pub async fn online_friends(
    requester: UserId,
    limit: usize,
    graph: &dyn FollowGraph,
    store: &PresenceStore,
    now: i64,
) -> Result<Vec<FriendStatus>, RosterError> {
    let mutuals = graph.mutuals_of(requester).await?;
    let statuses = store.effective_status_batch(&mutuals, now).await?;

    let mut out: Vec<FriendStatus> = mutuals
        .into_iter()
        .zip(statuses)
        .map(|(user_id, (status, last_seen))| FriendStatus {
            user_id,
            status,
            last_seen,
        })
        .collect();

    out.sort_by_key(|f| (f.status != Status::Online, std::cmp::Reverse(f.last_seen)));
    out.truncate(limit);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph::MemGraph;
    use kv::Kv;
    use presence::PresenceConfig;
    use std::sync::Arc;

    async fn fixture() -> (MemGraph, PresenceStore) {
        let kv = Arc::new(Kv::connect("").await.unwrap());
        let store = PresenceStore::new(kv, Arc::new(PresenceConfig::default()));
        (MemGraph::new(), store)
    }

    fn befriend(g: &MemGraph, a: UserId, b: UserId) {
        g.follow(a, b);
        g.follow(b, a);
    }

    #[tokio::test]
    async fn online_mutuals_sort_before_everyone_else() {
        let (g, store) = fixture().await;
        befriend(&g, 1, 2);
        befriend(&g, 1, 3);
        befriend(&g, 1, 4);
        befriend(&g, 1, 5);

        store.record_heartbeat(2, 1000).await.unwrap(); // online, ts 1000
        store.record_heartbeat(3, 1005).await.unwrap(); // online, ts 1005
        store.record_heartbeat(4, 900).await.unwrap();
        store.confirm_offline(4, 931).await.unwrap(); // offline, last seen 931
        // user 5 never heartbeat: offline-now

        let friends = online_friends(1, 50, &g, &store, 1010).await.unwrap();
        let ids: Vec<UserId> = friends.iter().map(|f| f.user_id).collect();
        assert_eq!(ids, vec![3, 2, 5, 4]);
        assert_eq!(friends[0].status, Status::Online);
        assert_eq!(friends[2].status, Status::Offline);
        assert_eq!(friends[3].last_seen, 931);
    }

    #[tokio::test]
    async fn away_users_rank_with_the_offline_tail_by_recency() {
        let (g, store) = fixture().await;
        befriend(&g, 1, 2);
        befriend(&g, 1, 3);

        store.record_heartbeat(2, 1000).await.unwrap();
        store.set_semantic(2, Status::Away, 1020).await.unwrap();
        store.record_heartbeat(3, 1001).await.unwrap();

        let friends = online_friends(1, 50, &g, &store, 1025).await.unwrap();
        assert_eq!(friends[0].user_id, 3);
        assert_eq!(friends[0].status, Status::Online);
        assert_eq!(friends[1].user_id, 2);
        assert_eq!(friends[1].status, Status::Away);
    }

    #[tokio::test]
    async fn limit_truncates_after_sorting() {
        let (g, store) = fixture().await;
        for u in 2..=6u64 {
            befriend(&g, 1, u);
            store.record_heartbeat(u, 1000 + u as i64).await.unwrap();
        }

        let friends = online_friends(1, 2, &g, &store, 1020).await.unwrap();
        assert_eq!(friends.len(), 2);
        // The most recently updated online users survive the cut.
        assert_eq!(friends[0].user_id, 6);
        assert_eq!(friends[1].user_id, 5);
    }

    #[tokio::test]
    async fn non_mutual_followers_never_appear() {
        let (g, store) = fixture().await;
        g.follow(1, 2); // not reciprocated
        g.follow(3, 1); // wrong direction
        store.record_heartbeat(2, 1000).await.unwrap();
        store.record_heartbeat(3, 1000).await.unwrap();

        let friends = online_friends(1, 50, &g, &store, 1010).await.unwrap();
        assert!(friends.is_empty());
    }
}
