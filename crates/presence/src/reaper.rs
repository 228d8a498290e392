// The reaper: a polling control loop that converts expired heartbeats into
// offline transitions.
//
// Centralizing offline detection here (instead of keyspace notifications or
// per-session teardown) keeps the transition atomic: the conditional remove
// in `confirm_offline` decides the race against concurrent heartbeats
// server-side, so each online -> offline transition publishes at most once.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use bus::Bus;
use domain::{now_epoch, Status, UserId};
use proto::{status_topic, Envelope};

use crate::store::{Effect, PresenceStore};

pub struct Reaper {
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Reaper {
    /// Spawn the loop. Shutdown is observed only between ticks; a tick that
    /// has started runs to completion so a confirmed transition is always
    /// followed by its publish attempt.
    pub fn spawn(store: Arc<PresenceStore>, bus: Arc<Bus>) -> Self {
        let (tx, mut rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let poll = store.config().poll_interval;

            // Randomize the phase so two reapers on the same shard rarely
            // scan simultaneously.
            let phase = poll.mul_f64(rand::random::<f64>());
            tokio::select! {
                _ = time::sleep(phase) => {}
                _ = rx.changed() => return,
            }

            loop {
                let full_batch = tick(&store, &bus).await;

                if *rx.borrow() {
                    break;
                }
                if full_batch {
                    // Pressure-responsive: a full batch means there is likely
                    // more expired backlog, scan again immediately.
                    continue;
                }
                tokio::select! {
                    _ = time::sleep(poll) => {}
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            handle: Mutex::new(Some(handle)),
            shutdown_tx: tx,
        }
    }

    /// Stop the loop and wait for it. Accepts Arc<Self> so callers can
    /// invoke it without needing mutable ownership.
    pub async fn shutdown(self: Arc<Self>) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// One scan over all shards. Returns true if any shard produced a full
/// batch of candidates.
async fn tick(store: &PresenceStore, bus: &Bus) -> bool {
    let now = now_epoch();
    let batch = store.config().reaper_batch_size;
    let mut full_batch = false;

    for shard in store.config().shard_keys() {
        let candidates = match store.expired_candidates(&shard, now).await {
            Ok(c) => c,
            Err(e) => {
                // Transient or not, abort this tick and retry on the next.
                tracing::warn!(shard = %shard, err = %e, "reaper scan failed, retrying next tick");
                return false;
            }
        };
        if candidates.len() >= batch {
            full_batch = true;
        }

        for user in candidates {
            match store.confirm_offline(user, now).await {
                Ok(Effect::TransitionedTo(Status::Offline)) => {
                    publish_offline(bus, user, now);
                }
                Ok(_) => {
                    // A heartbeat refreshed the record between the scan and
                    // the remove; nothing to announce.
                }
                Err(e) => {
                    tracing::warn!(user, err = %e, "confirm_offline failed, aborting tick");
                    return full_batch;
                }
            }
        }
    }

    full_batch
}

/// Publish failures are logged and dropped: the liveness state in the KV is
/// already correct and the user's next transition reconciles observers.
fn publish_offline(bus: &Bus, user: UserId, now: i64) {
    let envelope = Envelope::status_changed(user, Status::Offline, now);
    let bytes = match envelope.to_bytes() {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(user, err = %e, "failed encoding offline envelope");
            return;
        }
    };
    match bus.publish(&status_topic(user), &bytes) {
        Ok(()) => tracing::info!(user, ts = now, "published offline transition"),
        Err(e) => tracing::error!(user, err = %e, "failed publishing offline transition"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresenceConfig;
    use kv::Kv;
    use std::time::Duration;

    async fn fixture(poll_ms: u64) -> (Arc<PresenceStore>, Arc<Bus>) {
        let kv = Arc::new(Kv::connect("").await.unwrap());
        let cfg = PresenceConfig {
            poll_interval: Duration::from_millis(poll_ms),
            ..Default::default()
        };
        let store = Arc::new(PresenceStore::new(kv, Arc::new(cfg)));
        let bus = Arc::new(Bus::bind("").unwrap());
        (store, bus)
    }

    #[tokio::test]
    async fn expired_users_are_reaped_and_announced_once() {
        let (store, bus) = fixture(20).await;

        // A heartbeat far enough in the past that it is already expired.
        let past = now_epoch() - 120;
        store.record_heartbeat(7, past).await.unwrap();

        let mut sub = bus.subscribe(&status_topic(7)).unwrap();
        let reaper = Arc::new(Reaper::spawn(Arc::clone(&store), Arc::clone(&bus)));

        let (_, payload) = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("offline envelope within the poll window")
            .expect("subscription open");
        let env = Envelope::from_bytes(&payload).unwrap();
        assert_eq!(env.user_id, 7);
        assert_eq!(env.status, Status::Offline);
        assert_eq!(env.kind, proto::KIND_STATUS_CHANGED);

        let (status, _) = store.effective_status(7, now_epoch()).await.unwrap();
        assert_eq!(status, Status::Offline);

        // No second envelope for the same transition.
        tokio::select! {
            more = sub.recv() => panic!("duplicate offline publish: {:?}", more),
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        reaper.shutdown().await;
    }

    #[tokio::test]
    async fn live_users_are_left_alone() {
        let (store, bus) = fixture(20).await;
        store.record_heartbeat(7, now_epoch()).await.unwrap();

        let mut sub = bus.subscribe(&status_topic(7)).unwrap();
        let reaper = Arc::new(Reaper::spawn(Arc::clone(&store), Arc::clone(&bus)));

        tokio::select! {
            env = sub.recv() => panic!("unexpected publish for a live user: {:?}", env),
            _ = tokio::time::sleep(Duration::from_millis(300)) => {}
        }
        let (status, _) = store.effective_status(7, now_epoch()).await.unwrap();
        assert_eq!(status, Status::Online);

        reaper.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let (store, bus) = fixture(10).await;
        let reaper = Arc::new(Reaper::spawn(store, bus));
        // Must return promptly even though the loop would otherwise tick on.
        tokio::time::timeout(Duration::from_secs(1), reaper.shutdown())
            .await
            .expect("shutdown completes");
    }
}
