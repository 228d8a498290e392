use std::collections::HashMap;
use std::sync::Arc;

use domain::{Status, UserId};
use kv::{Kv, KvError, RemoveOutcome};

use crate::config::PresenceConfig;

const F_STATUS: &str = "status";
const F_UPDATED_TS: &str = "updated_ts";
const F_LAST_HEARTBEAT_TS: &str = "last_heartbeat_ts";
const F_LAST_SEEN_TS: &str = "last_seen_ts";

/// What a store operation did, as seen by the caller.
///
/// Callers publish to the fanout bus only on `TransitionedTo`; every other
/// effect is silent. This is the sole debounce: a user heartbeating every
/// 30 s produces one `TransitionedTo(Online)` and then `Refreshed` forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    TransitionedTo(Status),
    Refreshed,
    Unchanged,
    Ignored,
}

/// Stateless facade over the liveness KV. Holds no per-user state of its
/// own; `now` is passed in by callers so the clock stays testable.
pub struct PresenceStore {
    kv: Arc<Kv>,
    cfg: Arc<PresenceConfig>,
}

fn field_i64(map: &HashMap<String, String>, field: &str) -> Option<i64> {
    map.get(field).and_then(|s| s.parse::<i64>().ok())
}

impl PresenceStore {
    pub fn new(kv: Arc<Kv>, cfg: Arc<PresenceConfig>) -> Self {
        Self { kv, cfg }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.cfg
    }

    /// Accept a heartbeat from `user`.
    ///
    /// Rate-limited by `last_heartbeat_ts` (best-effort, read-then-write; the
    /// worst case under a race is one extra KV write per window). A beat from
    /// a user whose recorded status is offline is the online transition;
    /// every other beat just pushes the expiry forward.
    pub async fn record_heartbeat(&self, user: UserId, now: i64) -> Result<Effect, KvError> {
        let state_key = self.cfg.state_key(user);
        let map = self.kv.hgetall(&state_key).await?;

        if let Some(last) = field_i64(&map, F_LAST_HEARTBEAT_TS) {
            if now - last < self.cfg.min_interval_secs {
                return Ok(Effect::Ignored);
            }
        }

        let expiry = (now + self.cfg.heartbeat_window_secs) as f64;
        self.kv
            .zadd(&self.cfg.shard_key(user), &user.to_string(), expiry)
            .await?;

        let prior = map
            .get(F_STATUS)
            .and_then(|s| Status::parse(s))
            .unwrap_or(Status::Offline);
        if prior == Status::Offline {
            self.write_state(
                user,
                &[
                    (F_STATUS, Status::Online.as_str().to_string()),
                    (F_UPDATED_TS, now.to_string()),
                    (F_LAST_HEARTBEAT_TS, now.to_string()),
                ],
                Some(now),
            )
            .await?;
            Ok(Effect::TransitionedTo(Status::Online))
        } else {
            self.write_state(user, &[(F_LAST_HEARTBEAT_TS, now.to_string())], None)
                .await?;
            Ok(Effect::Refreshed)
        }
    }

    /// Switch a live user between `Online` and `Away`.
    ///
    /// Requires a current heartbeat record; calls for dead users are dropped
    /// (`Ignored`). Semantic transitions never touch the liveness set.
    pub async fn set_semantic(&self, user: UserId, target: Status, now: i64) -> Result<Effect, KvError> {
        if target == Status::Offline {
            // Offline is the reaper's transition, never a client's.
            return Ok(Effect::Ignored);
        }

        let score = self
            .kv
            .zscore(&self.cfg.shard_key(user), &user.to_string())
            .await?;
        let live = score.map(|s| s >= now as f64).unwrap_or(false);
        if !live {
            return Ok(Effect::Ignored);
        }

        let current = self
            .kv
            .hget(&self.cfg.state_key(user), F_STATUS)
            .await?
            .and_then(|s| Status::parse(&s))
            .filter(|s| *s != Status::Offline)
            .unwrap_or(Status::Online);
        if current == target {
            return Ok(Effect::Unchanged);
        }

        self.write_state(
            user,
            &[
                (F_STATUS, target.as_str().to_string()),
                (F_UPDATED_TS, now.to_string()),
            ],
            Some(now),
        )
        .await?;
        Ok(Effect::TransitionedTo(target))
    }

    /// Reaper path: remove the heartbeat record iff it is still expired at
    /// decision time, then record the offline state.
    ///
    /// The conditional remove runs server-side as one unit, so of a racing
    /// heartbeat and reaper exactly one wins: `Aborted` means the heartbeat
    /// got there first and the field map must not be touched.
    pub async fn confirm_offline(&self, user: UserId, now: i64) -> Result<Effect, KvError> {
        let outcome = self
            .kv
            .zrem_if_score_below(&self.cfg.shard_key(user), &user.to_string(), now as f64)
            .await?;
        match outcome {
            RemoveOutcome::Removed => {
                self.write_state(
                    user,
                    &[
                        (F_STATUS, Status::Offline.as_str().to_string()),
                        (F_UPDATED_TS, now.to_string()),
                        (F_LAST_SEEN_TS, now.to_string()),
                    ],
                    Some(now),
                )
                .await?;
                Ok(Effect::TransitionedTo(Status::Offline))
            }
            RemoveOutcome::Aborted(_) => Ok(Effect::Unchanged),
        }
    }

    /// The status observers are told, derived from the liveness record first
    /// and the semantic field map second.
    pub async fn effective_status(&self, user: UserId, now: i64) -> Result<(Status, i64), KvError> {
        let score = self
            .kv
            .zscore(&self.cfg.shard_key(user), &user.to_string())
            .await?;
        let live = score.map(|s| s >= now as f64).unwrap_or(false);
        let map = self.kv.hgetall(&self.cfg.state_key(user)).await?;
        Ok(Self::derive(live, &map, now))
    }

    /// Degraded read for socket paths: when the KV cannot answer, report
    /// offline-now rather than fabricating an online status.
    pub async fn effective_status_or_offline(&self, user: UserId, now: i64) -> (Status, i64) {
        match self.effective_status(user, now).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(user, err = %e, "effective_status degraded to offline");
                (Status::Offline, now)
            }
        }
    }

    /// Batched `effective_status` for the roster query: one pipelined score
    /// read per shard plus one pipelined field-map read, same derivation.
    pub async fn effective_status_batch(
        &self,
        users: &[UserId],
        now: i64,
    ) -> Result<Vec<(Status, i64)>, KvError> {
        let mut live = vec![false; users.len()];
        let mut by_shard: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, u) in users.iter().enumerate() {
            by_shard.entry(self.cfg.shard_key(*u)).or_default().push(i);
        }
        for (shard, slots) in by_shard {
            let members: Vec<String> = slots.iter().map(|i| users[*i].to_string()).collect();
            let scores = self.kv.zscore_many(&shard, &members).await?;
            for (slot, score) in slots.into_iter().zip(scores) {
                live[slot] = score.map(|s| s >= now as f64).unwrap_or(false);
            }
        }

        let state_keys: Vec<String> = users.iter().map(|u| self.cfg.state_key(*u)).collect();
        let maps = self.kv.hgetall_many(&state_keys).await?;
        Ok(live
            .into_iter()
            .zip(maps.iter())
            .map(|(l, m)| Self::derive(l, m, now))
            .collect())
    }

    /// Members of one shard whose heartbeat expired at or before `now`, up
    /// to the reaper batch size.
    pub async fn expired_candidates(&self, shard_key: &str, now: i64) -> Result<Vec<UserId>, KvError> {
        let hits = self
            .kv
            .zrange_by_score(shard_key, now as f64, self.cfg.reaper_batch_size)
            .await?;
        Ok(hits
            .into_iter()
            .filter_map(|(member, _)| match member.parse::<UserId>() {
                Ok(u) => Some(u),
                Err(_) => {
                    tracing::warn!(member = %member, "non-numeric member in liveness set, skipping");
                    None
                }
            })
            .collect())
    }

    fn derive(live: bool, map: &HashMap<String, String>, now: i64) -> (Status, i64) {
        if !live {
            return (Status::Offline, field_i64(map, F_LAST_SEEN_TS).unwrap_or(now));
        }
        let status = map
            .get(F_STATUS)
            .and_then(|s| Status::parse(s))
            // A live user reads as online even while the map briefly lags.
            .filter(|s| *s != Status::Offline)
            .unwrap_or(Status::Online);
        (status, field_i64(map, F_UPDATED_TS).unwrap_or(now))
    }

    /// All field-map writes funnel through here so `updated_ts` stays
    /// monotonic non-decreasing per user and the state TTL is refreshed.
    async fn write_state(
        &self,
        user: UserId,
        fields: &[(&str, String)],
        monotonic_ts: Option<i64>,
    ) -> Result<(), KvError> {
        let key = self.cfg.state_key(user);
        if let Some(ts) = monotonic_ts {
            let current = self
                .kv
                .hget(&key, F_UPDATED_TS)
                .await?
                .and_then(|s| s.parse::<i64>().ok());
            if current.map(|c| ts < c).unwrap_or(false) {
                return Ok(());
            }
        }
        self.kv.hset(&key, fields, Some(self.cfg.state_ttl_secs)).await
    }
}
