/*
Typed adapter over the shared liveness KV.

This file exposes the same public API regardless of feature flags:

- Kv
  - connect(addr: &str) -> Result<Self>
  - scored-set ops: zadd / zscore / zrange_by_score / zrem_if_score_below
  - field-map ops: hset / hget / hgetall (+ batch variants for pipelined reads)
  - ping() for health probes

Current state:
- Default (no feature): in-memory implementation (suitable for dev/tests).
- feature = "with-redis": backed by Redis via a ConnectionManager. The
  conditional remove runs as a Lua script so the read-compare-remove is a
  single server-side unit; doing it client-side would race with heartbeats.

Scores are epoch seconds as f64; members and field values are strings, which
matches the on-wire key layout.
*/

use std::collections::HashMap;

use thiserror::Error;

/// Errors surfaced to callers. Transient errors are retryable at the next
/// natural trigger; fatal errors escalate to the health surface.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key or member not found")]
    NotFound,
    #[error("kv transiently unavailable: {0}")]
    TransientUnavailable(String),
    #[error("kv fatal error: {0}")]
    Fatal(String),
}

impl KvError {
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::TransientUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, KvError>;

/// Outcome of the conditional remove. `Aborted` carries the score observed
/// server-side at decision time (None if the member was absent).
#[derive(Debug, Clone, PartialEq)]
pub enum RemoveOutcome {
    Removed,
    Aborted(Option<f64>),
}

mod mem {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct FieldMap {
        fields: HashMap<String, String>,
        expires_at: Option<Instant>,
    }

    impl FieldMap {
        fn expired(&self) -> bool {
            self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
        }
    }

    #[derive(Default)]
    struct State {
        zsets: HashMap<String, HashMap<String, f64>>,
        maps: HashMap<String, FieldMap>,
    }

    /// In-memory stand-in for the shared KV. Every operation runs under one
    /// mutex, which gives the conditional remove the same atomicity the Lua
    /// script provides on the real store.
    #[derive(Clone)]
    pub struct Kv {
        state: Arc<Mutex<State>>,
    }

    impl Kv {
        /// `addr` is ignored for the in-memory fallback.
        pub async fn connect(_addr: &str) -> Result<Self> {
            Ok(Self {
                state: Arc::new(Mutex::new(State::default())),
            })
        }

        pub async fn ping(&self) -> Result<()> {
            Ok(())
        }

        pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
            let mut st = self.state.lock();
            st.zsets
                .entry(key.to_string())
                .or_default()
                .insert(member.to_string(), score);
            Ok(())
        }

        pub async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
            let st = self.state.lock();
            Ok(st.zsets.get(key).and_then(|z| z.get(member)).copied())
        }

        /// Members with score <= upper, in non-decreasing score order, at
        /// most `limit` of them.
        pub async fn zrange_by_score(
            &self,
            key: &str,
            upper: f64,
            limit: usize,
        ) -> Result<Vec<(String, f64)>> {
            let st = self.state.lock();
            let mut hits: Vec<(String, f64)> = st
                .zsets
                .get(key)
                .map(|z| {
                    z.iter()
                        .filter(|(_, s)| **s <= upper)
                        .map(|(m, s)| (m.clone(), *s))
                        .collect()
                })
                .unwrap_or_default();
            hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            hits.truncate(limit);
            Ok(hits)
        }

        /// Read the member's score; remove it only if strictly below
        /// `threshold`. The whole read-compare-remove happens under the lock.
        pub async fn zrem_if_score_below(
            &self,
            key: &str,
            member: &str,
            threshold: f64,
        ) -> Result<RemoveOutcome> {
            let mut st = self.state.lock();
            let current = st.zsets.get(key).and_then(|z| z.get(member)).copied();
            match current {
                Some(score) if score < threshold => {
                    if let Some(z) = st.zsets.get_mut(key) {
                        z.remove(member);
                    }
                    Ok(RemoveOutcome::Removed)
                }
                other => Ok(RemoveOutcome::Aborted(other)),
            }
        }

        pub async fn hset(
            &self,
            key: &str,
            fields: &[(&str, String)],
            ttl_secs: Option<i64>,
        ) -> Result<()> {
            let mut st = self.state.lock();
            let entry = st.maps.entry(key.to_string()).or_default();
            if entry.expired() {
                entry.fields.clear();
                entry.expires_at = None;
            }
            for (f, v) in fields {
                entry.fields.insert((*f).to_string(), v.clone());
            }
            if let Some(ttl) = ttl_secs {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl.max(0) as u64));
            }
            Ok(())
        }

        pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
            let st = self.state.lock();
            Ok(st
                .maps
                .get(key)
                .filter(|m| !m.expired())
                .and_then(|m| m.fields.get(field).cloned()))
        }

        pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
            let st = self.state.lock();
            Ok(st
                .maps
                .get(key)
                .filter(|m| !m.expired())
                .map(|m| m.fields.clone())
                .unwrap_or_default())
        }

        pub async fn zscore_many(&self, key: &str, members: &[String]) -> Result<Vec<Option<f64>>> {
            let st = self.state.lock();
            let zset = st.zsets.get(key);
            Ok(members
                .iter()
                .map(|m| zset.and_then(|z| z.get(m)).copied())
                .collect())
        }

        pub async fn hgetall_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>> {
            let st = self.state.lock();
            Ok(keys
                .iter()
                .map(|k| {
                    st.maps
                        .get(k)
                        .filter(|m| !m.expired())
                        .map(|m| m.fields.clone())
                        .unwrap_or_default()
                })
                .collect())
        }
    }
}

#[cfg(feature = "with-redis")]
mod redis_impl {
    use super::*;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    /// Conditional remove as a single server-side unit. Returns a two-element
    /// array {removed, observed_score}; the score slot is '' when the member
    /// is absent (false/nil would truncate the reply array).
    const ZREM_IF_BELOW: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if score and tonumber(score) < tonumber(ARGV[2]) then
  redis.call('ZREM', KEYS[1], ARGV[1])
  return {1, score}
end
if score then
  return {0, score}
end
return {0, ''}
"#;

    fn map_err(e: redis::RedisError) -> KvError {
        if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_cluster_error() {
            KvError::TransientUnavailable(e.to_string())
        } else {
            KvError::Fatal(e.to_string())
        }
    }

    #[derive(Clone)]
    pub struct Kv {
        manager: ConnectionManager,
        script: redis::Script,
    }

    impl Kv {
        pub async fn connect(addr: &str) -> Result<Self> {
            let client = redis::Client::open(addr).map_err(|e| KvError::Fatal(e.to_string()))?;
            let manager = ConnectionManager::new(client).await.map_err(map_err)?;
            Ok(Self {
                manager,
                script: redis::Script::new(ZREM_IF_BELOW),
            })
        }

        pub async fn ping(&self) -> Result<()> {
            let mut conn = self.manager.clone();
            redis::cmd("PING")
                .query_async::<()>(&mut conn)
                .await
                .map_err(map_err)
        }

        pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
            let mut conn = self.manager.clone();
            let _: () = conn.zadd(key, member, score).await.map_err(map_err)?;
            Ok(())
        }

        pub async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
            let mut conn = self.manager.clone();
            let score: Option<f64> = conn.zscore(key, member).await.map_err(map_err)?;
            Ok(score)
        }

        pub async fn zrange_by_score(
            &self,
            key: &str,
            upper: f64,
            limit: usize,
        ) -> Result<Vec<(String, f64)>> {
            let mut conn = self.manager.clone();
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(upper)
                .arg("WITHSCORES")
                .arg("LIMIT")
                .arg(0)
                .arg(limit)
                .query_async::<Vec<(String, f64)>>(&mut conn)
                .await
                .map_err(map_err)
        }

        pub async fn zrem_if_score_below(
            &self,
            key: &str,
            member: &str,
            threshold: f64,
        ) -> Result<RemoveOutcome> {
            let mut conn = self.manager.clone();
            let (removed, observed): (i64, String) = self
                .script
                .key(key)
                .arg(member)
                .arg(threshold)
                .invoke_async(&mut conn)
                .await
                .map_err(map_err)?;
            if removed == 1 {
                Ok(RemoveOutcome::Removed)
            } else {
                Ok(RemoveOutcome::Aborted(observed.parse::<f64>().ok()))
            }
        }

        pub async fn hset(
            &self,
            key: &str,
            fields: &[(&str, String)],
            ttl_secs: Option<i64>,
        ) -> Result<()> {
            let mut conn = self.manager.clone();
            let mut pipe = redis::pipe();
            pipe.atomic();
            let pairs: Vec<(&str, &str)> = fields.iter().map(|(f, v)| (*f, v.as_str())).collect();
            pipe.hset_multiple(key, &pairs).ignore();
            if let Some(ttl) = ttl_secs {
                pipe.expire(key, ttl).ignore();
            }
            pipe.query_async::<()>(&mut conn).await.map_err(map_err)
        }

        pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
            let mut conn = self.manager.clone();
            let value: Option<String> = conn.hget(key, field).await.map_err(map_err)?;
            Ok(value)
        }

        pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
            let mut conn = self.manager.clone();
            let map: HashMap<String, String> = conn.hgetall(key).await.map_err(map_err)?;
            Ok(map)
        }

        pub async fn zscore_many(&self, key: &str, members: &[String]) -> Result<Vec<Option<f64>>> {
            if members.is_empty() {
                return Ok(Vec::new());
            }
            let mut conn = self.manager.clone();
            let mut pipe = redis::pipe();
            for m in members {
                pipe.zscore(key, m);
            }
            pipe.query_async::<Vec<Option<f64>>>(&mut conn)
                .await
                .map_err(map_err)
        }

        pub async fn hgetall_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>> {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let mut conn = self.manager.clone();
            let mut pipe = redis::pipe();
            for k in keys {
                pipe.hgetall(k);
            }
            pipe.query_async::<Vec<HashMap<String, String>>>(&mut conn)
                .await
                .map_err(map_err)
        }
    }
}

#[cfg(not(feature = "with-redis"))]
pub use mem::Kv;

#[cfg(feature = "with-redis")]
pub use redis_impl::Kv;

// Always compiled so the in-memory backend stays testable alongside Redis.
pub use mem::Kv as MemKv;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conditional_remove_takes_expired_members_only() {
        let kv = MemKv::connect("").await.unwrap();
        kv.zadd("live", "7", 1030.0).await.unwrap();

        // Score below the threshold: removed.
        let out = kv.zrem_if_score_below("live", "7", 1031.0).await.unwrap();
        assert_eq!(out, RemoveOutcome::Removed);
        assert_eq!(kv.zscore("live", "7").await.unwrap(), None);

        // A refreshed score at/above the threshold aborts with the score seen.
        kv.zadd("live", "7", 1061.0).await.unwrap();
        let out = kv.zrem_if_score_below("live", "7", 1031.0).await.unwrap();
        assert_eq!(out, RemoveOutcome::Aborted(Some(1061.0)));
        assert_eq!(kv.zscore("live", "7").await.unwrap(), Some(1061.0));

        // Absent member aborts with None.
        let out = kv.zrem_if_score_below("live", "9", 1031.0).await.unwrap();
        assert_eq!(out, RemoveOutcome::Aborted(None));
    }

    #[tokio::test]
    async fn range_by_score_is_sorted_and_bounded() {
        let kv = MemKv::connect("").await.unwrap();
        kv.zadd("live", "1", 30.0).await.unwrap();
        kv.zadd("live", "2", 10.0).await.unwrap();
        kv.zadd("live", "3", 20.0).await.unwrap();
        kv.zadd("live", "4", 99.0).await.unwrap();

        let hits = kv.zrange_by_score("live", 30.0, 10).await.unwrap();
        let members: Vec<&str> = hits.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["2", "3", "1"]);

        let hits = kv.zrange_by_score("live", 30.0, 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "2");
    }

    #[tokio::test]
    async fn field_map_round_trip_and_ttl() {
        let kv = MemKv::connect("").await.unwrap();
        kv.hset(
            "state:7",
            &[("status", "away".to_string()), ("updated_ts", "1020".to_string())],
            Some(3600),
        )
        .await
        .unwrap();

        let all = kv.hgetall("state:7").await.unwrap();
        assert_eq!(all.get("status").map(String::as_str), Some("away"));
        assert_eq!(all.get("updated_ts").map(String::as_str), Some("1020"));
        assert_eq!(
            kv.hget("state:7", "status").await.unwrap().as_deref(),
            Some("away")
        );

        // A zero TTL expires immediately; reads see nothing.
        kv.hset("state:8", &[("status", "online".to_string())], Some(0))
            .await
            .unwrap();
        assert!(kv.hgetall("state:8").await.unwrap().is_empty());
        assert_eq!(kv.hget("state:8", "status").await.unwrap(), None);
    }

    #[tokio::test]
    async fn batch_reads_line_up_with_inputs() {
        let kv = MemKv::connect("").await.unwrap();
        kv.zadd("live", "1", 10.0).await.unwrap();
        kv.zadd("live", "3", 30.0).await.unwrap();
        kv.hset("state:1", &[("status", "online".to_string())], None)
            .await
            .unwrap();

        let scores = kv
            .zscore_many("live", &["1".into(), "2".into(), "3".into()])
            .await
            .unwrap();
        assert_eq!(scores, vec![Some(10.0), None, Some(30.0)]);

        let maps = kv
            .hgetall_many(&["state:1".into(), "state:2".into()])
            .await
            .unwrap();
        assert_eq!(maps[0].get("status").map(String::as_str), Some("online"));
        assert!(maps[1].is_empty());
    }
}
