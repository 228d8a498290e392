// Presence configuration surface. Constructed once at startup (defaults or
// environment) and passed by handle; immutable afterwards.

use std::time::Duration;

use domain::UserId;

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Seconds after the last accepted heartbeat at which a silent user is
    /// considered offline.
    pub heartbeat_window_secs: i64,
    /// Heartbeats arriving closer together than this are dropped.
    pub min_interval_secs: i64,
    /// Sleep between reaper ticks.
    pub poll_interval: Duration,
    /// Max expired members scanned per reaper tick.
    pub reaper_batch_size: usize,
    /// Shard count for the liveness scored set.
    pub num_shards: u32,
    /// Key (or key prefix, when sharded) of the liveness scored set.
    pub scored_set_key_prefix: String,
    /// Prefix of per-user presence field maps.
    pub state_key_prefix: String,
    /// TTL on presence field maps, limiting orphan accumulation.
    pub state_ttl_secs: i64,
    /// Cap on concurrent subscriptions held by one socket.
    pub max_subscriptions_per_socket: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_window_secs: 30,
            min_interval_secs: 5,
            poll_interval: Duration::from_secs(1),
            reaper_batch_size: 500,
            num_shards: 1,
            scored_set_key_prefix: "onlineUsers".to_string(),
            state_key_prefix: "presence:state".to_string(),
            state_ttl_secs: 86400,
            max_subscriptions_per_socket: 500,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl PresenceConfig {
    /// Defaults overridden by environment variables where set.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<i64>("HEARTBEAT_WINDOW_SECONDS") {
            cfg.heartbeat_window_secs = v;
        }
        if let Some(v) = env_parse::<i64>("MIN_INTERVAL_SECONDS") {
            cfg.min_interval_secs = v;
        }
        if let Some(v) = env_parse::<f64>("POLL_INTERVAL_SECONDS") {
            cfg.poll_interval = Duration::from_secs_f64(v.max(0.0));
        }
        if let Some(v) = env_parse::<usize>("REAPER_BATCH_SIZE") {
            cfg.reaper_batch_size = v;
        }
        if let Some(v) = env_parse::<u32>("NUM_SHARDS") {
            cfg.num_shards = v.max(1);
        }
        if let Ok(v) = std::env::var("SCORED_SET_KEY_PREFIX") {
            cfg.scored_set_key_prefix = v;
        }
        if let Ok(v) = std::env::var("STATE_KEY_PREFIX") {
            cfg.state_key_prefix = v;
        }
        if let Some(v) = env_parse::<i64>("STATE_TTL_SECONDS") {
            cfg.state_ttl_secs = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_SUBSCRIPTIONS_PER_SOCKET") {
            cfg.max_subscriptions_per_socket = v;
        }
        cfg
    }

    /// Scored-set key holding `user`'s heartbeat record. Every operation
    /// touching one user resolves to the same shard.
    pub fn shard_key(&self, user: UserId) -> String {
        if self.num_shards <= 1 {
            self.scored_set_key_prefix.clone()
        } else {
            format!(
                "{}:{}",
                self.scored_set_key_prefix,
                user % self.num_shards as u64
            )
        }
    }

    /// All shard keys, for the reaper's scan.
    pub fn shard_keys(&self) -> Vec<String> {
        if self.num_shards <= 1 {
            vec![self.scored_set_key_prefix.clone()]
        } else {
            (0..self.num_shards)
                .map(|i| format!("{}:{}", self.scored_set_key_prefix, i))
                .collect()
        }
    }

    /// Field-map key for `user`'s presence state.
    pub fn state_key(&self, user: UserId) -> String {
        format!("{}:{}", self.state_key_prefix, user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharded_keys_are_stable_per_user() {
        let cfg = PresenceConfig {
            num_shards: 4,
            ..Default::default()
        };
        assert_eq!(cfg.shard_key(7), "onlineUsers:3");
        assert_eq!(cfg.shard_key(7), cfg.shard_key(7));
        assert_eq!(cfg.shard_keys().len(), 4);
        assert!(cfg.shard_keys().contains(&cfg.shard_key(7)));
    }

    #[test]
    fn single_shard_uses_the_bare_prefix() {
        let cfg = PresenceConfig::default();
        assert_eq!(cfg.shard_key(7), "onlineUsers");
        assert_eq!(cfg.shard_keys(), vec!["onlineUsers".to_string()]);
        assert_eq!(cfg.state_key(7), "presence:state:7");
    }
}
