use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;

use crate::context::{CallTuple, TrafficPolicy};
use crate::keyed::KeyedCache;

use super::{edge_key, ConfigStore};

const POLICY_TTL: Duration = Duration::from_secs(3);

/// Per-edge RPC policy stored as JSON; all durations in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RpcPolicy {
    pub retry_times: u32,
    pub connect_timeout: u64,
    pub connect_retry_max_time: u64,
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub traffic_policy: Vec<TrafficPolicy>,
}

impl RpcPolicy {
    /// RPC timeout implied by the policy when the caller set none.
    pub fn rpc_timeout(&self) -> Duration {
        match self.write_timeout {
            0 => Duration::from_millis(500),
            ms => Duration::from_millis(ms),
        }
    }
}

#[derive(Clone)]
struct Cached {
    policy: Option<Arc<RpcPolicy>>,
    at: Instant,
}

/// Reads RPC policies through a short-lived local cache.
pub struct PolicyCache {
    store: Arc<dyn ConfigStore>,
    local_idc: String,
    cached: KeyedCache<Cached>,
}

impl PolicyCache {
    pub fn new(store: Arc<dyn ConfigStore>, local_idc: &str, capacity: usize) -> Self {
        Self {
            store,
            local_idc: local_idc.to_string(),
            cached: KeyedCache::new(capacity),
        }
    }

    pub fn key(&self, tuple: &CallTuple) -> String {
        edge_key(&["rpc", "config", &self.local_idc], tuple)
    }

    /// `None` when no policy is configured or the stored value is invalid.
    pub fn policy(&self, tuple: &CallTuple) -> Option<Arc<RpcPolicy>> {
        let key = self.key(tuple);
        if let Some(c) = self.cached.get(&key) && c.at.elapsed() < POLICY_TTL {
            return c.policy;
        }
        let policy = match self.store.get(&key) {
            Ok(Some(raw)) => match serde_json::from_str::<RpcPolicy>(&raw) {
                Ok(p) => Some(Arc::new(p)),
                Err(e) => {
                    debug!(key = %key, error = %e, "invalid rpc policy");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!(key = %key, error = %e, "rpc policy unavailable");
                return None;
            }
        };
        self.cached.insert(&key, Cached { policy: policy.clone(), at: Instant::now() });
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynconfig::MemoryStore;

    fn tuple() -> CallTuple {
        CallTuple {
            from: "caller".into(),
            from_cluster: "".into(),
            to: "callee".into(),
            to_cluster: "".into(),
            method: "Get".into(),
        }
    }

    #[test]
    fn test_policy_parsed_and_cached() {
        let store = Arc::new(MemoryStore::new());
        let pc = PolicyCache::new(store.clone(), "lf", 16);
        assert_eq!(pc.key(&tuple()), "/rpc/config/lf/caller/callee/Get");
        assert!(pc.policy(&tuple()).is_none());

        store.set("/rpc/config/lf/caller/callee/Get",
            r#"{"retry_times": 2, "write_timeout": 80, "traffic_policy": [{"idc": "hy", "percent": 30}]}"#);
        // the empty answer is still cached
        assert!(pc.policy(&tuple()).is_none());

        let pc = PolicyCache::new(store, "lf", 16);
        let p = pc.policy(&tuple()).unwrap();
        assert_eq!(p.retry_times, 2);
        assert_eq!(p.rpc_timeout(), Duration::from_millis(80));
        assert_eq!(p.traffic_policy, vec![TrafficPolicy { idc: "hy".into(), percent: 30 }]);
    }

    #[test]
    fn test_invalid_json_ignored() {
        let store = Arc::new(MemoryStore::new());
        store.set("/rpc/config/lf/caller/callee/Get", "not json");
        let pc = PolicyCache::new(store, "lf", 16);
        assert!(pc.policy(&tuple()).is_none());
        assert_eq!(RpcPolicy::default().rpc_timeout(), Duration::from_millis(500));
    }
}
