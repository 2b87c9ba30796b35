use std::collections::HashMap;
use std::str::FromStr;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::context::CallTuple;
use crate::instance::DEFAULT_CLUSTER;

pub mod policy;
pub mod remote;

pub use policy::{PolicyCache, RpcPolicy};
pub use remote::RemoteStore;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config store unavailable: {0}")]
    Unavailable(String),

    #[error("Reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
}

/// Dynamic key-value configuration.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError>;

    /// Current value of `key`, seeding it with `default` when absent.
    fn get_or_set(&self, key: &str, default: &str) -> Result<String, ConfigError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values.write().insert(key.to_string(), value.to_string());
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        Ok(self.values.read().get(key).cloned())
    }

    fn get_or_set(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        if let Some(v) = self.values.read().get(key) {
            return Ok(v.clone());
        }
        Ok(self.values.write()
            .entry(key.to_string())
            .or_insert_with(|| default.to_string())
            .clone())
    }
}

/// `/`-joined key for one call edge, e.g.
/// `/rpc/acl/{from}/{from_cluster}/{to}/{to_cluster}/{method}`.
/// Empty segments and `default` clusters are left out.
pub fn edge_key(prefix: &[&str], tuple: &CallTuple) -> String {
    let cluster = |c: &str| if c == DEFAULT_CLUSTER { String::new() } else { c.to_string() };
    let items = prefix.iter()
        .map(|s| s.to_string())
        .chain([
            tuple.from.clone(),
            cluster(&tuple.from_cluster),
            tuple.to.clone(),
            cluster(&tuple.to_cluster),
            tuple.method.clone(),
        ]);
    join_key(items)
}

pub fn join_key(items: impl IntoIterator<Item = String>) -> String {
    let mut key = String::new();
    for item in items.into_iter().filter(|s| !s.is_empty()) {
        key.push('/');
        key.push_str(&item);
    }
    key
}

/// `"1"` is on, anything else is off.
pub fn read_switch(store: &dyn ConfigStore, key: &str, default: bool) -> bool {
    let seed = if default { "1" } else { "0" };
    match store.get_or_set(key, seed) {
        Ok(v) => v.trim() == "1",
        Err(e) => {
            debug!(key = %key, error = %e, "switch unavailable, using default");
            default
        }
    }
}

/// Parsed value of `key`, or `default` when the store fails or the value
/// is unparsable or rejected by `valid`.
pub fn read_value<T>(store: &dyn ConfigStore, key: &str, default: T, valid: impl Fn(&T) -> bool) -> T
where T: FromStr + ToString
{
    let raw = match store.get_or_set(key, &default.to_string()) {
        Ok(v) => v,
        Err(e) => {
            debug!(key = %key, error = %e, "value unavailable, using default");
            return default;
        }
    };
    match raw.trim().parse::<T>() {
        Ok(v) if valid(&v) => v,
        _ => {
            debug!(key = %key, raw = %raw, "invalid value, using default");
            default
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::testing::DownStore;

    fn tuple(from_cluster: &str, to_cluster: &str) -> CallTuple {
        CallTuple {
            from: "caller".into(),
            from_cluster: from_cluster.into(),
            to: "callee".into(),
            to_cluster: to_cluster.into(),
            method: "Get".into(),
        }
    }

    #[test]
    fn test_edge_key() {
        assert_eq!(edge_key(&["rpc", "acl"], &tuple("default", "")), "/rpc/acl/caller/callee/Get");
        assert_eq!(edge_key(&["rpc", "acl"], &tuple("web", "store")), "/rpc/acl/caller/web/callee/store/Get");
        assert_eq!(
            edge_key(&["rpc", "circuitbreaker", "config"], &tuple("", "")) + "/errRate",
            "/rpc/circuitbreaker/config/caller/callee/Get/errRate"
        );
    }

    #[test]
    fn test_get_or_set_seeds() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        assert_eq!(store.get_or_set("k", "0").unwrap(), "0");
        store.set("k", "1");
        assert_eq!(store.get_or_set("k", "0").unwrap(), "1");
    }

    #[test]
    fn test_readers_fall_back() {
        let store = MemoryStore::new();
        store.set("/rate", "abc");
        store.set("/neg", "-3");
        store.set("/ok", "0.25");
        assert_eq!(read_value(&store, "/rate", 0.5, |r| *r > 0.0), 0.5);
        assert_eq!(read_value(&store, "/neg", 7i64, |n| *n >= 0), 7);
        assert_eq!(read_value(&store, "/ok", 0.5, |r| *r > 0.0), 0.25);
        assert_eq!(read_value(&DownStore, "/ok", 200u64, |_| true), 200);

        assert!(read_switch(&store, "/switch", true));
        assert_eq!(store.get("/switch").unwrap().as_deref(), Some("1"));
        assert!(read_switch(&DownStore, "/switch", true));
        store.set("/off", " 0 ");
        assert!(!read_switch(&store, "/off", true));
    }
}
