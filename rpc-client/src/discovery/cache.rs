use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::RpcError;
use crate::instance::Instance;
use crate::keyed::KeyedCache;

pub type Instances = Arc<Vec<Arc<Instance>>>;

struct Cached {
    instances: Instances,
    fetched_at: Instant,
}

#[derive(Default)]
struct Slot {
    state: tokio::sync::Mutex<Option<Cached>>,
}

/// TTL cache in front of registry lookups. Concurrent misses on one key
/// wait for a single refresh instead of each asking the registry.
pub struct LookupCache {
    ttl: Duration,
    slots: KeyedCache<Arc<Slot>>,
}

impl LookupCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { ttl, slots: KeyedCache::new(capacity) }
    }

    /// On refresh failure the previous value is served if there is one.
    pub async fn get_or_refresh<F, Fut>(&self, key: &str, load: F) -> Result<Instances, RpcError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Instance>, RpcError>>,
    {
        let slot = self.slots.get_or_insert_with(key, || Arc::new(Slot::default()));
        let mut state = slot.state.lock().await;
        if let Some(cached) = state.as_ref() && cached.fetched_at.elapsed() < self.ttl {
            return Ok(cached.instances.clone());
        }

        match load().await {
            Ok(fresh) => {
                let fresh: Instances = Arc::new(fresh.into_iter().map(Arc::new).collect());
                if let Some(old) = state.as_ref() && addrs(&old.instances) != addrs(&fresh) {
                    warn!(key = %key, before = ?addrs(&old.instances), after = ?addrs(&fresh), "instance set changed");
                }
                *state = Some(Cached { instances: fresh.clone(), fetched_at: Instant::now() });
                Ok(fresh)
            }
            Err(e) => match state.as_ref() {
                Some(stale) => {
                    warn!(key = %key, error = %e, "registry lookup failed, serving stale instances");
                    Ok(stale.instances.clone())
                }
                None => Err(e),
            },
        }
    }
}

fn addrs(instances: &[Arc<Instance>]) -> Vec<String> {
    let mut v: Vec<String> = instances.iter().map(|i| i.addr()).collect();
    v.sort();
    v
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn one(host: &str) -> Vec<Instance> {
        vec![Instance::new(host, 80, HashMap::new())]
    }

    #[tokio::test]
    async fn test_single_flight() {
        let cache = Arc::new(LookupCache::new(Duration::from_secs(30), 16));
        let loads = Arc::new(AtomicUsize::new(0));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let loads = loads.clone();
            tasks.spawn(async move {
                cache.get_or_refresh("svc/lf", || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(one("a"))
                }).await.unwrap().len()
            });
        }
        while let Some(n) = tasks.join_next().await {
            assert_eq!(n.unwrap(), 1);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_on_error() {
        let cache = LookupCache::new(Duration::ZERO, 16);
        cache.get_or_refresh("k", || async { Ok(one("a")) }).await.unwrap();
        let got = cache.get_or_refresh("k", || async {
            Err(RpcError::ServiceDiscovery("registry down".into()))
        }).await.unwrap();
        assert_eq!(got[0].host(), "a");

        let err = cache.get_or_refresh("other", || async {
            Err(RpcError::ServiceDiscovery("registry down".into()))
        }).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_refresh_after_ttl() {
        let cache = LookupCache::new(Duration::ZERO, 16);
        cache.get_or_refresh("k", || async { Ok(one("a")) }).await.unwrap();
        let got = cache.get_or_refresh("k", || async { Ok(one("b")) }).await.unwrap();
        assert_eq!(got[0].host(), "b");
    }
}
