use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::RpcError;
use crate::instance::{Instance, DEFAULT_CLUSTER, ENV_CANARY, ENV_PROD};
use crate::BoxFuture;

pub mod cache;

pub use cache::{Instances, LookupCache};

/// Where instances come from.
pub trait Registry: Send + Sync {
    fn lookup<'a>(&'a self, service: &'a str, idc: &'a str) -> BoxFuture<'a, Result<Vec<Instance>, RpcError>>;
}

/// Fixed instance lists. Instances tagged with an `idc` only answer
/// lookups for that IDC; untagged ones answer every IDC.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    services: HashMap<String, Vec<Instance>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: &str, instances: Vec<Instance>) -> Self {
        self.insert(service, instances);
        self
    }

    pub fn insert(&mut self, service: &str, instances: Vec<Instance>) {
        self.services.insert(service.to_string(), instances);
    }
}

impl Registry for StaticRegistry {
    fn lookup<'a>(&'a self, service: &'a str, idc: &'a str) -> BoxFuture<'a, Result<Vec<Instance>, RpcError>> {
        let found = self.services.get(service)
            .map(|all| {
                all.iter()
                    .filter(|i| i.idc().is_none_or(|tag| tag == idc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Box::pin(async move { Ok(found) })
    }
}

/// The paired IDC tried when a lookup comes back empty.
pub fn failback_idc(idc: &str) -> &'static str {
    match idc {
        "lf" => "hy",
        _ => "lf",
    }
}

/// Reorders `items` so the ones `keep` accepts come first, returning how
/// many there are. Order inside either group is not preserved.
fn partition<T>(items: &mut [T], keep: impl Fn(&T) -> bool) -> usize {
    let (mut i, mut j) = (0, items.len());
    while i < j {
        if keep(&items[i]) {
            i += 1;
        } else {
            j -= 1;
            items.swap(i, j);
        }
    }
    i
}

fn cluster_matches(expected: &str, actual: &str) -> bool {
    expected == actual || (expected.is_empty() && actual == DEFAULT_CLUSTER)
}

fn env_matches(expected: &str, actual: &str) -> bool {
    expected == actual
        || (expected.is_empty() && (actual == ENV_PROD || actual == ENV_CANARY))
        || (expected == ENV_PROD && actual == ENV_CANARY)
}

/// Narrow a lookup result to the target cluster and environment.
pub fn filter_instances(
    mut instances: Vec<Arc<Instance>>,
    cluster: &str,
    env: &str,
) -> Result<Vec<Arc<Instance>>, RpcError> {
    let n = partition(&mut instances, |i| cluster_matches(cluster, i.cluster()));
    if n == 0 {
        return Err(RpcError::ServiceDiscovery(format!("no hosts left for cluster {cluster:?}")));
    }
    instances.truncate(n);

    let mut n = partition(&mut instances, |i| env_matches(env, i.env()));
    if n == 0 {
        n = partition(&mut instances, |i| i.env() == ENV_PROD);
    }
    if n == 0 {
        return Err(RpcError::ServiceDiscovery(format!("no hosts for cluster {cluster:?} env {env:?}")));
    }
    instances.truncate(n);
    Ok(instances)
}

pub struct Discoverer {
    registry: Arc<dyn Registry>,
    cache: LookupCache,
}

impl Discoverer {
    pub fn new(registry: Arc<dyn Registry>, ttl: Duration, capacity: usize) -> Self {
        Self { registry, cache: LookupCache::new(ttl, capacity) }
    }

    async fn lookup_cached(&self, service: &str, idc: &str) -> Result<Instances, RpcError> {
        let key = format!("{service}/{idc}");
        self.cache.get_or_refresh(&key, || self.registry.lookup(service, idc)).await
    }

    /// Instances of `service` in `idc`, falling back once to the paired IDC.
    pub async fn lookup(&self, service: &str, idc: &str) -> Result<Instances, RpcError> {
        let found = self.lookup_cached(service, idc).await?;
        if !found.is_empty() {
            return Ok(found);
        }
        let other = failback_idc(idc);
        warn!(service = %service, idc = %idc, failback = %other, "no instances, failing back");
        let found = self.lookup_cached(service, other).await?;
        if found.is_empty() {
            return Err(RpcError::ServiceDiscovery(format!(
                "no instances for {service} in {idc} or {other}"
            )));
        }
        Ok(found)
    }

    pub async fn discover(&self, service: &str, idc: &str, cluster: &str, env: &str) -> Result<Vec<Arc<Instance>>, RpcError> {
        let found = self.lookup(service, idc).await?;
        filter_instances(found.to_vec(), cluster, env)
    }
}
