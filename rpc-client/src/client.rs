use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rpc_core::config::ClientConfig;
use rpc_core::PoolKind;
use tower::util::BoxCloneSyncService;
use tower::{ServiceBuilder, ServiceExt};
use tracing::info;

use crate::breaker::{BreakerMetrics, BreakerState, InstanceCircuit, RateTrip, ServiceCircuit};
use crate::context::{CallContext, CallTuple, Context, RpcRequest};
use crate::discovery::{Discoverer, StaticRegistry};
use crate::dynconfig::PolicyCache;
use crate::error::RpcError;
use crate::instance::Instance;
use crate::middleware::{
    Acl, BaseInfo, BreakerConfigLoader, Chain, ConfigReporter, ConnRetry, Degradation, Discover,
    DynamicConfig, IdcSelector, InstanceBreaker, InterceptLayer, Invoke, IoErrorClassifier,
    MetricsEmitter, Pool, RpcLogger, ServiceBreaker,
};
use crate::options::{ClientBuilder, ClientOptions, Collaborators, MAX_IDLE_TIMEOUT};
use crate::pool::{ConnPool, EphemeralPool, PersistentPool};
use crate::retry::{RetryManager, RetryPolicy};

/// RPC client for one downstream service.
pub struct Client {
    options: ClientOptions,
    chain: Chain,
    retry: RetryManager,
    policies: Arc<PolicyCache>,
    services: Arc<ServiceCircuit>,
    instances: Arc<InstanceCircuit>,
    pool: Arc<dyn ConnPool>,
}

impl Client {
    pub fn builder(service: &str, caller: &str) -> ClientBuilder {
        ClientBuilder::new(service, caller)
    }

    pub(crate) fn new(options: ClientOptions, deps: Collaborators) -> Self {
        let o = &options;
        let pool: Arc<dyn ConnPool> = match o.pool {
            PoolKind::Ephemeral => Arc::new(EphemeralPool::new(deps.dialer.clone())),
            PoolKind::Persistent => Arc::new(PersistentPool::new(
                deps.dialer.clone(),
                o.max_idle,
                o.max_idle_timeout,
                o.capacity,
            )),
        };
        let policies = Arc::new(PolicyCache::new(deps.store.clone(), &o.local_idc, o.capacity));
        let trip = RateTrip::new(o.breaker.error_rate, o.breaker.min_samples);
        let services = Arc::new(ServiceCircuit::new(trip, o.capacity));
        let instances = Arc::new(InstanceCircuit::new(o.capacity));
        let discoverer = Arc::new(Discoverer::new(deps.registry.clone(), o.discovery_ttl, o.capacity));

        let svc = ServiceBuilder::new()
            .layer(InterceptLayer::new(BaseInfo::new(&o.env, &o.local_addr, &o.local_idc)))
            .layer(InterceptLayer::new(RpcLogger))
            .layer(InterceptLayer::new(MetricsEmitter::new(deps.metrics.clone())))
            .layer(InterceptLayer::new(DynamicConfig::new(policies.clone())))
            .layer(InterceptLayer::new(ConfigReporter::new(deps.reporter.clone(), o.capacity)))
            .layer(InterceptLayer::new(BreakerConfigLoader::new(deps.store.clone(), o.breaker)))
            .layer(InterceptLayer::new(ServiceBreaker::new(services.clone(), o.cancel_on_timeout)))
            .layer(InterceptLayer::new(Acl::new(deps.store.clone())))
            .layer(InterceptLayer::new(Degradation::new(deps.store.clone())))
            .layer(InterceptLayer::new(IdcSelector::new(&o.local_idc)))
            .layer(InterceptLayer::new(Discover::new(discoverer)))
            .layer(InterceptLayer::new(ConnRetry::new(o.conn_retry_window, o.min_conn_timeout)))
            .layer(InterceptLayer::new(InstanceBreaker::new(instances.clone())))
            .layer(InterceptLayer::new(Pool::new(pool.clone())))
            .layer(InterceptLayer::new(IoErrorClassifier))
            .service(Invoke::new(deps.codec.clone()));

        info!(service = %o.service, cluster = %o.cluster, pool = ?o.pool, "rpc client ready");
        Self {
            retry: RetryManager::new(o.capacity),
            chain: BoxCloneSyncService::new(svc),
            policies,
            services,
            instances,
            pool,
            options,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn call_context(&self, method: &str, ctx: Context) -> CallContext {
        let o = &self.options;
        CallContext {
            tuple: CallTuple {
                from: o.caller.clone(),
                from_cluster: o.caller_cluster.clone(),
                to: o.service.clone(),
                to_cluster: o.cluster.clone(),
                method: method.to_string(),
            },
            log_id: ctx.log_id.unwrap_or_default(),
            env: ctx.env.unwrap_or_else(|| o.env.clone()),
            rpc_timeout: ctx.timeout.or_else(|| o.timeout_for(method)),
            deadline: ctx.deadline,
            conn_timeout: o.conn_timeout,
            retry_times: o.max_retry,
            const_idc: o.idc.clone(),
            ..Default::default()
        }
    }

    /// One logical call: the chain runs once, then again for retryable
    /// errors while the retry budget of `to:to_cluster:method` allows.
    pub async fn call(&self, method: &str, ctx: Context, payload: Bytes) -> Result<Bytes, RpcError> {
        let call_ctx = self.call_context(method, ctx);
        let key = call_ctx.tuple.key();
        let max_retry = match self.options.max_retry {
            Some(n) => n,
            None => self.policies.policy(&call_ctx.tuple).map_or(0, |p| p.retry_times),
        };
        let policy = RetryPolicy { max_retry, limit_rate: self.options.limit_rate };

        self.retry.run(
            &key,
            policy,
            |res: &Result<Bytes, RpcError>| matches!(res, Err(e) if e.is_retryable()),
            || self.chain.clone().oneshot(RpcRequest::new(call_ctx.clone(), payload.clone())),
        ).await
    }

    pub fn breaker_metrics(&self) -> Vec<BreakerMetrics> {
        self.services.metrics()
    }

    pub fn instance_breakers(&self) -> Vec<(String, BreakerState)> {
        self.instances.states()
    }

    pub fn idle_connections(&self) -> Vec<(String, usize)> {
        self.pool.idle()
    }
}

/// Clients for every configured downstream, looked up by service name.
#[derive(Default)]
pub struct ClientSet {
    clients: HashMap<String, Arc<Client>>,
}

impl ClientSet {
    /// Services with a static instance list get their own registry; the
    /// rest share `deps.registry`.
    pub fn from_config<E>(cfg: &ClientConfig<E>, deps: Collaborators) -> Result<Self, RpcError> {
        let mut clients = HashMap::new();
        for (name, svc) in &cfg.services {
            let mut deps = deps.clone();
            if !svc.instances.is_empty() {
                let instances = svc.instances.iter()
                    .map(|i| Instance::parse(i.addr(), i.tags()))
                    .collect::<Result<Vec<_>, _>>()?;
                deps.registry = Arc::new(StaticRegistry::new().with_service(name, instances));
            }

            let mut b = ClientBuilder::new(name, &cfg.service)
                .collaborators(deps)
                .cluster(&svc.cluster)
                .env(&cfg.env)
                .local_idc(&cfg.local_idc)
                .pool(svc.pool);
            if !cfg.cluster.is_empty() {
                b = b.caller_cluster(&cfg.cluster);
            }
            if let Some(idc) = &svc.idc {
                b = b.idc(idc);
            }
            if let Some(ms) = svc.timeout_ms {
                b = b.timeout(Duration::from_millis(ms));
            }
            if !svc.method_timeout.is_empty() {
                let rules = svc.method_timeout.iter()
                    .map(|(m, ms)| (m.clone(), Duration::from_millis(*ms)))
                    .collect();
                b = b.method_timeouts(rules);
            }
            if let Some(ms) = svc.conn_max_retry_ms {
                b = b.conn_retry_window(Duration::from_millis(ms));
            }
            if svc.max_idle.is_some() || svc.max_idle_timeout_ms.is_some() {
                let max_idle = svc.max_idle.unwrap_or(b.options().max_idle);
                let idle_timeout = svc.max_idle_timeout_ms.map_or(MAX_IDLE_TIMEOUT, Duration::from_millis);
                b = b.max_idle(max_idle, idle_timeout);
            }
            if let Some(br) = svc.breaker {
                b = b.breaker(br.error_rate, br.min_samples, br.max_concurrency);
            }
            if svc.disable_breaker {
                b = b.disable_breaker();
            }
            if let Some(r) = svc.retry {
                b = b.retry(r.max_retry, r.limit_rate);
            }
            clients.insert(name.clone(), Arc::new(b.build()?));
        }
        Ok(Self { clients })
    }

    pub fn insert(&mut self, client: Client) {
        self.clients.insert(client.options().service.clone(), Arc::new(client));
    }

    pub fn get(&self, service: &str) -> Option<Arc<Client>> {
        self.clients.get(service).cloned()
    }

    /// Clients sorted by service name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Client>)> {
        let mut all: Vec<_> = self.clients.iter().map(|(k, v)| (k.as_str(), v)).collect();
        all.sort_by_key(|(k, _)| *k);
        all.into_iter()
    }
}
