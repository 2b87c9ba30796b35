use std::sync::Arc;

use bytes::Bytes;

use crate::breaker::RateTrip;
use crate::context::{RpcRequest, ServiceBreakerConfig};
use crate::dynconfig::{edge_key, read_switch, read_value, ConfigStore};
use crate::error::RpcError;

use super::{Interceptor, Next};

/// Breaker settings used when the store has nothing better.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerDefaults {
    pub enabled: bool,
    pub error_rate: f64,
    pub min_samples: u64,
    pub max_concurrency: u64,
}

/// Resolves the service breaker switch and thresholds for the call edge.
pub struct BreakerConfigLoader {
    store: Arc<dyn ConfigStore>,
    defaults: BreakerDefaults,
}

impl BreakerConfigLoader {
    pub fn new(store: Arc<dyn ConfigStore>, defaults: BreakerDefaults) -> Self {
        Self { store, defaults }
    }

    fn load(&self, req: &RpcRequest) -> ServiceBreakerConfig {
        let tuple = &req.ctx.tuple;
        let store = self.store.as_ref();
        let d = self.defaults;

        let switch = edge_key(&["rpc", "circuitbreaker", "switch"], tuple);
        let enabled = d.enabled && read_switch(store, &switch, true);

        let base = edge_key(&["rpc", "circuitbreaker", "config"], tuple);
        let max_concurrency = read_value(store, &format!("{base}/concurrency"), d.max_concurrency, |v| *v > 0);
        let rate = read_value(store, &format!("{base}/errRate"), d.error_rate, |v| *v > 0.0 && *v <= 1.0);
        let min_samples = read_value(store, &format!("{base}/minSample"), d.min_samples, |v| *v > 0);

        ServiceBreakerConfig {
            enabled,
            trip: RateTrip::new(rate, min_samples),
            max_concurrency,
        }
    }
}

impl Interceptor for BreakerConfigLoader {
    async fn intercept(&self, mut req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        if req.ctx.breaker.is_none() {
            req.ctx.breaker = Some(self.load(&req));
        }
        next.run(req).await
    }
}
