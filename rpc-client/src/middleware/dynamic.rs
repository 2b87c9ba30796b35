use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::context::RpcRequest;
use crate::dynconfig::PolicyCache;
use crate::error::RpcError;

use super::{Interceptor, Next};

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Fills unset timeouts, retry times and traffic policy from the
/// per-edge RPC policy.
pub struct DynamicConfig {
    policies: Arc<PolicyCache>,
}

impl DynamicConfig {
    pub fn new(policies: Arc<PolicyCache>) -> Self {
        Self { policies }
    }
}

impl Interceptor for DynamicConfig {
    async fn intercept(&self, mut req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        let ctx = &mut req.ctx;
        if let Some(policy) = self.policies.policy(&ctx.tuple) {
            ctx.retry_times.get_or_insert(policy.retry_times);
            ctx.rpc_timeout.get_or_insert_with(|| policy.rpc_timeout());
            if ctx.conn_timeout.is_none() {
                ctx.conn_timeout = millis(policy.connect_timeout);
            }
            if ctx.conn_retry_window.is_none() {
                ctx.conn_retry_window = millis(policy.connect_retry_max_time);
            }
            if ctx.read_timeout.is_none() {
                ctx.read_timeout = millis(policy.read_timeout);
            }
            if ctx.write_timeout.is_none() {
                ctx.write_timeout = millis(policy.write_timeout);
            }
            if ctx.traffic_policy.is_empty() {
                ctx.traffic_policy = policy.traffic_policy.clone();
            }
        }
        next.run(req).await
    }
}
