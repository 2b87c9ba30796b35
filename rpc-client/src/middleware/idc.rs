use bytes::Bytes;
use rand::Rng;

use crate::context::{RpcRequest, TrafficPolicy};
use crate::error::RpcError;

use super::{Interceptor, Next};

/// Picks the target IDC: a fixed one when configured, otherwise a weighted
/// draw over the traffic policy, otherwise the local IDC.
pub struct IdcSelector {
    local_idc: String,
}

impl IdcSelector {
    pub fn new(local_idc: &str) -> Self {
        Self { local_idc: local_idc.to_string() }
    }

    pub fn select<R: Rng + ?Sized>(&self, policies: &[TrafficPolicy], rng: &mut R) -> String {
        let sum: u64 = policies.iter().map(|p| p.percent).sum();
        if sum == 0 {
            return self.local_idc.clone();
        }
        let mut r = rng.random_range(0..sum);
        for p in policies {
            if r < p.percent {
                return p.idc.clone();
            }
            r -= p.percent;
        }
        policies[0].idc.clone()
    }
}

impl Interceptor for IdcSelector {
    async fn intercept(&self, mut req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        let idc = match &req.ctx.const_idc {
            Some(idc) => idc.clone(),
            None => self.select(&req.ctx.traffic_policy, &mut rand::rng()),
        };
        if idc.is_empty() {
            return Err(RpcError::IdcSelection(format!("no IDC for {}", req.ctx.tuple.to)));
        }
        req.ctx.idc = Some(idc);
        next.run(req).await
    }
}
