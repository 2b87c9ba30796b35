use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::context::RpcRequest;
use crate::error::RpcError;

use super::{Interceptor, Next};

/// One event per attempt: debug on success, warn on error.
pub struct RpcLogger;

impl Interceptor for RpcLogger {
    async fn intercept(&self, req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        let ctx = req.ctx.clone();
        let t0 = Instant::now();
        let res = next.run(req).await;
        let cost_us = t0.elapsed().as_micros() as u64;
        let t = &ctx.tuple;
        match &res {
            Ok(_) => debug!(
                log_id = %ctx.log_id,
                from = %t.from,
                from_cluster = %t.from_cluster,
                to = %t.to,
                to_cluster = %t.to_cluster,
                method = %t.method,
                rip = %ctx.remote.get(),
                cost_us,
                status = 0,
                env = %ctx.env,
                "rpc call"
            ),
            Err(e) => warn!(
                log_id = %ctx.log_id,
                from = %t.from,
                from_cluster = %t.from_cluster,
                to = %t.to,
                to_cluster = %t.to_cluster,
                method = %t.method,
                rip = %ctx.remote.get(),
                cost_us,
                status = e.code(),
                env = %ctx.env,
                error = %e,
                "rpc call failed"
            ),
        }
        res
    }
}
