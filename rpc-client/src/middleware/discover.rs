use std::sync::Arc;

use bytes::Bytes;

use crate::context::RpcRequest;
use crate::discovery::Discoverer;
use crate::error::RpcError;

use super::{Interceptor, Next};

/// Resolves candidate instances for the selected IDC, cluster and env.
pub struct Discover {
    discoverer: Arc<Discoverer>,
}

impl Discover {
    pub fn new(discoverer: Arc<Discoverer>) -> Self {
        Self { discoverer }
    }
}

impl Interceptor for Discover {
    async fn intercept(&self, mut req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        let ctx = &mut req.ctx;
        let idc = ctx.idc.as_deref().ok_or(RpcError::NoExpectedContextField("idc"))?;
        ctx.instances = self.discoverer
            .discover(&ctx.tuple.to, idc, &ctx.tuple.to_cluster, &ctx.env)
            .await?;
        next.run(req).await
    }
}
