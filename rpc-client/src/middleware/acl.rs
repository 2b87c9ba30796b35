use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::context::RpcRequest;
use crate::dynconfig::{edge_key, ConfigStore};
use crate::error::RpcError;

use super::{Interceptor, Next};

/// Rejects the call edge when its ACL key is `"1"`.
pub struct Acl {
    store: Arc<dyn ConfigStore>,
}

impl Acl {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }
}

impl Interceptor for Acl {
    async fn intercept(&self, req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        let key = edge_key(&["rpc", "acl"], &req.ctx.tuple);
        match self.store.get_or_set(&key, "0") {
            Ok(v) if v.trim() == "1" => {
                let t = &req.ctx.tuple;
                return Err(RpcError::Acl(format!("{} -> {}.{}", t.from, t.to, t.method)));
            }
            Ok(_) => {}
            Err(e) => debug!(key = %key, error = %e, "acl unavailable, allowing"),
        }
        next.run(req).await
    }
}
