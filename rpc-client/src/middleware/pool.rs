use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::context::{ConnSlot, RpcRequest};
use crate::error::RpcError;
use crate::pool::{ConnPool, PoolConn};

use super::{Interceptor, Next};

pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_millis(30);

/// Checks a connection out for the attempt and recycles it afterwards.
pub struct Pool {
    pool: Arc<dyn ConnPool>,
}

impl Pool {
    pub fn new(pool: Arc<dyn ConnPool>) -> Self {
        Self { pool }
    }
}

impl Interceptor for Pool {
    async fn intercept(&self, mut req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        let ins = req.ctx.target.clone().ok_or(RpcError::NoExpectedContextField("target instance"))?;
        let timeout = req.ctx.conn_timeout.unwrap_or(DEFAULT_CONN_TIMEOUT);
        let conn = self.pool.get(&ins, timeout).await
            .map_err(|source| RpcError::GetConnection { addr: ins.addr(), source })?;

        let slot = ConnSlot::default();
        slot.put(PoolConn::new(conn, self.pool.clone()));
        req.ctx.conn = slot.clone();

        let res = next.run(req).await;
        if let Some(conn) = slot.take() {
            // a remote error frame leaves the connection in a clean state
            let failed = matches!(&res, Err(e) if !matches!(e, RpcError::Remote(_)));
            conn.release(failed);
        }
        res
    }
}
