use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tower::Service;

use crate::context::RpcRequest;
use crate::error::RpcError;
use crate::transport::{Codec, Exchange};
use crate::BoxFuture;

/// The innermost service: one exchange on the connection the pool stage
/// checked out.
#[derive(Clone)]
pub struct Invoke {
    codec: Arc<dyn Codec>,
}

impl Invoke {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self { codec }
    }
}

impl Service<RpcRequest> for Invoke {
    type Response = Bytes;
    type Error = RpcError;
    type Future = BoxFuture<'static, Result<Bytes, RpcError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RpcRequest) -> Self::Future {
        let codec = self.codec.clone();
        Box::pin(async move {
            let ctx = req.ctx;
            let mut conn = ctx.conn.take().ok_or(RpcError::NoExpectedContextField("connection"))?;
            let remote = conn.remote_addr().to_string();
            let ex = Exchange {
                method: ctx.tuple.method.clone(),
                log_id: ctx.log_id.clone(),
                payload: req.payload,
                read_timeout: ctx.read_timeout.or_else(|| ctx.remaining()),
                write_timeout: ctx.write_timeout,
            };
            let res = codec.call(&mut conn, &remote, ex).await;
            ctx.conn.put(conn);
            res
        })
    }
}
