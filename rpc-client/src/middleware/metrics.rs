use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::context::RpcRequest;
use crate::error::{ErrorKind, RpcError};
use crate::metrics::MetricsSink;

use super::{Interceptor, Next};

pub const THROUGHPUT: &str = "rpc.client.throughput";
pub const LATENCY: &str = "rpc.client.latency.us";
pub const STABILITY: &str = "rpc.client.stability";

/// Throughput, latency and stability per attempt. ACL and degradation
/// rejections are not reported.
pub struct MetricsEmitter {
    sink: Arc<dyn MetricsSink>,
}

impl MetricsEmitter {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

impl Interceptor for MetricsEmitter {
    async fn intercept(&self, req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        let tuple = req.ctx.tuple.clone();
        let t0 = Instant::now();
        let res = next.run(req).await;
        let cost_us = t0.elapsed().as_micros() as u64;

        let kind = res.as_ref().err().map(RpcError::kind);
        if matches!(kind, Some(ErrorKind::Acl | ErrorKind::Degradation)) {
            return res;
        }

        let mut tags = vec![
            ("to", tuple.to.as_str()),
            ("method", tuple.method.as_str()),
            ("from_cluster", tuple.from_cluster.as_str()),
            ("to_cluster", tuple.to_cluster.as_str()),
        ];
        let code = kind.map(|k| k.code().to_string());
        if let Some(code) = &code {
            tags.push(("err_code", code.as_str()));
        }
        self.sink.counter(THROUGHPUT, 1, &tags);
        self.sink.timer(LATENCY, cost_us, &tags);

        let status = match kind {
            None => "success",
            Some(k) if k.is_network() => "net_err",
            Some(_) => "business_err",
        };
        self.sink.counter(STABILITY, 1, &[
            ("to", tuple.to.as_str()),
            ("method", tuple.method.as_str()),
            ("status", status),
        ]);
        res
    }
}
