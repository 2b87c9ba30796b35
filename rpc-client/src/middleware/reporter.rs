use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tracing::info;

use crate::context::RpcRequest;
use crate::error::RpcError;
use crate::keyed::KeyedCache;

use super::{Interceptor, Next};

const REPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Effective settings of one call edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigReport {
    pub to: String,
    pub to_cluster: String,
    pub method: String,
    pub rpc_timeout_ms: u64,
    pub conn_timeout_ms: u64,
    pub retry_times: u32,
}

pub trait Reporter: Send + Sync {
    fn report(&self, report: &ConfigReport);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, report: &ConfigReport) {
        match serde_json::to_string(report) {
            Ok(json) => info!(config = %json, "rpc client config"),
            Err(e) => info!(error = %e, "rpc client config unserializable"),
        }
    }
}

/// Reports each call key's settings at most once per interval.
pub struct ConfigReporter {
    reporter: Arc<dyn Reporter>,
    last: KeyedCache<Instant>,
    interval: Duration,
}

impl ConfigReporter {
    pub fn new(reporter: Arc<dyn Reporter>, capacity: usize) -> Self {
        Self {
            reporter,
            last: KeyedCache::new(capacity),
            interval: REPORT_INTERVAL,
        }
    }

    fn due(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.last.get(key) {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                self.last.insert(key, now);
                true
            }
        }
    }
}

impl Interceptor for ConfigReporter {
    async fn intercept(&self, req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        let ctx = &req.ctx;
        if self.due(&ctx.tuple.key()) {
            let ms = |d: Option<Duration>| d.map_or(0, |d| d.as_millis() as u64);
            self.reporter.report(&ConfigReport {
                to: ctx.tuple.to.clone(),
                to_cluster: ctx.tuple.to_cluster.clone(),
                method: ctx.tuple.method.clone(),
                rpc_timeout_ms: ms(ctx.rpc_timeout),
                conn_timeout_ms: ms(ctx.conn_timeout),
                retry_times: ctx.retry_times.unwrap_or(0),
            });
        }
        next.run(req).await
    }
}
