use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::breaker::RateTrip;
use crate::instance::Instance;
use crate::pool::PoolConn;

/// One logical call edge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CallTuple {
    pub from: String,
    pub from_cluster: String,
    pub to: String,
    pub to_cluster: String,
    pub method: String,
}

impl CallTuple {
    /// `to:to_cluster:method`, shared by the service breaker and the retrier.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.to, self.to_cluster, self.method)
    }
}

/// Per-call settings supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub log_id: Option<String>,
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
    pub env: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
        self.log_id = Some(log_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = Some(env.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrafficPolicy {
    pub idc: String,
    pub percent: u64,
}

/// Breaker settings resolved for one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceBreakerConfig {
    pub enabled: bool,
    pub trip: RateTrip,
    pub max_concurrency: u64,
}

/// Remote address of the instance currently being tried, readable by
/// stages that sit outside the spawned attempt.
#[derive(Debug, Clone, Default)]
pub struct RemoteAddr(Arc<Mutex<Option<String>>>);

impl RemoteAddr {
    pub fn set(&self, addr: String) {
        *self.0.lock() = Some(addr);
    }

    pub fn get(&self) -> String {
        self.0.lock().clone().unwrap_or_default()
    }
}

/// Hands the pooled connection from the pool stage down to the transport
/// and back.
#[derive(Clone, Default)]
pub struct ConnSlot(Arc<Mutex<Option<PoolConn>>>);

impl ConnSlot {
    pub fn put(&self, conn: PoolConn) {
        *self.0.lock() = Some(conn);
    }

    pub fn take(&self) -> Option<PoolConn> {
        self.0.lock().take()
    }
}

impl fmt::Debug for ConnSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let held = self.0.lock().is_some();
        f.debug_struct("ConnSlot").field("held", &held).finish()
    }
}

/// Call-scoped state threaded through the interceptor chain. Built once
/// per logical call and cloned for every attempt; each stage reads what an
/// earlier one wrote.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub tuple: CallTuple,
    pub log_id: String,
    pub env: String,
    pub local_addr: String,
    pub local_idc: String,

    pub rpc_timeout: Option<Duration>,
    pub deadline: Option<Instant>,
    pub conn_retry_window: Option<Duration>,
    pub conn_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub retry_times: Option<u32>,

    pub const_idc: Option<String>,
    pub traffic_policy: Vec<TrafficPolicy>,
    pub breaker: Option<ServiceBreakerConfig>,

    pub idc: Option<String>,
    pub instances: Vec<Arc<Instance>>,
    pub target: Option<Arc<Instance>>,
    pub remote: RemoteAddr,
    pub conn: ConnSlot,
}

impl CallContext {
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub ctx: CallContext,
    pub payload: Bytes,
}

impl RpcRequest {
    pub fn new(ctx: CallContext, payload: Bytes) -> Self {
        Self { ctx, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_key() {
        let t = CallTuple {
            from: "a".into(),
            from_cluster: "x".into(),
            to: "b".into(),
            to_cluster: "".into(),
            method: "Get".into(),
        };
        assert_eq!(t.key(), "b::Get");
    }

    #[test]
    fn test_remote_addr_shared_between_clones() {
        let ctx = CallContext::default();
        let copy = ctx.clone();
        copy.remote.set("10.0.0.1:80".into());
        assert_eq!(ctx.remote.get(), "10.0.0.1:80");
    }

    #[test]
    fn test_remaining() {
        let mut ctx = CallContext::default();
        assert!(ctx.remaining().is_none());
        ctx.deadline = Some(Instant::now() - Duration::from_millis(5));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }
}
