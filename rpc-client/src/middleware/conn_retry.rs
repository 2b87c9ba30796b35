use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::warn;

use crate::balance::WeightedBalancer;
use crate::context::RpcRequest;
use crate::error::RpcError;

use super::{Interceptor, Next};

/// Kept free before the call deadline for the response to travel back.
const DEADLINE_MARGIN: Duration = Duration::from_millis(2);

/// Balances over the discovered instances and moves on to the next one
/// while the attempt fails to get a connection.
pub struct ConnRetry {
    window: Duration,
    min_dial_timeout: Duration,
}

impl ConnRetry {
    pub fn new(window: Duration, min_dial_timeout: Duration) -> Self {
        Self { window, min_dial_timeout }
    }

    /// Splits what is left of the window evenly over the remaining
    /// candidates, capped by the configured connect timeout.
    fn dial_timeout(&self, left: Duration, candidates: usize, cap: Option<Duration>) -> Duration {
        let share = left / candidates.max(1) as u32;
        let share = cap.map_or(share, |c| share.min(c));
        share.max(self.min_dial_timeout)
    }
}

impl Interceptor for ConnRetry {
    async fn intercept(&self, req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        if req.ctx.instances.is_empty() {
            return Err(RpcError::NoExpectedContextField("instances"));
        }
        let mut lb = WeightedBalancer::new(req.ctx.instances.clone());

        let start = Instant::now();
        let mut end = start + req.ctx.conn_retry_window.unwrap_or(self.window);
        if let Some(deadline) = req.ctx.deadline {
            end = end.min(deadline.checked_sub(DEADLINE_MARGIN).unwrap_or(start));
        }

        let mut errs = Vec::new();
        loop {
            let now = Instant::now();
            if now >= end {
                errs.push(RpcError::RpcTimeout {
                    timeout: end.saturating_duration_since(start),
                    remote: req.ctx.remote.get(),
                });
                return Err(RpcError::ConnectRetry(errs));
            }
            let Some(ins) = lb.select_one() else {
                errs.push(RpcError::NoAvailableInstance);
                return Err(RpcError::ConnectRetry(errs));
            };
            req.ctx.remote.set(ins.addr());

            let mut attempt = req.clone();
            attempt.ctx.conn_timeout = Some(self.dial_timeout(end - now, lb.remaining() + 1, req.ctx.conn_timeout));
            attempt.ctx.target = Some(ins);
            match next.clone().run(attempt).await {
                Ok(resp) => return Ok(resp),
                Err(e @ RpcError::InstanceBreaker(_)) => errs.push(e),
                Err(e @ RpcError::GetConnection { .. }) => {
                    warn!(to = %req.ctx.tuple.to, error = %e, "get connection failed");
                    errs.push(e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;
    use std::sync::Arc;

    use super::*;
    use crate::instance::Instance;
    use crate::middleware::testing::*;

    fn conn_err(addr: &str) -> RpcError {
        RpcError::GetConnection {
            addr: addr.into(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        }
    }

    fn with_instances(n: usize) -> RpcRequest {
        let mut req = request();
        req.ctx.instances = (0..n)
            .map(|i| Arc::new(Instance::new(format!("10.0.0.{i}"), 80, HashMap::new())))
            .collect();
        req
    }

    fn retry() -> ConnRetry {
        ConnRetry::new(Duration::from_secs(1), Duration::from_millis(30))
    }

    #[tokio::test]
    async fn test_moves_to_next_instance() {
        let end = Scripted::with(vec![
            Err(conn_err("a")),
            Err(RpcError::InstanceBreaker("b".into())),
            Ok(Bytes::from_static(b"pong")),
        ]);
        let req = with_instances(3);
        let remote = req.ctx.remote.clone();
        let out = retry().intercept(req, next(end.clone())).await.unwrap();
        assert_eq!(out, Bytes::from_static(b"pong"));
        assert_eq!(end.calls(), 3);

        let mut targets: Vec<String> = end.seen.lock().iter()
            .map(|c| c.target.as_ref().unwrap().addr())
            .collect();
        assert_eq!(remote.get(), targets[2]);
        targets.sort();
        targets.dedup();
        assert_eq!(targets.len(), 3);
    }

    #[tokio::test]
    async fn test_other_errors_stop_the_loop() {
        let end = Scripted::with(vec![Err(RpcError::Remote("bad".into()))]);
        let err = retry().intercept(with_instances(3), next(end.clone())).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(_)));
        assert_eq!(end.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted() {
        let end = Scripted::with(vec![Err(conn_err("a")), Err(conn_err("b"))]);
        let err = retry().intercept(with_instances(2), next(end)).await.unwrap_err();
        match err {
            RpcError::ConnectRetry(errs) => {
                assert_eq!(errs.len(), 3);
                assert!(matches!(errs[2], RpcError::NoAvailableInstance));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_passed() {
        let end = Scripted::ok();
        let mut req = with_instances(2);
        req.ctx.deadline = Some(Instant::now());
        let err = retry().intercept(req, next(end.clone())).await.unwrap_err();
        match err {
            RpcError::ConnectRetry(errs) => assert!(matches!(errs[0], RpcError::RpcTimeout { .. })),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(end.calls(), 0);
    }

    #[tokio::test]
    async fn test_requires_instances() {
        let err = retry().intercept(request(), next(Scripted::ok())).await.unwrap_err();
        assert!(matches!(err, RpcError::NoExpectedContextField("instances")));
    }

    #[tokio::test]
    async fn test_dial_timeout_split() {
        let end = Scripted::ok();
        let mut req = with_instances(3);
        req.ctx.deadline = Some(Instant::now() + Duration::from_millis(302));
        retry().intercept(req, next(end.clone())).await.unwrap();
        let t = end.last().conn_timeout.unwrap();
        assert!(t <= Duration::from_millis(100) && t >= Duration::from_millis(90), "{t:?}");
    }

    #[test]
    fn test_dial_timeout_bounds() {
        let r = retry();
        assert_eq!(r.dial_timeout(Duration::from_millis(900), 3, None), Duration::from_millis(300));
        assert_eq!(r.dial_timeout(Duration::from_millis(900), 3, Some(Duration::from_millis(50))), Duration::from_millis(50));
        assert_eq!(r.dial_timeout(Duration::from_millis(20), 2, None), Duration::from_millis(30));
    }
}
