use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use pin_project_lite::pin_project;
use tokio::time::Sleep;
use tracing::debug;

use crate::breaker::ServiceCircuit;
use crate::context::RpcRequest;
use crate::error::{BreakerOutcome, RpcError};

use super::{Interceptor, Next};

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(500);

pin_project! {
    /// Resolves to `None` once `sleep` fires before `inner`.
    pub struct Deadline<F> {
        #[pin]
        inner: F,
        #[pin]
        sleep: Sleep,
    }
}

impl<F> Deadline<F> {
    pub fn new(inner: F, deadline: Instant) -> Self {
        Self {
            inner,
            sleep: tokio::time::sleep_until(deadline.into()),
        }
    }
}

impl<F: Future> Future for Deadline<F> {
    type Output = Option<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(out) = this.inner.poll(cx) {
            return Poll::Ready(Some(out));
        }
        match this.sleep.poll(cx) {
            Poll::Ready(()) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Gates the call edge on its breaker and concurrency ceiling, and runs the
/// rest of the chain as a task raced against the call deadline.
pub struct ServiceBreaker {
    circuit: Arc<ServiceCircuit>,
    cancel_on_timeout: bool,
}

impl ServiceBreaker {
    pub fn new(circuit: Arc<ServiceCircuit>, cancel_on_timeout: bool) -> Self {
        Self { circuit, cancel_on_timeout }
    }
}

impl Interceptor for ServiceBreaker {
    async fn intercept(&self, mut req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        let cfg = req.ctx.breaker.ok_or(RpcError::NoExpectedContextField("service breaker config"))?;
        let timeout = match req.ctx.rpc_timeout {
            Some(t) if t.is_zero() => return Err(RpcError::NoExpectedContextField("rpc timeout")),
            Some(t) => t,
            None => DEFAULT_RPC_TIMEOUT,
        };

        let rich = self.circuit.breaker(&req.ctx.tuple);
        let Some(slot) = rich.breaker.acquire(self.circuit.now_ms(), cfg.max_concurrency) else {
            let t = &req.ctx.tuple;
            return Err(RpcError::ServiceBreaker(format!("service={} method={}", t.to, t.method)));
        };

        let deadline = *req.ctx.deadline.get_or_insert_with(|| Instant::now() + timeout);
        let remote = req.ctx.remote.clone();

        let mut task = tokio::spawn(async move {
            let _slot = slot;
            next.run(req).await
        });

        let breaker = &rich.breaker;
        let trip = Some(cfg.trip);
        match Deadline::new(&mut task, deadline).await {
            Some(Ok(res)) => {
                let now = self.circuit.now_ms();
                match &res {
                    Ok(_) => breaker.succeed(now),
                    Err(_) if !cfg.enabled => breaker.succeed(now),
                    Err(e) => match e.kind().breaker_outcome() {
                        BreakerOutcome::Succeed => breaker.succeed(now),
                        BreakerOutcome::Fail => breaker.fail(now, trip),
                        BreakerOutcome::Ignore => {}
                    },
                }
                res
            }
            Some(Err(join)) => Err(RpcError::Internal(format!("rpc attempt aborted: {join}"))),
            None => {
                if cfg.enabled {
                    breaker.timeout(self.circuit.now_ms(), trip);
                }
                if self.cancel_on_timeout {
                    task.abort();
                } else {
                    debug!(key = %rich.tuple.key(), "attempt detached after timeout");
                }
                Err(RpcError::RpcTimeout { timeout, remote: remote.get() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::breaker::{BreakerState, RateTrip};
    use crate::context::ServiceBreakerConfig;
    use crate::middleware::testing::*;
    use crate::middleware::{Chain, InterceptLayer};
    use tower::util::BoxCloneSyncService;
    use tower::ServiceBuilder;

    fn config(max_concurrency: u64) -> ServiceBreakerConfig {
        ServiceBreakerConfig {
            enabled: true,
            trip: RateTrip::new(0.5, 2),
            max_concurrency,
        }
    }

    fn armed(timeout_ms: u64) -> RpcRequest {
        let mut req = request();
        req.ctx.breaker = Some(config(10));
        req.ctx.rpc_timeout = Some(Duration::from_millis(timeout_ms));
        req
    }

    fn circuit() -> Arc<ServiceCircuit> {
        Arc::new(ServiceCircuit::new(RateTrip::new(0.5, 2), 16))
    }

    struct Stall {
        finished: Arc<AtomicBool>,
    }

    impl Interceptor for Stall {
        async fn intercept(&self, req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
            req.ctx.remote.set("10.0.0.9:80".into());
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished.store(true, Ordering::SeqCst);
            next.run(req).await
        }
    }

    fn stalled(finished: Arc<AtomicBool>) -> Next {
        let svc = ServiceBuilder::new()
            .layer(InterceptLayer::new(Stall { finished }))
            .service(Scripted::ok());
        let chain: Chain = BoxCloneSyncService::new(svc);
        Next::new(chain)
    }

    #[tokio::test]
    async fn test_missing_config() {
        let mw = ServiceBreaker::new(circuit(), true);
        let err = mw.intercept(request(), next(Scripted::ok())).await.unwrap_err();
        assert!(matches!(err, RpcError::NoExpectedContextField(_)));
    }

    #[tokio::test]
    async fn test_zero_timeout_rejected() {
        let mw = ServiceBreaker::new(circuit(), true);
        let err = mw.intercept(armed(0), next(Scripted::ok())).await.unwrap_err();
        assert!(matches!(err, RpcError::NoExpectedContextField("rpc timeout")));
    }

    #[tokio::test]
    async fn test_sets_deadline() {
        let mw = ServiceBreaker::new(circuit(), true);
        let end = Scripted::ok();
        let before = Instant::now();
        mw.intercept(armed(100), next(end.clone())).await.unwrap();
        let deadline = end.last().deadline.unwrap();
        assert!(deadline >= before + Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_timeout_does_not_block() {
        let circuit = circuit();
        let mw = ServiceBreaker::new(circuit.clone(), true);
        let finished = Arc::new(AtomicBool::new(false));
        let t0 = Instant::now();
        let err = mw.intercept(armed(30), stalled(finished.clone())).await.unwrap_err();
        assert!(t0.elapsed() < Duration::from_millis(150));
        match err {
            RpcError::RpcTimeout { timeout, remote } => {
                assert_eq!(timeout, Duration::from_millis(30));
                assert_eq!(remote, "10.0.0.9:80");
            }
            other => panic!("unexpected {other:?}"),
        }
        let metrics = circuit.metrics();
        assert_eq!(metrics[0].timeouts, 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(circuit.metrics()[0].concurrency, 0);
    }

    #[tokio::test]
    async fn test_detached_attempt_completes() {
        let mw = ServiceBreaker::new(circuit(), false);
        let finished = Arc::new(AtomicBool::new(false));
        let err = mw.intercept(armed(30), stalled(finished.clone())).await.unwrap_err();
        assert!(matches!(err, RpcError::RpcTimeout { .. }));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_trips_on_connectivity_errors() {
        let circuit = circuit();
        let mw = ServiceBreaker::new(circuit.clone(), true);
        let end = Scripted::with(vec![
            Err(RpcError::Acl("denied".into())),
            Err(RpcError::NoAvailableInstance),
            Err(RpcError::ConnectRetry(vec![])),
            Err(RpcError::ConnectRetry(vec![])),
        ]);
        for _ in 0..4 {
            let _ = mw.intercept(armed(100), next(end.clone())).await;
        }
        assert_eq!(circuit.metrics()[0].state, BreakerState::Open);

        let err = mw.intercept(armed(100), next(end.clone())).await.unwrap_err();
        assert_eq!(err.to_string(), "not allowed by service breaker: service=callee method=Get");
        assert_eq!(end.calls(), 4);
    }

    #[tokio::test]
    async fn test_disabled_never_trips() {
        let circuit = circuit();
        let mw = ServiceBreaker::new(circuit.clone(), true);
        let end = Scripted::with((0..5).map(|_| Err(RpcError::ConnectRetry(vec![]))).collect());
        for _ in 0..5 {
            let mut req = armed(100);
            req.ctx.breaker = Some(ServiceBreakerConfig { enabled: false, ..config(10) });
            let _ = mw.intercept(req, next(end.clone())).await;
        }
        assert_eq!(circuit.metrics()[0].state, BreakerState::Closed);
        assert_eq!(end.calls(), 5);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let mw = Arc::new(ServiceBreaker::new(circuit(), true));
        let finished = Arc::new(AtomicBool::new(false));
        let mut req = armed(500);
        req.ctx.breaker = Some(config(1));
        let first = {
            let mw = mw.clone();
            let next = stalled(finished);
            tokio::spawn(async move { mw.intercept(req, next).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut req = armed(500);
        req.ctx.breaker = Some(config(1));
        let err = mw.intercept(req, next(Scripted::ok())).await.unwrap_err();
        assert!(matches!(err, RpcError::ServiceBreaker(_)));
        assert!(first.await.unwrap().is_ok());
    }
}
