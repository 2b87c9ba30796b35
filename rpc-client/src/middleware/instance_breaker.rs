use std::sync::Arc;

use bytes::Bytes;

use crate::breaker::InstanceCircuit;
use crate::context::RpcRequest;
use crate::error::RpcError;

use super::{Interceptor, Next};

/// Gates the selected endpoint. Only failing to get a connection counts
/// against it.
pub struct InstanceBreaker {
    circuit: Arc<InstanceCircuit>,
}

impl InstanceBreaker {
    pub fn new(circuit: Arc<InstanceCircuit>) -> Self {
        Self { circuit }
    }
}

impl Interceptor for InstanceBreaker {
    async fn intercept(&self, req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        let addr = req.ctx.target.as_ref()
            .map(|ins| ins.addr())
            .ok_or(RpcError::NoExpectedContextField("target instance"))?;
        let breaker = self.circuit.breaker(&addr);
        if !breaker.is_allowed(self.circuit.now_ms()) {
            return Err(RpcError::InstanceBreaker(addr));
        }
        let res = next.run(req).await;
        let now = self.circuit.now_ms();
        match &res {
            Err(RpcError::GetConnection { .. }) => breaker.fail(now, None),
            _ => breaker.succeed(now),
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;

    use super::*;
    use crate::breaker::BreakerState;
    use crate::instance::Instance;
    use crate::middleware::testing::*;

    fn targeted() -> RpcRequest {
        let mut req = request();
        req.ctx.target = Some(Arc::new(Instance::new("10.0.0.1", 80, HashMap::new())));
        req
    }

    #[tokio::test]
    async fn test_trips_on_connection_failures() {
        let circuit = Arc::new(InstanceCircuit::new(16));
        let mw = InstanceBreaker::new(circuit.clone());
        let end = Scripted::with((0..20).map(|_| Err(RpcError::GetConnection {
            addr: "10.0.0.1:80".into(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        })).collect());
        for _ in 0..20 {
            let _ = mw.intercept(targeted(), next(end.clone())).await;
        }
        assert_eq!(circuit.states(), vec![("10.0.0.1:80".to_string(), BreakerState::Open)]);

        let err = mw.intercept(targeted(), next(end.clone())).await.unwrap_err();
        assert!(matches!(err, RpcError::InstanceBreaker(ref a) if a == "10.0.0.1:80"));
        assert_eq!(end.calls(), 20);
    }

    #[tokio::test]
    async fn test_business_errors_do_not_count() {
        let circuit = Arc::new(InstanceCircuit::new(16));
        let mw = InstanceBreaker::new(circuit.clone());
        let end = Scripted::with((0..30).map(|_| Err(RpcError::Remote("bad".into()))).collect());
        for _ in 0..30 {
            let _ = mw.intercept(targeted(), next(end.clone())).await;
        }
        assert_eq!(circuit.states()[0].1, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_requires_target() {
        let mw = InstanceBreaker::new(Arc::new(InstanceCircuit::new(16)));
        let err = mw.intercept(request(), next(Scripted::ok())).await.unwrap_err();
        assert!(matches!(err, RpcError::NoExpectedContextField(_)));
    }
}
