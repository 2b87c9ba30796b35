use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use tracing::debug;

use crate::context::RpcRequest;
use crate::dynconfig::{edge_key, ConfigStore};
use crate::error::RpcError;

use super::{Interceptor, Next};

/// Sheds the configured percentage of calls on an edge.
pub struct Degradation {
    store: Arc<dyn ConfigStore>,
}

impl Degradation {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    fn percent(&self, key: &str) -> Option<u32> {
        match self.store.get_or_set(key, "0") {
            Ok(v) => match v.trim().parse::<u32>() {
                Ok(p) => Some(p),
                Err(e) => {
                    debug!(key = %key, value = %v, error = %e, "invalid degradation percent");
                    None
                }
            },
            Err(e) => {
                debug!(key = %key, error = %e, "degradation unavailable");
                None
            }
        }
    }
}

fn shed<R: Rng + ?Sized>(percent: u32, rng: &mut R) -> bool {
    percent >= 100 || (percent > 0 && rng.random_range(0..=100) < percent)
}

impl Interceptor for Degradation {
    async fn intercept(&self, req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        let key = edge_key(&["rpc", "switches"], &req.ctx.tuple);
        if let Some(per) = self.percent(&key) && shed(per, &mut rand::rng()) {
            return Err(RpcError::Degradation(per));
        }
        next.run(req).await
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::dynconfig::MemoryStore;
    use crate::middleware::testing::*;

    #[test]
    fn test_shed_ratio() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!((0..1000).all(|_| !shed(0, &mut rng)));
        assert!((0..1000).all(|_| shed(100, &mut rng)));
        let n = (0..10_000).filter(|_| shed(30, &mut rng)).count();
        assert!((2700..3300).contains(&n), "shed {n}");
    }

    #[tokio::test]
    async fn test_full_degradation() {
        let store = Arc::new(MemoryStore::new());
        store.set("/rpc/switches/caller/callee/Get", "100");
        let end = Scripted::ok();
        let err = Degradation::new(store).intercept(request(), next(end.clone())).await.unwrap_err();
        assert!(matches!(err, RpcError::Degradation(100)));
        assert_eq!(end.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_value_passes() {
        let store = Arc::new(MemoryStore::new());
        store.set("/rpc/switches/caller/callee/Get", "lots");
        let end = Scripted::ok();
        Degradation::new(store).intercept(request(), next(end.clone())).await.unwrap();
        assert_eq!(end.calls(), 1);
    }
}
