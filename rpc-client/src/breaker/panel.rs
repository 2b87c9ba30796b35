use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::context::CallTuple;
use crate::keyed::KeyedCache;

use super::{Breaker, BreakerConfig, BreakerState, RateTrip};

/// Snapshot of one service breaker, keyed by its call edge.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BreakerMetrics {
    pub from: String,
    pub from_cluster: String,
    pub to: String,
    pub to_cluster: String,
    pub method: String,
    pub state: BreakerState,
    pub concurrency: i64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub conse_errors: u64,
    pub error_rate: f64,
}

pub struct RichBreaker {
    pub tuple: CallTuple,
    pub breaker: Arc<Breaker>,
}

/// Service level breakers, one per `to:to_cluster:method`.
pub struct ServiceCircuit {
    cfg: BreakerConfig,
    breakers: KeyedCache<Arc<RichBreaker>>,
    origin: Instant,
}

impl ServiceCircuit {
    pub fn new(trip: RateTrip, capacity: usize) -> Self {
        Self {
            cfg: BreakerConfig { trip, ..Default::default() },
            breakers: KeyedCache::new(capacity),
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn breaker(&self, tuple: &CallTuple) -> Arc<RichBreaker> {
        self.breakers.get_or_insert_with(&tuple.key(), || Arc::new(RichBreaker {
            tuple: tuple.clone(),
            breaker: Arc::new(Breaker::new(self.cfg.clone())),
        }))
    }

    pub fn metrics(&self) -> Vec<BreakerMetrics> {
        let now = self.now_ms();
        let mut all: Vec<BreakerMetrics> = self.breakers.snapshot()
            .into_iter()
            .map(|(_, rb)| {
                let counts = rb.breaker.counts(now);
                BreakerMetrics {
                    from: rb.tuple.from.clone(),
                    from_cluster: rb.tuple.from_cluster.clone(),
                    to: rb.tuple.to.clone(),
                    to_cluster: rb.tuple.to_cluster.clone(),
                    method: rb.tuple.method.clone(),
                    state: rb.breaker.load_state(),
                    concurrency: rb.breaker.concurrency(),
                    successes: counts.successes,
                    failures: counts.failures,
                    timeouts: counts.timeouts,
                    conse_errors: rb.breaker.conse_errors(),
                    error_rate: counts.error_rate(),
                }
            })
            .collect();
        all.sort_by(|a, b| (&a.to, &a.method).cmp(&(&b.to, &b.method)));
        all
    }
}

/// Endpoint level breakers keyed by `host:port`.
pub struct InstanceCircuit {
    cfg: BreakerConfig,
    breakers: KeyedCache<Arc<Breaker>>,
    origin: Instant,
}

impl InstanceCircuit {
    pub fn new(capacity: usize) -> Self {
        Self {
            cfg: BreakerConfig {
                trip: RateTrip::new(0.15, 20),
                cooling_ms: 3_000,
                detect_ms: 100,
                ..Default::default()
            },
            breakers: KeyedCache::new(capacity),
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn breaker(&self, addr: &str) -> Arc<Breaker> {
        self.breakers.get_or_insert_with(addr, || Arc::new(Breaker::new(self.cfg.clone())))
    }

    pub fn states(&self) -> Vec<(String, BreakerState)> {
        let mut all: Vec<_> = self.breakers.snapshot()
            .into_iter()
            .map(|(addr, b)| (addr, b.load_state()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
