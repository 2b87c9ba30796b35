use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::keyed::KeyedCache;

pub const SAMPLE_WINDOW: usize = 1024;

/// Rolling record of whether recent calls were retries.
pub struct RetrySample {
    slots: Box<[AtomicBool]>,
    idx: AtomicUsize,
    retried: AtomicI64,
}

impl RetrySample {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size.max(1)).map(|_| AtomicBool::new(false)).collect(),
            idx: AtomicUsize::new(0),
            retried: AtomicI64::new(0),
        }
    }

    pub fn record(&self, retried: bool) {
        let i = self.idx.fetch_add(1, Ordering::AcqRel) % self.slots.len();
        let old = self.slots[i].swap(retried, Ordering::AcqRel);
        match (old, retried) {
            (true, false) => { self.retried.fetch_sub(1, Ordering::AcqRel); }
            (false, true) => { self.retried.fetch_add(1, Ordering::AcqRel); }
            _ => {}
        }
    }

    pub fn retried(&self) -> i64 {
        self.retried.load(Ordering::Acquire)
    }

    /// True when more than `limit_rate` of the window is already retries.
    pub fn over_limit(&self, limit_rate: f64) -> bool {
        self.retried() > (self.slots.len() as f64 * limit_rate) as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retry: u32,
    pub limit_rate: f64,
}

/// Retry budgets per `to:to_cluster:method`.
pub struct RetryManager {
    samples: KeyedCache<Arc<RetrySample>>,
}

impl RetryManager {
    pub fn new(capacity: usize) -> Self {
        Self { samples: KeyedCache::new(capacity) }
    }

    pub fn sample(&self, key: &str) -> Arc<RetrySample> {
        self.samples.get_or_insert_with(key, || Arc::new(RetrySample::new(SAMPLE_WINDOW)))
    }

    /// Run `attempt` once, then again while `should_retry` holds, the
    /// per-call budget lasts and the key's window is under its limit.
    pub async fn run<T, E, F, Fut>(
        &self,
        key: &str,
        policy: RetryPolicy,
        should_retry: impl Fn(&Result<T, E>) -> bool,
        mut attempt: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let sample = self.sample(key);
        let mut res = attempt().await;
        sample.record(false);

        let mut retries = 0;
        while should_retry(&res) {
            if retries >= policy.max_retry {
                break;
            }
            if sample.over_limit(policy.limit_rate) {
                debug!(key = %key, retried = sample.retried(), "retry refused, window over limit");
                break;
            }
            retries += 1;
            res = attempt().await;
            sample.record(true);
        }
        res
    }
}
