use std::sync::{
    atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

pub mod panel;

pub use panel::{BreakerMetrics, InstanceCircuit, ServiceCircuit};

/// Trip when the error rate reaches `rate` over at least `min_samples`
/// observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateTrip {
    pub rate: f64,
    pub min_samples: u64,
}

impl RateTrip {
    pub fn new(rate: f64, min_samples: u64) -> Self {
        Self { rate, min_samples }
    }

    pub fn should_trip(&self, counts: &Counts) -> bool {
        let samples = counts.samples();
        samples >= self.min_samples && counts.error_rate() >= self.rate
    }
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub window_ms: u64,
    pub buckets: usize,
    pub trip: RateTrip,
    /// time spent Open before a probe is let through
    pub cooling_ms: u64,
    /// minimum gap between probes while HalfOpen
    pub detect_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_ms: 10_000,
            buckets: 10,
            trip: RateTrip::new(0.5, 200),
            cooling_ms: 5_000,
            detect_ms: 200,
        }
    }
}

#[repr(usize)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
}

impl Counts {
    pub fn samples(&self) -> u64 {
        self.successes + self.failures + self.timeouts
    }

    pub fn error_rate(&self) -> f64 {
        let samples = self.samples();
        if samples == 0 {
            return 0.0;
        }
        (self.failures + self.timeouts) as f64 / samples as f64
    }
}

#[derive(Clone, Copy, Default)]
struct Bucket {
    start_ms: u64,
    counts: Counts,
}

/// Rolling window split into fixed buckets; a bucket is reset when the
/// clock comes back around to it.
struct Window {
    bucket_ms: u64,
    buckets: Vec<Bucket>,
}

impl Window {
    fn new(window_ms: u64, n: usize) -> Self {
        let n = n.max(1);
        Self {
            bucket_ms: (window_ms / n as u64).max(1),
            buckets: vec![Bucket::default(); n],
        }
    }

    fn bucket(&mut self, now_ms: u64) -> &mut Counts {
        let start = now_ms - now_ms % self.bucket_ms;
        let idx = (now_ms / self.bucket_ms) as usize % self.buckets.len();
        let b = &mut self.buckets[idx];
        if b.start_ms != start {
            *b = Bucket { start_ms: start, counts: Counts::default() };
        }
        &mut b.counts
    }

    fn sum(&self, now_ms: u64) -> Counts {
        let span = self.bucket_ms * self.buckets.len() as u64;
        self.buckets.iter()
            .filter(|b| now_ms.saturating_sub(b.start_ms) < span)
            .fold(Counts::default(), |mut acc, b| {
                acc.successes += b.counts.successes;
                acc.failures += b.counts.failures;
                acc.timeouts += b.counts.timeouts;
                acc
            })
    }

    fn reset(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = Bucket::default());
    }
}

enum Outcome { Success, Failure, Timeout }

pub struct Breaker {
    cfg: BreakerConfig,
    state: AtomicUsize,      // BreakerState
    opened_at_ms: AtomicU64, // valid when Open
    last_probe_ms: AtomicU64,
    win: Mutex<Window>,
    concurrency: AtomicI64,
    conse_errors: AtomicU64,
}

impl Breaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        let win = Window::new(cfg.window_ms, cfg.buckets);
        Self {
            cfg,
            state: AtomicUsize::new(BreakerState::Closed as usize),
            opened_at_ms: AtomicU64::new(0),
            last_probe_ms: AtomicU64::new(0),
            win: Mutex::new(win),
            concurrency: AtomicI64::new(0),
            conse_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn load_state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            0 => BreakerState::Closed,
            1 => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }

    fn set_state(&self, s: BreakerState, now_ms: u64) {
        match s {
            BreakerState::Closed => {
                self.win.lock().reset();
                self.conse_errors.store(0, Ordering::Relaxed);
            }
            BreakerState::Open => {
                self.opened_at_ms.store(now_ms, Ordering::Release);
            }
            BreakerState::HalfOpen => {
                self.last_probe_ms.store(now_ms, Ordering::Release);
            }
        }
        self.state.store(s as usize, Ordering::Release);
    }

    /// should we allow this request
    pub fn is_allowed(&self, now_ms: u64) -> bool {
        match self.load_state() {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                if now_ms.saturating_sub(opened) < self.cfg.cooling_ms {
                    return false;
                }
                // only one caller wins the transition and becomes the probe
                self.state.compare_exchange(
                    BreakerState::Open as usize,
                    BreakerState::HalfOpen as usize,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ).map(|_| self.last_probe_ms.store(now_ms, Ordering::Release))
                .is_ok()
            }
            BreakerState::HalfOpen => {
                let last = self.last_probe_ms.load(Ordering::Acquire);
                now_ms.saturating_sub(last) >= self.cfg.detect_ms
                    && self.last_probe_ms
                        .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
            }
        }
    }

    /// Like [`Breaker::is_allowed`], but also enforces a ceiling on
    /// in-flight calls. The returned guard releases its slot on drop.
    pub fn acquire(self: &Arc<Self>, now_ms: u64, max_concurrency: u64) -> Option<InFlight> {
        let current = self.concurrency.fetch_add(1, Ordering::AcqRel);
        if current >= max_concurrency as i64 {
            self.concurrency.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        if !self.is_allowed(now_ms) {
            self.concurrency.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(InFlight { breaker: self.clone() })
    }

    pub fn concurrency(&self) -> i64 {
        self.concurrency.load(Ordering::Acquire)
    }

    pub fn succeed(&self, now_ms: u64) {
        self.record(now_ms, Outcome::Success, None);
    }

    pub fn fail(&self, now_ms: u64, trip: Option<RateTrip>) {
        self.record(now_ms, Outcome::Failure, trip);
    }

    pub fn timeout(&self, now_ms: u64, trip: Option<RateTrip>) {
        self.record(now_ms, Outcome::Timeout, trip);
    }

    fn record(&self, now_ms: u64, outcome: Outcome, trip: Option<RateTrip>) {
        let ok = matches!(outcome, Outcome::Success);
        if ok {
            self.conse_errors.store(0, Ordering::Relaxed);
        } else {
            self.conse_errors.fetch_add(1, Ordering::Relaxed);
        }

        match self.load_state() {
            BreakerState::Closed => {
                let mut w = self.win.lock();
                let b = w.bucket(now_ms);
                match outcome {
                    Outcome::Success => b.successes += 1,
                    Outcome::Failure => b.failures += 1,
                    Outcome::Timeout => b.timeouts += 1,
                }
                if ok {
                    return;
                }
                let counts = w.sum(now_ms);
                let trip = trip.unwrap_or(self.cfg.trip);
                if trip.should_trip(&counts) {
                    drop(w);
                    warn!(
                        error_rate = counts.error_rate(),
                        samples = counts.samples(),
                        "circuit breaker opened"
                    );
                    self.set_state(BreakerState::Open, now_ms);
                }
            }
            BreakerState::Open => {}
            BreakerState::HalfOpen => {
                if ok {
                    self.set_state(BreakerState::Closed, now_ms);
                    tracing::info!("circuit breaker closed after successful probe");
                } else {
                    self.set_state(BreakerState::Open, now_ms); // any failure -> Open
                }
            }
        }
    }

    pub fn counts(&self, now_ms: u64) -> Counts {
        self.win.lock().sum(now_ms)
    }

    pub fn conse_errors(&self) -> u64 {
        self.conse_errors.load(Ordering::Relaxed)
    }
}

/// One admitted call; gives its concurrency slot back when dropped.
pub struct InFlight {
    breaker: Arc<Breaker>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.breaker.concurrency.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(rate: f64, min_samples: u64) -> BreakerConfig {
        BreakerConfig {
            trip: RateTrip::new(rate, min_samples),
            cooling_ms: 1_000,
            detect_ms: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_allowed_until_min_samples() {
        let b = Breaker::new(cfg(0.5, 10));
        for i in 0..9 {
            b.fail(i, None);
            assert!(b.is_allowed(i), "tripped after {} samples", i + 1);
        }
        b.fail(9, None);
        assert_eq!(b.load_state(), BreakerState::Open);
        assert!(!b.is_allowed(10));
    }

    #[test]
    fn test_outcomes_while_open_keep_it_open() {
        let b = Breaker::new(cfg(0.5, 2));
        b.fail(0, None);
        b.fail(1, None);
        assert_eq!(b.load_state(), BreakerState::Open);

        b.succeed(50);
        b.fail(60, None);
        assert_eq!(b.load_state(), BreakerState::Open);
        assert!(!b.is_allowed(500));
        assert_eq!(BreakerState::HalfOpen as usize, 2);
    }

    #[test]
    fn test_below_rate_stays_closed() {
        let b = Breaker::new(cfg(0.5, 10));
        for i in 0..20 {
            if i % 3 == 0 {
                b.fail(i, None)
            } else {
                b.succeed(i)
            }
        }
        assert_eq!(b.load_state(), BreakerState::Closed);
        assert!(b.is_allowed(20));
    }

    #[test]
    fn test_timeouts_count_as_errors() {
        let b = Breaker::new(cfg(0.5, 4));
        b.succeed(0);
        b.succeed(1);
        b.timeout(2, None);
        b.timeout(3, None);
        assert_eq!(b.load_state(), BreakerState::Open);
    }

    #[test]
    fn test_per_call_trip_overrides_default() {
        let b = Breaker::new(cfg(0.5, 1000));
        b.fail(0, Some(RateTrip::new(0.5, 1)));
        assert_eq!(b.load_state(), BreakerState::Open);
    }

    #[test]
    fn test_cooldown_then_probe() {
        let b = Breaker::new(cfg(0.5, 2));
        b.fail(0, None);
        b.fail(1, None);
        assert!(!b.is_allowed(500));
        assert!(b.is_allowed(1_001));
        assert_eq!(b.load_state(), BreakerState::HalfOpen);
        // second probe must wait for the detect interval
        assert!(!b.is_allowed(1_050));
        assert!(b.is_allowed(1_101));
    }

    #[test]
    fn test_half_open_success_closes() {
        let b = Breaker::new(cfg(0.5, 2));
        b.fail(0, None);
        b.fail(1, None);
        assert!(b.is_allowed(1_001));
        b.succeed(1_002);
        assert_eq!(b.load_state(), BreakerState::Closed);
        assert_eq!(b.counts(1_002).samples(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = Breaker::new(cfg(0.5, 2));
        b.fail(0, None);
        b.fail(1, None);
        assert!(b.is_allowed(1_001));
        b.fail(1_002, None);
        assert_eq!(b.load_state(), BreakerState::Open);
        assert!(!b.is_allowed(1_500));
        assert!(b.is_allowed(2_003));
    }

    #[test]
    fn test_old_buckets_fall_out() {
        let b = Breaker::new(cfg(0.5, 4));
        b.fail(0, None);
        b.fail(1, None);
        b.fail(2, None);
        // far outside the 10s window
        b.fail(30_000, None);
        assert_eq!(b.load_state(), BreakerState::Closed);
        assert_eq!(b.counts(30_000).failures, 1);
    }

    #[test]
    fn test_concurrency_ceiling() {
        let b = Arc::new(Breaker::new(cfg(0.5, 2)));
        let g1 = b.acquire(0, 2).unwrap();
        let _g2 = b.acquire(0, 2).unwrap();
        assert!(b.acquire(0, 2).is_none());
        assert_eq!(b.concurrency(), 2);
        drop(g1);
        assert!(b.acquire(0, 2).is_some());
    }

    #[test]
    fn test_conse_errors() {
        let b = Breaker::new(cfg(0.9, 1000));
        b.fail(0, None);
        b.fail(1, None);
        assert_eq!(b.conse_errors(), 2);
        b.succeed(2);
        assert_eq!(b.conse_errors(), 0);
    }
}
