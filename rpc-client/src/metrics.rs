use std::collections::BTreeMap;

use parking_lot::Mutex;

pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// Destination for client counters and timers.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &str, value: u64, tags: Tags<'_>);
    fn timer(&self, name: &str, micros: u64, tags: Tags<'_>);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &str, _value: u64, _tags: Tags<'_>) {}
    fn timer(&self, _name: &str, _micros: u64, _tags: Tags<'_>) {}
}

/// Keeps everything in memory, keyed as `name{k=v,...}` with tags sorted.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    counters: Mutex<BTreeMap<String, u64>>,
    timers: Mutex<BTreeMap<String, Vec<u64>>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, series: &str) -> u64 {
        self.counters.lock().get(series).copied().unwrap_or(0)
    }

    pub fn timer_count(&self, series: &str) -> usize {
        self.timers.lock().get(series).map_or(0, Vec::len)
    }

    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.counters.lock().clone()
    }
}

pub fn series(name: &str, tags: Tags<'_>) -> String {
    let mut sorted: Vec<_> = tags.to_vec();
    sorted.sort();
    let labels = sorted.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}{{{labels}}}")
}

impl MetricsSink for MemoryMetrics {
    fn counter(&self, name: &str, value: u64, tags: Tags<'_>) {
        *self.counters.lock().entry(series(name, tags)).or_default() += value;
    }

    fn timer(&self, name: &str, micros: u64, tags: Tags<'_>) {
        self.timers.lock().entry(series(name, tags)).or_default().push(micros);
    }
}
