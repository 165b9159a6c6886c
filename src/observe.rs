//! Injected observability
//!
//! Components receive an `Arc<dyn Observer>` at construction instead of
//! touching process-wide counters. The binary installs `MetricsObserver`
//! (Prometheus via the `metrics` facade); tests use `InMemoryObserver`.

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

pub trait Observer: Send + Sync {
    fn record_event(&self, name: &'static str, count: u64);

    fn record_duration(&self, name: &'static str, elapsed: Duration);
}

pub type SharedObserver = Arc<dyn Observer>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn record_event(&self, _name: &'static str, _count: u64) {}

    fn record_duration(&self, _name: &'static str, _elapsed: Duration) {}
}

/// Forwards to whatever recorder is installed behind the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl Observer for MetricsObserver {
    fn record_event(&self, name: &'static str, count: u64) {
        metrics::counter!(name, count);
    }

    fn record_duration(&self, name: &'static str, elapsed: Duration) {
        metrics::histogram!(name, elapsed.as_secs_f64());
    }
}

/// Counter snapshot kept in memory
#[derive(Debug, Default)]
pub struct InMemoryObserver {
    events: Mutex<HashMap<&'static str, Arc<AtomicU64>>>,
    durations: Mutex<HashMap<&'static str, Vec<Duration>>>,
}

impl InMemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, name: &str) -> u64 {
        self.events
            .lock()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn durations(&self, name: &str) -> usize {
        self.durations.lock().get(name).map(Vec::len).unwrap_or(0)
    }
}

impl Observer for InMemoryObserver {
    fn record_event(&self, name: &'static str, count: u64) {
        let counter = self.events.lock().entry(name).or_default().clone();
        counter.fetch_add(count, Ordering::Relaxed);
    }

    fn record_duration(&self, name: &'static str, elapsed: Duration) {
        self.durations.lock().entry(name).or_default().push(elapsed);
    }
}
