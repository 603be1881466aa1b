//! Counters for control-plane traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Lifecycle and invocation counters. All updates are relaxed atomics.
#[derive(Debug, Default)]
pub struct ControlPlaneMetrics {
    loads: AtomicU64,
    load_failures: AtomicU64,
    unloads: AtomicU64,
    invocations: AtomicU64,
    invocation_failures: AtomicU64,
    invocation_latency_us: AtomicU64,
}

impl ControlPlaneMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of a load.
    pub fn record_load(&self, ok: bool) {
        if ok {
            self.loads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.load_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records an unload that removed a model.
    pub fn record_unload(&self) {
        self.unloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished invocation.
    pub fn record_invocation(&self, ok: bool, elapsed: Duration) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.invocation_failures.fetch_add(1, Ordering::Relaxed);
        }
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.invocation_latency_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let invocations = self.invocations.load(Ordering::Relaxed);
        let total_us = self.invocation_latency_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            unloads: self.unloads.load(Ordering::Relaxed),
            invocations,
            invocation_failures: self.invocation_failures.load(Ordering::Relaxed),
            average_invocation_ms: if invocations == 0 {
                0.0
            } else {
                (total_us as f64 / invocations as f64) / 1000.0
            },
        }
    }
}

/// Serializable view of [`ControlPlaneMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Successful loads.
    pub loads: u64,
    /// Failed loads.
    pub load_failures: u64,
    /// Unloads that removed a model.
    pub unloads: u64,
    /// Invocations, successful or not.
    pub invocations: u64,
    /// Invocations that returned an error.
    pub invocation_failures: u64,
    /// Mean invocation latency.
    pub average_invocation_ms: f64,
}

/// Measures an operation and logs its duration when stopped.
pub struct OperationTimer {
    start: Instant,
    label: &'static str,
}

impl OperationTimer {
    /// Starts a new timer.
    #[must_use]
    pub fn start(label: &'static str) -> Self {
        Self {
            start: Instant::now(),
            label,
        }
    }

    /// Elapsed time so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer, logs the duration and returns it.
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();
        tracing::debug!(
            label = self.label,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Operation finished"
        );
        elapsed
    }
}
