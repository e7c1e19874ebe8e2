//! Operation counters for the tick loop, logged as a structured summary.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// A thread-safe u64 counter backed by an atomic.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters for everything the supervisor does that an operator would ask
/// about after an incident.
#[derive(Debug, Default)]
pub struct OpsMetrics {
    /// Completed loop iterations.
    pub ticks: Counter,
    /// Restarts actually invoked.
    pub restarts_issued: Counter,
    /// Restarts warranted but held by the cooldown.
    pub restarts_suppressed: Counter,
    /// Config rollbacks fired by the safeguard.
    pub rollbacks: Counter,
    /// Armed tickets confirmed (auto or manual).
    pub confirms: Counter,
    /// Heartbeat sweeps executed.
    pub heartbeat_sweeps: Counter,
    /// Config backups archived.
    pub backups: Counter,
}

impl OpsMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a one-line summary of all counters.
    pub fn log_summary(&self) {
        info!(
            ticks = self.ticks.get(),
            restarts_issued = self.restarts_issued.get(),
            restarts_suppressed = self.restarts_suppressed.get(),
            rollbacks = self.rollbacks.get(),
            confirms = self.confirms.get(),
            heartbeat_sweeps = self.heartbeat_sweeps.get(),
            backups = self.backups.get(),
            "supervisor counters"
        );
    }
}
