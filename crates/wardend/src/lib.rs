//! wardend — reliability supervisor for a long-running AI-agent gateway.
//!
//! Watches the gateway's liveness, HTTP health, network reachability, and
//! configuration integrity from a single cooperative tick loop, and restarts
//! or rolls back when the signals diverge from healthy.

#![forbid(unsafe_code)]

pub mod backup;
pub mod config;
pub mod metrics;
pub mod status;
pub mod supervisor;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock as epoch seconds.
pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
