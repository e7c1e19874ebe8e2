//! End-to-end supervisor scenarios, driven through the pure health engine
//! and a tempdir-backed config safeguard.
//!
//! Each scenario maps ticks to epochs at the default 15 s period: tick N
//! happens at `T0 + 15 * (N - 1)`.

use chrono::{Duration as ChronoDuration, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use warden_health::{
    GatewayHealthEngine, HealthPolicy, RestartReason, TickDecision, TickSignals,
};
use warden_heartbeat::{AgentWorkspace, GatewayCondition, HeartbeatAction, HeartbeatMonitor};
use warden_safeguard::{ConfigSafeguard, SafeguardEvent};

const T0: u64 = 1_750_000_000;
const TICK: u64 = 15;

fn tick_epoch(n: u64) -> u64 {
    T0 + TICK * (n - 1)
}

fn signals(healthy: bool, tick: u64) -> TickSignals {
    TickSignals {
        liveness: true,
        http_healthy: healthy,
        online: true,
        proxy_ok: None,
        uptime_secs: 100_000 + TICK * tick,
    }
}

fn safeguard_fixture(dir: &Path, rollback_timeout: u64) -> (PathBuf, ConfigSafeguard) {
    let config = dir.join("gateway.json");
    fs::write(&config, br#"{"fleet":"v1"}"#).expect("write config");
    let sg = ConfigSafeguard::new(config.clone(), dir, rollback_timeout, 10)
        .with_change_settle(Duration::ZERO);
    (config, sg)
}

// ─── Scenario 1: transient blip ───────────────────────────────────────────────

#[test]
fn transient_blip_backs_off_without_restart() {
    let mut engine = GatewayHealthEngine::new(HealthPolicy {
        backoff_initial: 30,
        check_interval: TICK,
        ..HealthPolicy::default()
    });

    let trace = [true, true, false, false, true, true];
    let mut restarts = 0;
    for (i, healthy) in trace.iter().enumerate() {
        let n = i as u64 + 1;
        let decision = engine.observe(&signals(*healthy, n), tick_epoch(n));
        match (n, decision) {
            (1 | 2 | 5 | 6, TickDecision::Idle) => {}
            (3, TickDecision::BackoffWaiting { remaining_secs }) => {
                assert_eq!(remaining_secs, 30, "ladder enters at the initial wait");
            }
            (4, TickDecision::BackoffWaiting { .. }) => {}
            (_, TickDecision::Restart { .. }) => restarts += 1,
            (n, other) => panic!("tick {n}: unexpected decision {other:?}"),
        }
    }
    assert_eq!(restarts, 0, "a blip shorter than the first wait never restarts");
    assert!(!engine.backoff().active(), "recovery at tick 5 resets the ladder");
}

// ─── Scenario 2: persistent fault ─────────────────────────────────────────────

#[test]
fn persistent_fault_restarts_once_per_cooldown() {
    let mut engine = GatewayHealthEngine::new(HealthPolicy {
        check_interval: TICK,
        backoff_initial: 30,
        backoff_multiplier: 2.0,
        backoff_max: 300,
        cooldown: 120,
        ..HealthPolicy::default()
    });

    // Ladder under constant failure: 30 → 60 → 120 → 240; the escalation to
    // 480 exceeds the cap, so the first restart lands when the 240 s wait
    // expires (t = 450, tick 31).
    let mut restart_ticks = Vec::new();
    for n in 1..=70u64 {
        let now = tick_epoch(n);
        match engine.observe(&signals(false, n), now) {
            TickDecision::Restart { reason } => {
                assert_eq!(reason, RestartReason::BackoffExhausted);
                engine.record_restart(now);
                restart_ticks.push(n);
            }
            TickDecision::BackoffWaiting { .. } => {
                assert!(engine.backoff().wait_secs <= 300, "wait bounded by the cap");
            }
            TickDecision::RestartSuppressed { .. } => {}
            other => panic!("tick {n}: unexpected decision {other:?}"),
        }
    }

    assert_eq!(restart_ticks.len(), 2, "seventy failing ticks yield two restarts");
    assert_eq!(restart_ticks[0], 31);
    // The second restart needs the cooldown to expire *and* the ladder to
    // re-escalate all the way back up.
    let gap = (restart_ticks[1] - restart_ticks[0]) * TICK;
    assert!(gap >= 120, "restarts at least one cooldown apart (gap {gap}s)");
}

// ─── Scenario 3: good config change ───────────────────────────────────────────

#[test]
fn good_config_change_auto_confirms() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (config, mut sg) = safeguard_fixture(dir.path(), 300);

    assert_eq!(sg.tick(true, tick_epoch(1)), SafeguardEvent::Bootstrapped);
    for n in 2..5 {
        assert_eq!(sg.tick(true, tick_epoch(n)), SafeguardEvent::Idle);
    }

    fs::write(&config, br#"{"fleet":"v2"}"#).unwrap();
    let deadline = match sg.tick(true, tick_epoch(5)) {
        SafeguardEvent::Armed { deadline, .. } => deadline,
        other => panic!("tick 5 should arm, got {other:?}"),
    };
    assert_eq!(deadline, tick_epoch(5) + 300);

    // Healthy from tick 7 onward; the window simply runs out.
    let mut confirmed_at = None;
    for n in 6..=30u64 {
        match sg.tick(true, tick_epoch(n)) {
            SafeguardEvent::ArmedWaiting { .. } => {}
            SafeguardEvent::Confirmed => {
                confirmed_at = Some(n);
                break;
            }
            SafeguardEvent::RolledBack { .. } => panic!("healthy window must not roll back"),
            other => panic!("tick {n}: unexpected event {other:?}"),
        }
    }
    assert_eq!(confirmed_at, Some(25), "deadline = arm tick + 300 s = tick 25");
    assert!(sg.armed().is_none());
    // The accepted content stays live.
    assert_eq!(fs::read(&config).unwrap(), br#"{"fleet":"v2"}"#);
}

// ─── Scenario 4: bad config change ────────────────────────────────────────────

#[test]
fn bad_config_change_rolls_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (config, mut sg) = safeguard_fixture(dir.path(), 300);

    sg.tick(true, tick_epoch(1));
    fs::write(&config, br#"{"fleet":"broken"}"#).unwrap();
    let armed_snapshot = match sg.tick(true, tick_epoch(5)) {
        SafeguardEvent::Armed { snapshot, .. } => snapshot,
        other => panic!("tick 5 should arm, got {other:?}"),
    };

    assert!(matches!(
        sg.tick(true, tick_epoch(6)),
        SafeguardEvent::ArmedWaiting { .. }
    ));

    // Gateway unhealthy at tick 7: immediate rollback, no deadline wait.
    match sg.tick(false, tick_epoch(7)) {
        SafeguardEvent::RolledBack { snapshot } => assert_eq!(snapshot, armed_snapshot),
        other => panic!("tick 7 should roll back, got {other:?}"),
    }

    assert_eq!(
        fs::read(&config).unwrap(),
        fs::read(&armed_snapshot).unwrap(),
        "config byte-equal to the tick-5 snapshot"
    );
    assert!(sg.armed().is_none(), "ticket cleared after rollback");
    // The discarded file is kept for the post-mortem.
    assert!(sg
        .snapshots()
        .iter()
        .any(|p| p.to_string_lossy().contains("broken")));
}

// ─── Scenario 5: crash during the armed window ────────────────────────────────

#[test]
fn supervisor_crash_preserves_armed_deadline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (config, mut sg) = safeguard_fixture(dir.path(), 300);

    sg.tick(true, tick_epoch(1));
    fs::write(&config, br#"{"fleet":"v2"}"#).unwrap();
    let deadline = match sg.tick(true, tick_epoch(5)) {
        SafeguardEvent::Armed { deadline, .. } => deadline,
        other => panic!("tick 5 should arm, got {other:?}"),
    };

    // Supervisor exits at tick 6 and comes back at tick 9.
    drop(sg);
    let mut resumed = ConfigSafeguard::new(config.clone(), dir.path(), 300, 10)
        .with_change_settle(Duration::ZERO);

    let reloaded = resumed.armed().expect("ticket survives the crash");
    assert_eq!(reloaded.deadline, deadline, "absolute deadline honoured as-is");

    for n in 9..=24u64 {
        assert!(matches!(
            resumed.tick(true, tick_epoch(n)),
            SafeguardEvent::ArmedWaiting { .. }
        ));
    }
    // Auto-confirm at the originally scheduled time (tick 25).
    assert_eq!(resumed.tick(true, tick_epoch(25)), SafeguardEvent::Confirmed);
}

// ─── Scenario 6: scheduler-dead detection ─────────────────────────────────────

#[test]
fn stale_agents_under_healthy_gateway_warn_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let now = Utc::now();
    let stamp = (now - ChronoDuration::minutes(180)).to_rfc3339();

    let mut agents = Vec::new();
    for name in ["planner", "coder", "reviewer"] {
        let ws_dir = dir.path().join(name);
        fs::create_dir_all(ws_dir.join("state")).unwrap();
        fs::write(ws_dir.join("state/last-heartbeat"), &stamp).unwrap();
        agents.push(AgentWorkspace {
            name: name.to_string(),
            dir: ws_dir,
        });
    }

    let mut monitor = HeartbeatMonitor::new(agents, 600, 120);
    let report = monitor
        .sweep(now, GatewayCondition::Healthy)
        .expect("sweep runs");

    assert_eq!(report.stale_count(), 3);
    assert_eq!(
        report.action,
        HeartbeatAction::WarnSchedulerSuspect,
        "healthy gateway is never restarted for stale agents"
    );
}

// ─── Universal invariants ─────────────────────────────────────────────────────

#[test]
fn backoff_monotone_within_episode_and_reset_by_recovery() {
    let mut engine = GatewayHealthEngine::new(HealthPolicy {
        check_interval: TICK,
        ..HealthPolicy::default()
    });

    // Two failure episodes separated by a healthy tick.
    let mut last_wait = 0;
    for n in 1..=12u64 {
        engine.observe(&signals(false, n), tick_epoch(n));
        let wait = engine.backoff().wait_secs;
        assert!(wait >= last_wait, "wait must not decrease within an episode");
        assert!(wait <= 300);
        last_wait = wait;
    }

    engine.observe(&signals(true, 13), tick_epoch(13));
    assert_eq!(engine.backoff().wait_secs, 0, "one healthy tick resets the ladder");

    engine.observe(&signals(false, 14), tick_epoch(14));
    assert_eq!(engine.backoff().wait_secs, 30, "new episode starts from the bottom");
}

#[test]
fn snapshot_retention_spares_armed_ticket_reference() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("gateway.json");
    fs::write(&config, b"v1").unwrap();
    let mut sg = ConfigSafeguard::new(config.clone(), dir.path(), 300, 2)
        .with_change_settle(Duration::ZERO);

    sg.tick(true, tick_epoch(1));
    fs::write(&config, b"v2").unwrap();
    let armed_snapshot = match sg.tick(true, tick_epoch(2)) {
        SafeguardEvent::Armed { snapshot, .. } => snapshot,
        other => panic!("expected Armed, got {other:?}"),
    };

    // Pile manual snapshots far past the retention cap of 2.
    for i in 0..5 {
        let name = format!("gateway-20991231-12000{i}-manual.json");
        fs::write(dir.path().join("snapshots").join(name), b"newer").unwrap();
    }
    sg.snapshot(warden_safeguard::SnapshotReason::Manual)
        .expect("snapshot prunes as a side effect");

    assert!(
        armed_snapshot.exists(),
        "retention must never delete the armed ticket's snapshot"
    );
}

#[test]
fn tick_with_unchanged_config_is_idempotent_on_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_config, mut sg) = safeguard_fixture(dir.path(), 300);

    sg.tick(true, tick_epoch(1));
    let checksum = sg.recorded_checksum();
    let snapshots = sg.snapshots().len();

    for n in 2..=10u64 {
        assert_eq!(sg.tick(true, tick_epoch(n)), SafeguardEvent::Idle);
    }
    assert_eq!(sg.recorded_checksum(), checksum);
    assert_eq!(sg.snapshots().len(), snapshots);
    assert!(sg.armed().is_none());
}
