use super::*;
use crate::session::SessionConfig;

fn monitor() -> HeartbeatMonitor {
    HeartbeatMonitor::new(&HeartbeatConfig {
        tick_ms: 250,
        stable_interval_ms: 5000,
        unstable_interval_ms: 1000,
    })
}

/// Ready, connected core with a known member id
fn connected_core() -> SessionCore {
    let mut core = SessionCore::new(SessionConfig::random("p1", "duel", 2));
    core.config.member_id = Some("m1".to_string());
    core.config.session_started = true;
    core.state.status = ConnectionStatus::Connected;
    core.state.stable = true;
    core.state.ready = true;
    core
}

#[test]
fn test_idle_unless_connected() {
    let mut monitor = monitor();
    let mut core = connected_core();
    core.state.status = ConnectionStatus::Reconnecting;

    assert_eq!(monitor.on_tick(Instant::now(), &mut core), HeartbeatAction::Idle);
    assert_eq!(core.pending_heartbeats, 0);
}

#[test]
fn test_first_tick_sends_immediately() {
    let mut monitor = monitor();
    let mut core = connected_core();
    core.delivered_cursor = 1234;

    let action = monitor.on_tick(Instant::now(), &mut core);
    assert_eq!(
        action,
        HeartbeatAction::Send {
            frame: OutgoingFrame::Heartbeat {
                incl_messages_after: 1234,
                waiting_for: vec![],
            },
            became_unstable: false,
            reconnect: false,
        }
    );
    assert_eq!(core.pending_heartbeats, 1);
}

#[test]
fn test_interval_selection() {
    let monitor = monitor();
    let mut core = connected_core();
    assert_eq!(monitor.interval(&core), Duration::from_secs(5));

    core.pending_heartbeats = 1;
    assert_eq!(monitor.interval(&core), Duration::from_secs(1));

    core.pending_heartbeats = 0;
    core.state.ready = false;
    assert_eq!(monitor.interval(&core), Duration::from_secs(1));

    let core = SessionCore::new(SessionConfig::host_private("p1", "duel", 2));
    assert_eq!(monitor.interval(&core), Duration::from_secs(1));
}

#[test]
fn test_not_due_before_interval() {
    let mut monitor = monitor();
    let mut core = connected_core();
    let start = Instant::now();

    assert!(matches!(monitor.on_tick(start, &mut core), HeartbeatAction::Send { .. }));
    // One outstanding: unstable period applies
    assert_eq!(
        monitor.on_tick(start + Duration::from_millis(500), &mut core),
        HeartbeatAction::Idle
    );
    assert!(matches!(
        monitor.on_tick(start + Duration::from_millis(1000), &mut core),
        HeartbeatAction::Send { .. }
    ));
}

#[test]
fn test_stable_interval_after_ack() {
    let mut monitor = monitor();
    let mut core = connected_core();
    let start = Instant::now();

    monitor.on_tick(start, &mut core);
    core.pending_heartbeats = 0;

    assert_eq!(
        monitor.on_tick(start + Duration::from_millis(1500), &mut core),
        HeartbeatAction::Idle
    );
    assert!(matches!(
        monitor.on_tick(start + Duration::from_millis(5000), &mut core),
        HeartbeatAction::Send { .. }
    ));
}

#[test]
fn test_unstable_then_reconnect() {
    let mut monitor = monitor();
    let mut core = connected_core();
    let start = Instant::now();
    let step = Duration::from_millis(1000);

    let mut unstable_flips = 0;
    let mut sent = 0;
    let mut tick = 0u32;
    loop {
        let action = monitor.on_tick(start + step * tick, &mut core);
        tick += 1;
        match action {
            HeartbeatAction::Send {
                became_unstable,
                reconnect,
                ..
            } => {
                sent += 1;
                if became_unstable {
                    unstable_flips += 1;
                    assert_eq!(core.pending_heartbeats, HEARTBEAT_COUNT_UNTIL_UNSTABLE);
                }
                if reconnect {
                    break;
                }
            }
            HeartbeatAction::Idle => panic!("heartbeat should be due every second"),
        }
    }

    // Stability flips exactly once over the whole run
    assert_eq!(unstable_flips, 1);
    assert!(!core.state.stable);
    assert_eq!(sent, HEARTBEAT_COUNT_UNTIL_RECONNECT);
    assert_eq!(core.pending_heartbeats, HEARTBEAT_COUNT_UNTIL_RECONNECT);
}

#[test]
fn test_fourth_outstanding_heartbeat_keeps_connection() {
    let mut monitor = monitor();
    let mut core = connected_core();
    core.pending_heartbeats = HEARTBEAT_COUNT_UNTIL_RECONNECT - 2;

    assert!(matches!(
        monitor.on_tick(Instant::now(), &mut core),
        HeartbeatAction::Send {
            reconnect: false,
            ..
        }
    ));
    assert_eq!(core.pending_heartbeats, HEARTBEAT_COUNT_UNTIL_RECONNECT - 1);
}

#[test]
fn test_reconnect_even_if_stability_restored() {
    let mut monitor = monitor();
    let mut core = connected_core();
    core.pending_heartbeats = HEARTBEAT_COUNT_UNTIL_RECONNECT - 1;
    core.state.stable = true;

    assert_eq!(
        monitor.on_tick(Instant::now(), &mut core),
        HeartbeatAction::Send {
            frame: OutgoingFrame::Heartbeat {
                incl_messages_after: 0,
                waiting_for: vec![],
            },
            became_unstable: true,
            reconnect: true,
        }
    );
}

#[test]
fn test_waiting_for_hints() {
    let mut core = SessionCore::new(SessionConfig::host_private("p1", "duel", 2));
    assert_eq!(
        HeartbeatMonitor::waiting_for(&core),
        vec![
            WaitingFor::Connection,
            WaitingFor::PrivateSessionPending,
            WaitingFor::SessionConnect
        ]
    );

    core.config.member_id = Some("m1".to_string());
    core.config.session_id = Some("ABCD".to_string());
    assert_eq!(
        HeartbeatMonitor::waiting_for(&core),
        vec![WaitingFor::SessionConnect]
    );

    core.state.ready = true;
    assert!(HeartbeatMonitor::waiting_for(&core).is_empty());
}

#[test]
fn test_end_session_replaces_heartbeat() {
    let mut monitor = monitor();
    let mut core = connected_core();
    core.config.trying_to_end_session = true;

    assert_eq!(
        monitor.on_tick(Instant::now(), &mut core),
        HeartbeatAction::Send {
            frame: OutgoingFrame::EndSession,
            became_unstable: false,
            reconnect: false,
        }
    );
}

#[test]
fn test_reset_makes_next_tick_due() {
    let mut monitor = monitor();
    let mut core = connected_core();
    let start = Instant::now();

    monitor.on_tick(start, &mut core);
    core.pending_heartbeats = 0;
    assert_eq!(
        monitor.on_tick(start + Duration::from_millis(10), &mut core),
        HeartbeatAction::Idle
    );

    monitor.reset();
    assert!(matches!(
        monitor.on_tick(start + Duration::from_millis(20), &mut core),
        HeartbeatAction::Send { .. }
    ));
}
