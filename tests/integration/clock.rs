use std::sync::Arc;
use std::time::Duration;

use ensemble_core::config::ClockConfig;
use ensemble_services::{ClockSynchronizer, SyncState};

use crate::*;

fn fast_config() -> ClockConfig {
    ClockConfig {
        probe_interval_ms: 50,
        min_stable_ms: 300,
        ..ClockConfig::default()
    }
}

/// Two synchronizers in one process share a clock, so each should settle
/// near zero offset and start trusting its estimate.
#[tokio::test]
async fn test_two_nodes_converge_over_multicast() {
    if !multicast_available().await {
        eprintln!("SKIP: multicast loopback not available");
        return;
    }
    let Some(a_channel) = join_test_group(0) else {
        eprintln!("SKIP: no multicast route");
        return;
    };
    let Some(b_channel) = join_test_group(a_channel.group().port()) else {
        eprintln!("SKIP: could not share the group port");
        return;
    };

    let config = fast_config();
    let a = ClockSynchronizer::start(&config, a_channel.clone());
    let b = ClockSynchronizer::start(&config, b_channel.clone());
    assert_ne!(a.node_id(), b.node_id());

    let synced = wait_until(Duration::from_secs(5), || {
        a.state() != SyncState::Unsynchronized && b.state() != SyncState::Unsynchronized
    })
    .await;
    assert!(synced, "a={a:?} b={b:?}");

    tokio::time::sleep(Duration::from_millis(500)).await;
    for clock in [&a, &b] {
        assert!(clock.offset_ms().abs() < 20.0, "{clock:?} offset {}", clock.offset_ms());
        assert!(clock.stability() > 0.0);
    }

    a.shutdown();
    b.shutdown();
    a_channel.dispose();
    b_channel.dispose();
}

#[tokio::test]
async fn test_scheduled_actions_fire_in_target_order() {
    let clock = ClockSynchronizer::new(&ClockConfig::default(), Arc::new(ensemble_services::clock::NullSink));
    clock.spawn_tasks();

    let fired = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let now = clock.corrected_time_now();
    for (label, delay) in [("late", 120), ("early", 30), ("middle", 70)] {
        let fired = fired.clone();
        clock.do_at_time(now + delay, move || fired.lock().push(label));
    }
    let cancelled = {
        let fired = fired.clone();
        clock.do_at_time(now + 50, move || fired.lock().push("cancelled"))
    };
    assert!(cancelled.cancel());

    assert!(wait_until(Duration::from_secs(2), || fired.lock().len() == 3).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*fired.lock(), vec!["early", "middle", "late"]);
    assert_eq!(clock.pending_actions(), 0);

    clock.shutdown();
}
