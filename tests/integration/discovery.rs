use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use ensemble_core::config::LinkConfig;
use ensemble_core::wire::Datagram;
use ensemble_services::broadcast::Inbound;
use ensemble_services::link::{LinkPorts, NetTransport};
use ensemble_services::{
    alive_loop, control_loop, Announcement, ControlDispatcher, DeviceState, PeerRegistry,
};

use crate::*;

/// A device announces itself, the controller assigns it id 3 over the
/// control port, and a log line the device tags with id 3 reaches only
/// that device's log listeners.
#[tokio::test]
async fn test_announce_assign_and_route_log() {
    if !multicast_available().await {
        eprintln!("SKIP: multicast loopback not available");
        return;
    }

    // Controller side joins first so the device can share its ports.
    let (Some(ctl_alive), Some(ctl_status)) = (join_test_group(0), join_test_group(0)) else {
        eprintln!("SKIP: no multicast route");
        return;
    };
    let (Some(dev_alive), Some(dev_status)) = (
        join_test_group(ctl_alive.group().port()),
        join_test_group(ctl_status.group().port()),
    ) else {
        eprintln!("SKIP: could not share group ports");
        return;
    };

    // ── Device ───────────────────────────────────────────────────────────────
    let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let control_port = control.local_addr().unwrap().port();
    let device = DeviceState::new("ens-disc-a", "", "127.0.0.1");
    let ctx = device_context(device.clone(), dev_status.clone(), dev_alive.clone());
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let control_task = tokio::spawn(control_loop(
        control,
        Arc::new(ControlDispatcher::for_context(&ctx)),
        shutdown_tx.subscribe(),
    ));
    let alive_task = tokio::spawn(alive_loop(
        device.clone(),
        dev_alive.clone(),
        Duration::from_millis(50),
        shutdown_tx.subscribe(),
    ));

    // ── Controller ───────────────────────────────────────────────────────────
    let config = LinkConfig::default();
    let registry = PeerRegistry::new(
        Arc::new(NetTransport::from_config(&config)),
        LinkPorts { control: control_port, code: 0 },
        config,
    );
    for channel in [&ctl_alive, &ctl_status] {
        let registry = registry.clone();
        channel.subscribe(move |inbound: &Inbound| registry.handle_datagram(&inbound.datagram));
    }

    // A second, never-assigned peer.
    registry.on_announcement(&Announcement {
        hostname: "ens-disc-b".into(),
        address: "127.0.0.1".into(),
        device_name: String::new(),
        id: -1,
        status: "No ID set".into(),
    });

    assert!(wait_until(Duration::from_secs(2), || registry.get("ens-disc-a").is_some()).await);
    let link_a = registry.get("ens-disc-a").unwrap();
    let link_b = registry.get("ens-disc-b").unwrap();
    assert_eq!(link_a.id(), -1);

    assert!(registry.assign_id("ens-disc-a", 3));
    assert!(wait_until(Duration::from_secs(2), || device.id() == 3).await);
    assert_eq!(device.status(), "ID 3");

    let logs_a = Arc::new(Mutex::new(Vec::new()));
    let logs_b = Arc::new(Mutex::new(Vec::new()));
    for (link, logs) in [(&link_a, &logs_a), (&link_b, &logs_b)] {
        let logs = logs.clone();
        link.add_log_listener(move |text: &str| logs.lock().push(text.to_string()));
    }

    ctx.log("tick 1");
    assert!(wait_until(Duration::from_secs(2), || !logs_a.lock().is_empty()).await);
    assert_eq!(*logs_a.lock(), vec!["tick 1".to_string()]);
    assert!(logs_b.lock().is_empty());

    // Status follows the same routing.
    ctx.set_status("Last action: chime");
    assert!(
        wait_until(Duration::from_secs(2), || link_a.record().lock().status == "Last action: chime")
            .await
    );
    assert_eq!(link_b.record().lock().status, "No ID set");

    let _ = shutdown_tx.send(());
    control_task.await.unwrap();
    alive_task.await.unwrap();
    for channel in [ctl_alive, ctl_status, dev_alive, dev_status] {
        channel.dispose();
    }
}

/// Alive announcements carry the assigned id back to the controller, so a
/// restarted controller relearns ids without assigning them again.
#[test]
fn test_announced_id_is_adopted() {
    let registry = PeerRegistry::new(
        Arc::new(NetTransport::from_config(&LinkConfig::default())),
        LinkPorts { control: 0, code: 0 },
        LinkConfig::default(),
    );
    let device = DeviceState::new("ens-disc-c", "stage-left", "127.0.0.1");
    device.set_id(5);

    registry.handle_datagram(&Datagram::Message(device.announcement().to_message()));
    let link = registry.by_id(5).expect("adopted id");
    assert_eq!(link.hostname(), "ens-disc-c");
    let locators: Vec<String> = link.record().lock().locators.iter().map(String::from).collect();
    assert_eq!(locators[0], "stage-left.local");
}
