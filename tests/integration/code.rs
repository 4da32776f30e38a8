use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use ensemble_core::config::{AccessMode, LinkConfig};
use ensemble_core::crypto::{self, CodeKey};
use ensemble_services::link::{DeviceLink, LinkPorts, NetTransport};
use ensemble_services::{CodeError, CodeServer, LoadOutcome, PeerRecord, SecureCodeLoader};

use crate::*;

const UNIT: &[u8] = br#"{
    "name": "chime",
    "capabilities": ["action"],
    "steps": [
        {"op": "put", "key": "chime", "value": true},
        {"op": "log", "text": "chime loaded"}
    ]
}"#;

/// Code server on an ephemeral loopback port plus a link addressing it.
async fn device_and_link(
    loader: Arc<SecureCodeLoader>,
) -> (Arc<DeviceLink>, broadcast::Sender<()>, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let server = CodeServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        loader,
        AccessMode::Local,
        1024 * 1024,
    )
    .await
    .expect("bind code server");
    let port = server.local_addr().unwrap().port();

    let (tx, rx) = broadcast::channel(1);
    let task = tokio::spawn(server.run(rx));

    let config = LinkConfig::default();
    let link = Arc::new(DeviceLink::new(
        Arc::new(Mutex::new(PeerRecord::new("ens-test", "127.0.0.1", ""))),
        Arc::new(NetTransport::from_config(&config)),
        LinkPorts { control: 0, code: port },
        &config,
    ));
    (link, tx, task)
}

#[tokio::test]
async fn test_pushed_unit_runs_on_device() {
    let loader = test_loader(TEST_KEY);
    let (link, shutdown, task) = device_and_link(loader.clone()).await;

    let pushed = {
        let link = link.clone();
        tokio::task::spawn_blocking(move || link.push_code(&CodeKey::from_passphrase(TEST_KEY), UNIT))
            .await
            .unwrap()
    };
    assert!(pushed.is_ok(), "{pushed:?}");

    let ran = wait_until(Duration::from_secs(2), || {
        loader.context().device.status() == "Last action: chime"
    })
    .await;
    assert!(ran, "status is {}", loader.context().device.status());
    assert!(loader.context().store.contains_key("chime"));

    let _ = shutdown.send(());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wrong_key_is_not_loaded() {
    let loader = test_loader(TEST_KEY);
    let (link, shutdown, task) = device_and_link(loader.clone()).await;

    // Delivery succeeds; the device discards the unit.
    tokio::task::spawn_blocking(move || link.push_code(&CodeKey::from_passphrase("other-key"), UNIT))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(loader.context().device.status(), "No ID set");
    assert!(loader.context().store.is_empty());
    assert!(loader.last_scope_id().is_none());

    let _ = shutdown.send(());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_header_flip_in_transit_is_not_loaded() {
    let loader = test_loader(TEST_KEY);
    let (link, shutdown, task) = device_and_link(loader.clone()).await;

    let mut sealed = crypto::seal(&CodeKey::from_passphrase(TEST_KEY), UNIT).unwrap();
    sealed[3] ^= 0x04;
    tokio::task::spawn_blocking(move || link.send_bulk(&[&sealed[..]]))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(loader.context().store.is_empty());
    assert!(loader.last_scope_id().is_none());

    let _ = shutdown.send(());
    task.await.unwrap().unwrap();
}

#[test]
fn test_loader_error_kinds() {
    let loader = test_loader(TEST_KEY);
    let right = CodeKey::from_passphrase(TEST_KEY);

    let wrong_key = crypto::seal(&CodeKey::from_passphrase("other-key"), UNIT).unwrap();
    assert!(matches!(loader.process(&wrong_key), Err(CodeError::Decryption)));

    let mut flipped = crypto::seal(&right, UNIT).unwrap();
    flipped[0] ^= 0x01;
    assert!(matches!(loader.process(&flipped), Err(CodeError::Integrity { .. })));

    assert!(matches!(loader.process(&[0u8; 10]), Err(CodeError::TooShort(10))));

    let not_json = crypto::seal(&right, b"not a unit").unwrap();
    assert!(matches!(loader.process(&not_json), Err(CodeError::Malformed(_))));

    let ok = crypto::seal(&right, UNIT).unwrap();
    assert_eq!(
        loader.process(&ok).unwrap(),
        LoadOutcome::Executed { name: "chime".into() }
    );
}
