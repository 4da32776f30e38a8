use std::io::Read;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use ensemble_core::config::LinkConfig;
use ensemble_services::link::{DeviceLink, LinkError, LinkFailure, LinkPorts, NetTransport};
use ensemble_services::peer::PeerAddress;
use ensemble_services::PeerRecord;

/// Accept `expected` connections on 127.0.0.1 and count the bytes read.
fn spawn_sink(listener: TcpListener, expected: usize) -> std::thread::JoinHandle<usize> {
    std::thread::spawn(move || {
        let mut total = 0;
        for _ in 0..expected {
            let Ok((mut stream, _)) = listener.accept() else {
                break;
            };
            let mut buf = Vec::new();
            total += stream.read_to_end(&mut buf).unwrap_or(0);
        }
        total
    })
}

fn link_with(candidates: &[&str], port: u16) -> DeviceLink {
    let mut record = PeerRecord::new("ens-rotate", candidates[0], "");
    record.locators = PeerAddress::from_candidates(candidates.iter().copied(), candidates[0]);
    let config = LinkConfig::default();
    DeviceLink::new(
        Arc::new(Mutex::new(record)),
        Arc::new(NetTransport::from_config(&config)),
        LinkPorts { control: port, code: port },
        &config,
    )
}

/// Linux routes all of 127/8 to loopback; a listener bound to 127.0.0.1
/// refuses connections to 127.0.0.2 and 127.0.0.3 on the same port.
#[test]
fn test_rotation_settles_on_reachable_candidate() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let sink = spawn_sink(listener, 3);

    let link = link_with(&["127.0.0.2", "127.0.0.3", "127.0.0.1"], port);
    let errors = Arc::new(AtomicUsize::new(0));
    {
        let errors = errors.clone();
        link.add_error_listener(move |_: LinkFailure, _: &str| {
            errors.fetch_add(1, Ordering::Relaxed);
        });
    }

    for _ in 0..3 {
        link.send_bulk(&[b"unit-bytes".as_slice()]).unwrap();
    }

    assert_eq!(sink.join().unwrap(), 30);
    assert_eq!(errors.load(Ordering::Relaxed), 0);
    let order: Vec<String> = link.record().lock().locators.iter().map(String::from).collect();
    assert_eq!(order, vec!["127.0.0.1", "127.0.0.2", "127.0.0.3"]);
}

#[test]
fn test_unreachable_device_reports_exhaustion() {
    // Bind then drop to get a port nothing listens on.
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

    let link = link_with(&["127.0.0.1", "127.0.0.2"], port);
    let failures = Arc::new(Mutex::new(Vec::new()));
    {
        let failures = failures.clone();
        link.add_error_listener(move |kind: LinkFailure, message: &str| {
            failures.lock().push((kind, message.to_string()));
        });
    }

    let err = link.send_bulk(&[b"x".as_slice()]).unwrap_err();
    match err {
        LinkError::Exhausted { attempts, .. } => assert_eq!(attempts, LinkConfig::default().max_attempts),
        other => panic!("expected exhaustion, got {other:?}"),
    }

    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, LinkFailure::AddressesExhausted);
    assert!(failures[0].1.contains("ens-rotate"));

    // The candidates are kept for the next call.
    assert_eq!(link.record().lock().locators.len(), 2);
}
