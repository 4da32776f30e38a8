use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ensemble_core::message::{Arg, Message};
use ensemble_core::wire::Datagram;
use ensemble_services::broadcast::{BroadcastError, DatagramSink, Inbound, InboundKind};

use crate::*;

#[tokio::test]
async fn test_dispose_twice_is_harmless() {
    let Some(channel) = join_test_group(0) else {
        eprintln!("SKIP: no multicast route");
        return;
    };
    channel.subscribe(|_: &Inbound| {});

    channel.dispose();
    channel.dispose();
    assert!(channel.is_disposed());

    let result = channel.send_datagram(&Datagram::Message(Message::new("/test/late", vec![])));
    assert!(matches!(result, Err(BroadcastError::Disposed)));

    // Publishing after dispose only logs.
    channel.publish("/test/late", vec![]);
}

#[tokio::test]
async fn test_group_members_on_one_port_all_receive() {
    if !multicast_available().await {
        eprintln!("SKIP: multicast loopback not available");
        return;
    }
    let Some(a) = join_test_group(0) else {
        eprintln!("SKIP: no multicast route");
        return;
    };
    let Some(b) = join_test_group(a.group().port()) else {
        eprintln!("SKIP: could not share the group port");
        return;
    };

    let seen_a = Arc::new(AtomicUsize::new(0));
    let seen_b = Arc::new(AtomicUsize::new(0));
    for (channel, seen) in [(&a, &seen_a), (&b, &seen_b)] {
        let seen = seen.clone();
        channel.subscribe_kind(InboundKind::Message, move |inbound: &Inbound| {
            if let Datagram::Message(m) = &inbound.datagram {
                if m.is("/test/fanout") && m.int_arg(0) == Some(7) {
                    seen.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }

    a.publish("/test/fanout", vec![Arg::Int(7)]);
    let both = wait_until(Duration::from_secs(2), || {
        seen_a.load(Ordering::Relaxed) > 0 && seen_b.load(Ordering::Relaxed) > 0
    })
    .await;
    assert!(
        both,
        "a={} b={}",
        seen_a.load(Ordering::Relaxed),
        seen_b.load(Ordering::Relaxed)
    );

    a.dispose();
    b.dispose();
}
