//! Ensemble integration test harness.
//!
//! Tests run in-process against loopback TCP/UDP and a multicast group on
//! the default interface:
//!
//!   cargo test --test integration
//!
//! Multicast tests print SKIP and return when the host cannot loop group
//! traffic back to itself (containers without a multicast route, mostly).
//! Every test binds its own ephemeral ports, so tests may run in parallel.

mod channels;
mod clock;
mod code;
mod discovery;
mod links;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ensemble_core::config::ClockConfig;
use ensemble_core::crypto::CodeKey;
use ensemble_services::broadcast::{BroadcastChannel, DatagramSink, Inbound};
use ensemble_services::clock::NullSink;
use ensemble_services::loader::{new_store, ActionRegistry, ExecutionContext, LoggingOutput};
use ensemble_services::{ClockSynchronizer, DeviceState, SecureCodeLoader};

// ── Harness ───────────────────────────────────────────────────────────────────

/// Administratively scoped group used only by tests.
pub const TEST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 100);

/// Passphrase shared by test controllers and devices.
pub const TEST_KEY: &str = "integration-key";

/// Join `TEST_GROUP` on an ephemeral port, or `None` if the host has no
/// usable multicast route.
pub fn join_test_group(port: u16) -> Option<Arc<BroadcastChannel>> {
    match BroadcastChannel::join(TEST_GROUP, port, None) {
        Ok(channel) => Some(channel),
        Err(e) => {
            eprintln!("multicast join failed: {e}");
            None
        }
    }
}

/// True if a publication on the test group comes back to this process.
pub async fn multicast_available() -> bool {
    let Some(channel) = join_test_group(0) else {
        return false;
    };
    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = received.clone();
        channel.subscribe(move |_: &Inbound| {
            received.fetch_add(1, Ordering::Relaxed);
        });
    }
    channel.publish("/test/ping", vec![]);
    let ok = wait_until(Duration::from_millis(500), || received.load(Ordering::Relaxed) > 0).await;
    channel.dispose();
    ok
}

/// Poll `cond` every 10 ms until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Execution context for a device whose outbound traffic goes to the given
/// sinks. The clock is not started.
pub fn device_context(
    device: Arc<DeviceState>,
    status_out: Arc<dyn DatagramSink>,
    broadcast_out: Arc<dyn DatagramSink>,
) -> ExecutionContext {
    ExecutionContext {
        clock: ClockSynchronizer::new(&ClockConfig::default(), Arc::new(NullSink)),
        store: new_store(),
        output: Arc::new(LoggingOutput),
        device,
        status_out,
        broadcast_out,
    }
}

/// Loader keyed with `passphrase` over a context with no network output.
pub fn test_loader(passphrase: &str) -> Arc<SecureCodeLoader> {
    let ctx = device_context(
        DeviceState::new("ens-test", "", "127.0.0.1"),
        Arc::new(NullSink),
        Arc::new(NullSink),
    );
    Arc::new(SecureCodeLoader::new(
        CodeKey::from_passphrase(passphrase),
        ActionRegistry::new(),
        ctx,
    ))
}
