//! Device identity and status, and the periodic alive announcement.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use ensemble_core::message::{names, Arg, Message};
use ensemble_core::wire::Datagram;

use crate::broadcast::DatagramSink;
use crate::peer::Announcement;

/// Status shown before the controller has assigned an id.
pub const NO_ID_STATUS: &str = "No ID set";

#[derive(Debug)]
pub struct DeviceState {
    hostname: String,
    device_name: String,
    address: Mutex<String>,
    id: AtomicI64,
    status: Mutex<String>,
}

impl DeviceState {
    pub fn new(hostname: &str, device_name: &str, address: &str) -> Arc<Self> {
        Arc::new(Self {
            hostname: hostname.to_string(),
            device_name: device_name.to_string(),
            address: Mutex::new(address.to_string()),
            id: AtomicI64::new(-1),
            status: Mutex::new(NO_ID_STATUS.to_string()),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn id(&self) -> i64 {
        self.id.load(Ordering::Acquire)
    }

    pub fn set_id(&self, id: i64) {
        let previous = self.id.swap(id, Ordering::AcqRel);
        if previous != id {
            tracing::info!(previous, id, "device id set");
        }
        let mut status = self.status.lock();
        if *status == NO_ID_STATUS {
            *status = format!("ID {id}");
        }
    }

    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.lock() = status.into();
    }

    pub fn set_address(&self, address: &str) {
        *self.address.lock() = address.to_string();
    }

    pub fn announcement(&self) -> Announcement {
        Announcement {
            hostname: self.hostname.clone(),
            address: self.address.lock().clone(),
            device_name: self.device_name.clone(),
            id: self.id(),
            status: self.status(),
        }
    }

    /// `/device/log {id, text}`.
    pub fn log_message(&self, text: &str) -> Message {
        Message::new(names::DEVICE_LOG, vec![Arg::Int(self.id()), Arg::from(text)])
    }

    /// `/device/status {id, status}`.
    pub fn status_message(&self) -> Message {
        Message::new(
            names::DEVICE_STATUS,
            vec![Arg::Int(self.id()), Arg::from(self.status())],
        )
    }
}

/// Publish `/device/alive` every `interval` until shutdown.
pub async fn alive_loop(
    device: Arc<DeviceState>,
    sink: Arc<dyn DatagramSink>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    tracing::info!(
        host = device.hostname(),
        interval_ms = interval.as_millis() as u64,
        "alive announcements starting"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                let msg = Datagram::Message(device.announcement().to_message());
                if let Err(e) = sink.send_datagram(&msg) {
                    tracing::warn!(error = %e, "alive announcement failed");
                }
            }
        }
    }
}
