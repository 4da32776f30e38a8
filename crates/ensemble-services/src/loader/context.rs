//! What a running code unit can reach.

use std::sync::Arc;

use dashmap::DashMap;

use ensemble_core::message::{Arg, Message};
use ensemble_core::wire::Datagram;

use crate::broadcast::DatagramSink;
use crate::clock::{ClockSynchronizer, ScheduleHandle};
use crate::device::DeviceState;

/// Key/value storage shared by every unit on the device.
pub type SharedStore = Arc<DashMap<String, serde_json::Value>>;

pub fn new_store() -> SharedStore {
    Arc::new(DashMap::new())
}

/// Playback primitives owned by the audio runtime.
pub trait OutputSink: Send + Sync {
    /// Stop everything that is sounding.
    fn clear_sound(&self);

    /// Reset unit state but leave current sound playing.
    fn reset_sounding(&self) {}

    /// Full reset.
    fn reset(&self) {
        self.reset_sounding();
        self.clear_sound();
    }

    fn bleep(&self);

    fn set_gain(&self, level: f64, ramp_ms: f64);
}

/// Output that only logs. Used when no audio runtime is attached.
#[derive(Debug, Default)]
pub struct LoggingOutput;

impl OutputSink for LoggingOutput {
    fn clear_sound(&self) {
        tracing::info!("output: clear sound");
    }

    fn reset_sounding(&self) {
        tracing::info!("output: reset (leave sounding)");
    }

    fn bleep(&self) {
        tracing::info!("output: bleep");
    }

    fn set_gain(&self, level: f64, ramp_ms: f64) {
        tracing::info!(level, ramp_ms, "output: gain");
    }
}

/// Handle passed to every invoked unit.
#[derive(Clone)]
pub struct ExecutionContext {
    pub clock: ClockSynchronizer,
    pub store: SharedStore,
    pub output: Arc<dyn OutputSink>,
    pub device: Arc<DeviceState>,
    /// Device-to-controller status and log path.
    pub status_out: Arc<dyn DatagramSink>,
    /// General broadcast group.
    pub broadcast_out: Arc<dyn DatagramSink>,
}

impl ExecutionContext {
    pub fn do_at_time<F>(&self, target_ms: i64, action: F) -> ScheduleHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.clock.do_at_time(target_ms, action)
    }

    pub fn now(&self) -> i64 {
        self.clock.corrected_time_now()
    }

    /// Log locally and forward to the controller.
    pub fn log(&self, text: &str) {
        tracing::info!(id = self.device.id(), text, "unit log");
        let msg = Datagram::Message(self.device.log_message(text));
        if let Err(e) = self.status_out.send_datagram(&msg) {
            tracing::debug!(error = %e, "log forward failed");
        }
    }

    /// Replace the device status and push it to the controller.
    pub fn set_status(&self, status: &str) {
        self.device.set_status(status);
        let msg = Datagram::Message(self.device.status_message());
        if let Err(e) = self.status_out.send_datagram(&msg) {
            tracing::debug!(error = %e, "status push failed");
        }
    }

    pub fn broadcast(&self, name: &str, args: Vec<Arg>) {
        let msg = Datagram::Message(Message::new(name, args));
        if let Err(e) = self.broadcast_out.send_datagram(&msg) {
            tracing::warn!(message = name, error = %e, "unit broadcast failed");
        }
    }
}
