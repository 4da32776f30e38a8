//! Device-side control message handling.
//!
//! The controller sends fire-and-forget unicast datagrams to the control
//! port. Known names drive the [`OutputSink`] or device identity; anything
//! else is handed to registered listeners in registration order.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use ensemble_core::message::{names, Message};
use ensemble_core::wire::{Datagram, MAX_DATAGRAM};

use crate::device::DeviceState;
use crate::loader::{ExecutionContext, OutputSink, SharedStore};

type ControlListener = Arc<dyn Fn(&Message) + Send + Sync>;

pub struct ControlDispatcher {
    output: Arc<dyn OutputSink>,
    store: SharedStore,
    device: Arc<DeviceState>,
    listeners: RwLock<Vec<ControlListener>>,
}

impl ControlDispatcher {
    pub fn new(output: Arc<dyn OutputSink>, store: SharedStore, device: Arc<DeviceState>) -> Self {
        Self {
            output,
            store,
            device,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Dispatcher over the same output, store and device as `ctx`, with no
    /// listeners.
    pub fn for_context(ctx: &ExecutionContext) -> Self {
        Self::new(ctx.output.clone(), ctx.store.clone(), ctx.device.clone())
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Apply one control message. Returns true if a built-in handler or at
    /// least one listener took it.
    pub fn dispatch(&self, msg: &Message) -> bool {
        match msg.name.as_str() {
            names::RESET => {
                self.store.clear();
                self.output.reset();
            }
            names::RESET_SOUNDING => {
                self.store.clear();
                self.output.reset_sounding();
            }
            names::CLEAR_SOUND => self.output.clear_sound(),
            names::BLEEP => self.output.bleep(),
            names::GAIN => {
                let (Some(level), Some(ramp_ms)) = (msg.float_arg(0), msg.float_arg(1)) else {
                    tracing::warn!(args = msg.args.len(), "gain needs level and ramp");
                    return false;
                };
                self.output.set_gain(level, ramp_ms);
            }
            names::DEVICE_SET_ID => {
                let Some(id) = msg.int_arg(0) else {
                    tracing::warn!("set_id without an integer id");
                    return false;
                };
                self.device.set_id(id);
            }
            _ => {
                let listeners = self.listeners.read().clone();
                if listeners.is_empty() {
                    tracing::debug!(message = %msg.name, "unhandled control message");
                    return false;
                }
                for listener in &listeners {
                    listener(msg);
                }
            }
        }
        true
    }
}

/// Receive control datagrams on `socket` until shutdown.
pub async fn control_loop(
    socket: UdpSocket,
    dispatcher: Arc<ControlDispatcher>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    if let Ok(addr) = socket.local_addr() {
        tracing::info!(%addr, "control listener ready");
    }

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("control listener stopping");
                return;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "control recv failed");
                        continue;
                    }
                };
                match Datagram::decode(&buf[..len]) {
                    Ok(Datagram::Message(msg)) => {
                        tracing::debug!(%from, message = %msg.name, "control message");
                        dispatcher.dispatch(&msg);
                    }
                    Ok(_) => tracing::trace!(%from, "ignoring sync datagram on control port"),
                    Err(e) => tracing::debug!(%from, error = %e, "undecodable control datagram"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ensemble_core::message::Arg;

    use crate::loader::new_store;

    #[derive(Default)]
    struct Recorder(parking_lot::Mutex<Vec<String>>);

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    impl OutputSink for Recorder {
        fn clear_sound(&self) {
            self.0.lock().push("clear".into());
        }
        fn reset_sounding(&self) {
            self.0.lock().push("reset_sounding".into());
        }
        fn bleep(&self) {
            self.0.lock().push("bleep".into());
        }
        fn set_gain(&self, level: f64, ramp_ms: f64) {
            self.0.lock().push(format!("gain {level} {ramp_ms}"));
        }
    }

    fn dispatcher() -> (ControlDispatcher, Arc<Recorder>, SharedStore, Arc<DeviceState>) {
        let output = Arc::new(Recorder::default());
        let store = new_store();
        let device = DeviceState::new("pi", "", "");
        (
            ControlDispatcher::new(output.clone(), store.clone(), device.clone()),
            output,
            store,
            device,
        )
    }

    #[test]
    fn reset_sounding_clears_store_but_keeps_sound() {
        let (d, out, store, _) = dispatcher();
        store.insert("tempo".into(), serde_json::json!(120));
        assert!(d.dispatch(&Message::new(names::RESET_SOUNDING, vec![])));
        assert!(store.is_empty());
        assert_eq!(out.calls(), vec!["reset_sounding"]);
    }

    #[test]
    fn full_reset_also_clears_sound() {
        let (d, out, store, _) = dispatcher();
        store.insert("k".into(), serde_json::json!(1));
        d.dispatch(&Message::new(names::RESET, vec![]));
        assert!(store.is_empty());
        assert_eq!(out.calls(), vec!["reset_sounding", "clear"]);
    }

    #[test]
    fn gain_accepts_int_or_float_args() {
        let (d, out, _, _) = dispatcher();
        assert!(d.dispatch(&Message::new(names::GAIN, vec![Arg::Float(0.5), Arg::Int(200)])));
        assert!(!d.dispatch(&Message::new(names::GAIN, vec![Arg::Float(0.5)])));
        assert_eq!(out.calls(), vec!["gain 0.5 200"]);
    }

    #[test]
    fn set_id_updates_device() {
        let (d, _, _, device) = dispatcher();
        d.dispatch(&Message::new(names::DEVICE_SET_ID, vec![Arg::Int(5)]));
        assert_eq!(device.id(), 5);
        assert_eq!(device.status(), "ID 5");
    }

    #[test]
    fn unknown_messages_reach_listeners_in_order() {
        let (d, out, _, _) = dispatcher();
        assert!(!d.dispatch(&Message::new("/custom/thing", vec![])));

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            d.add_listener(move |m: &Message| seen.lock().push(format!("{tag} {}", m.name)));
        }
        assert!(d.dispatch(&Message::new("/custom/thing", vec![])));
        assert_eq!(*seen.lock(), vec!["first /custom/thing", "second /custom/thing"]);
        assert!(out.calls().is_empty());
    }

    #[tokio::test]
    async fn control_loop_dispatches_received_datagrams() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (d, out, _, _) = dispatcher();
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(control_loop(socket, Arc::new(d), rx));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = Message::new(names::BLEEP, vec![]).encode().unwrap();
        sender.send_to(b"garbage", addr).await.unwrap();
        sender.send_to(&bytes, addr).await.unwrap();

        for _ in 0..50 {
            if !out.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(out.calls(), vec!["bleep"]);

        let _ = tx.send(());
        task.await.unwrap();
    }
}
