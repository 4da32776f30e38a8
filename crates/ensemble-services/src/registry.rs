//! Controller-side peer registry, one [`DeviceLink`] per discovered device.
//!
//! Keyed on hostname. Records are created on the first `/device/alive`
//! from an unknown host and refreshed by every later one. They are never
//! removed while the process runs; `last_seen` ages instead.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use ensemble_core::config::LinkConfig;
use ensemble_core::message::{names, Arg, Message};
use ensemble_core::wire::Datagram;

use crate::link::{DeviceLink, LinkPorts, LinkTransport};
use crate::peer::{Announcement, PeerRecord};

#[derive(Clone)]
pub struct PeerRegistry {
    links: Arc<DashMap<String, Arc<DeviceLink>>>,
    transport: Arc<dyn LinkTransport>,
    ports: LinkPorts,
    config: LinkConfig,
}

impl PeerRegistry {
    pub fn new(transport: Arc<dyn LinkTransport>, ports: LinkPorts, config: LinkConfig) -> Self {
        Self {
            links: Arc::new(DashMap::new()),
            transport,
            ports,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn get(&self, hostname: &str) -> Option<Arc<DeviceLink>> {
        self.links.get(hostname).map(|l| l.value().clone())
    }

    /// Snapshot of every link, sorted by hostname.
    pub fn links(&self) -> Vec<Arc<DeviceLink>> {
        let mut links: Vec<(String, Arc<DeviceLink>)> = self
            .links
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        links.sort_by(|a, b| a.0.cmp(&b.0));
        links.into_iter().map(|(_, l)| l).collect()
    }

    /// Link for the device with assigned `id`, if any.
    pub fn by_id(&self, id: i64) -> Option<Arc<DeviceLink>> {
        if id < 0 {
            return None;
        }
        self.links
            .iter()
            .find(|e| e.value().id() == id)
            .map(|e| e.value().clone())
    }

    /// Create or refresh the record for an announcing device.
    pub fn on_announcement(&self, ann: &Announcement) -> Arc<DeviceLink> {
        if let Some(link) = self.get(&ann.hostname) {
            link.record().lock().refresh(ann);
            tracing::trace!(host = %ann.hostname, "peer refreshed");
            return link;
        }

        let entry = self.links.entry(ann.hostname.clone()).or_insert_with(|| {
            tracing::info!(
                host = %ann.hostname,
                address = %ann.address,
                device = %ann.device_name,
                "peer discovered"
            );
            Arc::new(DeviceLink::new(
                Arc::new(Mutex::new(PeerRecord::from_announcement(ann))),
                self.transport.clone(),
                self.ports,
                &self.config,
            ))
        });
        entry.value().clone()
    }

    /// Give `hostname` the id `id` and tell the device. Returns false if the
    /// host is unknown. Delivery failure is reported on the link's error
    /// listeners.
    pub fn assign_id(&self, hostname: &str, id: i64) -> bool {
        let Some(link) = self.get(hostname) else {
            return false;
        };
        link.record().lock().id = id;
        tracing::info!(host = hostname, id, "device id assigned");
        if let Err(e) = link.send(&Message::new(names::DEVICE_SET_ID, vec![Arg::Int(id)])) {
            tracing::warn!(host = hostname, error = %e, "failed to send id to device");
        }
        true
    }

    pub fn set_group(&self, hostname: &str, group: usize, member: bool) -> bool {
        self.get(hostname)
            .map(|l| l.record().lock().set_group(group, member))
            .unwrap_or(false)
    }

    /// Route `/device/log {id, text}` or `/device/status {id, text}` to the
    /// single link whose id matches. Returns true if a link took it.
    pub fn route_status_message(&self, msg: &Message) -> bool {
        let is_log = msg.is(names::DEVICE_LOG);
        if !is_log && !msg.is(names::DEVICE_STATUS) {
            return false;
        }
        let (Some(id), Some(text)) = (msg.int_arg(0), msg.str_arg(1)) else {
            tracing::debug!(message = %msg.name, "malformed status message");
            return false;
        };
        let Some(link) = self.by_id(id) else {
            tracing::trace!(id, "status message for unknown id");
            return false;
        };
        if is_log {
            link.deliver_log(text);
        } else {
            link.deliver_status(text);
        }
        true
    }

    /// Entry point for the controller's group listeners.
    pub fn handle_datagram(&self, datagram: &Datagram) {
        let Datagram::Message(msg) = datagram else {
            return;
        };
        if let Some(ann) = Announcement::from_message(msg) {
            self.on_announcement(&ann);
        } else {
            self.route_status_message(msg);
        }
    }
}
