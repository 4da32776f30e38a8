//! Peer records and their rotating candidate addresses.

use std::collections::VecDeque;
use std::time::Instant;

use ensemble_core::message::{names, Arg, Message};

/// Hostname prefix of simulated devices; sends to them are no-ops.
pub const VIRTUAL_DEVICE_PREFIX: &str = "Virtual Test Device";

/// Number of group-membership flags per peer.
pub const GROUP_COUNT: usize = 4;

/// Ordered candidate locators for one peer. Never empty.
///
/// A failed candidate moves to the back; after the last candidate the list
/// is back at the first one. Candidates are never dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    candidates: VecDeque<String>,
}

impl PeerAddress {
    /// Build the preference-ordered list for a device:
    /// `device.local`, address, `hostname.local`, hostname, device name.
    /// Empty and duplicate entries are skipped. If nothing usable remains,
    /// the hostname is used as-is.
    pub fn for_device(hostname: &str, address: &str, device_name: &str) -> Self {
        let mut candidates: VecDeque<String> = VecDeque::new();
        let mut push = |c: String| {
            if !c.is_empty() && !candidates.contains(&c) {
                candidates.push_back(c);
            }
        };

        push(local_name(device_name));
        push(address.to_string());
        push(local_name(hostname));
        push(hostname.to_string());
        push(device_name.to_string());

        if candidates.is_empty() {
            candidates.push_back(hostname.to_string());
        }
        Self { candidates }
    }

    /// Use exactly these candidates, in order. `fallback` is used when the
    /// list is empty.
    pub fn from_candidates<I, S>(candidates: I, fallback: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: VecDeque<String> = VecDeque::new();
        for c in candidates {
            let c = c.into();
            if !c.is_empty() && !list.contains(&c) {
                list.push_back(c);
            }
        }
        if list.is_empty() {
            list.push_back(fallback.to_string());
        }
        Self { candidates: list }
    }

    pub fn current(&self) -> &str {
        // Invariant: never empty.
        self.candidates.front().map(String::as_str).unwrap_or_default()
    }

    /// Move the current candidate to the back.
    pub fn rotate(&mut self) {
        if let Some(front) = self.candidates.pop_front() {
            self.candidates.push_back(front);
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.candidates.iter().map(String::as_str)
    }

    pub fn contains(&self, candidate: &str) -> bool {
        self.candidates.iter().any(|c| c == candidate)
    }
}

/// `name.local` unless `name` is empty or already qualified.
fn local_name(name: &str) -> String {
    if name.is_empty() || name.contains('.') || name.contains(':') {
        String::new()
    } else {
        format!("{name}.local")
    }
}

/// Controller-side view of one device.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub hostname: String,
    pub device_name: String,
    /// Numeric address last announced.
    pub address: String,
    /// Assigned id; -1 until assigned.
    pub id: i64,
    pub locators: PeerAddress,
    pub groups: [bool; GROUP_COUNT],
    pub last_seen: Instant,
    pub status: String,
    pub log: String,
}

impl PeerRecord {
    pub fn new(hostname: &str, address: &str, device_name: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            device_name: device_name.to_string(),
            address: address.to_string(),
            id: -1,
            locators: PeerAddress::for_device(hostname, address, device_name),
            groups: [false; GROUP_COUNT],
            last_seen: Instant::now(),
            status: String::new(),
            log: String::new(),
        }
    }

    pub fn from_announcement(ann: &Announcement) -> Self {
        let mut record = Self::new(&ann.hostname, &ann.address, &ann.device_name);
        record.id = ann.id;
        record.status = ann.status.clone();
        record
    }

    /// Fold a later announcement in. Candidates are rebuilt only if the
    /// announced identity changed, so rotation progress survives refreshes.
    pub fn refresh(&mut self, ann: &Announcement) {
        if ann.address != self.address || ann.device_name != self.device_name {
            self.address = ann.address.clone();
            self.device_name = ann.device_name.clone();
            self.locators = PeerAddress::for_device(&self.hostname, &self.address, &self.device_name);
        }
        if ann.id >= 0 {
            self.id = ann.id;
        }
        if !ann.status.is_empty() {
            self.status = ann.status.clone();
        }
        self.last_seen = Instant::now();
    }

    pub fn is_virtual(&self) -> bool {
        self.hostname.starts_with(VIRTUAL_DEVICE_PREFIX)
    }

    pub fn set_group(&mut self, group: usize, member: bool) -> bool {
        match self.groups.get_mut(group) {
            Some(slot) => {
                *slot = member;
                true
            }
            None => false,
        }
    }

    pub fn append_log(&mut self, text: &str) {
        self.log.push_str(text);
        if !text.ends_with('\n') {
            self.log.push('\n');
        }
    }
}

/// Body of a `/device/alive` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub hostname: String,
    pub address: String,
    pub device_name: String,
    pub id: i64,
    pub status: String,
}

impl Announcement {
    pub fn to_message(&self) -> Message {
        Message::new(
            names::DEVICE_ALIVE,
            vec![
                Arg::from(self.hostname.as_str()),
                Arg::from(self.address.as_str()),
                Arg::from(self.device_name.as_str()),
                Arg::Int(self.id),
                Arg::from(self.status.as_str()),
            ],
        )
    }

    /// `None` unless `msg` is a well-formed `/device/alive`.
    pub fn from_message(msg: &Message) -> Option<Self> {
        if !msg.is(names::DEVICE_ALIVE) {
            return None;
        }
        let hostname = msg.str_arg(0)?;
        if hostname.is_empty() {
            return None;
        }
        Some(Self {
            hostname: hostname.to_string(),
            address: msg.str_arg(1).unwrap_or_default().to_string(),
            device_name: msg.str_arg(2).unwrap_or_default().to_string(),
            id: msg.int_arg(3).unwrap_or(-1),
            status: msg.str_arg(4).unwrap_or_default().to_string(),
        })
    }
}
