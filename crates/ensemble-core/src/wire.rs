//! Ensemble wire format: fixed-layout datagrams and protocol constants.
//!
//! Clock synchronization traffic is latency sensitive and travels as
//! fixed-size `#[repr(C, packed)]` structs with zerocopy derives, so a probe
//! can be parsed without allocating. Everything else on the multicast groups
//! is a named [`Message`] envelope. [`Datagram::decode`] tells them apart by
//! the 4-byte magic at the front of the sync structs.
//!
//! There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::message::Message;

// ── Sync probe ────────────────────────────────────────────────────────────────

/// Broadcast by every node once per probe interval.
///
/// Receivers answer immediately with a [`SyncEcho`] carrying the original
/// `t1` back to the origin.
///
/// Wire size: 24 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SyncProbe {
    /// Always [`PROBE_MAGIC`].
    pub magic: [u8; 4],
    /// Wire format version. Currently [`SYNC_VERSION`].
    pub version: u8,
    /// Reserved, must be zero.
    pub reserved: [u8; 3],
    /// Random per-process node id of the sender.
    pub origin: u64,
    /// Sender's corrected time at send, in milliseconds.
    pub t1: i64,
}

assert_eq_size!(SyncProbe, [u8; 24]);

/// Reply to a [`SyncProbe`], addressed (by `origin`) to the node that sent it.
///
/// Wire size: 48 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SyncEcho {
    /// Always [`ECHO_MAGIC`].
    pub magic: [u8; 4],
    pub version: u8,
    pub reserved: [u8; 3],
    /// Node id copied from the probe being answered.
    pub origin: u64,
    /// Node id of the responder.
    pub responder: u64,
    /// `t1` copied from the probe.
    pub t1: i64,
    /// Responder's corrected time when the probe arrived.
    pub t2: i64,
    /// Responder's corrected time when this echo was sent.
    pub t3: i64,
}

assert_eq_size!(SyncEcho, [u8; 48]);

impl SyncProbe {
    pub fn new(origin: u64, t1: i64) -> Self {
        Self {
            magic: PROBE_MAGIC,
            version: SYNC_VERSION,
            reserved: [0; 3],
            origin,
            t1,
        }
    }
}

impl SyncEcho {
    /// Build the answer to `probe`. `t2` and `t3` are the responder's clock.
    pub fn answer(probe: &SyncProbe, responder: u64, t2: i64, t3: i64) -> Self {
        Self {
            magic: ECHO_MAGIC,
            version: SYNC_VERSION,
            reserved: [0; 3],
            origin: probe.origin,
            responder,
            t1: probe.t1,
            t2,
            t3,
        }
    }
}

// ── Datagram ──────────────────────────────────────────────────────────────────

/// Anything that can arrive on a multicast group.
#[derive(Debug, Clone)]
pub enum Datagram {
    Probe(SyncProbe),
    Echo(SyncEcho),
    Message(Message),
}

impl Datagram {
    /// Classify and parse a received datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_DATAGRAM {
            return Err(WireError::TooLarge(bytes.len()));
        }
        if bytes.len() >= 5 {
            let magic: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
            if magic == PROBE_MAGIC || magic == ECHO_MAGIC {
                if bytes[4] != SYNC_VERSION {
                    return Err(WireError::UnknownVersion(bytes[4]));
                }
            }
            if magic == PROBE_MAGIC {
                return SyncProbe::read_from(bytes)
                    .map(Datagram::Probe)
                    .ok_or(WireError::Truncated(bytes.len()));
            }
            if magic == ECHO_MAGIC {
                return SyncEcho::read_from(bytes)
                    .map(Datagram::Echo)
                    .ok_or(WireError::Truncated(bytes.len()));
            }
        }
        Message::decode(bytes).map(Datagram::Message)
    }

    /// Serialize for sending.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        match self {
            Datagram::Probe(p) => Ok(p.as_bytes().to_vec()),
            Datagram::Echo(e) => Ok(e.as_bytes().to_vec()),
            Datagram::Message(m) => m.encode(),
        }
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

pub const PROBE_MAGIC: [u8; 4] = *b"ENSP";
pub const ECHO_MAGIC: [u8; 4] = *b"ENSE";

/// Current sync datagram version.
pub const SYNC_VERSION: u8 = 0x01;

/// Largest datagram accepted on any multicast group or control socket.
pub const MAX_DATAGRAM: usize = 8192;

/// IPv4 multicast group shared by discovery, sync and general broadcast.
pub const MULTICAST_ADDR: &str = "225.2.2.5";

/// Broadcast messages (announcements, `/device/log`).
pub const BROADCAST_PORT: u16 = 2222;
/// Status and log messages from device to controller.
pub const STATUS_FROM_DEVICE_PORT: u16 = 2223;
/// Sync probes and echoes.
pub const CLOCK_SYNC_PORT: u16 = 2224;
/// Sealed code units from controller to device (stream).
pub const CODE_TO_DEVICE_PORT: u16 = 2225;
/// Control messages from controller to device (datagram).
pub const CONTROL_TO_DEVICE_PORT: u16 = 2226;

/// How often a device announces itself, in milliseconds.
pub const ALIVE_INTERVAL_MS: u64 = 1000;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown sync version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("datagram truncated ({0} bytes)")]
    Truncated(usize),

    #[error("datagram of {0} bytes exceeds maximum {}", MAX_DATAGRAM)]
    TooLarge(usize),

    #[error("malformed message: {0}")]
    Malformed(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Arg;

    #[test]
    fn probe_decodes_from_bytes() {
        let probe = SyncProbe::new(0xdead_beef, 1_700_000_000_123);
        let bytes = probe.as_bytes().to_vec();
        assert_eq!(bytes.len(), 24);

        match Datagram::decode(&bytes).unwrap() {
            Datagram::Probe(p) => {
                // Copy packed fields to locals to avoid unaligned references
                let origin = p.origin;
                let t1 = p.t1;
                assert_eq!(origin, 0xdead_beef);
                assert_eq!(t1, 1_700_000_000_123);
            }
            other => panic!("expected probe, got {:?}", other),
        }
    }

    #[test]
    fn echo_carries_probe_fields() {
        let probe = SyncProbe::new(7, 100);
        let echo = SyncEcho::answer(&probe, 9, 150, 152);
        let bytes = echo.as_bytes().to_vec();
        assert_eq!(bytes.len(), 48);

        match Datagram::decode(&bytes).unwrap() {
            Datagram::Echo(e) => {
                let (origin, responder, t1, t2, t3) = (e.origin, e.responder, e.t1, e.t2, e.t3);
                assert_eq!(origin, 7);
                assert_eq!(responder, 9);
                assert_eq!(t1, 100);
                assert_eq!(t2, 150);
                assert_eq!(t3, 152);
            }
            other => panic!("expected echo, got {:?}", other),
        }
    }

    #[test]
    fn truncated_probe_is_rejected() {
        let probe = SyncProbe::new(1, 2);
        let bytes = &probe.as_bytes()[..10];
        assert_eq!(Datagram::decode(bytes).unwrap_err(), WireError::Truncated(10));
    }

    #[test]
    fn unknown_sync_version_is_rejected() {
        let mut probe = SyncProbe::new(1, 2);
        probe.version = 0x7f;
        let err = Datagram::decode(probe.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("0x7f"));
    }

    #[test]
    fn json_messages_fall_through_to_message_decoder() {
        let msg = Message::new("/device/log", vec![Arg::Int(3), Arg::Str("hi".into())]);
        let bytes = Datagram::Message(msg.clone()).encode().unwrap();
        match Datagram::decode(&bytes).unwrap() {
            Datagram::Message(m) => assert_eq!(m, msg),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn oversized_datagram_is_rejected() {
        let bytes = vec![b'{'; MAX_DATAGRAM + 1];
        assert_eq!(
            Datagram::decode(&bytes).unwrap_err(),
            WireError::TooLarge(MAX_DATAGRAM + 1)
        );
    }
}
