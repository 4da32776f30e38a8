//! Addressed link to one device, with candidate-address failover.
//!
//! `send` delivers one control datagram; `send_bulk` opens a fresh stream
//! per call and writes every chunk. Both try the current candidate, rotate
//! it to the back on any network failure, and give up after
//! `max_attempts` tries per call. Giving up is reported through the event
//! bus and the returned error; nothing panics and nothing is retried later.
//!
//! Sends on one link are serialized by the link's I/O lock, so concurrent
//! callers never interleave their rotations. The record itself is locked
//! only briefly, so registry readers are not blocked by network I/O.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use ensemble_core::config::LinkConfig;
use ensemble_core::crypto::{self, CodeKey, CryptoError};
use ensemble_core::message::Message;
use ensemble_core::wire::WireError;

use crate::events::{EventBus, ListenerId, Topical};
use crate::peer::PeerRecord;

// ── Transport seam ────────────────────────────────────────────────────────────

/// Network operations a link needs. One call is one attempt at one locator.
pub trait LinkTransport: Send + Sync {
    fn send_datagram(&self, host: &str, port: u16, payload: &[u8]) -> io::Result<()>;
    fn send_stream(&self, host: &str, port: u16, chunks: &[&[u8]]) -> io::Result<()>;
}

/// Blocking std::net transport with connect and write timeouts.
#[derive(Debug, Clone)]
pub struct NetTransport {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

impl NetTransport {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
        }
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{host}: no addresses"))
    })
}

impl LinkTransport for NetTransport {
    fn send_datagram(&self, host: &str, port: u16, payload: &[u8]) -> io::Result<()> {
        let dest = resolve(host, port)?;
        let bind = if dest.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)?;
        socket.set_write_timeout(Some(self.write_timeout))?;
        socket.send_to(payload, dest)?;
        Ok(())
    }

    fn send_stream(&self, host: &str, port: u16, chunks: &[&[u8]]) -> io::Result<()> {
        let dest = resolve(host, port)?;
        let mut stream = TcpStream::connect_timeout(&dest, self.connect_timeout)?;
        stream.set_write_timeout(Some(self.write_timeout))?;
        for chunk in chunks {
            stream.write_all(chunk)?;
        }
        stream.flush()?;
        stream.shutdown(std::net::Shutdown::Write)?;
        Ok(())
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTopic {
    Error,
    Status,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFailure {
    /// Every attempt in one call failed. Candidates are kept for next time.
    AddressesExhausted,
    /// At least one attempt failed with an address-family mismatch.
    FamilyMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Error { kind: LinkFailure, message: String },
    Status(String),
    Log(String),
}

impl Topical for LinkEvent {
    type Topic = LinkTopic;
    fn topic(&self) -> LinkTopic {
        match self {
            LinkEvent::Error { .. } => LinkTopic::Error,
            LinkEvent::Status(_) => LinkTopic::Status,
            LinkEvent::Log(_) => LinkTopic::Log,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("{host}: all {attempts} attempts failed, last error: {last}")]
    Exhausted {
        host: String,
        attempts: usize,
        last: String,
    },

    #[error("{host}: address family mismatch, check IPv4/IPv6 settings ({detail})")]
    FamilyMismatch { host: String, detail: String },

    #[error(transparent)]
    Encode(#[from] WireError),

    #[error(transparent)]
    Seal(#[from] CryptoError),
}

/// True for errors caused by using an IPv6 locator on an IPv4-only stack
/// (or the reverse).
pub fn is_family_mismatch(err: &io::Error) -> bool {
    if let Some(code) = err.raw_os_error() {
        if code == libc::EAFNOSUPPORT || code == libc::EPFNOSUPPORT || code == libc::EPROTONOSUPPORT {
            return true;
        }
    }
    let text = err.to_string().to_ascii_lowercase();
    text.contains("address family") || text.contains("protocol family")
}

// ── Link ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct LinkPorts {
    pub control: u16,
    pub code: u16,
}

pub struct DeviceLink {
    record: Arc<Mutex<PeerRecord>>,
    transport: Arc<dyn LinkTransport>,
    ports: LinkPorts,
    max_attempts: usize,
    io_lock: Mutex<()>,
    events: EventBus<LinkEvent>,
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.record.lock();
        f.debug_struct("DeviceLink")
            .field("hostname", &record.hostname)
            .field("id", &record.id)
            .field("current", &record.locators.current())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Payload<'a> {
    Datagram(&'a [u8]),
    Stream(&'a [&'a [u8]]),
}

impl DeviceLink {
    pub fn new(
        record: Arc<Mutex<PeerRecord>>,
        transport: Arc<dyn LinkTransport>,
        ports: LinkPorts,
        config: &LinkConfig,
    ) -> Self {
        Self {
            record,
            transport,
            ports,
            max_attempts: config.max_attempts.max(1),
            io_lock: Mutex::new(()),
            events: EventBus::new(),
        }
    }

    /// The shared record this link addresses.
    pub fn record(&self) -> &Arc<Mutex<PeerRecord>> {
        &self.record
    }

    pub fn hostname(&self) -> String {
        self.record.lock().hostname.clone()
    }

    pub fn id(&self) -> i64 {
        self.record.lock().id
    }

    /// Send one control message. Best-effort: on failure the message is
    /// dropped, an error event is emitted and the error returned.
    pub fn send(&self, message: &Message) -> Result<(), LinkError> {
        let bytes = message.encode()?;
        tracing::debug!(message = %message.name, "link send");
        self.deliver(self.ports.control, Payload::Datagram(&bytes))
    }

    /// Open a fresh stream to the code port and write `chunks` in order.
    pub fn send_bulk(&self, chunks: &[&[u8]]) -> Result<(), LinkError> {
        self.deliver(self.ports.code, Payload::Stream(chunks))
    }

    /// Seal `unit` with `key` and deliver it over the bulk path.
    pub fn push_code(&self, key: &CodeKey, unit: &[u8]) -> Result<(), LinkError> {
        let sealed = crypto::seal(key, unit)?;
        tracing::info!(
            hash = hex::encode(&sealed[..8]),
            bytes = sealed.len(),
            "pushing code unit"
        );
        self.send_bulk(&[&sealed[..]])
    }

    fn deliver(&self, port: u16, payload: Payload<'_>) -> Result<(), LinkError> {
        let _serial = self.io_lock.lock();

        let hostname = {
            let record = self.record.lock();
            if record.is_virtual() {
                return Ok(());
            }
            record.hostname.clone()
        };

        let mut errors: Vec<(String, io::Error)> = Vec::new();
        let mut delivered = false;
        for attempt in 0..self.max_attempts {
            let locator = self.record.lock().locators.current().to_string();
            let result = match payload {
                Payload::Datagram(bytes) => self.transport.send_datagram(&locator, port, bytes),
                Payload::Stream(chunks) => self.transport.send_stream(&locator, port, chunks),
            };
            match result {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::debug!(host = %hostname, locator, attempt, "delivered after rotation");
                    }
                    delivered = true;
                    break;
                }
                Err(e) => {
                    tracing::debug!(host = %hostname, locator, error = %e, "attempt failed, rotating");
                    self.record.lock().locators.rotate();
                    errors.push((locator, e));
                }
            }
        }

        // Reported even when a later candidate got through.
        let mismatch = match payload {
            Payload::Stream(_) => errors
                .iter()
                .find(|(_, e)| is_family_mismatch(e))
                .map(|(locator, e)| format!("{locator}: {e}")),
            Payload::Datagram(_) => None,
        };
        if let Some(detail) = &mismatch {
            tracing::warn!(host = %hostname, detail = %detail, "address family mismatch");
            self.events.emit(&LinkEvent::Error {
                kind: LinkFailure::FamilyMismatch,
                message: format!(
                    "Unable to reach {hostname} on some addresses: address family mismatch. \
                     Try preferring IPv4 on the controller. ({detail})"
                ),
            });
        }

        if delivered {
            return Ok(());
        }

        let attempts = errors.len();
        let last = errors
            .last()
            .map(|(l, e)| format!("{l}: {e}"))
            .unwrap_or_default();
        tracing::warn!(host = %hostname, attempts, last = %last, "all candidate addresses failed");

        self.events.emit(&LinkEvent::Error {
            kind: LinkFailure::AddressesExhausted,
            message: format!("Unable to reach {hostname} after {attempts} attempts: {last}"),
        });
        match mismatch {
            Some(detail) => Err(LinkError::FamilyMismatch {
                host: hostname,
                detail,
            }),
            None => Err(LinkError::Exhausted {
                host: hostname,
                attempts,
                last,
            }),
        }
    }

    // ── Inbound status/log ────────────────────────────────────────────────────

    /// Record a status update from the device and notify status listeners.
    pub fn deliver_status(&self, text: &str) {
        self.record.lock().status = text.to_string();
        self.events.emit(&LinkEvent::Status(text.to_string()));
    }

    /// Append device log output and notify log listeners.
    pub fn deliver_log(&self, text: &str) {
        self.record.lock().append_log(text);
        self.events.emit(&LinkEvent::Log(text.to_string()));
    }

    // ── Listeners ─────────────────────────────────────────────────────────────

    pub fn add_error_listener<F>(&self, f: F) -> ListenerId
    where
        F: Fn(LinkFailure, &str) + Send + Sync + 'static,
    {
        self.events.subscribe(Some(LinkTopic::Error), move |e| {
            if let LinkEvent::Error { kind, message } = e {
                f(*kind, message);
            }
        })
    }

    pub fn add_status_listener<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.subscribe(Some(LinkTopic::Status), move |e| {
            if let LinkEvent::Status(s) = e {
                f(s);
            }
        })
    }

    pub fn add_log_listener<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.subscribe(Some(LinkTopic::Log), move |e| {
            if let LinkEvent::Log(s) = e {
                f(s);
            }
        })
    }

    /// Every event, in emission order.
    pub fn add_listener<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&LinkEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(None, f)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }
}
