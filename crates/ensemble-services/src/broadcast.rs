//! Multicast group channel.
//!
//! One UDP socket joined to one IPv4 multicast group. A single receive task
//! decodes each datagram and hands it to the listeners in registration
//! order, so listeners never run concurrently with each other and a slow
//! listener delays the rest.
//!
//! Multicast loopback is on: a node receives its own publications. Sync
//! traffic carries a node id for filtering; message listeners see
//! everything.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use ensemble_core::message::{Arg, Message};
use ensemble_core::wire::{Datagram, WireError, MAX_DATAGRAM};

use crate::events::{EventBus, ListenerId, Topical};

/// One decoded datagram and where it came from.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub datagram: Datagram,
    pub from: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Probe,
    Echo,
    Message,
}

impl Topical for Inbound {
    type Topic = InboundKind;
    fn topic(&self) -> InboundKind {
        match self.datagram {
            Datagram::Probe(_) => InboundKind::Probe,
            Datagram::Echo(_) => InboundKind::Echo,
            Datagram::Message(_) => InboundKind::Message,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("failed to bind multicast group {group}:{port}: {source}")]
    Bind {
        group: Ipv4Addr,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("channel disposed")]
    Disposed,
}

/// Anything that can put a datagram on the wire.
pub trait DatagramSink: Send + Sync {
    fn send_datagram(&self, datagram: &Datagram) -> Result<(), BroadcastError>;
}

pub struct BroadcastChannel {
    /// Taken on dispose; the receive task holds the only other reference.
    socket: Mutex<Option<Arc<UdpSocket>>>,
    group: SocketAddrV4,
    listeners: Arc<EventBus<Inbound>>,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for BroadcastChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("group", &self.group)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl BroadcastChannel {
    /// Bind and join `group:port` on the interface with address `interface`
    /// (any interface when `None`), and start the receive task.
    ///
    /// Port 0 binds an ephemeral port; publications then go to that port.
    /// Must be called from within a tokio runtime.
    pub fn join(
        group: Ipv4Addr,
        port: u16,
        interface: Option<Ipv4Addr>,
    ) -> Result<Arc<Self>, BroadcastError> {
        let bind_err = |source| BroadcastError::Bind {
            group,
            port,
            source,
        };

        let std_socket = make_group_socket(group, port, interface.unwrap_or(Ipv4Addr::UNSPECIFIED))
            .map_err(bind_err)?;
        let bound_port = std_socket.local_addr().map_err(bind_err)?.port();
        let socket = Arc::new(UdpSocket::from_std(std_socket).map_err(bind_err)?);

        let channel = Arc::new(Self {
            socket: Mutex::new(Some(socket.clone())),
            group: SocketAddrV4::new(group, bound_port),
            listeners: Arc::new(EventBus::new()),
            task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        let handle = tokio::spawn(receive_loop(socket, channel.listeners.clone()));
        *channel.task.lock() = Some(handle);

        tracing::info!(group = %group, port = bound_port, "joined multicast group");
        Ok(channel)
    }

    /// Group address publications are sent to.
    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    /// Serialize and send one message to the group. Fire-and-forget: a send
    /// failure is logged and the message is dropped.
    pub fn publish(&self, name: &str, args: Vec<Arg>) {
        let msg = Datagram::Message(Message::new(name, args));
        if let Err(e) = self.send_datagram(&msg) {
            tracing::warn!(message = name, error = %e, "publish failed");
        }
    }

    /// Register a callback for every received datagram.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Inbound) + Send + Sync + 'static,
    {
        self.listeners.subscribe(None, listener)
    }

    /// Register a callback for one kind of datagram.
    pub fn subscribe_kind<F>(&self, kind: InboundKind, listener: F) -> ListenerId
    where
        F: Fn(&Inbound) + Send + Sync + 'static,
    {
        self.listeners.subscribe(Some(kind), listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop the receive task, release the socket and drop all listeners.
    /// Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.socket.lock().take();
        self.listeners.clear();
        tracing::info!(group = %self.group, "multicast channel disposed");
    }
}

impl DatagramSink for BroadcastChannel {
    fn send_datagram(&self, datagram: &Datagram) -> Result<(), BroadcastError> {
        let Some(socket) = self.socket.lock().clone() else {
            return Err(BroadcastError::Disposed);
        };
        let bytes = datagram.encode()?;
        socket
            .try_send_to(&bytes, SocketAddr::V4(self.group))
            .map_err(BroadcastError::Send)?;
        Ok(())
    }
}

impl Drop for BroadcastChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, listeners: Arc<EventBus<Inbound>>) {
    let mut buf = vec![0u8; MAX_DATAGRAM + 1];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "recv_from failed");
                continue;
            }
        };

        match Datagram::decode(&buf[..len]) {
            Ok(datagram) => {
                listeners.emit(&Inbound { datagram, from });
            }
            Err(e) => {
                tracing::trace!(from = %from, len, error = %e, "dropping undecodable datagram");
            }
        }
    }
}

/// Create a UDP socket bound to `port` and joined to `group`.
fn make_group_socket(
    group: Ipv4Addr,
    port: u16,
    interface: Ipv4Addr,
) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into())?;

    socket.join_multicast_v4(&group, &interface)?;
    socket.set_multicast_loop_v4(true)?;
    // TTL 1: stay on the local network segment
    socket.set_multicast_ttl_v4(1)?;
    if !interface.is_unspecified() {
        socket.set_multicast_if_v4(&interface)?;
    }

    Ok(socket.into())
}
