pub mod broadcast;
pub mod clock;
pub mod code_server;
pub mod control;
pub mod device;
pub mod events;
pub mod link;
pub mod loader;
pub mod netif;
pub mod peer;
pub mod registry;

pub use broadcast::{BroadcastChannel, BroadcastError, DatagramSink, Inbound, InboundKind};
pub use clock::{ClockSynchronizer, ScheduleHandle, SyncState};
pub use code_server::CodeServer;
pub use control::{control_loop, ControlDispatcher};
pub use device::{alive_loop, DeviceState};
pub use link::{DeviceLink, LinkError, LinkEvent, LinkPorts, NetTransport};
pub use loader::{CodeError, ExecutionContext, LoadOutcome, SecureCodeLoader};
pub use peer::{Announcement, PeerAddress, PeerRecord};
pub use registry::PeerRegistry;
