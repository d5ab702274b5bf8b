mod datagram;
mod failover;
mod handshake;
mod info;
mod memory;
mod message;
mod peer;
mod stats;
mod tracking;
mod transport;
mod udp;
mod version;

pub use datagram::{DatagramError, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
pub use failover::{FailoverConnector, FailoverOutcome, resolve};
pub use handshake::{
    AUTO_CLOSE_TIMEOUT, ClientHandshake, ClientPredicate, HandshakeError, HandshakeOutcome,
    MismatchKind, ServerHandshake, ServerPredicate, accept_exact,
};
pub use info::{MAX_STRING_LEN, ServerInfo};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::{Message, MessageError, tag};
pub use peer::{FilterAction, NetworkPeer, PacketFilter};
pub use stats::{NetworkStats, PacketLossSimulation};
pub use transport::{
    OrderingMode, Packet, PacketKind, Reliability, SendOptions, SharedTransport, Transport,
    TransportError, share,
};
pub use udp::{MAX_PAYLOAD_SIZE, UdpTransport};
pub use version::{ParseVersionError, VersionInfo, VersionVerdict};
