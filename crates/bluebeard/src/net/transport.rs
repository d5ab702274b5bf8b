use std::cell::RefCell;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;

use super::datagram::DatagramError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reliability {
    Unreliable,
    #[default]
    Reliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingMode {
    Unordered,
    /// Late arrivals are dropped instead of delivered out of order.
    Sequenced,
    #[default]
    Ordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOptions {
    pub reliability: Reliability,
    pub ordering: OrderingMode,
    pub channel: u8,
}

impl SendOptions {
    pub const RELIABLE_ORDERED: SendOptions = SendOptions {
        reliability: Reliability::Reliable,
        ordering: OrderingMode::Ordered,
        channel: 0,
    };

    pub const UNRELIABLE: SendOptions = SendOptions {
        reliability: Reliability::Unreliable,
        ordering: OrderingMode::Unordered,
        channel: 0,
    };

    pub fn on_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    /// An outgoing connect completed.
    ConnectionAccepted,
    /// A remote peer connected to us.
    NewIncomingConnection,
    ConnectionAttemptFailed,
    NoFreeIncomingConnections,
    Disconnected,
    ConnectionLost,
    Message(Bytes),
    /// Connectionless datagram payload.
    Unconnected(Bytes),
}

impl PacketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::ConnectionAccepted => "connection accepted",
            PacketKind::NewIncomingConnection => "new incoming connection",
            PacketKind::ConnectionAttemptFailed => "connection attempt failed",
            PacketKind::NoFreeIncomingConnections => "no free incoming connections",
            PacketKind::Disconnected => "disconnected",
            PacketKind::ConnectionLost => "connection lost",
            PacketKind::Message(_) => "message",
            PacketKind::Unconnected(_) => "unconnected message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub addr: SocketAddr,
    pub kind: PacketKind,
}

impl Packet {
    pub fn new(addr: SocketAddr, kind: PacketKind) -> Self {
        Self { addr, kind }
    }

    pub fn message(addr: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self::new(addr, PacketKind::Message(payload.into()))
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match &self.kind {
            PacketKind::Message(data) | PacketKind::Unconnected(data) => Some(data),
            _ => None,
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.kind.as_str(), self.addr)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("datagram error: {0}")]
    Datagram(#[from] DatagramError),
    #[error("already connected or connecting to {0}")]
    AlreadyConnected(SocketAddr),
    #[error("not connected to {0}")]
    NotConnected(SocketAddr),
    #[error("payload of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
    #[error("cannot resolve {0}")]
    Unresolved(String),
}

/// Connection-oriented datagram delivery underneath the handshake and master
/// protocols.
pub trait Transport {
    fn local_addr(&self) -> SocketAddr;

    /// Starts connecting. Completion is reported later as a packet.
    fn connect(&mut self, addr: SocketAddr) -> Result<(), TransportError>;

    /// Drops the connection without a local notification. With `notify` the
    /// remote side sees `Disconnected` instead of eventually losing the link.
    fn close(&mut self, addr: SocketAddr, notify: bool);

    fn is_connected(&self, addr: SocketAddr) -> bool;

    fn connections(&self) -> Vec<SocketAddr>;

    fn send(
        &mut self,
        payload: &[u8],
        options: SendOptions,
        dest: SocketAddr,
    ) -> Result<(), TransportError>;

    fn send_unconnected(&mut self, payload: &[u8], dest: SocketAddr) -> Result<(), TransportError>;

    /// Queues a packet that `poll` returns ahead of anything from the network.
    fn inject(&mut self, packet: Packet);

    fn poll(&mut self) -> Option<Packet>;

    /// Resends, keepalives and timeouts.
    fn update(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub type SharedTransport = Rc<RefCell<dyn Transport>>;

pub fn share<T: Transport + 'static>(transport: T) -> SharedTransport {
    Rc::new(RefCell::new(transport))
}
