use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;

use super::stats::{NetworkStats, PacketLossSimulation};
use super::transport::{Packet, PacketKind, Reliability, SendOptions, Transport, TransportError};

#[derive(Debug)]
struct Mailbox {
    inbox: VecDeque<Packet>,
    listening: bool,
    max_connections: usize,
    connections: BTreeSet<SocketAddr>,
    loss: PacketLossSimulation,
    stats: NetworkStats,
}

#[derive(Debug, Default)]
struct Hub {
    endpoints: HashMap<SocketAddr, Mailbox>,
}

impl Hub {
    fn deliver(&mut self, dest: SocketAddr, packet: Packet) -> bool {
        match self.endpoints.get_mut(&dest) {
            Some(mailbox) => {
                if let Some(data) = packet.payload() {
                    mailbox.stats.record_received(data.len());
                }
                mailbox.inbox.push_back(packet);
                true
            }
            None => false,
        }
    }

    fn unlink(&mut self, a: SocketAddr, b: SocketAddr) -> bool {
        let had = self
            .endpoints
            .get_mut(&a)
            .is_some_and(|m| m.connections.remove(&b));
        if let Some(mailbox) = self.endpoints.get_mut(&b) {
            mailbox.connections.remove(&a);
        }
        had
    }
}

/// In-process network. Connects complete on the next poll and nothing is
/// reordered, which makes multi-peer tests deterministic.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Rc<RefCell<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, addr: SocketAddr, max_connections: usize) -> MemoryTransport {
        self.hub.borrow_mut().endpoints.insert(
            addr,
            Mailbox {
                inbox: VecDeque::new(),
                listening: true,
                max_connections,
                connections: BTreeSet::new(),
                loss: PacketLossSimulation::default(),
                stats: NetworkStats::default(),
            },
        );
        MemoryTransport {
            hub: Rc::clone(&self.hub),
            addr,
            injected: VecDeque::new(),
        }
    }

    /// An endpoint that is not listening makes connects to it fail, like a
    /// host with nothing bound to the port.
    pub fn set_listening(&self, addr: SocketAddr, listening: bool) {
        if let Some(mailbox) = self.hub.borrow_mut().endpoints.get_mut(&addr) {
            mailbox.listening = listening;
        }
    }

    pub fn set_packet_loss(&self, addr: SocketAddr, loss: PacketLossSimulation) {
        if let Some(mailbox) = self.hub.borrow_mut().endpoints.get_mut(&addr) {
            mailbox.loss = loss;
        }
    }

    /// Cuts the link between two endpoints; both sides see `ConnectionLost`.
    pub fn sever(&self, a: SocketAddr, b: SocketAddr) {
        let mut hub = self.hub.borrow_mut();
        if hub.unlink(a, b) {
            hub.deliver(a, Packet::new(b, PacketKind::ConnectionLost));
            hub.deliver(b, Packet::new(a, PacketKind::ConnectionLost));
        }
    }

    pub fn stats(&self, addr: SocketAddr) -> Option<NetworkStats> {
        self.hub
            .borrow()
            .endpoints
            .get(&addr)
            .map(|m| m.stats.clone())
    }

    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.hub
            .borrow()
            .endpoints
            .get(&addr)
            .map_or(0, |m| m.inbox.len())
    }
}

fn is_connectionless(packet: &Packet) -> bool {
    matches!(packet.kind, PacketKind::Unconnected(_))
}

pub struct MemoryTransport {
    hub: Rc<RefCell<Hub>>,
    addr: SocketAddr,
    injected: VecDeque<Packet>,
}

impl MemoryTransport {
    fn send_packet(&mut self, dest: SocketAddr, kind: PacketKind, droppable: bool) {
        let mut hub = self.hub.borrow_mut();
        let Some(own) = hub.endpoints.get_mut(&self.addr) else {
            return;
        };
        if let PacketKind::Message(data) | PacketKind::Unconnected(data) = &kind {
            own.stats.record_sent(data.len());
        }
        if droppable && own.loss.should_drop() {
            own.stats.packets_dropped += 1;
            return;
        }
        hub.deliver(dest, Packet::new(self.addr, kind));
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let Ok(mut hub) = self.hub.try_borrow_mut() else {
            return;
        };
        let Some(mailbox) = hub.endpoints.remove(&self.addr) else {
            return;
        };
        for peer in mailbox.connections {
            if let Some(other) = hub.endpoints.get_mut(&peer) {
                other.connections.remove(&self.addr);
            }
            hub.deliver(peer, Packet::new(self.addr, PacketKind::ConnectionLost));
        }
    }
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        let mut hub = self.hub.borrow_mut();
        if hub
            .endpoints
            .get(&self.addr)
            .is_some_and(|m| m.connections.contains(&addr))
        {
            return Err(TransportError::AlreadyConnected(addr));
        }

        let outcome = match hub.endpoints.get(&addr) {
            Some(remote) if !remote.listening => PacketKind::ConnectionAttemptFailed,
            Some(remote) if remote.connections.len() >= remote.max_connections => {
                PacketKind::NoFreeIncomingConnections
            }
            Some(_) => PacketKind::ConnectionAccepted,
            None => PacketKind::ConnectionAttemptFailed,
        };

        if outcome == PacketKind::ConnectionAccepted {
            if let Some(own) = hub.endpoints.get_mut(&self.addr) {
                own.connections.insert(addr);
            }
            if let Some(remote) = hub.endpoints.get_mut(&addr) {
                remote.connections.insert(self.addr);
            }
            hub.deliver(addr, Packet::new(self.addr, PacketKind::NewIncomingConnection));
        }
        hub.deliver(self.addr, Packet::new(addr, outcome));
        Ok(())
    }

    fn close(&mut self, addr: SocketAddr, notify: bool) {
        let mut hub = self.hub.borrow_mut();
        if let Some(own) = hub.endpoints.get_mut(&self.addr) {
            own.inbox.retain(|p| p.addr != addr || is_connectionless(p));
        }
        if hub.unlink(self.addr, addr) {
            let kind = if notify {
                PacketKind::Disconnected
            } else {
                PacketKind::ConnectionLost
            };
            hub.deliver(addr, Packet::new(self.addr, kind));
        }
    }

    fn is_connected(&self, addr: SocketAddr) -> bool {
        self.hub
            .borrow()
            .endpoints
            .get(&self.addr)
            .is_some_and(|m| m.connections.contains(&addr))
    }

    fn connections(&self) -> Vec<SocketAddr> {
        self.hub
            .borrow()
            .endpoints
            .get(&self.addr)
            .map(|m| m.connections.iter().copied().collect())
            .unwrap_or_default()
    }

    fn send(
        &mut self,
        payload: &[u8],
        options: SendOptions,
        dest: SocketAddr,
    ) -> Result<(), TransportError> {
        if !self.is_connected(dest) {
            return Err(TransportError::NotConnected(dest));
        }
        let droppable = options.reliability == Reliability::Unreliable;
        self.send_packet(
            dest,
            PacketKind::Message(Bytes::copy_from_slice(payload)),
            droppable,
        );
        Ok(())
    }

    fn send_unconnected(&mut self, payload: &[u8], dest: SocketAddr) -> Result<(), TransportError> {
        self.send_packet(
            dest,
            PacketKind::Unconnected(Bytes::copy_from_slice(payload)),
            true,
        );
        Ok(())
    }

    fn inject(&mut self, packet: Packet) {
        self.injected.push_back(packet);
    }

    fn poll(&mut self) -> Option<Packet> {
        if let Some(packet) = self.injected.pop_front() {
            return Some(packet);
        }
        self.hub
            .borrow_mut()
            .endpoints
            .get_mut(&self.addr)
            .and_then(|m| m.inbox.pop_front())
    }
}
