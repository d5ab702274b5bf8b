//! Version handshake running in front of all connected traffic.
//!
//! The server role keeps one session per connecting peer and hides the peer
//! from the application until the exchange `VERSION_INFO_INTERNAL` ->
//! `VERSION_INFO_INTERNAL` -> `VERSION_ACK` completes. The client role drives
//! exactly one exchange and then retires. Both re-inject an ordinary
//! connection notification followed by a `VERSION_INFO` message on success.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::callback::CallbackGroup;
use crate::sched::Scheduler;

use super::message::{Message, MessageError, tag};
use super::peer::{FilterAction, PacketFilter};
use super::transport::{Packet, PacketKind, SendOptions, SharedTransport, TransportError};
use super::version::{VersionInfo, VersionVerdict};

/// Connections that have not finished the handshake by then are closed.
pub const AUTO_CLOSE_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("malformed handshake message: {0}")]
    Malformed(#[from] MessageError),
    #[error("unexpected message tag {0} during handshake")]
    Unexpected(u8),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchKind {
    Type,
    Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted(VersionInfo),
    Mismatch { kind: MismatchKind, peer: VersionInfo },
    ConnectionLost,
}

/// Decides on a peer's version and names the version reported back.
pub type ServerPredicate = Box<dyn Fn(&VersionInfo) -> (VersionVerdict, VersionInfo)>;
pub type ClientPredicate = Box<dyn Fn(&VersionInfo) -> VersionVerdict>;

/// Server policy accepting only peers running exactly `local`.
pub fn accept_exact(local: VersionInfo) -> impl Fn(&VersionInfo) -> (VersionVerdict, VersionInfo) {
    move |peer| (local.check(peer), local)
}

fn send(transport: &SharedTransport, message: Message, dest: SocketAddr) -> Result<(), HandshakeError> {
    transport
        .borrow_mut()
        .send(&message.encode(), SendOptions::RELIABLE_ORDERED, dest)?;
    Ok(())
}

fn peer_version(data: &[u8]) -> Result<VersionInfo, HandshakeError> {
    match Message::decode(data)? {
        Message::VersionInfoInternal(v) | Message::VersionMismatch(v) | Message::TypeMismatch(v) => {
            Ok(v)
        }
        other => Err(HandshakeError::Unexpected(other.tag())),
    }
}

fn mismatch_message(kind: MismatchKind, version: VersionInfo) -> Message {
    match kind {
        MismatchKind::Type => Message::TypeMismatch(version),
        MismatchKind::Version => Message::VersionMismatch(version),
    }
}

fn mismatch_kind(verdict: VersionVerdict) -> Option<MismatchKind> {
    match verdict {
        VersionVerdict::Accept => None,
        VersionVerdict::TypeMismatch => Some(MismatchKind::Type),
        VersionVerdict::VersionMismatch => Some(MismatchKind::Version),
    }
}

/// Rejects `addr`: tells the peer, tells the local application and closes.
fn reject(transport: &SharedTransport, addr: SocketAddr, kind: MismatchKind, ours: VersionInfo, theirs: VersionInfo) {
    if let Err(e) = send(transport, mismatch_message(kind, ours), addr) {
        log::debug!("could not send mismatch notice to {addr}: {e}");
    }
    let mut transport = transport.borrow_mut();
    transport.inject(Packet::message(addr, mismatch_message(kind, theirs).encode()));
    transport.close(addr, true);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    PendingVersion,
    AwaitingAck(VersionInfo),
    /// Our own `NewIncomingConnection` is queued and must pass unharmed.
    Established,
}

struct Session {
    stage: Stage,
    timer: CallbackGroup,
}

struct ServerState {
    transport: SharedTransport,
    scheduler: Scheduler,
    accept: ServerPredicate,
    sessions: HashMap<SocketAddr, Session>,
}

/// Server side of the handshake; attach to the peer accepting connections.
#[derive(Clone)]
pub struct ServerHandshake {
    state: Rc<RefCell<ServerState>>,
}

impl ServerHandshake {
    pub fn new<F>(transport: SharedTransport, scheduler: Scheduler, accept: F) -> Self
    where
        F: Fn(&VersionInfo) -> (VersionVerdict, VersionInfo) + 'static,
    {
        Self {
            state: Rc::new(RefCell::new(ServerState {
                transport,
                scheduler,
                accept: Box::new(accept),
                sessions: HashMap::new(),
            })),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.borrow().sessions.len()
    }

    pub fn is_pending(&self, addr: SocketAddr) -> bool {
        self.state.borrow().sessions.contains_key(&addr)
    }

    fn arm_timer(&self, addr: SocketAddr) -> CallbackGroup {
        let mut timer = CallbackGroup::new();
        let weak: Weak<RefCell<ServerState>> = Rc::downgrade(&self.state);
        let scheduler = self.state.borrow().scheduler.clone();
        scheduler.add_event(
            "ServerHandshake::auto_close",
            AUTO_CLOSE_TIMEOUT,
            addr,
            &mut timer,
            move |addr: SocketAddr| {
                if let Some(state) = weak.upgrade() {
                    ServerState::timed_out(&state, addr);
                }
                Ok(())
            },
        );
        timer
    }
}

impl ServerState {
    fn timed_out(state: &Rc<RefCell<ServerState>>, addr: SocketAddr) {
        let transport = {
            let mut state = state.borrow_mut();
            if state.sessions.remove(&addr).is_none() {
                return;
            }
            Rc::clone(&state.transport)
        };
        log::warn!("closing connection to {addr} after version handshake timeout");
        let mut transport = transport.borrow_mut();
        transport.inject(Packet::message(
            addr,
            Message::TypeMismatch(VersionInfo::default()).encode(),
        ));
        transport.close(addr, true);
    }

    fn on_version(&mut self, addr: SocketAddr, data: &[u8]) {
        let peer = match peer_version(data) {
            Ok(v) => v,
            Err(e) => {
                log::info!("invalid version info from {addr} ({e}); closing connection");
                self.sessions.remove(&addr);
                self.transport.borrow_mut().close(addr, true);
                return;
            }
        };

        let (verdict, ours) = (self.accept)(&peer);
        if let Some(kind) = mismatch_kind(verdict) {
            log::info!("closing connection to {addr} because of mismatching {kind:?} {peer}");
            self.sessions.remove(&addr);
            reject(&self.transport, addr, kind, ours, peer);
            return;
        }

        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        session.stage = Stage::AwaitingAck(peer);
        match send(&self.transport, Message::VersionInfoInternal(ours), addr) {
            Ok(()) => log::debug!("sent version info {ours} to {addr}"),
            Err(e) => log::warn!("could not answer version of {addr}: {e}"),
        }
    }

    fn on_ack(&mut self, addr: SocketAddr) {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        let Stage::AwaitingAck(peer) = session.stage else {
            log::warn!("ignoring early version ack from {addr}");
            return;
        };

        log::debug!("got version ack from {addr}");
        session.stage = Stage::Established;
        session.timer = CallbackGroup::new();

        let mut transport = self.transport.borrow_mut();
        transport.inject(Packet::new(addr, PacketKind::NewIncomingConnection));
        transport.inject(Packet::message(addr, Message::VersionInfo(peer).encode()));
    }
}

impl PacketFilter for ServerHandshake {
    fn name(&self) -> &str {
        "server handshake"
    }

    fn on_packet(&mut self, packet: Packet) -> FilterAction {
        let addr = packet.addr;
        match &packet.kind {
            PacketKind::NewIncomingConnection => {
                let established = self
                    .state
                    .borrow()
                    .sessions
                    .get(&addr)
                    .map(|s| s.stage == Stage::Established);
                if established == Some(true) {
                    self.state.borrow_mut().sessions.remove(&addr);
                    return FilterAction::Continue(packet);
                }

                log::debug!("new incoming connection from {addr}");
                let timer = self.arm_timer(addr);
                self.state.borrow_mut().sessions.insert(
                    addr,
                    Session {
                        stage: Stage::PendingVersion,
                        timer,
                    },
                );
                FilterAction::Consumed
            }
            PacketKind::Disconnected | PacketKind::ConnectionLost => {
                if self.state.borrow_mut().sessions.remove(&addr).is_some() {
                    log::debug!("lost connection to {addr} mid-handshake");
                }
                FilterAction::Continue(packet)
            }
            PacketKind::Message(data) => {
                let mut state = self.state.borrow_mut();
                if !state.sessions.contains_key(&addr) {
                    return FilterAction::Continue(packet);
                }
                match Message::peek_tag(data) {
                    Some(tag::VERSION_INFO_INTERNAL) => state.on_version(addr, data),
                    Some(tag::VERSION_ACK) => state.on_ack(addr),
                    _ => log::trace!("blocked message from {addr} during handshake"),
                }
                FilterAction::Consumed
            }
            _ => FilterAction::Continue(packet),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientStage {
    Connecting,
    SentVersion(SocketAddr),
    Retired,
}

type Completion = Option<(Box<dyn FnOnce(HandshakeOutcome)>, HandshakeOutcome)>;

struct ClientState {
    transport: SharedTransport,
    local: VersionInfo,
    accept: ClientPredicate,
    stage: ClientStage,
    timer: CallbackGroup,
    on_outcome: Option<Box<dyn FnOnce(HandshakeOutcome)>>,
}

impl ClientState {
    fn retire(&mut self, outcome: HandshakeOutcome) -> Completion {
        self.stage = ClientStage::Retired;
        self.timer = CallbackGroup::new();
        self.on_outcome.take().map(|cb| (cb, outcome))
    }

    fn handle(&mut self, packet: Packet) -> (FilterAction, Completion) {
        let addr = packet.addr;
        let bound = match self.stage {
            ClientStage::Retired => return (FilterAction::Continue(packet), None),
            ClientStage::SentVersion(bound) => Some(bound),
            ClientStage::Connecting => None,
        };

        match &packet.kind {
            PacketKind::ConnectionAccepted if bound.is_none() => {
                self.stage = ClientStage::SentVersion(addr);
                match send(&self.transport, Message::VersionInfoInternal(self.local), addr) {
                    Ok(()) => log::debug!("sent version info {} to {addr}", self.local),
                    Err(e) => log::warn!("could not send version info to {addr}: {e}"),
                }
                (FilterAction::Consumed, None)
            }
            PacketKind::ConnectionAttemptFailed | PacketKind::NoFreeIncomingConnections
                if bound.is_none() =>
            {
                let done = self.retire(HandshakeOutcome::ConnectionLost);
                (FilterAction::Continue(packet), done)
            }
            PacketKind::Disconnected | PacketKind::ConnectionLost if bound == Some(addr) => {
                let done = self.retire(HandshakeOutcome::ConnectionLost);
                (FilterAction::Continue(packet), done)
            }
            PacketKind::Message(data) if bound == Some(addr) => match Message::peek_tag(data) {
                Some(tag::VERSION_INFO_INTERNAL) => {
                    let done = self.on_version(addr, data);
                    (FilterAction::Consumed, done)
                }
                Some(id @ (tag::VERSION_MISMATCH | tag::TYPE_MISMATCH)) => {
                    let peer = peer_version(data).unwrap_or_default();
                    let kind = if id == tag::TYPE_MISMATCH {
                        MismatchKind::Type
                    } else {
                        MismatchKind::Version
                    };
                    log::info!("{addr} rejected our version {} ({kind:?})", self.local);
                    self.transport.borrow_mut().close(addr, false);
                    let done = self.retire(HandshakeOutcome::Mismatch { kind, peer });
                    (FilterAction::Continue(packet), done)
                }
                _ => (FilterAction::Consumed, None),
            },
            _ => (FilterAction::Continue(packet), None),
        }
    }

    fn on_version(&mut self, addr: SocketAddr, data: &[u8]) -> Completion {
        let peer = match peer_version(data) {
            Ok(v) => v,
            Err(e) => {
                log::info!("invalid version info from {addr} ({e}); closing connection");
                let mut transport = self.transport.borrow_mut();
                transport.inject(Packet::message(
                    addr,
                    Message::TypeMismatch(VersionInfo::default()).encode(),
                ));
                transport.close(addr, true);
                drop(transport);
                return self.retire(HandshakeOutcome::Mismatch {
                    kind: MismatchKind::Type,
                    peer: VersionInfo::default(),
                });
            }
        };

        if let Some(kind) = mismatch_kind((self.accept)(&peer)) {
            log::info!("closing connection to {addr} because of mismatching {kind:?} {peer}");
            reject(&self.transport, addr, kind, self.local, peer);
            return self.retire(HandshakeOutcome::Mismatch { kind, peer });
        }

        if let Err(e) = send(&self.transport, Message::VersionAck, addr) {
            log::warn!("could not ack version of {addr}: {e}");
        }
        log::debug!("sent version ack to {addr}");

        let mut transport = self.transport.borrow_mut();
        transport.inject(Packet::new(addr, PacketKind::ConnectionAccepted));
        transport.inject(Packet::message(addr, Message::VersionInfo(peer).encode()));
        drop(transport);
        self.retire(HandshakeOutcome::Accepted(peer))
    }
}

/// Client side of the handshake. It binds to the first connection accepted
/// after it is attached and retires once that exchange ends.
#[derive(Clone)]
pub struct ClientHandshake {
    state: Rc<RefCell<ClientState>>,
    scheduler: Scheduler,
}

impl ClientHandshake {
    pub fn new<A, F>(
        transport: SharedTransport,
        scheduler: Scheduler,
        local: VersionInfo,
        accept: A,
        on_outcome: F,
    ) -> Self
    where
        A: Fn(&VersionInfo) -> VersionVerdict + 'static,
        F: FnOnce(HandshakeOutcome) + 'static,
    {
        Self {
            state: Rc::new(RefCell::new(ClientState {
                transport,
                local,
                accept: Box::new(accept),
                stage: ClientStage::Connecting,
                timer: CallbackGroup::new(),
                on_outcome: Some(Box::new(on_outcome)),
            })),
            scheduler,
        }
    }

    /// Client accepting only servers running exactly `local`.
    pub fn exact<F>(transport: SharedTransport, scheduler: Scheduler, local: VersionInfo, on_outcome: F) -> Self
    where
        F: FnOnce(HandshakeOutcome) + 'static,
    {
        Self::new(transport, scheduler, local, move |peer| local.check(peer), on_outcome)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        match self.state.borrow().stage {
            ClientStage::SentVersion(addr) => Some(addr),
            _ => None,
        }
    }

    fn arm_timer(&self, addr: SocketAddr) {
        let weak = Rc::downgrade(&self.state);
        let mut timer = CallbackGroup::new();
        self.scheduler.add_event(
            "ClientHandshake::auto_close",
            AUTO_CLOSE_TIMEOUT,
            addr,
            &mut timer,
            move |addr: SocketAddr| {
                let Some(state) = weak.upgrade() else {
                    return Ok(());
                };
                let done = {
                    let mut state = state.borrow_mut();
                    if state.stage != ClientStage::SentVersion(addr) {
                        return Ok(());
                    }
                    log::warn!("closing connection to {addr} after version handshake timeout");
                    let mut transport = state.transport.borrow_mut();
                    transport.inject(Packet::message(
                        addr,
                        Message::TypeMismatch(VersionInfo::default()).encode(),
                    ));
                    transport.close(addr, true);
                    drop(transport);
                    state.retire(HandshakeOutcome::Mismatch {
                        kind: MismatchKind::Type,
                        peer: VersionInfo::default(),
                    })
                };
                if let Some((callback, outcome)) = done {
                    callback(outcome);
                }
                Ok(())
            },
        );
        self.state.borrow_mut().timer = timer;
    }
}

impl PacketFilter for ClientHandshake {
    fn name(&self) -> &str {
        "client handshake"
    }

    fn on_packet(&mut self, packet: Packet) -> FilterAction {
        let was_connecting = self.state.borrow().stage == ClientStage::Connecting;
        let (action, done) = self.state.borrow_mut().handle(packet);

        if was_connecting {
            if let Some(addr) = self.peer() {
                self.arm_timer(addr);
            }
        }
        if let Some((callback, outcome)) = done {
            callback(outcome);
        }
        action
    }

    fn is_finished(&self) -> bool {
        self.state.borrow().stage == ClientStage::Retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::memory::MemoryNetwork;
    use crate::net::peer::NetworkPeer;
    use crate::net::transport::{Transport, share};

    const LOCAL: VersionInfo = VersionInfo::new(b'Z', 1, 3);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 1, 0, 1], port))
    }

    fn drain(peer: &mut NetworkPeer) -> Vec<Packet> {
        std::iter::from_fn(|| peer.receive()).collect()
    }

    #[test]
    fn test_server_hides_peer_until_ack() {
        let net = MemoryNetwork::new();
        let sched = Scheduler::new();
        let mut server = NetworkPeer::new(share(net.bind(addr(1), 8)));
        let handshake = ServerHandshake::new(
            Rc::clone(server.transport()),
            sched.clone(),
            accept_exact(LOCAL),
        );
        server.attach(handshake.clone());

        let mut raw = net.bind(addr(2), 8);
        raw.connect(addr(1)).unwrap();

        assert!(drain(&mut server).is_empty());
        assert!(handshake.is_pending(addr(2)));

        raw.send(b"\x80early", SendOptions::RELIABLE_ORDERED, addr(1)).unwrap();
        raw.send(&Message::VersionInfoInternal(LOCAL).encode(), SendOptions::RELIABLE_ORDERED, addr(1))
            .unwrap();
        assert!(drain(&mut server).is_empty());

        raw.send(&Message::VersionAck.encode(), SendOptions::RELIABLE_ORDERED, addr(1))
            .unwrap();
        let seen = drain(&mut server);
        assert_eq!(seen[0], Packet::new(addr(2), PacketKind::NewIncomingConnection));
        assert_eq!(
            Message::decode(seen[1].payload().unwrap()).unwrap(),
            Message::VersionInfo(LOCAL)
        );
        assert_eq!(handshake.pending_count(), 0);
    }

    #[test]
    fn test_disconnect_mid_handshake_clears_session() {
        let net = MemoryNetwork::new();
        let sched = Scheduler::new();
        let mut server = NetworkPeer::new(share(net.bind(addr(1), 8)));
        let handshake = ServerHandshake::new(
            Rc::clone(server.transport()),
            sched.clone(),
            accept_exact(LOCAL),
        );
        server.attach(handshake.clone());

        {
            let mut raw = net.bind(addr(2), 8);
            raw.connect(addr(1)).unwrap();
            drain(&mut server);
            assert_eq!(sched.live_task_count(), 1);
            raw.close(addr(1), true);
        }

        let seen = drain(&mut server);
        assert_eq!(seen, vec![Packet::new(addr(2), PacketKind::Disconnected)]);
        assert_eq!(handshake.pending_count(), 0);
        assert_eq!(sched.live_task_count(), 0);
    }
}
