use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bluebeard::Scheduler;
use bluebeard::net::{
    AUTO_CLOSE_TIMEOUT, ClientHandshake, HandshakeOutcome, MemoryNetwork, Message, MismatchKind,
    NetworkPeer, Packet, PacketKind, SendOptions, ServerHandshake, Transport, VersionInfo,
    accept_exact, share,
};

const V105: VersionInfo = VersionInfo::new(b'Z', 1, 5);
const V106: VersionInfo = VersionInfo::new(b'Z', 1, 6);

fn addr(host: u8) -> SocketAddr {
    SocketAddr::from(([10, 20, 0, host], 27015))
}

fn drain(peer: &mut NetworkPeer) -> Vec<Packet> {
    std::iter::from_fn(|| peer.receive()).collect()
}

fn version_message(version: VersionInfo) -> Message {
    Message::VersionInfo(version)
}

fn decoded(packet: &Packet) -> Message {
    Message::decode(packet.payload().expect("payload")).expect("decodable")
}

struct Server {
    peer: NetworkPeer,
    handshake: ServerHandshake,
}

fn server(net: &MemoryNetwork, sched: &Scheduler, version: VersionInfo) -> Server {
    let mut peer = NetworkPeer::new(share(net.bind(addr(1), 8)));
    let handshake = ServerHandshake::new(
        Rc::clone(peer.transport()),
        sched.clone(),
        accept_exact(version),
    );
    peer.attach(handshake.clone());
    Server { peer, handshake }
}

type Outcome = Rc<RefCell<Option<HandshakeOutcome>>>;

fn client(net: &MemoryNetwork, sched: &Scheduler, version: VersionInfo) -> (NetworkPeer, Outcome) {
    let mut peer = NetworkPeer::new(share(net.bind(addr(2), 8)));
    let outcome = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&outcome);
    peer.attach(ClientHandshake::exact(
        Rc::clone(peer.transport()),
        sched.clone(),
        version,
        move |o| *sink.borrow_mut() = Some(o),
    ));
    (peer, outcome)
}

#[test]
fn test_matching_versions_complete_on_both_sides() {
    let net = MemoryNetwork::new();
    let sched = Scheduler::new();
    let mut server = server(&net, &sched, V105);
    let (mut client, outcome) = client(&net, &sched, V105);

    client.connect(addr(1)).unwrap();

    let mut client_seen = Vec::new();
    let mut server_seen = Vec::new();
    for _ in 0..4 {
        client_seen.extend(drain(&mut client));
        server_seen.extend(drain(&mut server.peer));
    }

    assert_eq!(client_seen.len(), 2);
    assert_eq!(client_seen[0], Packet::new(addr(1), PacketKind::ConnectionAccepted));
    assert_eq!(decoded(&client_seen[1]), version_message(V105));

    assert_eq!(server_seen.len(), 2);
    assert_eq!(server_seen[0], Packet::new(addr(2), PacketKind::NewIncomingConnection));
    assert_eq!(decoded(&server_seen[1]), version_message(V105));

    assert_eq!(*outcome.borrow(), Some(HandshakeOutcome::Accepted(V105)));
    assert!(client.filter_names().is_empty());
    assert_eq!(server.handshake.pending_count(), 0);
    assert_eq!(sched.live_task_count(), 0);

    // Application traffic flows freely afterwards.
    client
        .send_message(&Message::CustomMessage { text: "hello".into() }, SendOptions::RELIABLE_ORDERED, addr(1))
        .unwrap();
    let seen = drain(&mut server.peer);
    assert_eq!(decoded(&seen[0]), Message::CustomMessage { text: "hello".into() });
}

#[test]
fn test_version_mismatch_ends_client_session() {
    let net = MemoryNetwork::new();
    let sched = Scheduler::new();
    let mut server = server(&net, &sched, V106);
    let (mut client, outcome) = client(&net, &sched, V105);

    client.connect(addr(1)).unwrap();

    let mut client_seen = Vec::new();
    let mut server_seen = Vec::new();
    for _ in 0..4 {
        client_seen.extend(drain(&mut client));
        server_seen.extend(drain(&mut server.peer));
    }

    assert_eq!(
        *outcome.borrow(),
        Some(HandshakeOutcome::Mismatch {
            kind: MismatchKind::Version,
            peer: V106
        })
    );
    // The notice itself, then nothing more from that server.
    assert_eq!(client_seen.len(), 1);
    assert_eq!(decoded(&client_seen[0]), Message::VersionMismatch(V106));
    assert!(!client.transport().borrow().is_connected(addr(1)));
    assert!(
        server
            .peer
            .send_message(&Message::VersionAck, SendOptions::RELIABLE_ORDERED, addr(2))
            .is_err()
    );
    assert!(drain(&mut client).is_empty());

    assert_eq!(server_seen.len(), 1);
    assert_eq!(decoded(&server_seen[0]), Message::VersionMismatch(V105));
    assert_eq!(server.handshake.pending_count(), 0);
}

#[test]
fn test_type_mismatch_reported_as_type() {
    let net = MemoryNetwork::new();
    let sched = Scheduler::new();
    let mut server = server(&net, &sched, VersionInfo::new(b'T', 1, 5));
    let (mut client, outcome) = client(&net, &sched, V105);

    client.connect(addr(1)).unwrap();
    for _ in 0..4 {
        drain(&mut client);
        drain(&mut server.peer);
    }

    assert!(matches!(
        *outcome.borrow(),
        Some(HandshakeOutcome::Mismatch {
            kind: MismatchKind::Type,
            ..
        })
    ));
}

#[test]
fn test_silent_peer_closed_at_timeout() {
    let net = MemoryNetwork::new();
    let sched = Scheduler::new();
    let mut server = server(&net, &sched, V105);

    let mut raw = net.bind(addr(3), 4);
    raw.connect(addr(1)).unwrap();
    assert!(drain(&mut server.peer).is_empty());
    assert!(server.handshake.is_pending(addr(3)));

    sched.tick(AUTO_CLOSE_TIMEOUT - Duration::from_millis(1));
    assert!(server.handshake.is_pending(addr(3)));
    assert!(raw.is_connected(addr(1)));

    sched.tick(Duration::from_millis(1));
    assert!(!server.handshake.is_pending(addr(3)));
    assert!(!raw.is_connected(addr(1)));

    let seen = drain(&mut server.peer);
    assert_eq!(seen.len(), 1);
    assert_eq!(decoded(&seen[0]), Message::TypeMismatch(VersionInfo::default()));
}

#[test]
fn test_client_gives_up_on_silent_server() {
    let net = MemoryNetwork::new();
    let sched = Scheduler::new();
    let mut raw = net.bind(addr(1), 4);
    let (mut client, outcome) = client(&net, &sched, V105);

    client.connect(addr(1)).unwrap();
    assert!(drain(&mut client).is_empty());
    raw.poll();
    assert_eq!(
        raw.poll().map(|p| decoded(&p)),
        Some(Message::VersionInfoInternal(V105))
    );

    sched.tick(AUTO_CLOSE_TIMEOUT);
    assert_eq!(
        *outcome.borrow(),
        Some(HandshakeOutcome::Mismatch {
            kind: MismatchKind::Type,
            peer: VersionInfo::default()
        })
    );
    let seen = drain(&mut client);
    assert_eq!(decoded(&seen[0]), Message::TypeMismatch(VersionInfo::default()));
    assert_eq!(raw.poll(), Some(Packet::new(addr(2), PacketKind::Disconnected)));
}

#[test]
fn test_failed_connect_reported_as_lost() {
    let net = MemoryNetwork::new();
    let sched = Scheduler::new();
    let (mut client, outcome) = client(&net, &sched, V105);

    client.connect(addr(9)).unwrap();
    let seen = drain(&mut client);

    assert_eq!(seen, vec![Packet::new(addr(9), PacketKind::ConnectionAttemptFailed)]);
    assert_eq!(*outcome.borrow(), Some(HandshakeOutcome::ConnectionLost));
    assert!(client.filter_names().is_empty());
}
