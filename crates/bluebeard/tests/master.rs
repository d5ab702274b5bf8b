use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bluebeard::master::{BrokerSettings, MasterServer, Registrator};
use bluebeard::net::{
    MemoryNetwork, MemoryTransport, Message, NetworkPeer, Packet, PacketKind, ServerHandshake,
    ServerInfo, Transport, VersionInfo, accept_exact, share,
};
use bluebeard::{CallbackGroup, Console, Scheduler};

const V105: VersionInfo = VersionInfo::new(b'z', 1, 5);

fn master_addr() -> SocketAddr {
    "198.51.100.1:27016".parse().unwrap()
}

fn game_addr() -> SocketAddr {
    "203.0.113.10:27015".parse().unwrap()
}

fn client_addr() -> SocketAddr {
    "192.0.2.50:6000".parse().unwrap()
}

struct Rig {
    net: MemoryNetwork,
    sched: Scheduler,
    peer: NetworkPeer,
    broker: MasterServer,
}

impl Rig {
    fn new() -> Self {
        let net = MemoryNetwork::new();
        let sched = Scheduler::new();
        let peer = NetworkPeer::new(share(net.bind(master_addr(), 64)));
        let broker = MasterServer::new(
            Rc::clone(peer.transport()),
            sched.clone(),
            BrokerSettings::default(),
        );
        Self {
            net,
            sched,
            peer,
            broker,
        }
    }

    fn pump(&mut self) {
        while let Some(packet) = self.peer.receive() {
            self.broker.handle_packet(packet);
        }
    }

    fn token(&mut self, caller: &mut MemoryTransport) -> u32 {
        caller
            .send_unconnected(&Message::RequestAuthToken.encode(), master_addr())
            .unwrap();
        self.pump();
        messages(caller)
            .into_iter()
            .find_map(|m| match m {
                Message::AuthToken { token } => Some(token),
                _ => None,
            })
            .expect("auth token")
    }

    fn send(&mut self, caller: &mut MemoryTransport, message: Message) {
        caller
            .send_unconnected(&message.encode(), master_addr())
            .unwrap();
        self.pump();
    }

    fn heartbeat(&mut self, server: &mut MemoryTransport, info: ServerInfo) -> u32 {
        let token = self.token(server);
        self.send(server, Message::Heartbeat { token, info });
        token
    }

    fn list(&mut self, client: &mut MemoryTransport, version: VersionInfo) -> Vec<Message> {
        let token = self.token(client);
        self.send(client, Message::RequestServerList { token, version });
        messages(client)
    }
}

fn packets(transport: &mut MemoryTransport) -> Vec<Packet> {
    std::iter::from_fn(|| transport.poll()).collect()
}

fn messages(transport: &mut MemoryTransport) -> Vec<Message> {
    packets(transport)
        .iter()
        .filter_map(|p| p.payload())
        .filter_map(|data| Message::decode(data).ok())
        .collect()
}

fn info(name: &str, address: SocketAddr, version: VersionInfo) -> ServerInfo {
    ServerInfo {
        name: name.into(),
        level_name: "dm_arena".into(),
        max_players: 16,
        version,
        address,
        ..ServerInfo::default()
    }
}

fn listed_names(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::ServerList { info } => Some(info.name.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_heartbeat_lists_until_timeout() {
    let mut rig = Rig::new();
    let mut server = rig.net.bind(game_addr(), 8);
    let mut client = rig.net.bind(client_addr(), 8);

    let lan: SocketAddr = "192.168.1.20:27015".parse().unwrap();
    rig.heartbeat(&mut server, info("alpha", lan, V105));
    assert_eq!(rig.broker.server_count(), 1);

    let listed = rig.list(&mut client, V105);
    let Some(Message::ServerList { info }) = listed.first() else {
        panic!("no server list entry: {listed:?}");
    };
    assert_eq!(info.name, "alpha");
    assert_eq!(info.address, game_addr());
    assert_eq!(info.internal_port, 27015);

    rig.sched.tick(Duration::from_secs(29));
    assert_eq!(listed_names(&rig.list(&mut client, V105)), vec!["alpha"]);

    rig.sched.tick(Duration::from_secs(1));
    assert!(listed_names(&rig.list(&mut client, V105)).is_empty());
    assert_eq!(rig.broker.server_count(), 0);
}

#[test]
fn test_heartbeat_refreshes_eviction() {
    let mut rig = Rig::new();
    let mut server = rig.net.bind(game_addr(), 8);

    rig.heartbeat(&mut server, info("alpha", game_addr(), V105));
    rig.sched.tick(Duration::from_secs(20));
    rig.heartbeat(&mut server, info("alpha renamed", game_addr(), V105));
    rig.sched.tick(Duration::from_secs(20));

    let servers = rig.broker.servers();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].info.name, "alpha renamed");
}

#[test]
fn test_same_ip_different_ports_are_distinct() {
    let mut rig = Rig::new();
    let mut first = rig.net.bind("203.0.113.10:27015".parse().unwrap(), 8);
    let mut second = rig.net.bind("203.0.113.10:27025".parse().unwrap(), 8);

    rig.heartbeat(&mut first, info("one", "10.0.0.2:27015".parse().unwrap(), V105));
    rig.heartbeat(&mut second, info("two", "10.0.0.3:27025".parse().unwrap(), V105));
    assert_eq!(rig.broker.server_count(), 2);

    rig.heartbeat(&mut second, info("two again", "10.0.0.3:27025".parse().unwrap(), V105));
    assert_eq!(rig.broker.server_count(), 2);
}

#[test]
fn test_remove_requires_last_token() {
    let mut rig = Rig::new();
    let mut server = rig.net.bind(game_addr(), 8);
    let token = rig.heartbeat(&mut server, info("alpha", game_addr(), V105));

    rig.send(
        &mut server,
        Message::RemoveServer {
            token: token.wrapping_add(1),
            internal_port: 27015,
        },
    );
    assert_eq!(rig.broker.server_count(), 1);

    rig.send(
        &mut server,
        Message::RemoveServer {
            token,
            internal_port: 27015,
        },
    );
    assert_eq!(rig.broker.server_count(), 0);
}

#[test]
fn test_requests_without_valid_token_dropped() {
    let mut rig = Rig::new();
    let mut server = rig.net.bind(game_addr(), 8);

    rig.send(
        &mut server,
        Message::Heartbeat {
            token: 1,
            info: info("sneaky", game_addr(), V105),
        },
    );
    assert_eq!(rig.broker.server_count(), 0);

    let token = rig.token(&mut server);
    rig.send(
        &mut server,
        Message::Heartbeat {
            token: token.wrapping_add(1),
            info: info("sneaky", game_addr(), V105),
        },
    );
    // The failed check used up the contact.
    rig.send(
        &mut server,
        Message::Heartbeat {
            token,
            info: info("sneaky", game_addr(), V105),
        },
    );
    assert_eq!(rig.broker.server_count(), 0);
    assert_eq!(rig.broker.contact_count(), 0);
}

#[test]
fn test_unused_token_expires() {
    let mut rig = Rig::new();
    let mut server = rig.net.bind(game_addr(), 8);

    let token = rig.token(&mut server);
    rig.sched.tick(Duration::from_secs(5));
    assert_eq!(rig.broker.contact_count(), 0);

    rig.send(
        &mut server,
        Message::Heartbeat {
            token,
            info: info("late", game_addr(), V105),
        },
    );
    assert_eq!(rig.broker.server_count(), 0);
}

#[test]
fn test_newer_servers_hidden_behind_notice() {
    let mut rig = Rig::new();
    let mut old = rig.net.bind("203.0.113.10:27015".parse().unwrap(), 8);
    let mut new = rig.net.bind("203.0.113.11:27015".parse().unwrap(), 8);
    let mut other = rig.net.bind("203.0.113.12:27015".parse().unwrap(), 8);
    let mut client = rig.net.bind(client_addr(), 8);

    rig.heartbeat(&mut old, info("old", "203.0.113.10:27015".parse().unwrap(), V105));
    rig.heartbeat(
        &mut new,
        info("new", "203.0.113.11:27015".parse().unwrap(), VersionInfo::new(b'Z', 1, 6)),
    );
    rig.heartbeat(
        &mut other,
        info("other", "203.0.113.12:27015".parse().unwrap(), VersionInfo::new(b't', 9, 0)),
    );

    let listed = rig.list(&mut client, V105);
    assert_eq!(listed_names(&listed), vec!["old"]);
    assert_eq!(
        listed
            .iter()
            .filter(|m| matches!(m, Message::CustomMessage { .. }))
            .count(),
        1
    );
}

#[test]
fn test_punch_through_introduces_both_parties() {
    let mut rig = Rig::new();

    let mut game = NetworkPeer::new(share(rig.net.bind(game_addr(), 8)));
    let registrator = Registrator::announce(
        Rc::clone(game.transport()),
        &rig.sched,
        master_addr(),
        info("alpha", game_addr(), V105),
        Duration::from_secs(10),
    )
    .unwrap();
    game.attach(registrator.clone());
    let handshake = ServerHandshake::new(
        Rc::clone(game.transport()),
        rig.sched.clone(),
        accept_exact(V105),
    );
    game.attach(handshake.clone());

    rig.pump();
    assert!(game.receive().is_none());
    rig.pump();
    assert_eq!(rig.broker.server_count(), 1);
    assert!(registrator.last_token().is_some());

    let mut client = rig.net.bind(client_addr(), 8);
    let token = rig.token(&mut client);
    rig.send(
        &mut client,
        Message::RequestNatPunchthrough {
            token,
            server: game_addr(),
        },
    );
    assert!(rig.broker.punch_requests().is_empty());

    // The relay connection is swallowed; the game server then dials out.
    assert_eq!(
        game.receive(),
        Some(Packet::new(client_addr(), PacketKind::ConnectionAccepted))
    );
    assert!(game.receive().is_none());
    assert_eq!(handshake.pending_count(), 0);
    assert!(game.transport().borrow().is_connected(client_addr()));

    let seen = packets(&mut client);
    let ready: Vec<Message> = seen
        .iter()
        .filter(|p| p.addr == master_addr())
        .filter_map(|p| p.payload())
        .filter_map(|data| Message::decode(data).ok())
        .collect();
    assert_eq!(ready, vec![Message::NatPunchReady { peer: game_addr() }]);
    assert!(seen.contains(&Packet::new(game_addr(), PacketKind::NewIncomingConnection)));

    rig.sched.tick(Duration::from_secs(20));
    assert!(rig.broker.connections().is_empty());
    assert!(game.receive().is_none());
    assert_eq!(rig.broker.server_count(), 1);
}

#[test]
fn test_punch_to_unknown_server_fails_cleanly() {
    let mut rig = Rig::new();
    let mut client = rig.net.bind(client_addr(), 8);

    let token = rig.token(&mut client);
    rig.send(
        &mut client,
        Message::RequestNatPunchthrough {
            token,
            server: game_addr(),
        },
    );

    assert_eq!(
        packets(&mut client),
        vec![
            Packet::new(master_addr(), PacketKind::NewIncomingConnection),
            Packet::new(master_addr(), PacketKind::Disconnected),
        ]
    );
    assert!(rig.broker.connections().is_empty());
    assert!(rig.broker.punch_requests().is_empty());
}

#[test]
fn test_unreachable_server_dropped_from_directory() {
    let mut rig = Rig::new();
    {
        let mut server = rig.net.bind(game_addr(), 8);
        rig.heartbeat(&mut server, info("alpha", game_addr(), V105));
    }
    assert_eq!(rig.broker.server_count(), 1);

    let mut client = rig.net.bind(client_addr(), 8);
    let token = rig.token(&mut client);
    rig.send(
        &mut client,
        Message::RequestNatPunchthrough {
            token,
            server: game_addr(),
        },
    );

    assert_eq!(rig.broker.server_count(), 0);
    let kinds: Vec<PacketKind> = packets(&mut client).into_iter().map(|p| p.kind).collect();
    assert_eq!(
        kinds,
        vec![PacketKind::NewIncomingConnection, PacketKind::Disconnected]
    );
}

#[test]
fn test_console_commands_registered() {
    let mut rig = Rig::new();
    let console = Console::new();
    rig.broker.register_console(&console).unwrap();

    assert_eq!(
        console.command_names(),
        vec!["listConnections", "listServers", "populateList"]
    );
    assert!(
        console
            .execute("listConnections")
            .unwrap()
            .starts_with("requested NAT punchthroughs:")
    );
    console.execute("populateList 10").unwrap();
    assert_eq!(rig.broker.server_count(), 10);
}

#[test]
fn test_player_gain_announced() {
    let mut rig = Rig::new();
    let mut server = rig.net.bind(game_addr(), 8);

    let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let mut group = CallbackGroup::new();
    rig.broker.new_players().subscribe(&mut group, move |entry| {
        sink.borrow_mut().push((entry.info.num_players, entry.external));
    });

    for players in [1, 3, 2, 2] {
        let info = ServerInfo {
            num_players: players,
            ..info("alpha", game_addr(), V105)
        };
        rig.heartbeat(&mut server, info);
    }
    assert_eq!(*seen.borrow(), vec![(3, game_addr())]);

    drop(group);
    rig.heartbeat(
        &mut server,
        ServerInfo {
            num_players: 5,
            ..info("alpha", game_addr(), V105)
        },
    );
    assert_eq!(seen.borrow().len(), 1);
}
