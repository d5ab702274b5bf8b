//! The rendezvous broker: auth tokens, the game server directory and NAT
//! punch-through relaying.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::{Rc, Weak};

use rand::RngCore;
use rand::rngs::OsRng;

use crate::callback::{CallbackGroup, Console, ConsoleError, Observable};
use crate::net::{
    Message, Packet, PacketKind, SendOptions, ServerInfo, SharedTransport, TransportError,
    VersionInfo,
};
use crate::sched::{Scheduler, TaskId};

use super::config::BrokerSettings;
use super::directory::{Contact, Contacts, Directory, GameServerRecord, ServerKey, TokenCheck};
use super::punch::{PunchRequest, PunchStage, PunchTable};

pub const DEFAULT_POPULATE_COUNT: usize = 4000;

/// Read-only view of a directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub info: ServerInfo,
    pub external: SocketAddr,
}

struct BrokerState {
    this: Weak<RefCell<BrokerState>>,
    transport: SharedTransport,
    scheduler: Scheduler,
    settings: BrokerSettings,
    contacts: Contacts,
    directory: Directory,
    punches: PunchTable,
    disconnect_timers: HashMap<SocketAddr, (TaskId, CallbackGroup)>,
    /// Servers whose player count rose, emitted once the state is released.
    player_gains: Vec<ServerEntry>,
}

/// Feed it every packet the broker's transport produces.
pub struct MasterServer {
    state: Rc<RefCell<BrokerState>>,
    commands: CallbackGroup,
    new_players: Observable<ServerEntry>,
}

impl MasterServer {
    pub fn new(transport: SharedTransport, scheduler: Scheduler, settings: BrokerSettings) -> Self {
        let state = Rc::new_cyclic(|this| {
            RefCell::new(BrokerState {
                this: this.clone(),
                transport,
                scheduler,
                settings,
                contacts: Contacts::default(),
                directory: Directory::default(),
                punches: PunchTable::default(),
                disconnect_timers: HashMap::new(),
                player_gains: Vec::new(),
            })
        });
        Self {
            state,
            commands: CallbackGroup::new(),
            new_players: Observable::new("MasterServer::new_players"),
        }
    }

    pub fn handle_packet(&self, packet: Packet) {
        let gains = {
            let mut state = self.state.borrow_mut();
            state.handle_packet(packet);
            std::mem::take(&mut state.player_gains)
        };
        for entry in gains {
            self.new_players.emit(&entry);
        }
    }

    /// Fires when a heartbeat reports more players than the previous one.
    pub fn new_players(&self) -> &Observable<ServerEntry> {
        &self.new_players
    }

    pub fn register_console(&mut self, console: &Console) -> Result<(), ConsoleError> {
        let state = Rc::downgrade(&self.state);
        console.add_command("listConnections", &mut self.commands, move |_| {
            state
                .upgrade()
                .map_or_else(String::new, |s| s.borrow().list_connections())
        })?;

        let state = Rc::downgrade(&self.state);
        console.add_command("listServers", &mut self.commands, move |_| {
            state
                .upgrade()
                .map_or_else(String::new, |s| s.borrow().list_servers())
        })?;

        let state = Rc::downgrade(&self.state);
        console.add_command("populateList", &mut self.commands, move |args| {
            let count = match args.first().map(|a| a.parse::<usize>()) {
                None => DEFAULT_POPULATE_COUNT,
                Some(Ok(count)) => count,
                Some(Err(_)) => return String::from("usage: populateList [count]"),
            };
            state
                .upgrade()
                .map_or_else(String::new, |s| s.borrow_mut().populate(count))
        })
    }

    pub fn servers(&self) -> Vec<ServerEntry> {
        self.state
            .borrow()
            .directory
            .records()
            .map(|(_, record)| ServerEntry {
                info: record.info.clone(),
                external: record.external,
            })
            .collect()
    }

    pub fn server_count(&self) -> usize {
        self.state.borrow().directory.len()
    }

    pub fn contact_count(&self) -> usize {
        self.state.borrow().contacts.len()
    }

    pub fn punch_requests(&self) -> Vec<PunchRequest> {
        self.state.borrow().punches.iter().copied().collect()
    }

    pub fn connections(&self) -> Vec<SocketAddr> {
        self.state.borrow().transport.borrow().connections()
    }

    pub fn list_servers(&self) -> String {
        self.state.borrow().list_servers()
    }

    pub fn list_connections(&self) -> String {
        self.state.borrow().list_connections()
    }

    /// Inserts `count` synthetic servers through the heartbeat path.
    pub fn populate(&self, count: usize) -> String {
        self.state.borrow_mut().populate(count)
    }
}

impl BrokerState {
    fn handle_packet(&mut self, packet: Packet) {
        let addr = packet.addr;
        match packet.kind {
            PacketKind::Disconnected | PacketKind::ConnectionLost => self.on_disconnect(addr),
            PacketKind::ConnectionAttemptFailed => {
                log::debug!(target: "master::punch", "failed to connect to {addr}");
                self.on_disconnect(addr);
            }
            PacketKind::NoFreeIncomingConnections => {
                log::debug!(target: "master::punch", "no free incoming connections on {addr}");
                self.on_disconnect(addr);
            }
            PacketKind::NewIncomingConnection => {
                log::warn!(target: "master::net", "incoming connection from {addr} - closing right away");
                self.transport.borrow_mut().close(addr, false);
            }
            PacketKind::ConnectionAccepted => self.on_connection_accepted(addr),
            PacketKind::Unconnected(data) => self.on_datagram(addr, &data),
            PacketKind::Message(data) => {
                log::debug!(
                    target: "master::net",
                    "unhandled message {:?} from {addr}",
                    Message::peek_tag(&data)
                );
            }
        }
    }

    fn on_datagram(&mut self, addr: SocketAddr, data: &[u8]) {
        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => {
                log::debug!(target: "master::net", "undecodable datagram from {addr}: {e}");
                return;
            }
        };

        if let Some(token) = message.auth_token() {
            if !self.check_token(addr, token) {
                return;
            }
        }

        match message {
            Message::RequestAuthToken => self.send_auth_token(addr),
            Message::RemoveServer {
                token,
                internal_port,
            } => self.remove_server(addr, token, internal_port),
            Message::Heartbeat { token, info } => self.update_server(addr, info, token),
            Message::RequestServerList { version, .. } => self.send_server_list(addr, version),
            Message::RequestNatPunchthrough { server, .. } => self.on_punch_request(addr, server),
            other => {
                log::debug!(target: "master::net", "unhandled message {} from {addr}", other.tag());
            }
        }
    }

    fn send_datagram(&self, message: &Message, dest: SocketAddr) {
        if let Err(e) = self
            .transport
            .borrow_mut()
            .send_unconnected(&message.encode(), dest)
        {
            log::warn!(target: "master::net", "cannot send to {dest}: {e}");
        }
    }

    fn send_connected(&self, message: &Message, dest: SocketAddr) {
        if let Err(e) = self
            .transport
            .borrow_mut()
            .send(&message.encode(), SendOptions::RELIABLE_ORDERED, dest)
        {
            log::warn!(target: "master::net", "cannot send to {dest}: {e}");
        }
    }

    fn connect(&self, addr: SocketAddr) -> Result<(), TransportError> {
        let result = self.transport.borrow_mut().connect(addr);
        if let Err(e) = &result {
            log::debug!(target: "master::punch", "connect to {addr} failed: {e}");
        }
        result
    }

    fn close(&mut self, addr: SocketAddr) {
        self.transport.borrow_mut().close(addr, true);
        self.disconnect_timers.remove(&addr);
    }

    fn is_connected(&self, addr: SocketAddr) -> bool {
        self.transport.borrow().is_connected(addr)
    }

    // --- auth tokens ---

    fn send_auth_token(&mut self, addr: SocketAddr) {
        let delay = self.settings.clear_contact_delay;
        let token = match self.contacts.get(addr) {
            Some(contact) => {
                if let Err(e) = self.scheduler.reschedule(contact.expiry, delay) {
                    log::warn!(target: "master::token", "cannot refresh contact {addr}: {e}");
                }
                contact.token
            }
            None => {
                let token = OsRng.next_u32();
                let mut timer = CallbackGroup::new();
                let this = self.this.clone();
                let expiry = self.scheduler.add_event(
                    &format!("MasterServer::remove_contact({addr})"),
                    delay,
                    addr,
                    &mut timer,
                    move |addr: SocketAddr| {
                        if let Some(state) = this.upgrade() {
                            state.borrow_mut().contact_expired(addr);
                        }
                        Ok(())
                    },
                );
                self.contacts.insert(
                    addr,
                    Contact {
                        token,
                        created_at: self.scheduler.now(),
                        expiry,
                        timer,
                    },
                );
                token
            }
        };

        self.send_datagram(&Message::AuthToken { token }, addr);
        log::debug!(target: "master::token", "sent auth token {token} to {addr}");
    }

    fn contact_expired(&mut self, addr: SocketAddr) {
        if self.contacts.remove(addr).is_some() {
            log::debug!(target: "master::token", "timeout for contact {addr}");
        }
    }

    fn check_token(&mut self, addr: SocketAddr, token: u32) -> bool {
        match self.contacts.check(addr, token) {
            TokenCheck::Matching => {
                log::debug!(target: "master::token", "got matching auth token {token} from {addr}");
                true
            }
            TokenCheck::Mismatching => {
                log::debug!(target: "master::token", "got mismatching auth token {token} from {addr}");
                false
            }
            TokenCheck::NoContact => {
                log::debug!(
                    target: "master::token",
                    "got auth token {token}, but expecting no contact from {addr}"
                );
                false
            }
        }
    }

    // --- directory ---

    fn update_server(&mut self, external: SocketAddr, info: ServerInfo, token: u32) {
        let key = ServerKey::new(external, info.address.port());
        let delay = self.settings.drop_server_delay;

        if let Some(record) = self.directory.get_mut(&key) {
            log::debug!(target: "master::heartbeat", "server status update: {info}");
            if info.num_players > record.info.num_players {
                self.player_gains.push(ServerEntry {
                    info: info.clone(),
                    external,
                });
            }
            record.info = info;
            record.last_token = token;
            record.external = external;
            if let Some(eviction) = record.eviction {
                if let Err(e) = self.scheduler.reschedule(eviction, delay) {
                    log::warn!(target: "master::heartbeat", "cannot refresh {external}: {e}");
                }
            }
            return;
        }

        let mut timer = CallbackGroup::new();
        let this = self.this.clone();
        let eviction = self.scheduler.add_event(
            &format!("MasterServer::remove_server({})", info.address),
            delay,
            key,
            &mut timer,
            move |key: ServerKey| {
                if let Some(state) = this.upgrade() {
                    state.borrow_mut().evict(key);
                }
                Ok(())
            },
        );

        log::debug!(
            target: "master::heartbeat",
            "new server: {info} (external {external}). Total number of servers: {}",
            self.directory.len() + 1
        );
        self.directory.insert(
            key,
            GameServerRecord {
                info,
                external,
                last_token: token,
                eviction: Some(eviction),
                timer,
            },
        );
    }

    fn evict(&mut self, key: ServerKey) {
        if let Some(record) = self.directory.remove(&key) {
            log::debug!(
                target: "master::heartbeat",
                "removed server {} from server list after timeout",
                record.info
            );
        }
    }

    fn remove_server(&mut self, addr: SocketAddr, token: u32, internal_port: u16) {
        let key = ServerKey::new(addr, internal_port);
        match self.directory.get(&key) {
            Some(record) if record.last_token == token => {
                log::debug!(target: "master::heartbeat", "removing {} on request", record.info);
                self.directory.remove(&key);
            }
            _ => log::debug!(
                target: "master::heartbeat",
                "remove request from {addr}, but either token is incorrect or server is not listed"
            ),
        }
    }

    fn send_server_list(&self, addr: SocketAddr, version: VersionInfo) {
        log::debug!(target: "master::list", "{addr} requested a server list and has version {version}");

        let listing = self.directory.listing_for(addr, version);
        for info in listing.servers {
            log::trace!(target: "master::list", "reporting {info}");
            self.send_datagram(&Message::ServerList { info }, addr);
        }

        if listing.newer_version_available {
            log::info!(target: "master::list", "notifying {addr} of newer version");
            self.send_datagram(
                &Message::CustomMessage {
                    text: self.settings.newer_version_notice.clone(),
                },
                addr,
            );
        }
    }

    fn populate(&mut self, count: usize) -> String {
        for i in 0..count {
            let address = SocketAddr::from((Ipv4Addr::from(i as u32), i as u16));
            let info = ServerInfo {
                name: format!("Testserver {i}"),
                address,
                ..ServerInfo::default()
            };
            self.update_server(address, info, 0);
        }
        format!("added {count} servers")
    }

    fn list_servers(&self) -> String {
        if self.directory.is_empty() {
            return String::from("No servers listed");
        }
        let mut out = String::new();
        for (_, record) in self.directory.records() {
            let _ = writeln!(out, "{} (external {})", record.info, record.external);
        }
        out
    }

    fn list_connections(&self) -> String {
        let mut out = String::from("requested NAT punchthroughs:\n");
        for request in self.punches.iter() {
            let _ = writeln!(out, "{request}");
        }
        out.push_str("connections:\n");
        for addr in self.transport.borrow().connections() {
            let _ = writeln!(out, "{addr}");
        }
        out
    }

    // --- NAT punch-through ---

    fn on_punch_request(&mut self, client: SocketAddr, server: SocketAddr) {
        log::debug!(target: "master::punch", "got nat punchthrough request for {server} from {client}");

        if self.punches.contains(server, client) {
            log::debug!(target: "master::punch", "already handling it");
            return;
        }
        if self.directory.find_external(server).is_none() {
            log::debug!(target: "master::punch", "server {server} is not known to us");
            let _ = self.connect(client);
            return;
        }
        if self.punches.len() >= self.settings.max_punch_requests {
            log::warn!(target: "master::punch", "too many punch-through requests, refusing {client}");
            let _ = self.connect(client);
            return;
        }

        if self.is_connected(server) {
            match self.connect(client) {
                Ok(()) => {}
                Err(TransportError::AlreadyConnected(_)) => {
                    self.complete(server, client);
                    return;
                }
                Err(_) => return,
            }
            if let Some((task, _)) = self.disconnect_timers.get(&server) {
                if let Err(e) = self
                    .scheduler
                    .reschedule(*task, self.settings.max_connection_duration)
                {
                    log::warn!(target: "master::punch", "cannot extend connection to {server}: {e}");
                }
            }
            log::debug!(target: "master::punch", "re-using existing connection to {server}");
            self.punches.insert(server, client, PunchStage::ServerReady);
        } else {
            match self.connect(server) {
                Ok(()) => {}
                Err(TransportError::AlreadyConnected(_)) => {
                    log::debug!(target: "master::punch", "connection to {server} already pending");
                }
                Err(_) => {
                    let _ = self.connect(client);
                    return;
                }
            }
            self.punches.insert(server, client, PunchStage::Requested);
        }
    }

    fn on_connection_accepted(&mut self, addr: SocketAddr) {
        self.arm_disconnect(addr);

        let mut handled = false;
        for request in self.punches.by_server(addr) {
            handled = true;
            if request.stage != PunchStage::Requested {
                continue;
            }
            log::debug!(
                target: "master::punch",
                "server {addr} connected, connecting to client {}",
                request.client
            );
            self.punches
                .set_stage(addr, request.client, PunchStage::ServerReady);
            match self.connect(request.client) {
                Ok(()) => {}
                Err(TransportError::AlreadyConnected(_)) => self.complete(addr, request.client),
                Err(_) => {
                    self.punches.remove(addr, request.client);
                    self.disconnect_if_idle(addr);
                }
            }
        }

        for request in self.punches.by_client(addr) {
            handled = true;
            if request.stage == PunchStage::ServerReady {
                self.complete(request.server, addr);
            }
        }

        if !handled {
            log::debug!(
                target: "master::punch",
                "connected to {addr} but don't know what to do with connection, disconnecting"
            );
            self.close(addr);
        }
    }

    /// Both legs are up: introduce the parties to each other.
    fn complete(&mut self, server: SocketAddr, client: SocketAddr) {
        log::debug!(target: "master::punch", "relay to {server} and {client} is up");
        self.send_connected(&Message::NatPunchReady { peer: client }, server);
        self.send_connected(&Message::NatPunchReady { peer: server }, client);
        self.punches.remove(server, client);
    }

    fn on_disconnect(&mut self, addr: SocketAddr) {
        log::debug!(target: "master::punch", "connection to {addr} closed");
        self.disconnect_timers.remove(&addr);

        let failed = self.punches.take_server(addr);
        for request in &failed {
            if self.is_connected(request.client) {
                self.close(request.client);
            } else {
                // The client sees connect-then-disconnect as failure.
                let _ = self.connect(request.client);
            }
        }
        if !failed.is_empty() {
            if let Some(key) = self.directory.find_external(addr) {
                self.directory.remove(&key);
                log::debug!(
                    target: "master::punch",
                    "removing {addr} from server list after unsuccessful connection attempt"
                );
            }
        }

        for request in self.punches.take_client(addr) {
            self.disconnect_if_idle(request.server);
        }
    }

    fn disconnect_if_idle(&mut self, server: SocketAddr) {
        if !self.punches.has_server(server) {
            self.close(server);
        }
    }

    fn arm_disconnect(&mut self, addr: SocketAddr) {
        let mut timer = CallbackGroup::new();
        let this = self.this.clone();
        let task = self.scheduler.add_event(
            &format!("MasterServer::close_connection({addr})"),
            self.settings.max_connection_duration,
            addr,
            &mut timer,
            move |addr: SocketAddr| {
                if let Some(state) = this.upgrade() {
                    state.borrow_mut().connection_expired(addr);
                }
                Ok(())
            },
        );
        self.disconnect_timers.insert(addr, (task, timer));
    }

    fn connection_expired(&mut self, addr: SocketAddr) {
        self.disconnect_timers.remove(&addr);
        if !self.is_connected(addr) {
            return;
        }
        log::debug!(target: "master::punch", "timeout for connection to {addr}");
        self.transport.borrow_mut().close(addr, true);
        self.on_disconnect(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{MemoryNetwork, NetworkPeer, Transport, share};
    use std::time::Duration;

    fn pump(peer: &mut NetworkPeer, master: &MasterServer) {
        while let Some(packet) = peer.receive() {
            master.handle_packet(packet);
        }
    }

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([203, 0, 113, last], port))
    }

    #[test]
    fn test_populate_and_list() {
        let net = MemoryNetwork::new();
        let sched = Scheduler::new();
        let mut master = MasterServer::new(
            share(net.bind(addr(1, 27016), 16)),
            sched.clone(),
            BrokerSettings::default(),
        );
        let console = Console::new();
        master.register_console(&console).unwrap();

        assert_eq!(console.execute("listServers").unwrap(), "No servers listed");
        assert_eq!(console.execute("populateList 3").unwrap(), "added 3 servers");
        assert_eq!(master.server_count(), 3);
        assert!(console.execute("listServers").unwrap().contains("Testserver 2"));
        assert!(console.execute("populateList x").unwrap().starts_with("usage"));

        sched.tick(Duration::from_secs(31));
        assert_eq!(master.server_count(), 0);
    }

    #[test]
    fn test_incoming_connections_are_closed() {
        let net = MemoryNetwork::new();
        let sched = Scheduler::new();
        let mut peer = NetworkPeer::new(share(net.bind(addr(1, 27016), 16)));
        let master = MasterServer::new(Rc::clone(peer.transport()), sched, BrokerSettings::default());

        let mut intruder = net.bind(addr(9, 5000), 4);
        intruder.connect(addr(1, 27016)).unwrap();
        pump(&mut peer, &master);
        assert!(master.connections().is_empty());
        assert!(!intruder.is_connected(addr(1, 27016)));
    }

    #[test]
    fn test_token_reissued_to_same_contact() {
        let net = MemoryNetwork::new();
        let sched = Scheduler::new();
        let mut peer = NetworkPeer::new(share(net.bind(addr(1, 27016), 16)));
        let master = MasterServer::new(
            Rc::clone(peer.transport()),
            sched.clone(),
            BrokerSettings::default(),
        );
        let mut caller = net.bind(addr(2, 5000), 4);

        let mut tokens = Vec::new();
        for _ in 0..2 {
            caller
                .send_unconnected(&Message::RequestAuthToken.encode(), addr(1, 27016))
                .unwrap();
            pump(&mut peer, &master);
            let reply = caller.poll().unwrap();
            match Message::decode(reply.payload().unwrap()).unwrap() {
                Message::AuthToken { token } => tokens.push(token),
                other => panic!("unexpected {other:?}"),
            }
            sched.tick(Duration::from_secs(4));
        }

        assert_eq!(tokens[0], tokens[1]);
        assert_eq!(master.contact_count(), 1);
        sched.tick(Duration::from_secs(2));
        assert_eq!(master.contact_count(), 0);
    }

    #[test]
    fn test_duplicate_punch_request_tracked_once() {
        let net = MemoryNetwork::new();
        let sched = Scheduler::new();
        let settings = BrokerSettings {
            max_punch_requests: 2,
            ..BrokerSettings::default()
        };
        let master = MasterServer::new(share(net.bind(addr(1, 27016), 16)), sched, settings);
        let _server = net.bind(addr(3, 27015), 4);
        let info = ServerInfo {
            address: addr(3, 27015),
            ..ServerInfo::default()
        };

        let mut state = master.state.borrow_mut();
        state.update_server(addr(3, 27015), info, 7);
        state.on_punch_request(addr(2, 5000), addr(3, 27015));
        state.on_punch_request(addr(2, 5000), addr(3, 27015));
        assert_eq!(state.punches.len(), 1);

        state.on_punch_request(addr(4, 5000), addr(3, 27015));
        state.on_punch_request(addr(5, 5000), addr(3, 27015));
        let clients: Vec<SocketAddr> = state.punches.iter().map(|r| r.client).collect();
        assert_eq!(clients.len(), 2);
        assert!(!clients.contains(&addr(5, 5000)));
        drop(state);

        // The second client rides on the already open server leg.
        let stages: Vec<PunchStage> = master.punch_requests().iter().map(|r| r.stage).collect();
        assert_eq!(stages, vec![PunchStage::Requested, PunchStage::ServerReady]);
    }
}
