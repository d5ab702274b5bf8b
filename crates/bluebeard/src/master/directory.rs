use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::callback::CallbackGroup;
use crate::net::{ServerInfo, VersionInfo};
use crate::sched::TaskId;

/// Game servers are identified by external IP plus the port they listen on
/// locally, so several servers behind one NAT stay apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKey {
    pub ip: IpAddr,
    pub internal_port: u16,
}

impl ServerKey {
    pub fn new(external: SocketAddr, internal_port: u16) -> Self {
        Self {
            ip: external.ip(),
            internal_port,
        }
    }
}

pub struct GameServerRecord {
    pub info: ServerInfo,
    pub external: SocketAddr,
    pub last_token: u32,
    pub(crate) eviction: Option<TaskId>,
    pub(crate) timer: CallbackGroup,
}

/// A caller holding an unused auth token.
pub struct Contact {
    pub token: u32,
    pub created_at: Duration,
    pub(crate) expiry: TaskId,
    pub(crate) timer: CallbackGroup,
}

#[derive(Default)]
pub struct Contacts {
    entries: HashMap<SocketAddr, Contact>,
}

impl Contacts {
    pub fn get(&self, addr: SocketAddr) -> Option<&Contact> {
        self.entries.get(&addr)
    }

    pub fn insert(&mut self, addr: SocketAddr, contact: Contact) {
        self.entries.insert(addr, contact);
    }

    pub fn remove(&mut self, addr: SocketAddr) -> Option<Contact> {
        self.entries.remove(&addr)
    }

    /// Consumes the contact of `addr`; true only if its token was `token`.
    pub fn check(&mut self, addr: SocketAddr, token: u32) -> TokenCheck {
        match self.entries.remove(&addr) {
            None => TokenCheck::NoContact,
            Some(contact) if contact.token == token => TokenCheck::Matching,
            Some(_) => TokenCheck::Mismatching,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCheck {
    Matching,
    Mismatching,
    NoContact,
}

/// Entries a client gets for one server list request.
#[derive(Debug, Default, PartialEq)]
pub struct Listing {
    pub servers: Vec<ServerInfo>,
    pub newer_version_available: bool,
}

#[derive(Default)]
pub struct Directory {
    records: BTreeMap<ServerKey, GameServerRecord>,
}

impl Directory {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &ServerKey) -> Option<&GameServerRecord> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &ServerKey) -> Option<&mut GameServerRecord> {
        self.records.get_mut(key)
    }

    pub fn insert(&mut self, key: ServerKey, record: GameServerRecord) {
        self.records.insert(key, record);
    }

    pub fn remove(&mut self, key: &ServerKey) -> Option<GameServerRecord> {
        self.records.remove(key)
    }

    pub fn records(&self) -> impl Iterator<Item = (&ServerKey, &GameServerRecord)> {
        self.records.iter()
    }

    pub fn find_external(&self, external: SocketAddr) -> Option<ServerKey> {
        self.records
            .iter()
            .find(|(_, record)| record.external == external)
            .map(|(key, _)| *key)
    }

    /// What a client at `client` running `version` may see.
    pub fn listing_for(&self, client: SocketAddr, version: VersionInfo) -> Listing {
        let mut listing = Listing::default();

        for record in self.records.values() {
            let server_version = record.info.version;
            if !server_version.same_kind(&version) {
                continue;
            }
            if server_version.is_newer_than(&version) {
                listing.newer_version_available = true;
                continue;
            }

            let mut info = record.info.clone();
            if client.ip() != record.external.ip() {
                // Clients first try the advertised port directly, then the
                // external one for punch-through.
                info.internal_port = record.info.address.port();
                if !record.external.ip().is_loopback() {
                    info.address = record.external;
                }
            }
            listing.servers.push(info);
        }

        listing
    }
}
