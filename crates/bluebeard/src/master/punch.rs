use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchStage {
    /// Waiting for the broker's connection to the server.
    Requested,
    /// Server leg is up, waiting for the connection to the client.
    ServerReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchRequest {
    pub server: SocketAddr,
    pub client: SocketAddr,
    pub stage: PunchStage,
}

impl fmt::Display for PunchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} ({:?})", self.server, self.client, self.stage)
    }
}

/// Outstanding punch-through requests, at most one per (server, client).
#[derive(Debug, Default)]
pub struct PunchTable {
    requests: Vec<PunchRequest>,
}

impl PunchTable {
    pub fn contains(&self, server: SocketAddr, client: SocketAddr) -> bool {
        self.requests
            .iter()
            .any(|r| r.server == server && r.client == client)
    }

    /// False if the pair is already pending.
    pub fn insert(&mut self, server: SocketAddr, client: SocketAddr, stage: PunchStage) -> bool {
        if self.contains(server, client) {
            return false;
        }
        self.requests.push(PunchRequest {
            server,
            client,
            stage,
        });
        true
    }

    pub fn remove(&mut self, server: SocketAddr, client: SocketAddr) -> bool {
        let before = self.requests.len();
        self.requests
            .retain(|r| !(r.server == server && r.client == client));
        before != self.requests.len()
    }

    pub fn has_server(&self, server: SocketAddr) -> bool {
        self.requests.iter().any(|r| r.server == server)
    }

    pub fn by_server(&self, server: SocketAddr) -> Vec<PunchRequest> {
        self.requests
            .iter()
            .filter(|r| r.server == server)
            .copied()
            .collect()
    }

    pub fn by_client(&self, client: SocketAddr) -> Vec<PunchRequest> {
        self.requests
            .iter()
            .filter(|r| r.client == client)
            .copied()
            .collect()
    }

    pub fn set_stage(&mut self, server: SocketAddr, client: SocketAddr, stage: PunchStage) {
        for request in self
            .requests
            .iter_mut()
            .filter(|r| r.server == server && r.client == client)
        {
            request.stage = stage;
        }
    }

    pub fn take_server(&mut self, server: SocketAddr) -> Vec<PunchRequest> {
        let (taken, kept): (Vec<_>, Vec<_>) = self.requests.drain(..).partition(|r| r.server == server);
        self.requests = kept;
        taken
    }

    pub fn take_client(&mut self, client: SocketAddr) -> Vec<PunchRequest> {
        let (taken, kept): (Vec<_>, Vec<_>) = self.requests.drain(..).partition(|r| r.client == client);
        self.requests = kept;
        taken
    }

    pub fn iter(&self) -> impl Iterator<Item = &PunchRequest> {
        self.requests.iter()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
