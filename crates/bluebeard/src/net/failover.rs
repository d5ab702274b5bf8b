use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

use super::peer::{FilterAction, PacketFilter};
use super::transport::{Packet, PacketKind, SharedTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverOutcome {
    Connected(SocketAddr),
    /// Every host ran out of attempts. `no_free_slots` is set when at least
    /// one of them was reachable but full.
    Exhausted { no_free_slots: bool },
}

#[derive(Debug)]
struct Host {
    name: String,
    port: u16,
    attempts: u32,
}

/// Connects to the first host of a list that accepts, with a per-host attempt
/// budget. Failures that lead to another attempt are swallowed; the terminal
/// packet is passed on.
pub struct FailoverConnector {
    transport: SharedTransport,
    hosts: Vec<Host>,
    current: usize,
    target: SocketAddr,
    had_no_free_slots: bool,
    finished: bool,
    on_outcome: Option<Box<dyn FnOnce(FailoverOutcome)>>,
}

pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let unresolved = || TransportError::Unresolved(format!("{host}:{port}"));
    (host, port)
        .to_socket_addrs()
        .map_err(|_| unresolved())?
        .next()
        .ok_or_else(unresolved)
}

impl FailoverConnector {
    /// Starts connecting to `hosts[0]`.
    pub fn start<F>(
        transport: SharedTransport,
        hosts: Vec<(String, u16)>,
        attempts_per_host: u32,
        on_outcome: F,
    ) -> Self
    where
        F: FnOnce(FailoverOutcome) + 'static,
    {
        let mut connector = Self {
            transport,
            hosts: hosts
                .into_iter()
                .map(|(name, port)| Host {
                    name,
                    port,
                    attempts: attempts_per_host,
                })
                .collect(),
            current: 0,
            target: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            had_no_free_slots: false,
            finished: false,
            on_outcome: Some(Box::new(on_outcome)),
        };

        if connector.hosts.is_empty() {
            log::warn!("failover connector started without hosts");
            connector.finish(FailoverOutcome::Exhausted {
                no_free_slots: false,
            });
        } else {
            connector.connect_current();
        }
        connector
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn remaining_attempts(&self) -> Vec<u32> {
        self.hosts.iter().map(|h| h.attempts).collect()
    }

    fn connect_current(&mut self) {
        let host = &self.hosts[self.current];
        let result = resolve(&host.name, host.port).and_then(|addr| {
            self.target = addr;
            self.transport.borrow_mut().connect(addr)
        });

        if let Err(e) = result {
            log::error!("connect to {}:{} failed: {e}", host.name, host.port);
            if matches!(e, TransportError::Unresolved(_)) {
                self.target = SocketAddr::from((Ipv4Addr::UNSPECIFIED, host.port));
            }
            self.transport
                .borrow_mut()
                .inject(Packet::new(self.target, PacketKind::ConnectionAttemptFailed));
        } else {
            log::debug!("connecting to {}:{} ({})", host.name, host.port, self.target);
        }
    }

    /// Same host while it has attempts left, then round-robin onwards.
    fn next_host(&self) -> Option<usize> {
        let len = self.hosts.len();
        (0..len)
            .map(|step| (self.current + step) % len)
            .find(|&index| self.hosts[index].attempts > 0)
    }

    fn finish(&mut self, outcome: FailoverOutcome) {
        self.finished = true;
        if let Some(callback) = self.on_outcome.take() {
            callback(outcome);
        }
    }
}

impl PacketFilter for FailoverConnector {
    fn name(&self) -> &str {
        "failover connector"
    }

    fn on_packet(&mut self, mut packet: Packet) -> FilterAction {
        if packet.addr != self.target {
            return FilterAction::Continue(packet);
        }

        match packet.kind {
            PacketKind::ConnectionAccepted => {
                self.finish(FailoverOutcome::Connected(packet.addr));
                return FilterAction::Continue(packet);
            }
            PacketKind::NoFreeIncomingConnections => {
                let host = &mut self.hosts[self.current];
                host.attempts = host.attempts.saturating_sub(1);
                self.had_no_free_slots = true;
                log::info!(
                    "{} has no free incoming connections, {} attempts left",
                    packet.addr,
                    host.attempts
                );
            }
            PacketKind::ConnectionAttemptFailed => {
                self.hosts[self.current].attempts = 0;
                log::info!("failed to connect to {}", packet.addr);
            }
            _ => return FilterAction::Continue(packet),
        }

        match self.next_host() {
            Some(next) => {
                self.current = next;
                self.connect_current();
                FilterAction::Consumed
            }
            None => {
                if self.had_no_free_slots {
                    packet.kind = PacketKind::NoFreeIncomingConnections;
                }
                self.finish(FailoverOutcome::Exhausted {
                    no_free_slots: self.had_no_free_slots,
                });
                FilterAction::Continue(packet)
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}
