use std::net::SocketAddr;

use super::message::Message;
use super::transport::{Packet, SendOptions, SharedTransport, TransportError};

pub enum FilterAction {
    /// Hand the (possibly rewritten) packet to the next stage.
    Continue(Packet),
    Consumed,
}

/// A stage of the receive pipeline. Stages see packets in attach order.
pub trait PacketFilter {
    fn name(&self) -> &str;

    fn on_packet(&mut self, packet: Packet) -> FilterAction;

    /// Finished filters are skipped and then dropped by the peer.
    fn is_finished(&self) -> bool {
        false
    }
}

/// Owns the transport handle plus the filter pipeline in front of the
/// application.
pub struct NetworkPeer {
    transport: SharedTransport,
    filters: Vec<Box<dyn PacketFilter>>,
}

impl NetworkPeer {
    pub fn new(transport: SharedTransport) -> Self {
        Self {
            transport,
            filters: Vec::new(),
        }
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.borrow().local_addr()
    }

    pub fn attach(&mut self, filter: impl PacketFilter + 'static) {
        log::debug!("attached filter {}", filter.name());
        self.filters.push(Box::new(filter));
    }

    pub fn filter_names(&self) -> Vec<String> {
        self.filters.iter().map(|f| f.name().to_string()).collect()
    }

    /// Next packet that made it through every filter.
    pub fn receive(&mut self) -> Option<Packet> {
        loop {
            let packet = self.transport.borrow_mut().poll()?;
            if let Some(packet) = self.run_filters(packet) {
                return Some(packet);
            }
        }
    }

    fn run_filters(&mut self, packet: Packet) -> Option<Packet> {
        let mut slot = Some(packet);
        for filter in self.filters.iter_mut() {
            if filter.is_finished() {
                continue;
            }
            let Some(packet) = slot.take() else {
                break;
            };
            match filter.on_packet(packet) {
                FilterAction::Continue(next) => slot = Some(next),
                FilterAction::Consumed => break,
            }
        }

        self.prune_finished();
        slot
    }

    fn prune_finished(&mut self) {
        self.filters.retain(|f| {
            let done = f.is_finished();
            if done {
                log::debug!("detached filter {}", f.name());
            }
            !done
        });
    }

    /// Transport maintenance; errors are logged, never propagated.
    pub fn update(&mut self) {
        if let Err(e) = self.transport.borrow_mut().update() {
            log::warn!("transport update failed: {e}");
        }
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<(), TransportError> {
        self.transport.borrow_mut().connect(addr)
    }

    pub fn send_message(
        &self,
        message: &Message,
        options: SendOptions,
        dest: SocketAddr,
    ) -> Result<(), TransportError> {
        self.transport
            .borrow_mut()
            .send(&message.encode(), options, dest)
    }

    pub fn send_unconnected(&self, message: &Message, dest: SocketAddr) -> Result<(), TransportError> {
        self.transport
            .borrow_mut()
            .send_unconnected(&message.encode(), dest)
    }
}
