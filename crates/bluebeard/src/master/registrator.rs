use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use crate::callback::CallbackGroup;
use crate::net::{
    FilterAction, Message, Packet, PacketFilter, PacketKind, ServerInfo, SharedTransport,
    TransportError,
};
use crate::sched::{Scheduler, SchedulerError};

struct RegistratorState {
    transport: SharedTransport,
    master: SocketAddr,
    info: ServerInfo,
    last_token: Option<u32>,
    withdrawn: bool,
    timer: CallbackGroup,
}

/// Keeps a game server listed on the master. Attach it in front of the
/// server handshake so the master's relay connections never reach it.
#[derive(Clone)]
pub struct Registrator {
    state: Rc<RefCell<RegistratorState>>,
}

impl Registrator {
    /// Requests a token right away and then every `interval`.
    pub fn announce(
        transport: SharedTransport,
        scheduler: &Scheduler,
        master: SocketAddr,
        info: ServerInfo,
        interval: Duration,
    ) -> Result<Self, SchedulerError> {
        let state = Rc::new(RefCell::new(RegistratorState {
            transport,
            master,
            info,
            last_token: None,
            withdrawn: false,
            timer: CallbackGroup::new(),
        }));

        let weak = Rc::downgrade(&state);
        let mut timer = CallbackGroup::new();
        scheduler.add_task("Registrator::request_token", interval, &mut timer, move |_| {
            if let Some(state) = weak.upgrade() {
                state.borrow().request_token();
            }
            Ok(())
        })?;
        state.borrow_mut().timer = timer;
        state.borrow().request_token();

        Ok(Self { state })
    }

    pub fn master(&self) -> SocketAddr {
        self.state.borrow().master
    }

    pub fn last_token(&self) -> Option<u32> {
        self.state.borrow().last_token
    }

    pub fn info(&self) -> ServerInfo {
        self.state.borrow().info.clone()
    }

    /// Takes effect with the next heartbeat.
    pub fn update_info(&self, info: ServerInfo) {
        self.state.borrow_mut().info = info;
    }

    /// Asks the master to drop the listing and stops announcing.
    pub fn withdraw(&self) {
        self.state.borrow_mut().withdraw();
    }
}

impl RegistratorState {
    fn send(&self, message: &Message) -> Result<(), TransportError> {
        self.transport
            .borrow_mut()
            .send_unconnected(&message.encode(), self.master)
    }

    fn request_token(&self) {
        if self.withdrawn {
            return;
        }
        if let Err(e) = self.send(&Message::RequestAuthToken) {
            log::warn!("cannot reach master {}: {e}", self.master);
        }
    }

    fn withdraw(&mut self) {
        if self.withdrawn {
            return;
        }
        self.withdrawn = true;
        self.timer = CallbackGroup::new();

        let Some(token) = self.last_token else {
            return;
        };
        let message = Message::RemoveServer {
            token,
            internal_port: self.info.address.port(),
        };
        // Also runs from drop, possibly while the transport is borrowed.
        let sent = match self.transport.try_borrow_mut() {
            Ok(mut transport) => transport
                .send_unconnected(&message.encode(), self.master)
                .is_ok(),
            Err(_) => false,
        };
        if sent {
            log::info!("withdrew {} from master {}", self.info.name, self.master);
        } else {
            log::warn!("could not withdraw {} from master {}", self.info.name, self.master);
        }
    }

    fn on_token(&mut self, token: u32) {
        self.last_token = Some(token);
        let heartbeat = Message::Heartbeat {
            token,
            info: self.info.clone(),
        };
        match self.send(&heartbeat) {
            Ok(()) => log::debug!("heartbeat sent to {}", self.master),
            Err(e) => log::warn!("cannot send heartbeat to {}: {e}", self.master),
        }
    }

    fn on_punch_ready(&self, peer: SocketAddr) {
        log::info!("master relayed a punch-through request from {peer}");
        match self.transport.borrow_mut().connect(peer) {
            Ok(()) | Err(TransportError::AlreadyConnected(_)) => {}
            Err(e) => log::warn!("cannot connect to {peer}: {e}"),
        }
    }
}

impl Drop for RegistratorState {
    fn drop(&mut self) {
        self.withdraw();
    }
}

impl PacketFilter for Registrator {
    fn name(&self) -> &str {
        "registrator"
    }

    fn on_packet(&mut self, packet: Packet) -> FilterAction {
        let mut state = self.state.borrow_mut();
        if packet.addr != state.master || state.withdrawn {
            return FilterAction::Continue(packet);
        }

        match packet.kind {
            PacketKind::Unconnected(_) | PacketKind::Message(_) => {}
            PacketKind::NewIncomingConnection
            | PacketKind::Disconnected
            | PacketKind::ConnectionLost => {
                log::debug!("master relay: {packet}");
                return FilterAction::Consumed;
            }
            _ => return FilterAction::Continue(packet),
        }

        let connected = matches!(packet.kind, PacketKind::Message(_));
        match packet.payload().map(|data| Message::decode(data)) {
            Some(Ok(Message::AuthToken { token })) if !connected => {
                state.on_token(token);
                FilterAction::Consumed
            }
            Some(Ok(Message::NatPunchReady { peer })) if connected => {
                state.on_punch_ready(peer);
                FilterAction::Consumed
            }
            _ => FilterAction::Continue(packet),
        }
    }

    fn is_finished(&self) -> bool {
        self.state.borrow().withdrawn
    }
}
