use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use crate::callback::CallbackGroup;
use crate::net::{FilterAction, Message, Packet, PacketFilter, PacketKind, SharedTransport};
use crate::sched::{Scheduler, SchedulerError};

pub const RETRY_DELAY: Duration = Duration::from_millis(500);
pub const MAX_SENDS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Response(Message),
    ContactFailed,
}

type OutcomeFn = Box<dyn FnOnce(RequestOutcome)>;

struct RequestState {
    transport: SharedTransport,
    master: SocketAddr,
    payload: Bytes,
    expected: u8,
    sends_left: u32,
    on_outcome: Option<OutcomeFn>,
    timer: CallbackGroup,
}

impl RequestState {
    fn resend(&mut self) -> Option<(OutcomeFn, RequestOutcome)> {
        if self.sends_left == 0 {
            log::info!("master {} did not answer", self.master);
            return self.finish(RequestOutcome::ContactFailed);
        }
        self.sends_left -= 1;
        if let Err(e) = self
            .transport
            .borrow_mut()
            .send_unconnected(&self.payload, self.master)
        {
            log::warn!("cannot send request to master {}: {e}", self.master);
        }
        None
    }

    fn finish(&mut self, outcome: RequestOutcome) -> Option<(OutcomeFn, RequestOutcome)> {
        self.timer = CallbackGroup::new();
        self.on_outcome.take().map(|callback| (callback, outcome))
    }

    fn is_finished(&self) -> bool {
        self.on_outcome.is_none()
    }
}

/// Sends one datagram to the master until a reply carrying `expected`
/// arrives or the retries run out.
#[derive(Clone)]
pub struct MasterRequest {
    state: Rc<RefCell<RequestState>>,
}

impl MasterRequest {
    pub fn send<F>(
        transport: SharedTransport,
        scheduler: &Scheduler,
        master: SocketAddr,
        message: &Message,
        expected: u8,
        on_outcome: F,
    ) -> Result<Self, SchedulerError>
    where
        F: FnOnce(RequestOutcome) + 'static,
    {
        let state = Rc::new(RefCell::new(RequestState {
            transport,
            master,
            payload: message.encode(),
            expected,
            sends_left: MAX_SENDS,
            on_outcome: Some(Box::new(on_outcome)),
            timer: CallbackGroup::new(),
        }));

        let weak = Rc::downgrade(&state);
        let mut timer = CallbackGroup::new();
        scheduler.add_task("MasterRequest::resend", RETRY_DELAY, &mut timer, move |_| {
            let Some(state) = weak.upgrade() else {
                return Ok(());
            };
            let completion = state.borrow_mut().resend();
            if let Some((callback, outcome)) = completion {
                callback(outcome);
            }
            Ok(())
        })?;

        {
            let mut guard = state.borrow_mut();
            guard.timer = timer;
            guard.resend();
        }
        Ok(Self { state })
    }

    pub fn sends_left(&self) -> u32 {
        self.state.borrow().sends_left
    }
}

impl PacketFilter for MasterRequest {
    fn name(&self) -> &str {
        "master request"
    }

    fn on_packet(&mut self, packet: Packet) -> FilterAction {
        let completion = {
            let mut state = self.state.borrow_mut();
            let answers = packet.addr == state.master
                && !state.is_finished()
                && matches!(&packet.kind, PacketKind::Unconnected(data)
                    if Message::peek_tag(data) == Some(state.expected));
            if !answers {
                return FilterAction::Continue(packet);
            }

            match packet.payload().map(|data| Message::decode(data)) {
                Some(Ok(message)) => state.finish(RequestOutcome::Response(message)),
                Some(Err(e)) => {
                    log::debug!("malformed reply from master {}: {e}", state.master);
                    return FilterAction::Consumed;
                }
                None => return FilterAction::Continue(packet),
            }
        };

        if let Some((callback, outcome)) = completion {
            callback(outcome);
        }
        FilterAction::Consumed
    }

    fn is_finished(&self) -> bool {
        self.state.borrow().is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{MemoryNetwork, NetworkPeer, Transport, share, tag};

    fn master_addr() -> SocketAddr {
        "192.0.2.1:27016".parse().unwrap()
    }

    #[test]
    fn test_gives_up_after_last_retry() {
        let net = MemoryNetwork::new();
        let master = master_addr();
        let _silent = net.bind(master, 4);
        let sched = Scheduler::new();
        let mut peer = NetworkPeer::new(share(net.bind("192.0.2.5:6000".parse().unwrap(), 4)));

        let outcome = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&outcome);
        let request = MasterRequest::send(
            Rc::clone(peer.transport()),
            &sched,
            master,
            &Message::RequestAuthToken,
            tag::AUTH_TOKEN,
            move |o| *sink.borrow_mut() = Some(o),
        )
        .unwrap();
        peer.attach(request.clone());

        for _ in 0..9 {
            sched.tick(RETRY_DELAY);
        }
        assert_eq!(net.pending(master), 10);
        assert!(outcome.borrow().is_none());

        sched.tick(RETRY_DELAY);
        assert_eq!(*outcome.borrow(), Some(RequestOutcome::ContactFailed));
        assert_eq!(net.pending(master), 10);
        assert!(request.is_finished());
    }

    #[test]
    fn test_matching_reply_completes() {
        let net = MemoryNetwork::new();
        let master = master_addr();
        let mut broker = net.bind(master, 4);
        let sched = Scheduler::new();
        let client: SocketAddr = "192.0.2.5:6000".parse().unwrap();
        let mut peer = NetworkPeer::new(share(net.bind(client, 4)));

        let outcome = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&outcome);
        peer.attach(
            MasterRequest::send(
                Rc::clone(peer.transport()),
                &sched,
                master,
                &Message::RequestAuthToken,
                tag::AUTH_TOKEN,
                move |o| *sink.borrow_mut() = Some(o),
            )
            .unwrap(),
        );

        let unrelated = Message::CustomMessage { text: "hi".into() }.encode();
        broker.send_unconnected(&unrelated, client).unwrap();
        broker
            .send_unconnected(&Message::AuthToken { token: 9 }.encode(), client)
            .unwrap();

        let passed = peer.receive().unwrap();
        assert_eq!(passed.kind, PacketKind::Unconnected(unrelated));
        assert!(peer.receive().is_none());
        assert_eq!(
            *outcome.borrow(),
            Some(RequestOutcome::Response(Message::AuthToken { token: 9 }))
        );

        sched.tick(Duration::from_secs(10));
        assert_eq!(sched.live_task_count(), 0);
    }
}
