use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use super::datagram::{
    Datagram, DatagramHeader, Delivery, Frame, MAX_DATAGRAM_SIZE, sequence_greater_than,
};
use super::stats::{NetworkStats, PacketLossSimulation};
use super::tracking::{AckWindow, DuplicateFilter, SentLedger};
use super::transport::{
    OrderingMode, Packet, PacketKind, Reliability, SendOptions, Transport, TransportError,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const CONNECT_ATTEMPTS: u32 = 6;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const RESEND_INTERVAL: Duration = Duration::from_millis(200);
const MAX_RESENDS: u32 = 25;
const FRAME_OVERHEAD: usize = 96;

pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - FRAME_OVERHEAD;

#[derive(Debug)]
struct PendingConnect {
    salt: u64,
    attempts: u32,
    last_sent: Instant,
}

#[derive(Debug)]
struct Resend {
    frame: Frame,
    last_sent: Instant,
    attempts: u32,
}

#[derive(Debug, Default)]
struct ChannelState {
    next_ordered: u32,
    next_sequenced: u32,
    expected_ordered: u32,
    last_sequenced: Option<u32>,
    held: BTreeMap<u32, Vec<u8>>,
}

#[derive(Debug)]
struct Connection {
    salt: u64,
    send_sequence: u32,
    sent: SentLedger,
    received: AckWindow,
    delivered: DuplicateFilter,
    next_reliable_id: u32,
    resend: BTreeMap<u32, Resend>,
    channels: HashMap<u8, ChannelState>,
    last_receive: Instant,
    last_send: Instant,
}

impl Connection {
    fn new(salt: u64) -> Self {
        let now = Instant::now();
        Self {
            salt,
            send_sequence: 0,
            sent: SentLedger::new(512),
            received: AckWindow::default(),
            delivered: DuplicateFilter::new(1024),
            next_reliable_id: 0,
            resend: BTreeMap::new(),
            channels: HashMap::new(),
            last_receive: now,
            last_send: now,
        }
    }

    fn datagram(&mut self, frame: Frame, reliable_id: Option<u32>) -> Datagram {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);

        let (ack, ack_bitfield) = self.received.ack_fields();
        self.sent.record(sequence, reliable_id);
        self.last_send = Instant::now();

        Datagram::new(DatagramHeader::new(sequence, ack, ack_bitfield), frame)
    }

    fn payload_frame(&mut self, delivery: Delivery, channel: u8, data: Vec<u8>) -> (Frame, Option<u32>) {
        let state = self.channels.entry(channel).or_default();
        let index = match delivery {
            Delivery::ReliableOrdered => {
                let index = state.next_ordered;
                state.next_ordered = index.wrapping_add(1);
                index
            }
            Delivery::UnreliableSequenced | Delivery::ReliableSequenced => {
                let index = state.next_sequenced;
                state.next_sequenced = index.wrapping_add(1);
                index
            }
            Delivery::Unreliable | Delivery::Reliable => 0,
        };

        let reliable_id = delivery.is_reliable().then(|| {
            let id = self.next_reliable_id;
            self.next_reliable_id = id.wrapping_add(1);
            id
        });

        let frame = Frame::Payload {
            delivery,
            channel,
            index,
            message_id: reliable_id.unwrap_or(0),
            data,
        };

        if let Some(id) = reliable_id {
            self.resend.insert(
                id,
                Resend {
                    frame: frame.clone(),
                    last_sent: Instant::now(),
                    attempts: 0,
                },
            );
        }

        (frame, reliable_id)
    }

    /// False for a datagram sequence seen before.
    fn on_header(&mut self, header: &DatagramHeader) -> bool {
        self.last_receive = Instant::now();
        if !self.received.record(header.sequence) {
            return false;
        }
        for id in self.sent.acknowledge(header.ack, header.ack_bitfield) {
            self.resend.remove(&id);
        }
        true
    }

    fn accept_payload(
        &mut self,
        delivery: Delivery,
        channel: u8,
        index: u32,
        message_id: u32,
        data: Vec<u8>,
    ) -> Vec<Vec<u8>> {
        if delivery.is_reliable() && !self.delivered.first_sighting(message_id) {
            return Vec::new();
        }

        let state = self.channels.entry(channel).or_default();
        match delivery {
            Delivery::Unreliable | Delivery::Reliable => vec![data],
            Delivery::UnreliableSequenced | Delivery::ReliableSequenced => {
                if state
                    .last_sequenced
                    .is_some_and(|last| !sequence_greater_than(index, last))
                {
                    return Vec::new();
                }
                state.last_sequenced = Some(index);
                vec![data]
            }
            Delivery::ReliableOrdered => {
                if index == state.expected_ordered {
                    let mut ready = vec![data];
                    state.expected_ordered = state.expected_ordered.wrapping_add(1);
                    while let Some(next) = state.held.remove(&state.expected_ordered) {
                        ready.push(next);
                        state.expected_ordered = state.expected_ordered.wrapping_add(1);
                    }
                    ready
                } else {
                    if sequence_greater_than(index, state.expected_ordered) {
                        state.held.insert(index, data);
                    }
                    Vec::new()
                }
            }
        }
    }
}

fn delivery_for(options: SendOptions) -> Delivery {
    match (options.reliability, options.ordering) {
        (Reliability::Unreliable, OrderingMode::Unordered) => Delivery::Unreliable,
        (Reliability::Unreliable, _) => Delivery::UnreliableSequenced,
        (Reliability::Reliable, OrderingMode::Unordered) => Delivery::Reliable,
        (Reliability::Reliable, OrderingMode::Sequenced) => Delivery::ReliableSequenced,
        (Reliability::Reliable, OrderingMode::Ordered) => Delivery::ReliableOrdered,
    }
}

fn transmit(
    socket: &UdpSocket,
    stats: &mut NetworkStats,
    loss: &PacketLossSimulation,
    datagram: &Datagram,
    dest: SocketAddr,
) -> Result<(), TransportError> {
    let data = datagram.serialize()?;
    if data.len() > MAX_DATAGRAM_SIZE {
        return Err(TransportError::TooLarge(data.len()));
    }

    if loss.should_drop() {
        stats.packets_dropped += 1;
        return Ok(());
    }

    match socket.send_to(&data, dest) {
        Ok(bytes) => {
            stats.record_sent(bytes);
            Ok(())
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
            stats.packets_dropped += 1;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Non-blocking UDP socket with connections, acks and resends.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: [u8; MAX_DATAGRAM_SIZE],
    max_connections: usize,
    timeout: Duration,
    connect_attempts: u32,
    connect_interval: Duration,
    pending: HashMap<SocketAddr, PendingConnect>,
    connections: HashMap<SocketAddr, Connection>,
    injected: VecDeque<Packet>,
    inbox: VecDeque<Packet>,
    stats: NetworkStats,
    loss: PacketLossSimulation,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A, max_connections: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            recv_buffer: [0u8; MAX_DATAGRAM_SIZE],
            max_connections,
            timeout: DEFAULT_TIMEOUT,
            connect_attempts: CONNECT_ATTEMPTS,
            connect_interval: CONNECT_RETRY_INTERVAL,
            pending: HashMap::new(),
            connections: HashMap::new(),
            injected: VecDeque::new(),
            inbox: VecDeque::new(),
            stats: NetworkStats::default(),
            loss: PacketLossSimulation::default(),
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_connect_policy(&mut self, attempts: u32, interval: Duration) {
        self.connect_attempts = attempts.max(1);
        self.connect_interval = interval;
    }

    pub fn set_packet_loss(&mut self, loss: PacketLossSimulation) {
        self.loss = loss;
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn connection_rtt(&self, addr: SocketAddr) -> Option<f32> {
        self.connections.get(&addr).map(|c| c.sent.rtt().smoothed_ms)
    }

    fn send_control(&mut self, frame: Frame, dest: SocketAddr) {
        let datagram = Datagram::new(DatagramHeader::unsequenced(), frame);
        if let Err(e) = transmit(&self.socket, &mut self.stats, &self.loss, &datagram, dest) {
            log::debug!("control frame to {dest} failed: {e}");
        }
    }

    fn send_on_connection(&mut self, frame: Frame, reliable_id: Option<u32>, dest: SocketAddr) -> Result<(), TransportError> {
        let conn = self
            .connections
            .get_mut(&dest)
            .ok_or(TransportError::NotConnected(dest))?;
        let datagram = conn.datagram(frame, reliable_id);
        transmit(&self.socket, &mut self.stats, &self.loss, &datagram, dest)
    }

    fn receive_all(&mut self) {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    self.stats.record_received(size);
                    let datagram = match Datagram::deserialize(&self.recv_buffer[..size]) {
                        Ok(datagram) if datagram.header.is_valid() => datagram,
                        Ok(_) => continue,
                        Err(e) => {
                            log::trace!("dropping malformed datagram from {addr}: {e}");
                            continue;
                        }
                    };
                    self.handle_datagram(addr, datagram);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    log::warn!("socket receive failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, addr: SocketAddr, datagram: Datagram) {
        match datagram.frame {
            Frame::Unconnected { data } => {
                self.inbox
                    .push_back(Packet::new(addr, PacketKind::Unconnected(data.into())));
            }
            Frame::ConnectRequest { salt } => self.on_connect_request(addr, salt),
            Frame::ConnectAccept { salt } => {
                if self.pending.get(&addr).is_some_and(|p| p.salt == salt) {
                    self.pending.remove(&addr);
                    self.connections.insert(addr, Connection::new(salt));
                    self.inbox
                        .push_back(Packet::new(addr, PacketKind::ConnectionAccepted));
                }
            }
            Frame::ConnectRefused => {
                if self.pending.remove(&addr).is_some() {
                    self.inbox
                        .push_back(Packet::new(addr, PacketKind::NoFreeIncomingConnections));
                }
            }
            Frame::Disconnect => {
                if self.connections.remove(&addr).is_some() {
                    self.inbox.push_back(Packet::new(addr, PacketKind::Disconnected));
                }
            }
            Frame::Keepalive => {
                if let Some(conn) = self.connections.get_mut(&addr) {
                    conn.on_header(&datagram.header);
                }
            }
            Frame::Payload {
                delivery,
                channel,
                index,
                message_id,
                data,
            } => {
                let Some(conn) = self.connections.get_mut(&addr) else {
                    return;
                };
                if !conn.on_header(&datagram.header) {
                    return;
                }
                for data in conn.accept_payload(delivery, channel, index, message_id, data) {
                    self.inbox
                        .push_back(Packet::new(addr, PacketKind::Message(data.into())));
                }
                if delivery.is_reliable() {
                    let _ = self.send_on_connection(Frame::Keepalive, None, addr);
                }
            }
        }
    }

    fn on_connect_request(&mut self, addr: SocketAddr, salt: u64) {
        if let Some(conn) = self.connections.get(&addr) {
            if conn.salt == salt {
                self.send_control(Frame::ConnectAccept { salt }, addr);
                return;
            }
            log::debug!("{addr} reconnected with a new salt");
            self.connections.remove(&addr);
            self.inbox.push_back(Packet::new(addr, PacketKind::ConnectionLost));
        }

        // Both ends connecting to each other at once.
        if self.pending.remove(&addr).is_some() {
            self.connections.insert(addr, Connection::new(salt));
            self.send_control(Frame::ConnectAccept { salt }, addr);
            self.inbox
                .push_back(Packet::new(addr, PacketKind::ConnectionAccepted));
            return;
        }

        if self.connections.len() >= self.max_connections {
            log::debug!("refusing {addr}: {} connections", self.connections.len());
            self.send_control(Frame::ConnectRefused, addr);
            return;
        }

        self.connections.insert(addr, Connection::new(salt));
        self.send_control(Frame::ConnectAccept { salt }, addr);
        self.inbox
            .push_back(Packet::new(addr, PacketKind::NewIncomingConnection));
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        if self.connections.contains_key(&addr) || self.pending.contains_key(&addr) {
            return Err(TransportError::AlreadyConnected(addr));
        }

        let salt: u64 = rand::random();
        self.pending.insert(
            addr,
            PendingConnect {
                salt,
                attempts: 1,
                last_sent: Instant::now(),
            },
        );
        self.send_control(Frame::ConnectRequest { salt }, addr);
        Ok(())
    }

    fn close(&mut self, addr: SocketAddr, notify: bool) {
        self.pending.remove(&addr);
        if notify && self.connections.contains_key(&addr) {
            if let Err(e) = self.send_on_connection(Frame::Disconnect, None, addr) {
                log::debug!("disconnect notice to {addr} failed: {e}");
            }
        }
        self.connections.remove(&addr);
        self.inbox
            .retain(|p| p.addr != addr || matches!(p.kind, PacketKind::Unconnected(_)));
    }

    fn is_connected(&self, addr: SocketAddr) -> bool {
        self.connections.contains_key(&addr)
    }

    fn connections(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self.connections.keys().copied().collect();
        addrs.sort();
        addrs
    }

    fn send(
        &mut self,
        payload: &[u8],
        options: SendOptions,
        dest: SocketAddr,
    ) -> Result<(), TransportError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::TooLarge(payload.len()));
        }

        let conn = self
            .connections
            .get_mut(&dest)
            .ok_or(TransportError::NotConnected(dest))?;
        let (frame, reliable_id) =
            conn.payload_frame(delivery_for(options), options.channel, payload.to_vec());
        self.send_on_connection(frame, reliable_id, dest)
    }

    fn send_unconnected(&mut self, payload: &[u8], dest: SocketAddr) -> Result<(), TransportError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::TooLarge(payload.len()));
        }

        let datagram = Datagram::new(
            DatagramHeader::unsequenced(),
            Frame::Unconnected {
                data: payload.to_vec(),
            },
        );
        transmit(&self.socket, &mut self.stats, &self.loss, &datagram, dest)
    }

    fn inject(&mut self, packet: Packet) {
        self.injected.push_back(packet);
    }

    fn poll(&mut self) -> Option<Packet> {
        if let Some(packet) = self.injected.pop_front() {
            return Some(packet);
        }
        if self.inbox.is_empty() {
            self.receive_all();
        }
        self.inbox.pop_front()
    }

    fn update(&mut self) -> Result<(), TransportError> {
        let now = Instant::now();

        let mut failed = Vec::new();
        let mut retries = Vec::new();
        for (addr, pending) in self.pending.iter_mut() {
            if now.duration_since(pending.last_sent) < self.connect_interval {
                continue;
            }
            if pending.attempts >= self.connect_attempts {
                failed.push(*addr);
            } else {
                pending.attempts += 1;
                pending.last_sent = now;
                retries.push((*addr, pending.salt));
            }
        }
        for (addr, salt) in retries {
            self.send_control(Frame::ConnectRequest { salt }, addr);
        }
        for addr in failed {
            self.pending.remove(&addr);
            self.inbox
                .push_back(Packet::new(addr, PacketKind::ConnectionAttemptFailed));
        }

        let mut lost = Vec::new();
        for (addr, conn) in self.connections.iter_mut() {
            if now.duration_since(conn.last_receive) > self.timeout {
                lost.push(*addr);
                continue;
            }

            let mut due = Vec::new();
            let mut exhausted = false;
            for (id, resend) in conn.resend.iter_mut() {
                if now.duration_since(resend.last_sent) < RESEND_INTERVAL {
                    continue;
                }
                if resend.attempts >= MAX_RESENDS {
                    exhausted = true;
                    break;
                }
                resend.attempts += 1;
                resend.last_sent = now;
                due.push((*id, resend.frame.clone()));
            }
            if exhausted {
                lost.push(*addr);
                continue;
            }

            for (id, frame) in due {
                let datagram = conn.datagram(frame, Some(id));
                self.stats.packets_resent += 1;
                if let Err(e) = transmit(&self.socket, &mut self.stats, &self.loss, &datagram, *addr) {
                    log::debug!("resend to {addr} failed: {e}");
                }
            }

            if now.duration_since(conn.last_send) >= KEEPALIVE_INTERVAL {
                let datagram = conn.datagram(Frame::Keepalive, None);
                if let Err(e) = transmit(&self.socket, &mut self.stats, &self.loss, &datagram, *addr) {
                    log::debug!("keepalive to {addr} failed: {e}");
                }
            }
        }

        for addr in lost {
            log::debug!("connection to {addr} lost");
            self.connections.remove(&addr);
            self.inbox.push_back(Packet::new(addr, PacketKind::ConnectionLost));
        }

        if let Some(conn) = self.connections.values().next() {
            let rtt = conn.sent.rtt();
            self.stats.rtt_ms = rtt.smoothed_ms;
            self.stats.rtt_variance = rtt.variance_ms;
        }

        Ok(())
    }
}
