use std::cell::RefCell;
use std::net::SocketAddr;
use std::process::Command;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use bluebeard::master::{MasterConfig, MasterServer, PunchRequest, ServerEntry};
use bluebeard::net::{NetworkPeer, NetworkStats, SharedTransport, UdpTransport};
use bluebeard::{CallbackGroup, Console, Scheduler};

/// Upper bound on one scheduler step after a stall.
pub const MAX_STEP: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct MasterStats {
    pub uptime_secs: u64,
    pub server_count: usize,
    pub contact_count: usize,
    pub task_count: usize,
    pub network: NetworkStats,
}

/// The broker process: socket, scheduler, console and broker state.
pub struct MasterProcess {
    udp: Rc<RefCell<UdpTransport>>,
    peer: NetworkPeer,
    scheduler: Scheduler,
    console: Console,
    broker: MasterServer,
    _commands: CallbackGroup,
    start_time: Instant,
    last_tick_time: Instant,
}

impl MasterProcess {
    pub fn new(config: &MasterConfig) -> Result<Self> {
        let settings = config.settings()?;
        let udp = Rc::new(RefCell::new(
            UdpTransport::bind(("0.0.0.0", config.listen_port), config.max_connections)
                .with_context(|| format!("cannot bind port {}", config.listen_port))?,
        ));
        let transport: SharedTransport = udp.clone();

        let scheduler = Scheduler::new();
        let console = Console::new();
        let mut commands = CallbackGroup::new();
        scheduler.register_console(&console, &mut commands)?;

        let mut broker = MasterServer::new(Rc::clone(&transport), scheduler.clone(), settings);
        broker.register_console(&console)?;
        if let Some(command) = config.new_player_cmd.clone() {
            broker.new_players().subscribe(&mut commands, move |entry: &ServerEntry| {
                run_new_player_cmd(&command, entry);
            });
        }

        Ok(Self {
            udp,
            peer: NetworkPeer::new(transport),
            scheduler,
            console,
            broker,
            _commands: commands,
            start_time: Instant::now(),
            last_tick_time: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.peer.local_addr()
    }

    /// Dispatches everything received, then advances the scheduler by the
    /// wall-clock time since the previous tick.
    pub fn tick_once(&mut self) {
        while let Some(packet) = self.peer.receive() {
            self.broker.handle_packet(packet);
        }
        self.peer.update();

        let now = Instant::now();
        let dt = now.duration_since(self.last_tick_time).min(MAX_STEP);
        self.last_tick_time = now;
        self.scheduler.tick(dt);
    }

    pub fn execute(&self, line: &str) -> String {
        match self.console.execute(line) {
            Ok(output) => output,
            Err(e) => e.to_string(),
        }
    }

    pub fn servers(&self) -> Vec<ServerEntry> {
        self.broker.servers()
    }

    pub fn punch_requests(&self) -> Vec<PunchRequest> {
        self.broker.punch_requests()
    }

    pub fn connections(&self) -> Vec<SocketAddr> {
        self.broker.connections()
    }

    pub fn stats(&self) -> MasterStats {
        MasterStats {
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_count: self.broker.server_count(),
            contact_count: self.broker.contact_count(),
            task_count: self.scheduler.live_task_count(),
            network: self.udp.borrow().stats().clone(),
        }
    }
}

fn run_new_player_cmd(command: &str, entry: &ServerEntry) {
    log::info!(
        "new player on {} ({}/{})",
        entry.info.name,
        entry.info.num_players,
        entry.info.max_players
    );
    let spawned = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("BLUEBEARD_SERVER_NAME", &entry.info.name)
        .env("BLUEBEARD_SERVER_ADDRESS", entry.external.to_string())
        .env("BLUEBEARD_NUM_PLAYERS", entry.info.num_players.to_string())
        .spawn();
    match spawned {
        // Reaped off the tick thread.
        Ok(mut child) => {
            std::thread::spawn(move || child.wait());
        }
        Err(e) => log::warn!("cannot run new player command {command:?}: {e}"),
    }
}
