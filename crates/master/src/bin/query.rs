use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use bluebeard::master::{DEFAULT_MASTER_PORT, MasterRequest, Registrator, RequestOutcome};
use bluebeard::net::{
    ClientHandshake, FailoverConnector, FailoverOutcome, HandshakeOutcome, Message, NetworkPeer,
    PacketKind, ServerInfo, SharedTransport, UdpTransport, VersionInfo, resolve, share, tag,
};
use bluebeard::Scheduler;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(name = "master-query")]
#[command(about = "Talks to a Bluebeard master server or game server")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1", help = "Master server host")]
    master: String,

    #[arg(long, default_value_t = DEFAULT_MASTER_PORT)]
    master_port: u16,

    #[arg(short, long, default_value = "Z1.00", help = "Version to report, e.g. Z1.05")]
    version: VersionInfo,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prints the servers the master lists for our version.
    List {
        #[arg(long, default_value_t = 2.0, help = "Seconds to wait for entries")]
        wait: f32,
    },
    /// Lists a test server on the master until interrupted by the timeout.
    Announce {
        #[arg(long, default_value = "Test server")]
        name: String,

        #[arg(long, default_value_t = 27015)]
        port: u16,

        #[arg(long, default_value = "dm_arena")]
        level: String,

        #[arg(long, default_value_t = 16)]
        max_players: u8,

        #[arg(long, default_value_t = 10.0, help = "Seconds between heartbeats")]
        interval: f32,

        #[arg(long, default_value_t = 60.0, help = "Seconds to stay listed")]
        duration: f32,
    },
    /// Connects to the first responsive game server and runs the version
    /// handshake.
    Probe {
        #[arg(required = true, help = "host:port, tried in order")]
        hosts: Vec<String>,

        #[arg(long, default_value_t = 3)]
        attempts: u32,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    match &args.command {
        Command::List { wait } => list(&args, *wait),
        Command::Announce {
            name,
            port,
            level,
            max_players,
            interval,
            duration,
        } => {
            let info = ServerInfo {
                name: name.clone(),
                level_name: level.clone(),
                max_players: *max_players,
                version: args.version,
                address: SocketAddr::from(([0, 0, 0, 0], *port)),
                ..ServerInfo::default()
            };
            announce(&args, info, *interval, *duration)
        }
        Command::Probe { hosts, attempts } => probe(&args, hosts, *attempts),
    }
}

struct Session {
    peer: NetworkPeer,
    scheduler: Scheduler,
    last_tick: Instant,
}

impl Session {
    fn bind(port: u16) -> Result<Self> {
        let udp = UdpTransport::bind(("0.0.0.0", port), 8).context("cannot bind socket")?;
        Ok(Self {
            peer: NetworkPeer::new(share(udp)),
            scheduler: Scheduler::new(),
            last_tick: Instant::now(),
        })
    }

    fn transport(&self) -> SharedTransport {
        Rc::clone(self.peer.transport())
    }

    /// Runs the loop until `done` holds or `timeout` passes, handing every
    /// packet that leaves the filters to `on_packet`.
    fn run_until(
        &mut self,
        timeout: Duration,
        mut on_packet: impl FnMut(Message),
        done: impl Fn() -> bool,
    ) {
        let deadline = Instant::now() + timeout;
        while !done() && Instant::now() < deadline {
            while let Some(packet) = self.peer.receive() {
                match packet.kind {
                    PacketKind::Message(data) | PacketKind::Unconnected(data) => {
                        match Message::decode(&data) {
                            Ok(message) => on_packet(message),
                            Err(e) => log::debug!("ignoring packet from {}: {e}", packet.addr),
                        }
                    }
                    kind => log::info!("{} from {}", kind.as_str(), packet.addr),
                }
            }
            self.peer.update();

            let now = Instant::now();
            self.scheduler.tick(now.duration_since(self.last_tick));
            self.last_tick = now;
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

fn master_addr(args: &Args) -> Result<SocketAddr> {
    Ok(resolve(&args.master, args.master_port)?)
}

fn seconds(value: f32) -> Result<Duration> {
    Ok(bluebeard::sched::delay_from_secs(value)?)
}

fn list(args: &Args, wait: f32) -> Result<()> {
    let master = master_addr(args)?;
    let mut session = Session::bind(0)?;

    let token = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&token);
    let request = MasterRequest::send(
        session.transport(),
        &session.scheduler,
        master,
        &Message::RequestAuthToken,
        tag::AUTH_TOKEN,
        move |outcome| *sink.borrow_mut() = Some(outcome),
    )?;
    session.peer.attach(request);

    let answered = Rc::clone(&token);
    session.run_until(Duration::from_secs(6), |_| {}, move || answered.borrow().is_some());

    let token = match token.borrow_mut().take() {
        Some(RequestOutcome::Response(Message::AuthToken { token })) => token,
        _ => bail!("master {master} did not answer"),
    };

    session.peer.send_unconnected(
        &Message::RequestServerList {
            token,
            version: args.version,
        },
        master,
    )?;

    let mut count = 0;
    session.run_until(
        seconds(wait)?,
        |message| match message {
            Message::ServerList { info } => {
                count += 1;
                println!(
                    "{:<24} {:>2}/{:<2} {} {:<16} {} (internal port {})",
                    info.name,
                    info.num_players,
                    info.max_players,
                    info.version,
                    info.level_name,
                    info.address,
                    info.internal_port
                );
            }
            Message::CustomMessage { text } => println!("master: {text}"),
            _ => {}
        },
        || false,
    );
    println!("{count} servers");
    Ok(())
}

fn announce(args: &Args, info: ServerInfo, interval: f32, duration: f32) -> Result<()> {
    let master = master_addr(args)?;
    let mut session = Session::bind(info.address.port())?;
    let name = info.name.clone();

    let registrator = Registrator::announce(
        session.transport(),
        &session.scheduler,
        master,
        info,
        seconds(interval)?,
    )?;
    session.peer.attach(registrator.clone());
    println!("announcing {name} to {master}");

    session.run_until(seconds(duration)?, |_| {}, || false);

    match registrator.last_token() {
        Some(_) => println!("withdrawing {name}"),
        None => println!("master {master} never handed out a token"),
    }
    registrator.withdraw();
    session.peer.update();
    Ok(())
}

fn probe(args: &Args, hosts: &[String], attempts: u32) -> Result<()> {
    let hosts = hosts
        .iter()
        .map(|host| {
            let (name, port) = host
                .rsplit_once(':')
                .with_context(|| format!("{host} is not host:port"))?;
            let port: u16 = port.parse().with_context(|| format!("bad port in {host}"))?;
            Ok((name.to_string(), port))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut session = Session::bind(0)?;
    let connected = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&connected);
    let connector = FailoverConnector::start(session.transport(), hosts, attempts, move |outcome| {
        *sink.borrow_mut() = Some(outcome);
    });
    session.peer.attach(connector);

    let handshake = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&handshake);
    session.peer.attach(ClientHandshake::exact(
        session.transport(),
        session.scheduler.clone(),
        args.version,
        move |outcome| *sink.borrow_mut() = Some(outcome),
    ));

    let finished = {
        let connected = Rc::clone(&connected);
        let handshake = Rc::clone(&handshake);
        move || {
            handshake.borrow().is_some()
                || matches!(*connected.borrow(), Some(FailoverOutcome::Exhausted { .. }))
        }
    };
    session.run_until(Duration::from_secs(30), |_| {}, finished);

    match (*connected.borrow(), handshake.borrow_mut().take()) {
        (Some(FailoverOutcome::Connected(addr)), Some(HandshakeOutcome::Accepted(version))) => {
            println!("{addr} accepted us, running {version}");
        }
        (_, Some(HandshakeOutcome::Mismatch { kind, peer })) => {
            println!("rejected: {kind:?} mismatch, server runs {peer}");
        }
        (_, Some(HandshakeOutcome::ConnectionLost)) => println!("connection lost during handshake"),
        (Some(FailoverOutcome::Exhausted { no_free_slots: true }), _) => {
            println!("every server is full");
        }
        (Some(FailoverOutcome::Exhausted { .. }), _) => println!("no server could be reached"),
        _ => println!("timed out"),
    }
    Ok(())
}
