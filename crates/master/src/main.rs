mod logging;
mod server;
mod tui;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;

use bluebeard::master::MasterConfig;
use logging::LogBuffer;
use server::MasterProcess;
use tui::{TuiState, View};

#[derive(Parser)]
#[command(name = "master-server")]
#[command(about = "Bluebeard master server: server directory and NAT punch-through broker")]
struct Args {
    #[arg(short, long, help = "JSON configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    max_connections: Option<usize>,

    #[arg(long)]
    headless: bool,

    #[arg(short, long)]
    tick_rate: Option<u32>,
}

impl Args {
    fn config(&self) -> Result<MasterConfig> {
        let mut config = match &self.config {
            Some(path) => MasterConfig::load(path)?,
            None => MasterConfig::default(),
        };
        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(rate) = self.tick_rate {
            config.tick_rate = rate;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.config()?;
    let interval = config.tick_interval()?;

    if args.headless {
        logging::init_stderr("info");
        let mut master = MasterProcess::new(&config)?;
        log::info!("Master server started on {}", master.local_addr());
        run_headless(&mut master, interval)?;
        log::info!("Master server shutting down");
    } else {
        let log = LogBuffer::new();
        logging::init_captured("info", &log);
        let mut master = MasterProcess::new(&config)?;
        run_with_tui(&mut master, interval, log)?;
    }

    Ok(())
}

fn run_headless(master: &mut MasterProcess, interval: Duration) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => master.tick_once(),
                result = &mut shutdown => {
                    result?;
                    break;
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

fn run_with_tui(master: &mut MasterProcess, interval: Duration, log: LogBuffer) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut state = TuiState::new(log);
    state.log_info(format!("Master server started on {}", master.local_addr()));

    let mut running = true;
    while running {
        master.tick_once();

        if event::poll(interval)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                            running = false;
                        }
                        KeyCode::Esc => running = false,
                        KeyCode::Tab => state.next_tab(),
                        KeyCode::BackTab => state.prev_tab(),
                        KeyCode::PageUp => state.scroll_up(),
                        KeyCode::PageDown => state.scroll_down(),
                        KeyCode::End => state.scroll_to_bottom(),
                        KeyCode::Backspace => state.pop_char(),
                        KeyCode::Enter => {
                            if let Some(command) = state.take_command() {
                                let output = master.execute(&command);
                                state.show_output(&command, &output);
                            }
                        }
                        KeyCode::Char(c) => state.push_char(c),
                        _ => {}
                    }
                }
            }
        }

        let stats = master.stats();
        let servers = master.servers();
        let punches = master.punch_requests();
        let connections = master.connections();
        let view = View {
            stats: &stats,
            local_addr: master.local_addr(),
            servers: &servers,
            punches: &punches,
            connections: &connections,
        };
        terminal.draw(|frame| tui::render(frame, &state, &view))?;
    }

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(())
}
