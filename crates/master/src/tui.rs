use std::net::SocketAddr;

use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Tabs};

use bluebeard::master::{PunchRequest, ServerEntry};

use crate::logging::LogBuffer;
use crate::server::MasterStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Log,
    Servers,
    Connections,
}

impl Tab {
    const ALL: [Tab; 3] = [Tab::Log, Tab::Servers, Tab::Connections];

    fn title(self) -> &'static str {
        match self {
            Tab::Log => "Log",
            Tab::Servers => "Servers",
            Tab::Connections => "Connections",
        }
    }

    fn index(self) -> usize {
        Self::ALL.iter().position(|t| *t == self).unwrap_or(0)
    }
}

pub struct TuiState {
    log: LogBuffer,
    tab: Tab,
    scroll: usize,
    input: String,
}

/// What the render pass needs from the broker, gathered once per frame.
pub struct View<'a> {
    pub stats: &'a MasterStats,
    pub local_addr: SocketAddr,
    pub servers: &'a [ServerEntry],
    pub punches: &'a [PunchRequest],
    pub connections: &'a [SocketAddr],
}

impl TuiState {
    pub fn new(log: LogBuffer) -> Self {
        Self {
            log,
            tab: Tab::Log,
            scroll: 0,
            input: String::new(),
        }
    }

    pub fn log_info(&self, message: impl Into<String>) {
        self.log.push(message);
    }

    pub fn next_tab(&mut self) {
        self.tab = Tab::ALL[(self.tab.index() + 1) % Tab::ALL.len()];
        self.scroll = 0;
    }

    pub fn prev_tab(&mut self) {
        self.tab = Tab::ALL[(self.tab.index() + Tab::ALL.len() - 1) % Tab::ALL.len()];
        self.scroll = 0;
    }

    pub fn scroll_up(&mut self) {
        self.scroll = self.scroll.saturating_add(10);
    }

    pub fn scroll_down(&mut self) {
        self.scroll = self.scroll.saturating_sub(10);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll = 0;
    }

    pub fn push_char(&mut self, c: char) {
        self.input.push(c);
    }

    pub fn pop_char(&mut self) {
        self.input.pop();
    }

    /// Empties the input line and returns its command, if any.
    pub fn take_command(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.input);
        let line = line.trim();
        (!line.is_empty()).then(|| line.to_string())
    }

    /// Command output goes to the log tab.
    pub fn show_output(&mut self, command: &str, output: &str) {
        self.log.push(format!("> {command}"));
        for line in output.lines() {
            self.log.push(line.to_string());
        }
        self.tab = Tab::Log;
        self.scroll = 0;
    }
}

pub fn render(frame: &mut Frame, state: &TuiState, view: &View<'_>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], view);
    render_tabs(frame, chunks[1], state.tab);
    match state.tab {
        Tab::Log => render_log(frame, chunks[2], state),
        Tab::Servers => render_servers(frame, chunks[2], view.servers, state.scroll),
        Tab::Connections => render_connections(frame, chunks[2], view),
    }
    render_input(frame, chunks[3], &state.input);
}

fn render_header(frame: &mut Frame, area: Rect, view: &View<'_>) {
    let stats = view.stats;
    let title = format!(
        " Bluebeard Master - {} - Uptime: {} ",
        view.local_addr,
        format_duration(stats.uptime_secs)
    );

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let text = format!(
        "Servers: {}  |  Contacts: {}  |  Tasks: {}  |  Packets: {} sent / {} recv",
        stats.server_count,
        stats.contact_count,
        stats.task_count,
        stats.network.packets_sent,
        stats.network.packets_received
    );

    let paragraph = Paragraph::new(text)
        .block(block)
        .style(Style::default().fg(Color::White));
    frame.render_widget(paragraph, area);
}

fn render_tabs(frame: &mut Frame, area: Rect, active: Tab) {
    let tabs = Tabs::new(Tab::ALL.iter().map(|t| t.title()))
        .block(Block::default().borders(Borders::ALL))
        .select(active.index())
        .style(Style::default().fg(Color::Gray))
        .highlight_style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        );
    frame.render_widget(tabs, area);
}

/// Last lines that fit, `scroll` lines up from the bottom.
fn visible<T>(items: &[T], height: usize, scroll: usize) -> &[T] {
    let end = items.len().saturating_sub(scroll);
    let start = end.saturating_sub(height);
    &items[start..end]
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default()
        .title(" Log ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let lines = state.log.snapshot();
    let height = area.height.saturating_sub(2) as usize;
    let shown: Vec<Line> = visible(&lines, height, state.scroll)
        .iter()
        .map(|line| {
            let color = if line.contains("ERROR") {
                Color::Red
            } else if line.contains("WARN") {
                Color::Yellow
            } else {
                Color::White
            };
            Line::from(Span::styled(line.clone(), Style::default().fg(color)))
        })
        .collect();

    frame.render_widget(Paragraph::new(shown).block(block), area);
}

fn render_servers(frame: &mut Frame, area: Rect, servers: &[ServerEntry], scroll: usize) {
    let block = Block::default()
        .title(format!(" Servers ({}) ", servers.len()))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let height = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = visible(servers, height, scroll)
        .iter()
        .map(|entry| {
            Line::from(vec![
                Span::styled(
                    format!("{:<24}", entry.info.name),
                    Style::default().fg(Color::White),
                ),
                Span::styled(
                    format!(
                        " {}/{} {} {} ",
                        entry.info.num_players,
                        entry.info.max_players,
                        entry.info.version,
                        entry.info.level_name
                    ),
                    Style::default().fg(Color::Gray),
                ),
                Span::styled(
                    format!("{} via {}", entry.info.address, entry.external),
                    Style::default().fg(Color::DarkGray),
                ),
            ])
        })
        .collect();

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_connections(frame: &mut Frame, area: Rect, view: &View<'_>) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let punches: Vec<Line> = view
        .punches
        .iter()
        .map(|request| Line::from(request.to_string()))
        .collect();
    let block = Block::default()
        .title(format!(" Punch-through requests ({}) ", view.punches.len()))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Magenta));
    frame.render_widget(Paragraph::new(punches).block(block), columns[0]);

    let connections: Vec<Line> = view
        .connections
        .iter()
        .map(|addr| Line::from(addr.to_string()))
        .collect();
    let block = Block::default()
        .title(format!(" Connections ({}) ", view.connections.len()))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Magenta));
    frame.render_widget(Paragraph::new(connections).block(block), columns[1]);
}

fn render_input(frame: &mut Frame, area: Rect, input: &str) {
    let block = Block::default()
        .title(" Console (Enter to run, Tab to switch, Esc to quit) ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let line = Line::from(vec![
        Span::styled("> ", Style::default().fg(Color::Cyan)),
        Span::styled(input.to_string(), Style::default().fg(Color::White)),
    ]);
    frame.render_widget(Paragraph::new(line).block(block), area);
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, secs)
}
