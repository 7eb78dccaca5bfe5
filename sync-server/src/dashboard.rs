//! Terminal dashboard for the sync server

use crate::config::ServerConfig;
use crate::metrics::{truncate_video_id, LogLevel, Metrics, ServerStatus};
use crate::network::{self, ServerEvent};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use parking_lot::RwLock;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{
        Block, Borders, List, ListItem, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState,
    },
    Frame, Terminal,
};
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Log view scrolling
#[derive(Debug)]
struct DashboardState {
    /// 0 = newest entry at the bottom
    log_scroll: usize,
    auto_scroll: bool,
}

impl DashboardState {
    fn new() -> Self {
        Self {
            log_scroll: 0,
            auto_scroll: true,
        }
    }

    fn scroll_up(&mut self, lines: usize, log_count: usize) {
        if log_count > 0 {
            self.log_scroll = (self.log_scroll + lines).min(log_count - 1);
            self.auto_scroll = false;
        }
    }

    fn scroll_down(&mut self, lines: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(lines);
        if self.log_scroll == 0 {
            self.auto_scroll = true;
        }
    }

    /// Returns true when the dashboard should exit
    fn handle_key(&mut self, key: KeyEvent, log_count: usize) -> bool {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return true,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return true,
            KeyCode::Up | KeyCode::Char('k') => self.scroll_up(1, log_count),
            KeyCode::Down | KeyCode::Char('j') => self.scroll_down(1),
            KeyCode::PageUp => self.scroll_up(10, log_count),
            KeyCode::PageDown => self.scroll_down(10),
            KeyCode::Home => self.scroll_up(log_count, log_count),
            KeyCode::End => self.scroll_down(usize::MAX),
            KeyCode::Char('a') => {
                self.auto_scroll = !self.auto_scroll;
                if self.auto_scroll {
                    self.log_scroll = 0;
                }
            }
            _ => {}
        }
        false
    }
}

/// Run the dashboard
pub async fn run(
    config: ServerConfig,
    metrics: Arc<RwLock<Metrics>>,
) -> Result<(), Box<dyn std::error::Error>> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Start the server in background
    let metrics_for_network = Arc::clone(&metrics);
    tokio::spawn(async move {
        if let Err(e) = network::run_with_dashboard(config, metrics_for_network, event_tx).await {
            eprintln!("Server error: {}", e);
        }
    });

    let mut state = DashboardState::new();
    let tick_rate = Duration::from_millis(100);

    loop {
        while let Ok(event) = event_rx.try_recv() {
            match event {
                ServerEvent::Ready { addr } => metrics
                    .write()
                    .log(LogLevel::Info, format!("Viewers connect to ws://{}/ws", addr)),
                ServerEvent::Failed(reason) => metrics
                    .write()
                    .log(LogLevel::Error, format!("Server stopped: {}", reason)),
            }
            if state.auto_scroll {
                state.log_scroll = 0;
            }
        }

        terminal.draw(|f| draw(f, &metrics, &state))?;

        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let log_count = metrics.read().logs.len();
                    if state.handle_key(key, log_count) {
                        break;
                    }
                }
            }
        }
    }

    // Cleanup
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    Ok(())
}

fn draw(f: &mut Frame, metrics: &Arc<RwLock<Metrics>>, state: &DashboardState) {
    let m = metrics.read();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(7), // Stats
            Constraint::Min(10),   // Sessions + logs
            Constraint::Length(1), // Footer
        ])
        .split(f.area());

    draw_header(f, chunks[0], &m);
    draw_stats(f, chunks[1], &m);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(48), Constraint::Min(20)])
        .split(chunks[2]);
    draw_sessions(f, body[0], &m);
    draw_logs(f, body[1], &m, state);

    draw_footer(f, chunks[3], state);
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let (status_text, status_color) = match m.status {
        ServerStatus::Starting => ("STARTING", Color::Yellow),
        ServerStatus::Running => ("RUNNING", Color::Green),
        ServerStatus::Error => ("ERROR", Color::Red),
    };

    let title = Line::from(vec![
        Span::styled("watchsync server", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  │  Status: "),
        Span::styled(status_text, Style::default().fg(status_color)),
        Span::raw("  │  Uptime: "),
        Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
    ]);

    let header = Paragraph::new(title)
        .block(Block::default().borders(Borders::ALL).title(" Dashboard "));
    f.render_widget(header, area);
}

fn labeled<'a>(label: &'a str, value: String, color: Color) -> Line<'a> {
    Line::from(vec![
        Span::raw(label),
        Span::styled(value, Style::default().fg(color)),
    ])
}

fn draw_stats(f: &mut Frame, area: Rect, m: &Metrics) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(30),
            Constraint::Percentage(35),
            Constraint::Percentage(35),
        ])
        .split(area);

    let server_info = vec![
        labeled(
            "Listening: ",
            m.bind_addr.clone().unwrap_or_else(|| "...".to_string()),
            Color::Cyan,
        ),
        labeled(
            "Snapshot: ",
            m.snapshot_path.clone().unwrap_or_else(|| "memory only".to_string()),
            Color::Yellow,
        ),
        labeled(
            "Saves: ",
            format!("{} ok / {} failed", m.saves_ok, m.saves_failed),
            if m.saves_failed > 0 { Color::Red } else { Color::Green },
        ),
    ];
    let server_block = Paragraph::new(server_info)
        .block(Block::default().borders(Borders::ALL).title(" Server "));
    f.render_widget(server_block, chunks[0]);

    let room_info = match &m.room {
        Some(room) => vec![
            labeled("Video: ", truncate_video_id(&room.video_id), Color::Magenta),
            labeled(
                "State: ",
                if room.is_playing { "playing" } else { "paused" }.to_string(),
                if room.is_playing { Color::Green } else { Color::Yellow },
            ),
            labeled("Last event at: ", format!("{:.1}s", room.position), Color::Cyan),
        ],
        None => vec![Line::from(Span::styled(
            "No video yet",
            Style::default().fg(Color::DarkGray),
        ))],
    };
    let room_block = Paragraph::new(room_info)
        .block(Block::default().borders(Borders::ALL).title(" Room "));
    f.render_widget(room_block, chunks[1]);

    let event_info = vec![
        labeled(
            "Play/Pause/Seek: ",
            format!("{}/{}/{}", m.plays_applied, m.pauses_applied, m.seeks_applied),
            Color::Green,
        ),
        labeled("Rejected: ", m.events_rejected.to_string(), Color::Red),
        labeled("Delivered: ", m.messages_broadcast.to_string(), Color::Cyan),
    ];
    let event_block = Paragraph::new(event_info).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Events ({}) ", m.total_events())),
    );
    f.render_widget(event_block, chunks[2]);
}

fn draw_sessions(f: &mut Frame, area: Rect, m: &Metrics) {
    let items: Vec<ListItem> = m
        .session_list
        .iter()
        .map(|s| {
            ListItem::new(Line::from(vec![
                Span::styled(format!("#{:<4}", s.id), Style::default().fg(Color::Green)),
                Span::styled(
                    s.connected_at.format("%H:%M ").to_string(),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::raw(format!("{:>3} ev ", s.events_sent)),
                Span::styled(
                    s.remote.clone().unwrap_or_default(),
                    Style::default().fg(Color::DarkGray),
                ),
            ]))
        })
        .collect();

    let title = format!(
        " Sessions {} (peak {}, total {}) ",
        m.connected_sessions, m.peak_connections, m.total_connections
    );
    let list = List::new(items).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(list, area);
}

fn draw_logs(f: &mut Frame, area: Rect, m: &Metrics, state: &DashboardState) {
    let visible_height = area.height.saturating_sub(2) as usize;
    let total_logs = m.logs.len();

    let log_items: Vec<ListItem> = m
        .logs
        .iter()
        .rev()
        .skip(state.log_scroll)
        .take(visible_height)
        .map(|entry| {
            let level_style = match entry.level {
                LogLevel::Info => Style::default().fg(Color::Blue),
                LogLevel::Warning => Style::default().fg(Color::Yellow),
                LogLevel::Error => Style::default().fg(Color::Red),
                LogLevel::Connection => Style::default().fg(Color::Green),
                LogLevel::Event => Style::default().fg(Color::Magenta),
            };

            ListItem::new(Line::from(vec![
                Span::styled(
                    entry.timestamp.format("%H:%M:%S ").to_string(),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(format!("[{}] ", entry.level.as_str()), level_style),
                Span::raw(&entry.message),
            ]))
        })
        .collect();

    let scroll_indicator = if state.auto_scroll {
        " [AUTO] ".to_string()
    } else if total_logs > 0 {
        format!(" [{}/{}] ", total_logs - state.log_scroll, total_logs)
    } else {
        String::new()
    };

    let logs = List::new(log_items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Activity Log{}", scroll_indicator)),
    );
    f.render_widget(logs, area);

    if total_logs > visible_height {
        let scrollbar = Scrollbar::new(ScrollbarOrientation::VerticalRight)
            .begin_symbol(Some("↑"))
            .end_symbol(Some("↓"));
        let mut scrollbar_state = ScrollbarState::new(total_logs)
            .position(total_logs.saturating_sub(state.log_scroll + visible_height));
        f.render_stateful_widget(
            scrollbar,
            area.inner(ratatui::layout::Margin { vertical: 1, horizontal: 0 }),
            &mut scrollbar_state,
        );
    }
}

fn draw_footer(f: &mut Frame, area: Rect, state: &DashboardState) {
    let key = Style::default().fg(Color::Black).bg(Color::White);
    let (auto_text, auto_color) = if state.auto_scroll {
        ("ON ", Color::Green)
    } else {
        ("OFF", Color::Yellow)
    };

    let footer = Paragraph::new(Line::from(vec![
        Span::styled(" Q ", key),
        Span::raw(" Quit  "),
        Span::styled(" ↑↓ ", key),
        Span::raw(" Scroll  "),
        Span::styled(" PgUp/Dn ", key),
        Span::raw(" Page  "),
        Span::styled(" A ", key),
        Span::raw(" Auto-scroll: "),
        Span::styled(auto_text, Style::default().fg(auto_color)),
    ]));
    f.render_widget(footer, area);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn test_scrolling_disables_auto_scroll() {
        let mut state = DashboardState::new();
        assert!(!state.handle_key(press(KeyCode::Up), 50));
        assert_eq!(state.log_scroll, 1);
        assert!(!state.auto_scroll);

        state.handle_key(press(KeyCode::PageUp), 50);
        assert_eq!(state.log_scroll, 11);

        state.handle_key(press(KeyCode::Home), 50);
        assert_eq!(state.log_scroll, 49);

        state.handle_key(press(KeyCode::End), 50);
        assert_eq!(state.log_scroll, 0);
        assert!(state.auto_scroll);
    }

    #[test]
    fn test_scroll_with_no_logs() {
        let mut state = DashboardState::new();
        state.handle_key(press(KeyCode::Up), 0);
        assert_eq!(state.log_scroll, 0);
        assert!(state.auto_scroll);
    }

    #[test]
    fn test_quit_keys() {
        let mut state = DashboardState::new();
        assert!(state.handle_key(press(KeyCode::Char('q')), 0));
        assert!(state.handle_key(press(KeyCode::Esc), 0));
        assert!(state.handle_key(
            KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL),
            0
        ));
        assert!(!state.handle_key(press(KeyCode::Char('c')), 0));
    }
}
