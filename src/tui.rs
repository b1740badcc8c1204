use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, Paragraph, Wrap};

use crate::backfill::{ProgressEvent, ProgressSink};
use crate::error::BackfillError;

const EVENTS_MAX: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolve,
    Plan,
    Vegetation,
    Soil,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Resolve => "Resolve",
            Phase::Plan => "Plan",
            Phase::Vegetation => "Vegetation",
            Phase::Soil => "Soil",
        }
    }
}

#[derive(Debug)]
struct RunState {
    status: String,
    phase: Phase,
    chunks_done: usize,
    chunks_total: usize,
    latency_ms: Option<u128>,
    run_elapsed: Option<Duration>,
    requests: u64,
    events: VecDeque<String>,
    started: Instant,
}

impl RunState {
    fn new() -> Self {
        Self {
            status: "starting".to_string(),
            phase: Phase::Resolve,
            chunks_done: 0,
            chunks_total: 0,
            latency_ms: None,
            run_elapsed: None,
            requests: 0,
            events: VecDeque::new(),
            started: Instant::now(),
        }
    }

    fn apply(&mut self, event: ProgressEvent) {
        let message = event.message.trim().to_string();
        if let Some((phase, payload)) = parse_phase(&message) {
            self.phase = phase;
            self.status = payload.to_string();
        } else if let Some(latency) = parse_latency(&message) {
            self.latency_ms = Some(latency);
        } else {
            self.status = message.clone();
        }
        if message.ends_with(".request") {
            self.requests = self.requests.saturating_add(1);
        }
        if let Some((done, total)) = event.chunks {
            self.chunks_done = done;
            self.chunks_total = total;
        }
        if let Some(elapsed) = event.elapsed {
            self.run_elapsed = Some(elapsed);
        }

        self.events
            .push_back(format!("[{}] {message}", Local::now().format("%H:%M:%S")));
        while self.events.len() > EVENTS_MAX {
            self.events.pop_front();
        }
    }

    fn ratio(&self) -> f64 {
        if self.chunks_total == 0 {
            0.0
        } else {
            (self.chunks_done as f64 / self.chunks_total as f64).clamp(0.0, 1.0)
        }
    }

    /// Mean wall time per finished chunk, as reported by the run itself.
    fn per_chunk(&self) -> Option<Duration> {
        let elapsed = self.run_elapsed?;
        let done = u32::try_from(self.chunks_done).ok().filter(|done| *done > 0)?;
        Some(elapsed / done)
    }
}

/// Full-screen progress view for a single backfill run. `q` or `Esc`
/// requests cancellation; the run stops before its next chunk.
pub struct Tui {
    state: Arc<Mutex<RunState>>,
    cancel: Arc<AtomicBool>,
}

struct TuiProgress {
    state: Arc<Mutex<RunState>>,
    cancel: Arc<AtomicBool>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            state.apply(event);
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

impl Default for Tui {
    fn default() -> Self {
        Self::new()
    }
}

impl Tui {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RunState::new())),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, BackfillError> + Send + 'static,
        R: Send + 'static,
    {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
            cancel: self.cancel.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        let result = loop {
            if let Ok(state) = self.state.lock() {
                let cancelling = self.cancel.load(Ordering::SeqCst);
                terminal
                    .draw(|frame| draw_ui(frame, &state, cancelling, tick))
                    .into_diagnostic()?;
            }

            if let Ok(result) = rx.try_recv() {
                break result;
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    self.handle_key(key);
                }
            }
            tick = tick.wrapping_add(1);
        };

        disable_raw_mode().into_diagnostic()?;
        io::stdout()
            .execute(LeaveAlternateScreen)
            .into_diagnostic()?;
        handle.join().ok();
        result.map_err(miette::Report::new)
    }

    fn handle_key(&self, key: KeyEvent) {
        if key.kind != KeyEventKind::Press {
            return;
        }
        if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
            self.cancel.store(true, Ordering::SeqCst);
        }
    }
}

fn draw_ui(frame: &mut ratatui::Frame, state: &RunState, cancelling: bool, tick: usize) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Length(3),
            Constraint::Length(4),
            Constraint::Min(4),
            Constraint::Length(2),
        ])
        .split(frame.area());

    let heartbeat = if tick % 2 == 0 { "*" } else { " " };
    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            "AGRO-BACKFILL",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw("   "),
        Span::styled(heartbeat, Style::default().fg(Color::Green)),
    ]))
    .block(Block::default().borders(Borders::BOTTOM));
    frame.render_widget(header, rows[0]);

    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Chunks"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(state.ratio())
        .label(format!("{}/{}", state.chunks_done, state.chunks_total));
    frame.render_widget(gauge, rows[1]);

    let latency = state
        .latency_ms
        .map(|value| format!("{value} ms"))
        .unwrap_or_else(|| "--".to_string());
    let per_chunk = state
        .per_chunk()
        .map(|value| format!("{} ms", value.as_millis()))
        .unwrap_or_else(|| "--".to_string());
    let status = Paragraph::new(vec![
        Line::from(vec![
            Span::styled("Phase: ", Style::default().fg(Color::Gray)),
            Span::styled(state.phase.label(), Style::default().fg(Color::Cyan)),
            Span::styled("   Elapsed: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{}s", state.started.elapsed().as_secs())),
            Span::styled("   Per chunk: ", Style::default().fg(Color::Gray)),
            Span::raw(per_chunk),
        ]),
        Line::from(vec![
            Span::styled("Requests: ", Style::default().fg(Color::Gray)),
            Span::raw(state.requests.to_string()),
            Span::styled("   Last latency: ", Style::default().fg(Color::Gray)),
            Span::raw(latency),
        ]),
        Line::from(vec![
            Span::styled("Status: ", Style::default().fg(Color::Gray)),
            Span::raw(state.status.clone()),
        ]),
    ])
    .wrap(Wrap { trim: true });
    frame.render_widget(status, rows[2]);

    let mut lines = vec![Line::from(Span::styled(
        "EVENTS",
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    ))];
    lines.extend(state.events.iter().map(|event| Line::from(event.clone())));
    let events = Paragraph::new(lines)
        .block(Block::default().borders(Borders::TOP))
        .wrap(Wrap { trim: true });
    frame.render_widget(events, rows[3]);

    let footer = if cancelling {
        Span::styled(
            "cancelling after current chunk...",
            Style::default().fg(Color::Yellow),
        )
    } else {
        Span::styled("q / Esc: cancel", Style::default().fg(Color::DarkGray))
    };
    frame.render_widget(
        Paragraph::new(Line::from(footer)).alignment(Alignment::Left),
        rows[4],
    );
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (name, payload) = rest.split_once(';')?;
    let phase = match name {
        "Resolve" => Phase::Resolve,
        "Plan" => Phase::Plan,
        "Vegetation" => Phase::Vegetation,
        "Soil" => Phase::Soil,
        _ => return None,
    };
    Some((phase, payload.trim()))
}

fn parse_latency(message: &str) -> Option<u128> {
    message
        .split("latency_ms=")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse::<u128>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_phase_messages() {
        assert_eq!(
            parse_phase("phase=Soil; chunk [2024-01-01, 2024-01-10]"),
            Some((Phase::Soil, "chunk [2024-01-01, 2024-01-10]"))
        );
        assert_eq!(parse_phase("phase=Unknown; x"), None);
        assert_eq!(parse_phase("vegetation.request"), None);
    }

    #[test]
    fn parses_latency() {
        assert_eq!(parse_latency("soil.response latency_ms=42"), Some(42));
        assert_eq!(parse_latency("soil.response"), None);
    }

    #[test]
    fn tracks_chunk_progress_and_requests() {
        let mut state = RunState::new();
        state.apply(ProgressEvent {
            message: "phase=Plan; 3 chunks of up to 10 days".to_string(),
            elapsed: None,
            chunks: Some((0, 3)),
        });
        state.apply(ProgressEvent::message("vegetation.request"));
        state.apply(ProgressEvent::message("vegetation.response latency_ms=15"));
        state.apply(ProgressEvent {
            message: "chunk [2024-01-01, 2024-01-10] done".to_string(),
            elapsed: None,
            chunks: Some((1, 3)),
        });

        assert_eq!(state.phase, Phase::Plan);
        assert_eq!(state.requests, 1);
        assert_eq!(state.latency_ms, Some(15));
        assert_eq!((state.chunks_done, state.chunks_total), (1, 3));
        assert!((state.ratio() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn per_chunk_time_comes_from_run_elapsed() {
        let mut state = RunState::new();
        assert_eq!(state.per_chunk(), None);

        state.apply(ProgressEvent {
            message: "chunk [2024-01-01, 2024-01-10] done".to_string(),
            elapsed: Some(Duration::from_millis(900)),
            chunks: Some((1, 3)),
        });
        state.apply(ProgressEvent::message("soil.request"));
        state.apply(ProgressEvent {
            message: "chunk [2024-01-11, 2024-01-20] done".to_string(),
            elapsed: Some(Duration::from_millis(1500)),
            chunks: Some((2, 3)),
        });

        assert_eq!(state.run_elapsed, Some(Duration::from_millis(1500)));
        assert_eq!(state.per_chunk(), Some(Duration::from_millis(750)));
    }
}
