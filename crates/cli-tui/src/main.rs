use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use engine::{
    config::EncoderConfig,
    coordinator::{EncodingCoordinator, Notice},
    ffmpeg::FfmpegEncoder,
    ffprobe::FfprobeProbe,
    job::{Job, JobId, JobStatus},
    scan::{self, ScanResult},
    store::{ChangeKind, ChannelObserver, JobStore, StoreEvent},
};
use humansize::{format_size, DECIMAL};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::{broadcast, mpsc};

/// How long a notice stays in the status bar.
const NOTICE_TTL: Duration = Duration::from_secs(6);
const SYSTEM_REFRESH: Duration = Duration::from_secs(1);

/// Live HEVC batch encoder
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Video files or directories to encode
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Concurrent encodes (overrides config)
    #[arg(short, long)]
    workers: Option<usize>,
}

/// Label and colour shown for a job status.
fn status_presentation(status: JobStatus) -> (&'static str, Color) {
    match status {
        JobStatus::Pending => ("WAIT", Color::Gray),
        JobStatus::Encoding => ("ENC", Color::Yellow),
        JobStatus::Completed => ("OK", Color::Green),
        JobStatus::Failed => ("FAIL", Color::Red),
    }
}

/// UI-side copy of one job, patched from store events.
#[derive(Debug, Clone)]
struct JobRow {
    id: JobId,
    file_name: String,
    output_path: PathBuf,
    duration_ms: u64,
    status: JobStatus,
    progress: u8,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    output_bytes: Option<u64>,
    reason: Option<String>,
}

impl JobRow {
    fn from_job(job: &Job) -> Self {
        let mut row = Self {
            id: job.id(),
            file_name: job.file_name().to_string(),
            output_path: job.output_path().to_path_buf(),
            duration_ms: job.duration_ms(),
            status: job.status(),
            progress: job.progress(),
            started_at: None,
            finished_at: None,
            output_bytes: None,
            reason: None,
        };
        row.apply_status(job);
        row
    }

    fn apply_status(&mut self, job: &Job) {
        self.status = job.status();
        self.started_at = job.started_at();
        self.finished_at = job.finished_at();
        self.reason = job.failure_reason().map(str::to_string);
        if self.status == JobStatus::Completed {
            self.output_bytes = std::fs::metadata(&self.output_path).ok().map(|m| m.len());
        }
    }

    fn apply_progress(&mut self, job: &Job) {
        self.progress = job.progress();
    }

    fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.finished_at.unwrap_or(now) - started)
    }
}

struct App {
    coordinator: EncodingCoordinator,
    rows: Vec<JobRow>,
    events: mpsc::UnboundedReceiver<StoreEvent>,
    notices: broadcast::Receiver<Notice>,
    notice: Option<(String, Instant)>,
    system: System,
    last_system_refresh: Option<Instant>,
    table_state: TableState,
    should_quit: bool,
}

impl App {
    fn new(coordinator: EncodingCoordinator) -> Self {
        let (observer, events) = ChannelObserver::channel();
        coordinator.store().subscribe(observer);
        let notices = coordinator.subscribe_notices();

        Self {
            coordinator,
            rows: Vec::new(),
            events,
            notices,
            notice: None,
            system: System::new(),
            last_system_refresh: None,
            table_state: TableState::default(),
            should_quit: false,
        }
    }

    /// Drain pending store events and notices. Runs on the UI thread only.
    fn refresh(&mut self) {
        let store = Arc::clone(self.coordinator.store());
        while let Ok(event) = self.events.try_recv() {
            apply_event(&mut self.rows, &store, event);
        }
        if self.table_state.selected().is_none() && !self.rows.is_empty() {
            self.table_state.select(Some(0));
        }

        loop {
            match self.notices.try_recv() {
                Ok(notice) => self.notice = Some((notice.to_string(), Instant::now())),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        if matches!(&self.notice, Some((_, shown)) if shown.elapsed() > NOTICE_TTL) {
            self.notice = None;
        }

        let due = self
            .last_system_refresh
            .map_or(true, |at| at.elapsed() >= SYSTEM_REFRESH);
        if due {
            self.system.refresh_cpu_usage();
            self.system.refresh_memory();
            self.last_system_refresh = Some(Instant::now());
        }
    }

    fn select_next(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let next = match self.table_state.selected() {
            Some(i) if i + 1 < self.rows.len() => i + 1,
            Some(i) => i,
            None => 0,
        };
        self.table_state.select(Some(next));
    }

    fn select_previous(&mut self) {
        let previous = self.table_state.selected().map_or(0, |i| i.saturating_sub(1));
        self.table_state.select(Some(previous));
    }

    fn cancel_selected(&mut self) {
        let Some(row) = self.table_state.selected().and_then(|i| self.rows.get(i)) else {
            return;
        };
        if !self.coordinator.cancel(row.id) {
            self.notice = Some((
                format!("{} is not running", row.file_name),
                Instant::now(),
            ));
        }
    }

    fn count_by_status(&self, status: JobStatus) -> usize {
        self.rows.iter().filter(|r| r.status == status).count()
    }
}

/// Patch the row an event refers to, touching only what changed.
fn apply_event(rows: &mut Vec<JobRow>, store: &JobStore, event: StoreEvent) {
    match event {
        StoreEvent::Inserted { index } => {
            if let Some(job) = store.job_at(index) {
                // Inserts arrive in index order.
                if index == rows.len() {
                    rows.push(JobRow::from_job(&job));
                }
            }
        }
        StoreEvent::Changed { index, kind } => {
            let (Some(row), Some(job)) = (rows.get_mut(index), store.job_at(index)) else {
                return;
            };
            match kind {
                ChangeKind::Status => row.apply_status(&job),
                ChangeKind::Progress => row.apply_progress(&job),
                ChangeKind::Both => {
                    row.apply_status(&job);
                    row.apply_progress(&job);
                }
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = EncoderConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if args.workers.is_some() {
        cfg.workers = args.workers;
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let encoder = runtime
        .block_on(FfmpegEncoder::new(&cfg))
        .context("ffmpeg is not usable")?;
    let coordinator =
        EncodingCoordinator::new(&cfg, Arc::new(encoder), Arc::new(FfprobeProbe::new(&cfg)));

    let inputs: Vec<PathBuf> = scan::expand_inputs(&args.paths, &cfg.output_suffix)
        .into_iter()
        .filter_map(|r| match r {
            ScanResult::Input(path) => Some(path),
            ScanResult::Skipped(..) => None,
        })
        .collect();

    // Subscribe before anything is submitted so no insert is missed.
    let mut app = App::new(coordinator.clone());
    let submitter = coordinator.clone();
    let submission = runtime.spawn(async move { submitter.submit(&inputs).await });

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, &mut app);

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    coordinator.cancel_all();
    runtime.block_on(async {
        // Stops before its next input once cancel_all has run.
        let _ = submission.await;
        coordinator.wait_idle().await;
    });
    result
}

fn run(terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>, app: &mut App) -> Result<()> {
    use crossterm::event::{self, Event, KeyCode};

    loop {
        app.refresh();
        terminal.draw(|f| ui(f, app))?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Char('q') => app.should_quit = true,
                    KeyCode::Char('c') => app.cancel_selected(),
                    KeyCode::Down => app.select_next(),
                    KeyCode::Up => app.select_previous(),
                    _ => {}
                }
            }
        }

        if app.should_quit {
            return Ok(());
        }
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(3),
        ])
        .split(size);

    render_top_bar(f, app, chunks[0]);
    render_job_table(f, app, chunks[1]);
    render_status_bar(f, app, chunks[2]);
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);
    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(app.system.used_memory() as f64 / total_memory as f64 * 100.0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    let header = Row::new(vec!["ST", "FILE", "PROG", "LEN", "TIME", "SIZE", "REASON"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let now = Utc::now();
    let rows: Vec<Row> = app
        .rows
        .iter()
        .map(|row| {
            let (label, color) = status_presentation(row.status);
            let length = if row.duration_ms == 0 {
                "?".to_string()
            } else {
                format_clock(row.duration_ms / 1000)
            };
            let elapsed = row
                .elapsed(now)
                .map(|d| format_clock(d.num_seconds().max(0) as u64))
                .unwrap_or_else(|| "-".to_string());
            let size = row
                .output_bytes
                .map(|b| format_size(b, DECIMAL))
                .unwrap_or_else(|| "-".to_string());

            Row::new(vec![
                label.to_string(),
                truncate_string(&row.file_name, 50),
                format!("{:>3}%", row.progress),
                length,
                elapsed,
                size,
                truncate_string(row.reason.as_deref().unwrap_or("-"), 30),
            ])
            .style(Style::default().fg(color))
            .height(1)
        })
        .collect();

    let widths = [
        Constraint::Length(5),
        Constraint::Percentage(40),
        Constraint::Length(5),
        Constraint::Length(8),
        Constraint::Length(8),
        Constraint::Length(9),
        Constraint::Percentage(24),
    ];

    let title = format!("Jobs ({})", app.rows.len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let text = match &app.notice {
        Some((notice, _)) => notice.clone(),
        None => format!(
            "Encoding: {} | Waiting: {} | Done: {} | Failed: {} | workers={} | q=quit c=cancel",
            app.count_by_status(JobStatus::Encoding),
            app.count_by_status(JobStatus::Pending),
            app.count_by_status(JobStatus::Completed),
            app.count_by_status(JobStatus::Failed),
            app.coordinator.workers(),
        ),
    };
    let style = if app.notice.is_some() {
        Style::default().add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };

    let paragraph = Paragraph::new(text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .style(style)
        .wrap(ratatui::widgets::Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn format_clock(total_secs: u64) -> String {
    let (h, m, s) = (total_secs / 3600, total_secs / 60 % 60, total_secs % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
