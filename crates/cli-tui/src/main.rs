use anyhow::{Context, Result};
use clap::Parser;
use humansize::{format_size, DECIMAL};
use pipeline::{
    commands::{self, Command},
    job::{load_all_jobs, Job, JobKind, JobStatus},
    PipelineConfig,
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::Line,
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use sysinfo::System;

const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

struct App {
    jobs: Vec<Job>,
    system: System,
    table_state: TableState,
    should_quit: bool,
    jobs_dir: PathBuf,
    commands_dir: PathBuf,
    log_tail: usize,
    message: Option<String>,
}

impl App {
    fn new(cfg: &PipelineConfig) -> Self {
        Self {
            jobs: Vec::new(),
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
            jobs_dir: cfg.jobs_dir(),
            commands_dir: cfg.commands_dir(),
            log_tail: cfg.status_log_tail,
            message: None,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let selected_id = self.selected().map(|j| j.id);
        match load_all_jobs(&self.jobs_dir) {
            Ok(jobs) => {
                self.jobs = jobs;
                // newest first
                self.jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
            Err(e) => {
                self.message = Some(format!("Failed to load jobs: {:#}", e));
                self.jobs = Vec::new();
            }
        }

        // keep the cursor on the same job across reloads
        let index = selected_id
            .and_then(|id| self.jobs.iter().position(|j| j.id == id))
            .or(if self.jobs.is_empty() { None } else { Some(0) });
        self.table_state.select(index);
    }

    fn selected(&self) -> Option<&Job> {
        self.table_state.selected().and_then(|i| self.jobs.get(i))
    }

    fn move_selection(&mut self, delta: isize) {
        if self.jobs.is_empty() {
            return;
        }
        let current = self.table_state.selected().unwrap_or(0) as isize;
        let last = self.jobs.len() as isize - 1;
        self.table_state.select(Some((current + delta).clamp(0, last) as usize));
    }

    /// Queue a cancel command for the daemon
    fn request_cancel(&mut self) {
        let Some(job) = self.selected() else {
            return;
        };
        if job.status.is_terminal() {
            self.message = Some(format!("Job {} already {}", short_id(job), job.status));
            return;
        }
        let id = job.id;
        self.message = Some(match commands::submit(&self.commands_dir, Command::Cancel { job_id: id }) {
            Ok(_) => format!("Cancel requested for {}", id),
            Err(e) => format!("Cancel failed: {:#}", e),
        });
    }

    fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}

/// Gallery pipeline job monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Same default location as the daemon when no config is given
    let default_config_path = PathBuf::from("/etc/galleryd/config.json");
    let config_path = if let Some(ref path) = args.config {
        Some(path.as_path())
    } else if default_config_path.exists() {
        Some(default_config_path.as_path())
    } else {
        None
    };

    let cfg = PipelineConfig::load_config(config_path).context("Failed to load configuration")?;

    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(&cfg);
    let result = run(&mut terminal, &mut app);

    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    result
}

fn run<B: ratatui::backend::Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<()> {
    let mut last_refresh: Option<Instant> = None;

    loop {
        if last_refresh.map_or(true, |at| at.elapsed() >= REFRESH_INTERVAL) {
            app.refresh();
            last_refresh = Some(Instant::now());
        }

        terminal.draw(|f| ui(f, app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                use crossterm::event::KeyCode;
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => app.should_quit = true,
                    KeyCode::Char('r') => last_refresh = None,
                    KeyCode::Char('c') => app.request_cancel(),
                    KeyCode::Up | KeyCode::Char('k') => app.move_selection(-1),
                    KeyCode::Down | KeyCode::Char('j') => app.move_selection(1),
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

    if size.height < 16 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x16.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Percentage(45),
            Constraint::Min(6),
            Constraint::Length(3),
        ])
        .split(size);

    render_top_bar(f, app, chunks[0]);
    render_job_table(f, app, chunks[1]);
    render_detail(f, app, chunks[2]);
    render_status_bar(f, app, chunks[3]);
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);
    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(app.system.used_memory() as f64 / total_memory as f64 * 100.0)
    };
    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    let header = Row::new(vec!["ST", "ID", "KIND", "SCOPE", "PROGRESS", "OK", "FAIL", "SKIP", "TIME", "REASON"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let rows: Vec<Row> = if app.jobs.is_empty() {
        vec![Row::new(vec![
            "-".to_string(),
            "No jobs".to_string(),
            format!("Dir: {}", app.jobs_dir.display()),
        ])]
    } else {
        app.jobs
            .iter()
            .map(|job| {
                let c = job.counters;
                let kind = match job.kind {
                    JobKind::RebuildPreviews => "rebuild",
                    JobKind::ScanDuplicates => "dedupe",
                };
                let time = job
                    .elapsed()
                    .map(|d| format!("{}s", d.num_seconds()))
                    .unwrap_or_else(|| "-".to_string());
                Row::new(vec![
                    status_label(job).to_string(),
                    short_id(job),
                    kind.to_string(),
                    truncate_string(&job.scope.to_string(), 20),
                    format!("{}/{}", c.processed, c.total),
                    c.succeeded.to_string(),
                    c.failed.to_string(),
                    c.skipped.to_string(),
                    time,
                    truncate_string(job.reason.as_deref().unwrap_or("-"), 40),
                ])
                .style(Style::default().fg(status_color(job.status)))
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Length(8),
        Constraint::Length(7),
        Constraint::Percentage(20),
        Constraint::Length(11),
        Constraint::Length(6),
        Constraint::Length(5),
        Constraint::Length(5),
        Constraint::Length(7),
        Constraint::Percentage(30),
    ];

    let running = app.count_by_status(JobStatus::Running);
    let table = Table::new(rows, widths)
        .header(header)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("Jobs ({}, {} running)", app.jobs.len(), running)),
        )
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_detail(f: &mut Frame, app: &App, area: Rect) {
    let Some(job) = app.selected() else {
        let empty = Paragraph::new("No job selected").block(Block::default().borders(Borders::ALL).title("Log"));
        f.render_widget(empty, area);
        return;
    };

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(3)])
        .split(area);

    let fraction = job.counters.fraction();
    let mut title = format!("{} {} over {}", job.id, job.kind, job.scope);
    if job.cancel_requested && !job.status.is_terminal() {
        title.push_str(" (cancelling)");
    }
    if let Some(report) = &job.duplicates {
        title.push_str(&format!(
            " - {} groups, {} reclaimable",
            report.groups.len(),
            format_size(report.reclaimable_bytes, DECIMAL)
        ));
    }
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .gauge_style(Style::default().fg(status_color(job.status)))
        .ratio(fraction)
        .label(format!(
            "{:.0}% ({}/{})",
            fraction * 100.0,
            job.counters.processed,
            job.counters.total
        ));
    f.render_widget(gauge, chunks[0]);

    // show only what fits: borders take two lines
    let visible = (chunks[1].height as usize).saturating_sub(2).min(app.log_tail);
    let width = (chunks[1].width as usize).saturating_sub(12);
    let lines: Vec<Line> = job
        .log
        .tail(visible)
        .into_iter()
        .map(|l| Line::from(format!("{} {}", l.at.format("%H:%M:%S"), truncate_string(&l.message, width))))
        .collect();
    let log = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Log"));
    f.render_widget(log, chunks[1]);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let text = match &app.message {
        Some(message) => format!("{} | q=quit r=refresh c=cancel up/down=select", message),
        None => format!(
            "Total: {} | Running: {} | Pending: {} | Completed: {} | Failed: {} | Cancelled: {} | q=quit r=refresh c=cancel up/down=select",
            app.jobs.len(),
            app.count_by_status(JobStatus::Running),
            app.count_by_status(JobStatus::Pending),
            app.count_by_status(JobStatus::Completed),
            app.count_by_status(JobStatus::Failed),
            app.count_by_status(JobStatus::Cancelled),
        ),
    };

    let paragraph = Paragraph::new(text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(ratatui::widgets::Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn status_label(job: &Job) -> &'static str {
    match job.status {
        JobStatus::Pending => "PEND",
        JobStatus::Running if job.cancel_requested => "STOP",
        JobStatus::Running => "RUN",
        JobStatus::Completed => "OK",
        JobStatus::Failed => "FAIL",
        JobStatus::Cancelled => "CANC",
    }
}

fn status_color(status: JobStatus) -> Color {
    match status {
        JobStatus::Pending => Color::Gray,
        JobStatus::Running => Color::Yellow,
        JobStatus::Completed => Color::Green,
        JobStatus::Failed => Color::Red,
        JobStatus::Cancelled => Color::Magenta,
    }
}

fn short_id(job: &Job) -> String {
    job.id.to_string().chars().take(8).collect()
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() || value.is_infinite() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Shorten to at most `max_len` characters, marking the cut with "..."
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let keep = max_len.saturating_sub(3);
        let mut out: String = s.chars().take(keep).collect();
        out.push_str(&"..."[..max_len.min(3)]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::job::JobOptions;
    use pipeline::layout::Scope;
    use proptest::prelude::*;

    #[test]
    fn test_truncate_string_respects_char_boundaries() {
        assert_eq!(truncate_string("family", 10), "family");
        assert_eq!(truncate_string("Urlaub-Österreich-2023", 10), "Urlaub-...");
        assert_eq!(truncate_string("ÄÖÜäöüß", 5), "ÄÖ...");
        assert_eq!(truncate_string("abcdef", 2), "..");
    }

    #[test]
    fn test_status_label_flags_pending_cancel() {
        let mut job = Job::new(JobKind::RebuildPreviews, Scope::All, JobOptions::default(), 10);
        job.status = JobStatus::Running;
        assert_eq!(status_label(&job), "RUN");
        job.cancel_requested = true;
        assert_eq!(status_label(&job), "STOP");
        job.status = JobStatus::Cancelled;
        assert_eq!(status_label(&job), "CANC");
    }

    #[test]
    fn test_clamp_percent() {
        assert_eq!(clamp_percent(f64::NAN), 0.0);
        assert_eq!(clamp_percent(140.0), 100.0);
        assert_eq!(clamp_percent(-1.0), 0.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn test_truncate_string_never_exceeds_limit(s in "\\PC{0,60}", max_len in 0usize..40) {
            let out = truncate_string(&s, max_len);
            prop_assert!(out.chars().count() <= max_len);
            if s.chars().count() <= max_len {
                prop_assert_eq!(out, s);
            }
        }
    }
}
