use anyhow::{anyhow, bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use humansize::{format_size, DECIMAL};
use log::{error, info, warn};
use pipeline::{
    commands::{self, Command},
    duplicates::{self, Confirmation, DuplicateReport},
    job::{load_all_jobs, load_job, Job, JobId, JobKind, JobOptions, JobStatus},
    layout::{ArtifactLayout, Scope},
    runner::JobRunner,
    PipelineConfig,
};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Gallery derivation pipeline: rebuild previews, find duplicates, run the job daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Rebuild derived artifacts in the foreground (Ctrl-C cancels after the current file)
    Rebuild {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Skip files a previous run over the same scope already finished
        #[arg(long)]
        resume: bool,
    },
    /// Scan for duplicate uploads and optionally delete them
    Dedupe {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Actually delete the duplicates (default: report only)
        #[arg(long)]
        delete: bool,
    },
    /// Run the job daemon: recover, then consume command files until interrupted
    Serve,
    /// Queue a job for the daemon
    Submit {
        #[command(subcommand)]
        job: SubmitCmd,
    },
    /// Ask the daemon to cancel a job
    Cancel {
        job_id: JobId,
    },
    /// Show persisted job status
    Status {
        job_id: Option<JobId>,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SubmitCmd {
    Rebuild {
        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(long)]
        resume: bool,
    },
    Dedupe {
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
struct ScopeArgs {
    /// Every category under the upload root
    #[arg(long)]
    all: bool,

    /// A single category
    #[arg(long)]
    category: Option<String>,
}

impl ScopeArgs {
    fn scope(&self) -> Result<Scope> {
        match (&self.category, self.all) {
            (Some(name), _) => name.parse::<Scope>().map_err(|e| anyhow!(e)),
            (None, true) => Ok(Scope::All),
            (None, false) => bail!("either --all or --category is required"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger - RUST_LOG wins; the daemon defaults to info, the
    // foreground commands keep stderr quiet because they print the job log
    let default_level = match (&args.command, args.verbose) {
        (_, true) => "debug",
        (Cmd::Serve, false) => "info",
        _ => "warn",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = PipelineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Cmd::Rebuild { scope, resume } => rebuild(&cfg, scope.scope()?, resume).await,
        Cmd::Dedupe { scope, delete } => dedupe(&cfg, scope.scope()?, delete).await,
        Cmd::Serve => serve(&cfg).await,
        Cmd::Submit { job } => {
            let command = match job {
                SubmitCmd::Rebuild { scope, resume } => Command::Start {
                    kind: JobKind::RebuildPreviews,
                    scope: scope.scope()?,
                    resume,
                },
                SubmitCmd::Dedupe { scope } => Command::Start {
                    kind: JobKind::ScanDuplicates,
                    scope: scope.scope()?,
                    resume: false,
                },
            };
            let path = commands::submit(&cfg.commands_dir(), command)?;
            println!("Queued {}", path.display());
            Ok(())
        }
        Cmd::Cancel { job_id } => {
            let path = commands::submit(&cfg.commands_dir(), Command::Cancel { job_id })?;
            println!("Cancellation of {} queued ({})", job_id, path.display());
            Ok(())
        }
        Cmd::Status { job_id, json } => status(&cfg, job_id, json),
    }
}

async fn rebuild(cfg: &PipelineConfig, scope: Scope, resume: bool) -> Result<()> {
    let runner = JobRunner::from_config(cfg);
    let id = runner.start_job(JobKind::RebuildPreviews, scope, JobOptions { resume })?;
    let job = follow(&runner, id).await?;

    print_summary(&job);
    if job.status == JobStatus::Failed {
        bail!("job {} failed: {}", job.id, job.reason.as_deref().unwrap_or("unknown"));
    }
    Ok(())
}

async fn dedupe(cfg: &PipelineConfig, scope: Scope, delete: bool) -> Result<()> {
    let runner = JobRunner::from_config(cfg);
    let id = runner.start_job(JobKind::ScanDuplicates, scope, JobOptions::default())?;
    let job = follow(&runner, id).await?;
    print_summary(&job);

    if job.status == JobStatus::Failed {
        bail!("job {} failed: {}", job.id, job.reason.as_deref().unwrap_or("unknown"));
    }
    let Some(report) = job.duplicates else {
        return Ok(());
    };
    print_report(&report);

    if report.groups.is_empty() {
        return Ok(());
    }
    if !delete {
        println!(
            "Re-run with --delete to remove {} file(s) and reclaim {}",
            report.candidate_count(),
            format_size(report.reclaimable_bytes, DECIMAL)
        );
        return Ok(());
    }

    let layout = ArtifactLayout::new(&cfg.upload_root);
    let summary = tokio::task::spawn_blocking(move || {
        duplicates::resolve(&layout, &report, Confirmation::delete_duplicates())
    })
    .await
    .context("Duplicate resolution worker failed")?;

    for (entry, reason) in &summary.refused {
        println!("  kept {}/{}: {}", entry.category, entry.filename, reason);
    }
    println!(
        "Deleted {} file(s) and {} derived artifact(s), reclaimed {}",
        summary.deleted.len(),
        summary.artifacts_removed,
        format_size(summary.bytes_reclaimed, DECIMAL)
    );
    Ok(())
}

/// Stream a job's log to stdout until it finishes. The first Ctrl-C requests
/// cancellation; the job stops at its next file boundary.
async fn follow(runner: &JobRunner, id: JobId) -> Result<Job> {
    let mut rx = runner
        .subscribe(id)
        .ok_or_else(|| anyhow!("job {} vanished", id))?;
    let mut next_seq = 0;
    let mut cancel_sent = false;

    loop {
        {
            let job = rx.borrow_and_update();
            for line in job.log.since(next_seq) {
                println!("{} {}", line.at.format("%H:%M:%S"), line.message);
                next_seq = line.seq + 1;
            }
            if job.status.is_terminal() {
                return Ok(job.clone());
            }
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return runner.snapshot(id).ok_or_else(|| anyhow!("job {} vanished", id));
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                match runner.cancel_job(id) {
                    Ok(_) => eprintln!("Cancelling after the current file..."),
                    Err(e) => warn!("{}", e),
                }
            }
        }
    }
}

async fn serve(cfg: &PipelineConfig) -> Result<()> {
    info!("Gallery pipeline daemon starting");
    info!("Configuration loaded:");
    info!("  Upload root: {}", cfg.upload_root.display());
    info!("  Job state dir: {}", cfg.job_state_dir.display());
    info!("  ffmpeg: {}", cfg.ffmpeg_bin.display());
    info!("  Poll interval: {}s", cfg.poll_interval_secs);

    if !cfg.upload_root.exists() {
        warn!("Upload root does not exist: {}", cfg.upload_root.display());
    }
    for dir in [cfg.jobs_dir(), cfg.commands_dir()] {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
    }

    let runner = JobRunner::from_config(cfg);
    let recovered = runner
        .recover()
        .context("Failed to recover persisted jobs on startup")?;
    info!("Startup recovery complete: {} interrupted job(s) marked failed", recovered);

    let poll = Duration::from_secs(cfg.poll_interval_secs.max(1));
    loop {
        if let Err(e) = commands::process_command_files(&runner, &cfg.commands_dir()) {
            error!("Failed to process command files: {:#}", e);
        }
        runner.evict_expired();

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    // let active jobs stop at a file boundary so nothing is left half-recorded
    let active: Vec<JobId> = runner
        .list_jobs()
        .into_iter()
        .filter(|j| !j.status.is_terminal())
        .map(|j| j.id)
        .collect();
    for id in &active {
        if runner.cancel_job(*id).is_ok() {
            info!("Job {}: cancelling for shutdown", id);
        }
    }
    for id in active {
        runner.wait(id).await;
    }
    info!("Daemon stopped");
    Ok(())
}

fn status(cfg: &PipelineConfig, job_id: Option<JobId>, json: bool) -> Result<()> {
    let jobs_dir = cfg.jobs_dir();

    if let Some(id) = job_id {
        let job = load_job(&jobs_dir, id)?.ok_or_else(|| anyhow!("job {} not found", id))?;
        let report = job.status_report(cfg.status_log_tail);
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        print_summary(&job);
        if let Some(reason) = &report.reason {
            println!("Reason: {}", reason);
        }
        for line in &report.log_tail {
            println!("  {} {}", line.at.format("%Y-%m-%d %H:%M:%S"), line.message);
        }
        if let Some(dups) = &report.duplicates {
            print_report(dups);
        }
        return Ok(());
    }

    let jobs = load_all_jobs(&jobs_dir)
        .with_context(|| format!("Failed to load jobs from {}", jobs_dir.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs in {}", jobs_dir.display());
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:<16}  {:<9}  {:>11}  {:>6}  {:>10}",
        "ID", "KIND", "SCOPE", "STATUS", "PROGRESS", "FAILED", "ELAPSED"
    );
    for job in jobs.iter().rev() {
        println!(
            "{:<36}  {:<16}  {:<16}  {:<9}  {:>11}  {:>6}  {:>10}",
            job.id.to_string(),
            job.kind.to_string(),
            job.scope.to_string(),
            job.status.to_string(),
            format!("{}/{}", job.counters.processed, job.counters.total),
            job.counters.failed,
            job.elapsed().map(format_duration).unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

fn print_summary(job: &Job) {
    let c = job.counters;
    println!(
        "Job {} ({} over {}): {} - {}/{} processed, {} succeeded, {} failed, {} skipped{}",
        job.id,
        job.kind,
        job.scope,
        job.status,
        c.processed,
        c.total,
        c.succeeded,
        c.failed,
        c.skipped,
        job.elapsed()
            .map(|d| format!(" in {}", format_duration(d)))
            .unwrap_or_default()
    );
}

fn print_report(report: &DuplicateReport) {
    println!(
        "Scanned {} file(s) in {}: {} duplicate group(s), {} reclaimable",
        report.files_scanned,
        report.scope,
        report.groups.len(),
        format_size(report.reclaimable_bytes, DECIMAL)
    );
    if report.files_vanished > 0 || report.files_unreadable > 0 {
        println!(
            "  ({} vanished during the scan, {} unreadable)",
            report.files_vanished, report.files_unreadable
        );
    }
    for group in &report.groups {
        println!(
            "  {}  keep {}/{}",
            group.fingerprint.short(),
            group.keep.category,
            group.keep.filename
        );
        for candidate in &group.candidates {
            println!(
                "  {}  dup  {}/{} ({})",
                " ".repeat(group.fingerprint.short().len()),
                candidate.category,
                candidate.filename,
                format_size(candidate.size, DECIMAL)
            );
        }
    }
}

/// Helper function to format duration for logging
fn format_duration(d: chrono::Duration) -> String {
    let hours = d.num_hours();
    let minutes = d.num_minutes() % 60;
    let seconds = d.num_seconds() % 60;
    format!("{}h {}m {}s", hours, minutes, seconds)
}
