//! Background job scheduling: admission, execution, observation, cancellation
//! and restart recovery.
//!
//! Each job runs on its own tokio task that owns the mutable [`Job`] and
//! publishes a full snapshot through a `watch` channel after every file.
//! Observers only ever see those snapshots; the single thing they can change
//! is the cancellation flag, which the task checks before each file.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use tokio::sync::watch;

use crate::catalog::{self, SourceFile};
use crate::config::PipelineConfig;
use crate::duplicates::{fingerprint_source, DuplicateCollector, ScanOutcome};
use crate::error::{CancelError, DismissError, JobError, StartError};
use crate::job::{
    delete_job, load_all_jobs, save_job, Job, JobId, JobKind, JobOptions, JobStatus, LogLine,
    StatusReport,
};
use crate::layout::{basename_of, Scope};
use crate::orchestrator::{DimensionsRecorder, FileOutcome, Pipeline};
use crate::progress::ProgressStore;

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub jobs_dir: PathBuf,
    pub progress_path: PathBuf,
    pub log_retention_lines: usize,
    pub status_log_tail: usize,
    pub job_retention: Duration,
}

impl RunnerSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            jobs_dir: cfg.jobs_dir(),
            progress_path: cfg.progress_path(),
            log_retention_lines: cfg.log_retention_lines,
            status_log_tail: cfg.status_log_tail,
            job_retention: Duration::from_secs(cfg.job_retention_secs),
        }
    }
}

/// Acknowledgement that a cancellation request was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelAck {
    pub id: JobId,
    /// State at the time of the request; the job stops at its next checkpoint
    pub status: JobStatus,
}

/// Progress-store key for a kind and scope
pub fn progress_key(kind: JobKind, scope: &Scope) -> String {
    format!("{}:{}", kind, scope)
}

struct Entry {
    tx: Arc<watch::Sender<Job>>,
    cancel: Arc<AtomicBool>,
}

impl Entry {
    fn detached(job: Job) -> Self {
        let cancel = Arc::new(AtomicBool::new(job.cancel_requested));
        let (tx, _) = watch::channel(job);
        Self {
            tx: Arc::new(tx),
            cancel,
        }
    }
}

struct Inner {
    pipeline: Pipeline,
    progress: ProgressStore,
    settings: RunnerSettings,
    entries: Mutex<HashMap<JobId, Entry>>,
    #[cfg(test)]
    gate: Option<Arc<tokio::sync::Semaphore>>,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<JobId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, job: &Job) {
        if let Err(e) = save_job(job, &self.settings.jobs_dir) {
            warn!("Job {}: failed to persist snapshot: {:#}", job.id, e);
        }
    }

    /// Last resort when a job task dies without reaching a terminal state
    fn mark_crashed(&self, id: JobId, reason: String) {
        let snapshot = {
            let entries = self.entries();
            let Some(entry) = entries.get(&id) else {
                return;
            };
            entry.tx.send_modify(|job| {
                if !job.status.is_terminal() {
                    job.log.push(format!("Job aborted: {}", reason));
                    job.status = JobStatus::Failed;
                    job.reason = Some(reason.clone());
                    job.finished_at = Some(Utc::now());
                }
            });
            let job = entry.tx.borrow().clone();
            job
        };
        log::error!("Job {}: task aborted: {}", id, reason);
        self.persist(&snapshot);
    }
}

/// Owns the job registry. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

impl JobRunner {
    pub fn new(pipeline: Pipeline, settings: RunnerSettings) -> Self {
        let progress = ProgressStore::open(&settings.progress_path);
        Self {
            inner: Arc::new(Inner {
                pipeline,
                progress,
                settings,
                entries: Mutex::new(HashMap::new()),
                #[cfg(test)]
                gate: None,
            }),
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(Pipeline::from_config(cfg), RunnerSettings::from_config(cfg))
    }

    /// Admit a job and spawn it on the current tokio runtime. Returns as soon
    /// as the job is registered; the work happens in the background.
    pub fn start_job(
        &self,
        kind: JobKind,
        scope: Scope,
        options: JobOptions,
    ) -> Result<JobId, StartError> {
        let job = Job::new(kind, scope.clone(), options, self.inner.settings.log_retention_lines);
        let id = job.id;
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, _) = watch::channel(job.clone());
        let tx = Arc::new(tx);

        {
            let mut entries = self.inner.entries();
            let conflict = entries.iter().find_map(|(other, entry)| {
                let snapshot = entry.tx.borrow();
                (!snapshot.status.is_terminal() && snapshot.scope.overlaps(&scope)).then_some(*other)
            });
            if let Some(running) = conflict {
                return Err(StartError::AlreadyInProgress { scope, running });
            }
            entries.insert(
                id,
                Entry {
                    tx: Arc::clone(&tx),
                    cancel: Arc::clone(&cancel),
                },
            );
        }

        self.inner.persist(&job);
        info!("Job {}: admitted {} over {}", id, kind, scope);

        let task = JobTask {
            inner: Arc::clone(&self.inner),
            job,
            tx,
            cancel,
        };
        let handle = tokio::spawn(task.run());
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                inner.mark_crashed(id, e.to_string());
            }
        });

        Ok(id)
    }

    /// Latest snapshot summary; None when the id is unknown
    pub fn status(&self, id: JobId) -> Option<StatusReport> {
        let entries = self.inner.entries();
        let entry = entries.get(&id)?;
        let mut report = entry.tx.borrow().status_report(self.inner.settings.status_log_tail);
        report.cancel_requested |= entry.cancel.load(Ordering::SeqCst);
        Some(report)
    }

    /// Full copy of the latest snapshot
    pub fn snapshot(&self, id: JobId) -> Option<Job> {
        let entries = self.inner.entries();
        entries.get(&id).map(|e| e.tx.borrow().clone())
    }

    /// Push stream of snapshots, starting with the current one
    pub fn subscribe(&self, id: JobId) -> Option<watch::Receiver<Job>> {
        let entries = self.inner.entries();
        entries.get(&id).map(|e| e.tx.subscribe())
    }

    /// Retained log lines with sequence number >= `seq`
    pub fn log_since(&self, id: JobId, seq: u64) -> Option<Vec<LogLine>> {
        let entries = self.inner.entries();
        entries.get(&id).map(|e| e.tx.borrow().log.since(seq))
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = {
            let entries = self.inner.entries();
            entries.values().map(|e| e.tx.borrow().clone()).collect()
        };
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn cancel_job(&self, id: JobId) -> Result<CancelAck, CancelError> {
        let entries = self.inner.entries();
        let entry = entries.get(&id).ok_or(CancelError::NotFound(id))?;
        let status = entry.tx.borrow().status;
        if status.is_terminal() {
            return Err(CancelError::AlreadyTerminal { id, status });
        }

        entry.cancel.store(true, Ordering::SeqCst);
        entry.tx.send_modify(|job| job.cancel_requested = true);
        info!("Job {}: cancellation requested", id);
        Ok(CancelAck { id, status })
    }

    /// Wait until the job reaches a terminal state and return that snapshot
    pub async fn wait(&self, id: JobId) -> Option<Job> {
        let mut rx = self.subscribe(id)?;
        let job = rx
            .wait_for(|job| job.status.is_terminal())
            .await
            .ok()
            .map(|job| job.clone());
        job
    }

    /// Forget a terminal job and remove its persisted snapshot
    pub fn dismiss(&self, id: JobId) -> Result<(), DismissError> {
        {
            let mut entries = self.inner.entries();
            let entry = entries.get(&id).ok_or(DismissError::NotFound(id))?;
            if !entry.tx.borrow().status.is_terminal() {
                return Err(DismissError::StillActive(id));
            }
            entries.remove(&id);
        }
        if let Err(e) = delete_job(&self.inner.settings.jobs_dir, id) {
            warn!("Job {}: {:#}", id, e);
        }
        Ok(())
    }

    /// Drop terminal jobs that finished longer ago than the retention window
    pub fn evict_expired(&self) -> Vec<JobId> {
        let now = Utc::now();
        let retention = self.inner.settings.job_retention;
        let expired: Vec<JobId> = {
            let mut entries = self.inner.entries();
            let expired: Vec<JobId> = entries
                .iter()
                .filter(|(_, entry)| {
                    let job = entry.tx.borrow();
                    job.status.is_terminal()
                        && job
                            .finished_at
                            .and_then(|at| (now - at).to_std().ok())
                            .map_or(false, |age| age >= retention)
                })
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                entries.remove(id);
            }
            expired
        };

        for id in &expired {
            if let Err(e) = delete_job(&self.inner.settings.jobs_dir, *id) {
                warn!("Job {}: {:#}", id, e);
            }
        }
        if !expired.is_empty() {
            info!("Evicted {} expired job(s)", expired.len());
        }
        expired
    }

    /// Load persisted jobs after a restart. Jobs that were still pending or
    /// running have lost their task and become Failed. Returns how many were
    /// converted.
    pub fn recover(&self) -> Result<usize> {
        let jobs = load_all_jobs(&self.inner.settings.jobs_dir)?;
        let mut interrupted = 0;

        for mut job in jobs {
            if !job.status.is_terminal() {
                warn!("Job {}: was {:?} at shutdown, marking Failed", job.id, job.status);
                job.log.push("Job interrupted by restart");
                job.status = JobStatus::Failed;
                job.reason = Some("interrupted by restart".to_string());
                job.finished_at = Some(Utc::now());
                self.inner.persist(&job);
                interrupted += 1;
            }
            let mut entries = self.inner.entries();
            entries.entry(job.id).or_insert_with(|| Entry::detached(job));
        }

        if interrupted > 0 {
            info!("Recovered {} interrupted job(s)", interrupted);
        }
        Ok(interrupted)
    }

    #[cfg(test)]
    fn with_gate(mut self, gate: Arc<tokio::sync::Semaphore>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.gate = Some(gate);
        }
        self
    }
}

enum Finish {
    Completed,
    Cancelled,
}

/// The running side of one job
struct JobTask {
    inner: Arc<Inner>,
    job: Job,
    tx: Arc<watch::Sender<Job>>,
    cancel: Arc<AtomicBool>,
}

impl JobTask {
    async fn run(mut self) {
        self.job.status = JobStatus::Running;
        self.job.started_at = Some(Utc::now());
        self.log(format!("Started {} over {}", self.job.kind, self.job.scope));
        self.publish();

        let result = match self.job.kind {
            JobKind::RebuildPreviews => self.rebuild_previews().await,
            JobKind::ScanDuplicates => self.scan_duplicates().await,
        };

        match result {
            Ok(Finish::Completed) => {
                let c = self.job.counters;
                self.log(format!(
                    "Completed: {} succeeded, {} failed, {} skipped",
                    c.succeeded, c.failed, c.skipped
                ));
                self.finish(JobStatus::Completed, None);
            }
            Ok(Finish::Cancelled) => {
                let c = self.job.counters;
                self.log(format!("Cancelled after {} of {} files", c.processed, c.total));
                self.finish(JobStatus::Cancelled, None);
            }
            Err(e) => {
                self.log(format!("Job failed: {}", e));
                self.finish(JobStatus::Failed, Some(e.to_string()));
            }
        }
    }

    fn log(&mut self, message: String) {
        info!("Job {}: {}", self.job.id, message);
        self.job.log.push(message);
    }

    fn publish(&mut self) {
        self.job.cancel_requested = self.cancel.load(Ordering::SeqCst);
        self.tx.send_replace(self.job.clone());
        self.inner.persist(&self.job);
    }

    fn finish(&mut self, status: JobStatus, reason: Option<String>) {
        self.job.status = status;
        self.job.reason = reason;
        self.job.finished_at = Some(Utc::now());
        self.publish();
    }

    /// Per-file checkpoint; true once cancellation was requested
    async fn cancelled(&self) -> bool {
        #[cfg(test)]
        if let Some(gate) = &self.inner.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.cancel.load(Ordering::SeqCst)
    }

    async fn enumerate(&mut self) -> Result<Vec<SourceFile>, JobError> {
        let layout = self.inner.pipeline.layout().clone();
        let scope = self.job.scope.clone();
        let files = tokio::task::spawn_blocking(move || catalog::enumerate(&layout, &scope))
            .await
            .map_err(|e| JobError::Worker(e.to_string()))??;

        self.job.counters.total = files.len() as u64;
        self.log(format!("Found {} source files in {}", files.len(), self.job.scope));
        Ok(files)
    }

    async fn rebuild_previews(&mut self) -> Result<Finish, JobError> {
        let files = self.enumerate().await?;
        let inner = Arc::clone(&self.inner);
        let pipeline = inner.pipeline.clone();
        let key = progress_key(self.job.kind, &self.job.scope);

        let done: HashSet<String> = if self.job.options.resume {
            let done = inner.progress.processed(&key);
            if !done.is_empty() {
                self.log(format!("Resuming: {} files already processed", done.len()));
            }
            done
        } else {
            if let Err(e) = inner.progress.reset(&key) {
                warn!("Job {}: failed to reset progress for {}: {}", self.job.id, key, e);
            }
            HashSet::new()
        };
        self.publish();

        let total = files.len();
        let mut recorder = DimensionsRecorder::new(pipeline.layout().clone());
        let mut category_start = 0;

        for (idx, file) in files.iter().enumerate() {
            if self.cancelled().await {
                recorder.flush();
                return Ok(Finish::Cancelled);
            }

            let n = idx + 1;
            let label = file.key();
            if done.contains(&label) {
                self.job.counters.skipped += 1;
                self.log(format!("[{}/{}] Skipped {} (already processed)", n, total, label));
            } else {
                match pipeline.process(file).await {
                    FileOutcome::Derived(derived) => {
                        self.job.counters.succeeded += 1;
                        recorder.record(&file.category, basename_of(&file.filename), &derived.dimensions);
                        if let Err(e) = inner.progress.mark(&key, &label) {
                            warn!("Job {}: failed to record progress: {}", self.job.id, e);
                        }
                        let message = match derived.remuxed_to.as_deref().and_then(|p| p.file_name()) {
                            Some(name) => format!(
                                "[{}/{}] Processed {} (remuxed to {})",
                                n,
                                total,
                                label,
                                name.to_string_lossy()
                            ),
                            None => format!("[{}/{}] Processed {}", n, total, label),
                        };
                        self.log(message);
                    }
                    FileOutcome::Skipped(reason) => {
                        self.job.counters.skipped += 1;
                        self.log(format!("[{}/{}] Skipped {}: {}", n, total, label, reason));
                    }
                    FileOutcome::Failed(e) => {
                        self.job.counters.failed += 1;
                        self.log(format!("[{}/{}] Failed {}: {}", n, total, label, e));
                    }
                }
            }
            self.job.counters.processed += 1;

            let category_done = files
                .get(idx + 1)
                .map_or(true, |next| next.category != file.category);
            if category_done {
                recorder.flush();
                self.reconcile(&pipeline, &file.category, &files[category_start..=idx])
                    .await;
                category_start = idx + 1;
            }
            self.publish();
        }

        // a request that arrived during the last file, or on an empty scope
        if self.cancelled().await {
            recorder.flush();
            return Ok(Finish::Cancelled);
        }

        // an emptied category still needs its stale artifacts removed
        if files.is_empty() {
            if let Scope::Category(name) = self.job.scope.clone() {
                self.reconcile(&pipeline, &name, &[]).await;
            }
        }
        recorder.flush();
        Ok(Finish::Completed)
    }

    async fn reconcile(&mut self, pipeline: &Pipeline, category: &str, sources: &[SourceFile]) {
        let p = pipeline.clone();
        let c = category.to_string();
        let s = sources.to_vec();
        match tokio::task::spawn_blocking(move || p.reconcile_orphans(&c, &s)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => self.log(format!("Removed {} orphaned artifacts from {}", n, category)),
            Ok(Err(e)) => warn!("Job {}: orphan cleanup of {} failed: {}", self.job.id, category, e),
            Err(e) => warn!("Job {}: orphan cleanup of {} aborted: {}", self.job.id, category, e),
        }
    }

    async fn scan_duplicates(&mut self) -> Result<Finish, JobError> {
        let files = self.enumerate().await?;
        self.publish();

        let layout = self.inner.pipeline.layout().clone();
        let total = files.len();
        let mut collector = DuplicateCollector::new();

        for (idx, file) in files.iter().enumerate() {
            if self.cancelled().await {
                return Ok(Finish::Cancelled);
            }

            let n = idx + 1;
            let label = file.key();
            let (l, f) = (layout.clone(), file.clone());
            let outcome = tokio::task::spawn_blocking(move || fingerprint_source(&l, &f))
                .await
                .unwrap_or_else(|e| {
                    ScanOutcome::Unreadable(std::io::Error::new(std::io::ErrorKind::Other, e))
                });

            match &outcome {
                ScanOutcome::Hashed(fp) => {
                    self.job.counters.succeeded += 1;
                    self.log(format!("[{}/{}] Hashed {} {}", n, total, label, fp.short()));
                }
                ScanOutcome::Vanished => {
                    self.job.counters.skipped += 1;
                    self.log(format!("[{}/{}] Skipped {} (vanished)", n, total, label));
                }
                ScanOutcome::Unreadable(e) => {
                    self.job.counters.failed += 1;
                    self.log(format!("[{}/{}] Failed {}: {}", n, total, label, e));
                }
            }
            collector.record(file, &outcome);
            self.job.counters.processed += 1;
            self.publish();
        }

        if self.cancelled().await {
            return Ok(Finish::Cancelled);
        }

        let report = collector.finish(self.job.scope.clone());
        self.log(format!(
            "Found {} duplicate groups, {} files reclaimable ({} bytes)",
            report.groups.len(),
            report.candidate_count(),
            report.reclaimable_bytes
        ));
        self.job.duplicates = Some(report);
        Ok(Finish::Completed)
    }
}
