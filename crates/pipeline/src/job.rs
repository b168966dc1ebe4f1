use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::duplicates::DuplicateReport;
use crate::layout::Scope;
use crate::storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(JobId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    RebuildPreviews,
    ScanDuplicates,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::RebuildPreviews => "rebuild-previews",
            JobKind::ScanDuplicates => "scan-duplicates",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "rebuild-previews" | "rebuild" => Ok(JobKind::RebuildPreviews),
            "scan-duplicates" | "dedupe" => Ok(JobKind::ScanDuplicates),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Skip items a previous run of the same kind and scope already finished
    pub resume: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl JobCounters {
    /// Fraction of enumerated files handled so far, 0.0 when nothing was found
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.processed as f64 / self.total as f64).min(1.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Append-only log that keeps the newest `capacity` lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLog {
    capacity: usize,
    next_seq: u64,
    lines: VecDeque<LogLine>,
}

impl JobLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 0,
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, message: impl Into<String>) -> &LogLine {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(LogLine {
            seq: self.next_seq,
            at: Utc::now(),
            message: message.into(),
        });
        self.next_seq += 1;
        &self.lines[self.lines.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The newest `n` lines, oldest first
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Retained lines with a sequence number of at least `seq`
    pub fn since(&self, seq: u64) -> Vec<LogLine> {
        self.lines.iter().filter(|l| l.seq >= seq).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }
}

/// One background job and everything an observer can learn about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub scope: Scope,
    #[serde(default)]
    pub options: JobOptions,
    pub status: JobStatus,
    pub counters: JobCounters,
    pub log: JobLog,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Why the job failed, when it did
    pub reason: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub duplicates: Option<DuplicateReport>,
}

impl Job {
    pub fn new(kind: JobKind, scope: Scope, options: JobOptions, log_capacity: usize) -> Self {
        Self {
            id: JobId::new(),
            kind,
            scope,
            options,
            status: JobStatus::Pending,
            counters: JobCounters::default(),
            log: JobLog::new(log_capacity),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            reason: None,
            cancel_requested: false,
            duplicates: None,
        }
    }

    /// Time spent running; still ticking while the job is active
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some(end - started)
    }

    pub fn status_report(&self, log_tail: usize) -> StatusReport {
        StatusReport {
            id: self.id,
            kind: self.kind,
            scope: self.scope.clone(),
            status: self.status,
            counters: self.counters,
            log_tail: self.log.tail(log_tail),
            elapsed_secs: self.elapsed().map(|d| d.num_seconds()),
            cancel_requested: self.cancel_requested,
            reason: self.reason.clone(),
            duplicates: self.duplicates.clone(),
        }
    }
}

/// Poll-style view of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub id: JobId,
    pub kind: JobKind,
    pub scope: Scope,
    pub status: JobStatus,
    pub counters: JobCounters,
    pub log_tail: Vec<LogLine>,
    pub elapsed_secs: Option<i64>,
    pub cancel_requested: bool,
    pub reason: Option<String>,
    pub duplicates: Option<DuplicateReport>,
}

pub fn job_path(jobs_dir: &Path, id: JobId) -> PathBuf {
    jobs_dir.join(format!("{}.json", id))
}

/// Persist a job snapshot atomically
pub fn save_job(job: &Job, jobs_dir: &Path) -> Result<()> {
    let path = job_path(jobs_dir, job.id);
    let json = serde_json::to_vec_pretty(job)
        .with_context(|| format!("Failed to serialize job {}", job.id))?;
    storage::write_atomic(&path, &json)
        .with_context(|| format!("Failed to write job file: {}", path.display()))
}

pub fn load_job(jobs_dir: &Path, id: JobId) -> Result<Option<Job>> {
    let path = job_path(jobs_dir, id);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read job file: {}", path.display()))
        }
    };
    let job = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse job file: {}", path.display()))?;
    Ok(Some(job))
}

/// Load every persisted job, oldest first. Unparseable files are skipped.
pub fn load_all_jobs(jobs_dir: &Path) -> Result<Vec<Job>> {
    if !jobs_dir.exists() {
        return Ok(Vec::new());
    }

    let names = storage::list_dir(jobs_dir)
        .with_context(|| format!("Failed to list job directory: {}", jobs_dir.display()))?;

    let mut jobs = Vec::new();
    for name in names {
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        let path = jobs_dir.join(&name);
        let parsed = std::fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| serde_json::from_slice::<Job>(&bytes).map_err(anyhow::Error::from));
        match parsed {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping unreadable job file {}: {}", path.display(), e),
        }
    }

    jobs.sort_by_key(|j| j.created_at);
    Ok(jobs)
}

/// Remove a persisted snapshot; false if there was none
pub fn delete_job(jobs_dir: &Path, id: JobId) -> Result<bool> {
    let path = job_path(jobs_dir, id);
    storage::delete(&path).with_context(|| format!("Failed to delete job file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_log_drops_oldest_first() {
        let mut log = JobLog::new(3);
        for i in 0..5 {
            log.push(format!("line {}", i));
        }
        let messages: Vec<_> = log.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(log.tail(2)[0].seq, 3);
        assert_eq!(log.since(4).len(), 1);
        // evicted sequence numbers just yield what is still retained
        assert_eq!(log.since(0).len(), 3);
    }

    #[test]
    fn test_snapshot_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new(
            JobKind::RebuildPreviews,
            Scope::Category("family".into()),
            JobOptions { resume: true },
            10,
        );
        job.log.push("[1/1] Processed family/a.jpg");
        job.counters.total = 1;
        save_job(&job, dir.path()).unwrap();

        let loaded = load_job(dir.path(), job.id).unwrap().unwrap();
        assert_eq!(loaded, job);
        assert_eq!(load_all_jobs(dir.path()).unwrap().len(), 1);

        assert!(delete_job(dir.path(), job.id).unwrap());
        assert!(load_job(dir.path(), job.id).unwrap().is_none());
    }

    #[test]
    fn test_load_all_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{").unwrap();
        let job = Job::new(JobKind::ScanDuplicates, Scope::All, JobOptions::default(), 10);
        save_job(&job, dir.path()).unwrap();

        let jobs = load_all_jobs(dir.path()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::ScanDuplicates);
        assert!(load_all_jobs(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_kind_and_id_parse() {
        assert_eq!("dedupe".parse::<JobKind>().unwrap(), JobKind::ScanDuplicates);
        assert_eq!(JobKind::RebuildPreviews.to_string(), "rebuild-previews");
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn test_log_never_exceeds_capacity(capacity in 1usize..64, pushes in 0usize..300) {
            let mut log = JobLog::new(capacity);
            for i in 0..pushes {
                log.push(i.to_string());
                prop_assert!(log.len() <= capacity);
            }
            prop_assert_eq!(log.len(), pushes.min(capacity));
            if let Some(last) = log.tail(1).first() {
                prop_assert_eq!(last.seq as usize, pushes - 1);
            }
        }
    }
}
