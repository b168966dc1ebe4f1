use std::path::PathBuf;
use thiserror::Error;

use crate::job::{JobId, JobStatus};
use crate::layout::Scope;

/// Per-file derivation failure. Caught at the orchestrator boundary and
/// counted against the file, never against the job.
#[derive(Debug, Error)]
pub enum DeriveError {
    #[error("cannot decode image: {0}")]
    Decode(String),

    #[error("cannot encode {variant} variant: {reason}")]
    Encode { variant: &'static str, reason: String },

    #[error("frame extraction failed: {0}")]
    FrameExtraction(String),

    #[error("remux failed: {0}")]
    Remux(String),

    #[error("{tool} timed out after {secs:.1}s")]
    ToolTimeout { tool: String, secs: f64 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DeriveError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DeriveError::Io { path: path.into(), source }
    }

    /// True when the underlying cause is a file that no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, DeriveError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Job-level fault: aborts the whole job as Failed
#[derive(Debug, Error)]
pub enum JobError {
    #[error("scope {scope} is unreadable at {path}: {source}")]
    ScopeUnreadable {
        scope: Scope,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("job worker failed: {0}")]
    Worker(String),
}

/// Admission-time rejection; not a job state
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("a job overlapping scope {scope} is already in progress ({running})")]
    AlreadyInProgress { scope: Scope, running: JobId },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} already finished as {status:?}")]
    AlreadyTerminal { id: JobId, status: JobStatus },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DismissError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} is still active")]
    StillActive(JobId),
}

/// Why one duplicate candidate was left in place during resolution
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("kept file {path} is missing or changed since the scan")]
    KeptFileChanged { path: PathBuf },

    #[error("{path} changed since the scan")]
    CandidateChanged { path: PathBuf },

    #[error("{path} no longer exists")]
    CandidateMissing { path: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
