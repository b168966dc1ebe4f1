pub mod config;
pub mod error;
pub mod classifier;
pub mod layout;
pub mod storage;
pub mod fingerprint;
pub mod imaging;
pub mod tool;
pub mod video;
pub mod catalog;
pub mod duplicates;
pub mod orchestrator;
pub mod progress;
pub mod job;
pub mod runner;
pub mod commands;

pub use config::PipelineConfig;
pub use error::{CancelError, DeriveError, DismissError, JobError, ResolveError, StartError};
pub use classifier::{classify, Classification, MediaKind};
pub use layout::{ArtifactLayout, Scope, Variant};
pub use job::{Job, JobId, JobKind, JobOptions, JobStatus, StatusReport};
pub use duplicates::{Confirmation, DuplicateReport};
pub use orchestrator::{FileOutcome, Pipeline};
pub use runner::{CancelAck, JobRunner, RunnerSettings};
