//! File-based request queue between the operator tools and the daemon.
//!
//! Each request is one JSON file in the commands directory. Writers publish
//! atomically; the daemon applies and deletes them in timestamp order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobId, JobKind, JobOptions};
use crate::layout::Scope;
use crate::runner::JobRunner;
use crate::storage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Start {
        kind: JobKind,
        scope: Scope,
        #[serde(default)]
        resume: bool,
    },
    Cancel {
        job_id: JobId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFile {
    #[serde(flatten)]
    pub command: Command,
    pub timestamp: DateTime<Utc>,
}

/// Queue a command for the daemon; returns the file written
pub fn submit(commands_dir: &Path, command: Command) -> Result<PathBuf> {
    let file = CommandFile {
        command,
        timestamp: Utc::now(),
    };
    let path = commands_dir.join(format!("{}.json", Uuid::new_v4()));
    let json = serde_json::to_vec_pretty(&file).context("Failed to serialize command")?;
    storage::write_atomic(&path, &json)
        .with_context(|| format!("Failed to write command file: {}", path.display()))?;
    debug!("Queued {:?} as {}", file.command, path.display());
    Ok(path)
}

/// Parsed commands waiting in the queue, oldest first. Unparseable files
/// are removed.
pub fn read_pending(commands_dir: &Path) -> Result<Vec<(PathBuf, CommandFile)>> {
    let names = match storage::list_dir(commands_dir) {
        Ok(names) => names,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| {
                format!("Failed to read command directory: {}", commands_dir.display())
            })
        }
    };

    let mut pending = Vec::new();
    for name in names {
        // in-flight temporaries are dot-files
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        let path = commands_dir.join(&name);
        let content = match std::fs::read(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read command file {}: {}", path.display(), e);
                continue;
            }
        };
        match serde_json::from_slice::<CommandFile>(&content) {
            Ok(cmd) => pending.push((path, cmd)),
            Err(e) => {
                warn!("Failed to parse command file {}: {}", path.display(), e);
                storage::delete(&path).ok();
            }
        }
    }

    pending.sort_by_key(|(_, cmd)| cmd.timestamp);
    Ok(pending)
}

/// Apply every queued command to the runner and delete the files.
/// Returns how many commands were consumed.
pub fn process_command_files(runner: &JobRunner, commands_dir: &Path) -> Result<usize> {
    let pending = read_pending(commands_dir)?;
    let mut processed = 0;

    for (path, cmd) in pending {
        apply(runner, &cmd.command);
        storage::delete(&path)
            .with_context(|| format!("Failed to delete processed command file: {}", path.display()))?;
        processed += 1;
    }

    if processed > 0 {
        info!("Processed {} command file(s)", processed);
    }
    Ok(processed)
}

fn apply(runner: &JobRunner, command: &Command) {
    match command {
        Command::Start {
            kind,
            scope,
            resume,
        } => match runner.start_job(*kind, scope.clone(), JobOptions { resume: *resume }) {
            Ok(id) => info!("Started {} over {} as job {}", kind, scope, id),
            Err(e) => warn!("Cannot start {} over {}: {}", kind, scope, e),
        },
        Command::Cancel { job_id } => match runner.cancel_job(*job_id) {
            Ok(_) => info!("Job {}: cancel requested via command file", job_id),
            Err(e) => warn!("Cannot cancel: {}", e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_file_format() {
        let file = CommandFile {
            command: Command::Start {
                kind: JobKind::RebuildPreviews,
                scope: Scope::Category("family".into()),
                resume: true,
            },
            timestamp: Utc::now(),
        };
        let json: serde_json::Value = serde_json::to_value(&file).unwrap();
        assert_eq!(json["action"], "start");
        assert_eq!(json["kind"], "rebuild-previews");
        assert_eq!(json["scope"]["category"], "family");

        let minimal = r#"{"action":"start","kind":"scan-duplicates","scope":"all","timestamp":"2024-05-01T10:00:00Z"}"#;
        let parsed: CommandFile = serde_json::from_str(minimal).unwrap();
        assert_eq!(
            parsed.command,
            Command::Start {
                kind: JobKind::ScanDuplicates,
                scope: Scope::All,
                resume: false
            }
        );
    }

    #[test]
    fn test_queue_skips_temporaries_and_drops_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let id = JobId::new();
        submit(dir.path(), Command::Cancel { job_id: id }).unwrap();
        std::fs::write(dir.path().join(".tmp-abc.json"), b"{").unwrap();
        std::fs::write(dir.path().join("junk.json"), b"nope").unwrap();

        let pending = read_pending(dir.path()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.command, Command::Cancel { job_id: id });
        assert!(!dir.path().join("junk.json").exists());
        assert!(read_pending(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_daemon_applies_and_consumes_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = crate::config::PipelineConfig::default_config();
        cfg.upload_root = dir.path().join("uploads");
        cfg.job_state_dir = dir.path().join("state");
        std::fs::create_dir_all(cfg.upload_root.join("family").join("source")).unwrap();
        let runner = JobRunner::from_config(&cfg);

        submit(
            &cfg.commands_dir(),
            Command::Start {
                kind: JobKind::ScanDuplicates,
                scope: Scope::Category("family".into()),
                resume: false,
            },
        )
        .unwrap();
        assert_eq!(process_command_files(&runner, &cfg.commands_dir()).unwrap(), 1);
        assert!(storage::list_dir(&cfg.commands_dir()).unwrap().is_empty());

        let jobs = runner.list_jobs();
        assert_eq!(jobs.len(), 1);
        let job = runner.wait(jobs[0].id).await.unwrap();
        assert_eq!(job.kind, JobKind::ScanDuplicates);

        // cancelling a finished job is consumed and only logged
        submit(&cfg.commands_dir(), Command::Cancel { job_id: job.id }).unwrap();
        assert_eq!(process_command_files(&runner, &cfg.commands_dir()).unwrap(), 1);
    }
}
