use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the gallery derivation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upload root holding one directory per category
    pub upload_root: PathBuf,
    /// Directory where job snapshots, the progress store and command files live
    pub job_state_dir: PathBuf,
    /// JPEG quality for the medium variant (0-100)
    pub image_quality: u8,
    /// JPEG quality for thumbnails (0-100)
    pub thumbnail_quality: u8,
    /// Path to the ffmpeg binary used for frame extraction and remuxing
    pub ffmpeg_bin: PathBuf,
    /// Upper bound for a single external tool invocation
    pub tool_timeout_secs: u64,
    /// Offset into a clip where the thumbnail frame is taken
    pub thumbnail_offset_secs: f64,
    /// Number of log lines retained per job
    pub log_retention_lines: usize,
    /// Number of log lines returned by a status query
    pub status_log_tail: usize,
    /// How long terminal jobs stay queryable before eviction
    pub job_retention_secs: u64,
    /// Interval between command-queue polls in daemon mode
    pub poll_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl PipelineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            upload_root: PathBuf::from("uploads"),
            job_state_dir: PathBuf::from("/tmp/galleryd-jobs"),
            image_quality: 100,
            thumbnail_quality: 85,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            tool_timeout_secs: 300,
            thumbnail_offset_secs: 1.0,
            log_retention_lines: 500,
            status_log_tail: 50,
            job_retention_secs: 7 * 24 * 60 * 60, // 1 week
            poll_interval_secs: 2,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `UPLOAD_FOLDER`, `IMAGE_QUALITY` and `THUMBNAIL_QUALITY` from the environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("UPLOAD_FOLDER") {
            self.upload_root = PathBuf::from(root);
        }
        if let Some(q) = lookup("IMAGE_QUALITY") {
            self.image_quality = parse_quality("IMAGE_QUALITY", &q)?;
        }
        if let Some(q) = lookup("THUMBNAIL_QUALITY") {
            self.thumbnail_quality = parse_quality("THUMBNAIL_QUALITY", &q)?;
        }
        Ok(())
    }

    /// Directory holding one JSON snapshot per job
    pub fn jobs_dir(&self) -> PathBuf {
        self.job_state_dir.join("jobs")
    }

    /// Directory the daemon polls for start/cancel requests
    pub fn commands_dir(&self) -> PathBuf {
        self.job_state_dir.join("commands")
    }

    /// Location of the resumable-progress store
    pub fn progress_path(&self) -> PathBuf {
        self.job_state_dir.join("progress.json")
    }
}

fn parse_quality(key: &str, value: &str) -> Result<u8> {
    let q: u32 = value
        .trim()
        .parse()
        .with_context(|| format!("{} must be an integer, got {:?}", key, value))?;
    Ok(q.min(100) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PipelineConfig::load_config(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(cfg.thumbnail_quality, 85);
        assert_eq!(cfg.log_retention_lines, 500);
    }

    #[test]
    fn test_toml_partial_config_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("galleryd.toml");
        std::fs::write(&path, "upload_root = \"/srv/photos\"\nlog_retention_lines = 20\n").unwrap();

        let mut cfg: PipelineConfig = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        cfg.apply_overrides(|_| None).unwrap();

        assert_eq!(cfg.upload_root, PathBuf::from("/srv/photos"));
        assert_eq!(cfg.log_retention_lines, 20);
        assert_eq!(cfg.image_quality, 100);
    }

    #[test]
    fn test_env_overrides_clamp_quality() {
        let env: HashMap<&str, &str> = [
            ("UPLOAD_FOLDER", "/data/uploads"),
            ("IMAGE_QUALITY", "250"),
            ("THUMBNAIL_QUALITY", "60"),
        ]
        .into_iter()
        .collect();

        let mut cfg = PipelineConfig::default_config();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.upload_root, PathBuf::from("/data/uploads"));
        assert_eq!(cfg.image_quality, 100);
        assert_eq!(cfg.thumbnail_quality, 60);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut cfg = PipelineConfig::default_config();
        let err = cfg
            .apply_overrides(|k| (k == "IMAGE_QUALITY").then(|| "high".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("IMAGE_QUALITY"));
    }
}
