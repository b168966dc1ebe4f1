use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};

use crate::classifier::Classification;
use crate::config::PipelineConfig;
use crate::error::DeriveError;
use crate::imaging::{self, EncodedVariant};
use crate::storage;
use crate::tool::{ExternalTool, ToolError};

/// Container legacy videos are remuxed into
pub const REMUX_TARGET_EXTENSION: &str = "mp4";

/// Thumbnail extraction and legacy-container remuxing through ffmpeg
#[derive(Debug, Clone)]
pub struct VideoDeriver {
    ffmpeg: ExternalTool,
    thumbnail_offset_secs: f64,
    thumbnail_quality: u8,
}

impl VideoDeriver {
    pub fn new(ffmpeg: ExternalTool, thumbnail_offset_secs: f64, thumbnail_quality: u8) -> Self {
        Self {
            ffmpeg,
            thumbnail_offset_secs: thumbnail_offset_secs.max(0.0),
            thumbnail_quality,
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(
            ExternalTool::new(&cfg.ffmpeg_bin, Duration::from_secs(cfg.tool_timeout_secs)),
            cfg.thumbnail_offset_secs,
            cfg.thumbnail_quality,
        )
    }

    /// Grab one frame a little into the clip and turn it into a grid thumbnail.
    /// Clips shorter than the offset fall back to the first frame.
    pub async fn derive_thumbnail(&self, source: &Path) -> Result<EncodedVariant, DeriveError> {
        let frame = match self.extract_frame(source, self.thumbnail_offset_secs).await {
            Ok(frame) => frame,
            Err(DeriveError::FrameExtraction(reason)) if self.thumbnail_offset_secs > 0.0 => {
                debug!(
                    "No frame at {:.1}s in {} ({}), retrying at 0s",
                    self.thumbnail_offset_secs,
                    source.display(),
                    reason
                );
                self.extract_frame(source, 0.0).await?
            }
            Err(e) => return Err(e),
        };

        let quality = self.thumbnail_quality;
        tokio::task::spawn_blocking(move || {
            let image = imaging::decode(&frame).map_err(|e| {
                DeriveError::FrameExtraction(format!("extracted frame is unreadable: {}", e))
            })?;
            imaging::thumbnail(&image, quality)
        })
        .await
        .map_err(|e| DeriveError::FrameExtraction(format!("thumbnail worker failed: {}", e)))?
    }

    async fn extract_frame(&self, source: &Path, offset_secs: f64) -> Result<Vec<u8>, DeriveError> {
        let args = frame_args(source, offset_secs);
        let output = self.ffmpeg.run(&args).await.map_err(|e| match e {
            ToolError::Timeout { tool, secs } => DeriveError::ToolTimeout { tool, secs },
            other => DeriveError::FrameExtraction(other.to_string()),
        })?;

        if output.stdout.is_empty() {
            return Err(DeriveError::FrameExtraction(format!(
                "no frame at {:.1}s",
                offset_secs
            )));
        }
        Ok(output.stdout)
    }

    /// Remux a legacy container into mp4 without re-encoding. Returns the new
    /// authoritative source path, or None when the classification asks for
    /// no remux.
    ///
    /// The mp4 is written to a hidden temporary next to the source and renamed
    /// into place only after ffmpeg succeeds; the original is removed last.
    /// An existing file under the target name is never replaced.
    pub async fn remux_if_needed(
        &self,
        source: &Path,
        classification: &Classification,
    ) -> Result<Option<PathBuf>, DeriveError> {
        if !classification.needs_remux() {
            return Ok(None);
        }

        let target = source.with_extension(REMUX_TARGET_EXTENSION);
        if target.exists() {
            return Err(target_taken(&target));
        }
        let tmp = storage::temp_sibling(&target).map_err(|e| DeriveError::io(&target, e))?;
        // ffmpeg reopens the path itself; the handle only reserves the name
        // and removes the file on every early return
        let args = remux_args(source, tmp.path());

        self.ffmpeg.run(&args).await.map_err(|e| match e {
            ToolError::Timeout { tool, secs } => DeriveError::ToolTimeout { tool, secs },
            other => DeriveError::Remux(other.to_string()),
        })?;

        let written = std::fs::metadata(tmp.path())
            .map(|m| m.len())
            .map_err(|e| DeriveError::io(tmp.path(), e))?;
        if written == 0 {
            return Err(DeriveError::Remux("ffmpeg produced an empty file".to_string()));
        }

        tmp.persist_noclobber(&target).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                target_taken(&target)
            } else {
                DeriveError::io(&target, e.error)
            }
        })?;

        if let Err(e) = std::fs::remove_file(source) {
            warn!(
                "Remuxed {} but could not remove the original: {}",
                source.display(),
                e
            );
        }
        info!("Remuxed {} -> {}", source.display(), target.display());
        Ok(Some(target))
    }
}

fn target_taken(target: &Path) -> DeriveError {
    DeriveError::Remux(format!(
        "{} already exists and belongs to another upload",
        target.display()
    ))
}

fn frame_args(source: &Path, offset_secs: f64) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "-ss".to_string(),
        format!("{:.3}", offset_secs),
        "-i".to_string(),
        source.display().to_string(),
        "-frames:v".to_string(),
        "1".to_string(),
        "-f".to_string(),
        "image2pipe".to_string(),
        "-vcodec".to_string(),
        "png".to_string(),
        "-".to_string(),
    ]
}

fn remux_args(source: &Path, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        source.display().to_string(),
        "-map".to_string(),
        "0".to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-f".to_string(),
        REMUX_TARGET_EXTENSION.to_string(),
        output.display().to_string(),
    ]
}
