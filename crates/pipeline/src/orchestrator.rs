//! Per-file "derive everything" step driven by rebuild jobs.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::catalog::SourceFile;
use crate::classifier::{classify, Classification, MediaKind};
use crate::config::PipelineConfig;
use crate::error::DeriveError;
use crate::fingerprint::{self, Fingerprint};
use crate::imaging::{self, EncodedVariant, JpegQualities};
use crate::layout::{basename_of, ArtifactLayout, Dimensions, DimensionsManifest, Variant, DERIVED_EXTENSION};
use crate::storage;
use crate::video::VideoDeriver;

/// Result of processing one source file. Errors stay inside the outcome.
#[derive(Debug)]
pub enum FileOutcome {
    Derived(Derived),
    Skipped(String),
    Failed(DeriveError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    pub fingerprint: Fingerprint,
    pub artifacts: Vec<PathBuf>,
    pub dimensions: Vec<(Variant, Dimensions)>,
    /// New authoritative source when a legacy container was remuxed
    pub remuxed_to: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    layout: ArtifactLayout,
    qualities: JpegQualities,
    video: VideoDeriver,
}

impl Pipeline {
    pub fn new(layout: ArtifactLayout, qualities: JpegQualities, video: VideoDeriver) -> Self {
        Self {
            layout,
            qualities,
            video,
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(
            ArtifactLayout::new(&cfg.upload_root),
            JpegQualities {
                medium: cfg.image_quality,
                thumbnail: cfg.thumbnail_quality,
            },
            VideoDeriver::from_config(cfg),
        )
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub async fn process(&self, source: &SourceFile) -> FileOutcome {
        let classification = classify(&source.filename);
        let result = match classification.kind {
            MediaKind::Image => self.process_image(source).await,
            MediaKind::Video => self.process_video(source, &classification).await,
            MediaKind::Unsupported => {
                return FileOutcome::Skipped(if classification.extension.is_empty() {
                    "no extension".to_string()
                } else {
                    format!("unsupported extension .{}", classification.extension)
                })
            }
        };

        match result {
            Ok(derived) => FileOutcome::Derived(derived),
            Err(e) if e.is_not_found() => FileOutcome::Skipped("vanished before processing".to_string()),
            Err(e) => FileOutcome::Failed(e),
        }
    }

    async fn process_image(&self, source: &SourceFile) -> Result<Derived, DeriveError> {
        let path = source.path(&self.layout);
        let layout = self.layout.clone();
        let category = source.category.clone();
        let basename = basename_of(&source.filename).to_string();
        let qualities = self.qualities;

        tokio::task::spawn_blocking(move || {
            let bytes = storage::read_bytes(&path).map_err(|e| DeriveError::io(&path, e))?;
            let fingerprint = fingerprint::hash_bytes(&bytes);
            let derived = imaging::derive(&bytes, qualities)?;

            let mut artifacts = Vec::new();
            let mut dimensions = Vec::new();
            for variant in derived.iter() {
                artifacts.push(write_variant(&layout, &category, &basename, variant)?);
                dimensions.push((variant.variant, variant.dimensions()));
            }

            Ok(Derived {
                fingerprint,
                artifacts,
                dimensions,
                remuxed_to: None,
            })
        })
        .await
        .map_err(|e| DeriveError::Decode(format!("derivation worker failed: {}", e)))?
    }

    async fn process_video(
        &self,
        source: &SourceFile,
        classification: &Classification,
    ) -> Result<Derived, DeriveError> {
        let original = source.path(&self.layout);
        if !original.exists() {
            return Err(DeriveError::io(
                &original,
                io::Error::new(io::ErrorKind::NotFound, "source vanished"),
            ));
        }

        let remuxed_to = self.video.remux_if_needed(&original, classification).await?;
        let authoritative = remuxed_to.clone().unwrap_or(original);

        let hash_path = authoritative.clone();
        let fingerprint = tokio::task::spawn_blocking(move || fingerprint::hash_file(&hash_path))
            .await
            .map_err(|e| DeriveError::io(&authoritative, io::Error::new(io::ErrorKind::Other, e)))?
            .map_err(|e| DeriveError::io(&authoritative, e))?;

        let thumbnail = self.video.derive_thumbnail(&authoritative).await?;
        let basename = basename_of(&source.filename);
        let artifact = write_variant(&self.layout, &source.category, basename, &thumbnail)?;

        Ok(Derived {
            fingerprint,
            artifacts: vec![artifact],
            dimensions: vec![(Variant::Thumbnail, thumbnail.dimensions())],
            remuxed_to,
        })
    }

    /// Remove derived artifacts of `category` whose basename matches none of
    /// `sources`. Returns the number of files removed.
    pub fn reconcile_orphans(&self, category: &str, sources: &[SourceFile]) -> io::Result<usize> {
        let live: HashSet<&str> = sources
            .iter()
            .filter(|s| s.category == category)
            .map(|s| basename_of(&s.filename))
            .collect();

        let mut removed = 0;
        for variant in Variant::ALL {
            let dir = self.layout.variant_dir(category, variant);
            let names = match storage::list_dir(&dir) {
                Ok(names) => names,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            for name in names {
                if name.starts_with('.') {
                    continue;
                }
                let path = dir.join(&name);
                let is_artifact = Path::new(&name).extension().and_then(|e| e.to_str())
                    == Some(DERIVED_EXTENSION);
                if !is_artifact || !path.is_file() || live.contains(basename_of(&name)) {
                    continue;
                }
                if storage::delete(&path)? {
                    debug!("Removed orphaned artifact {}", path.display());
                    removed += 1;
                }
            }
        }

        let manifest_path = self.layout.dimensions_path(category);
        if manifest_path.exists() {
            let mut manifest = DimensionsManifest::load(&manifest_path);
            if manifest.retain_basenames(|name| live.contains(name)) > 0 {
                manifest.save(&manifest_path)?;
            }
        }

        if removed > 0 {
            info!("Removed {} orphaned artifacts from {}", removed, category);
        }
        Ok(removed)
    }
}

fn write_variant(
    layout: &ArtifactLayout,
    category: &str,
    basename: &str,
    variant: &EncodedVariant,
) -> Result<PathBuf, DeriveError> {
    let path = layout.variant_path(category, variant.variant, basename);
    storage::write_atomic(&path, &variant.bytes).map_err(|e| DeriveError::io(&path, e))?;
    Ok(path)
}

/// Collects dimensions per category and writes each category's manifest
/// once, when the job moves on to the next category or finishes.
#[derive(Debug)]
pub struct DimensionsRecorder {
    layout: ArtifactLayout,
    current: Option<(String, DimensionsManifest)>,
    dirty: bool,
}

impl DimensionsRecorder {
    pub fn new(layout: ArtifactLayout) -> Self {
        Self {
            layout,
            current: None,
            dirty: false,
        }
    }

    pub fn record(&mut self, category: &str, basename: &str, dimensions: &[(Variant, Dimensions)]) {
        let switching = self.current.as_ref().map_or(true, |(c, _)| c != category);
        if switching {
            self.flush();
            let manifest = DimensionsManifest::load(&self.layout.dimensions_path(category));
            self.current = Some((category.to_string(), manifest));
        }
        if let Some((_, manifest)) = self.current.as_mut() {
            for (variant, dims) in dimensions {
                manifest.set(basename, *variant, *dims);
            }
            self.dirty = true;
        }
    }

    /// Write the pending manifest, if any. Failures are logged; the manifest
    /// is a layout hint and gets rebuilt on the next run.
    pub fn flush(&mut self) {
        if let Some((category, manifest)) = self.current.take() {
            if self.dirty {
                let path = self.layout.dimensions_path(&category);
                if let Err(e) = manifest.save(&path) {
                    warn!("Failed to write {}: {}", path.display(), e);
                }
            }
        }
        self.dirty = false;
    }
}

impl Drop for DimensionsRecorder {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ExternalTool;
    use chrono::Utc;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::fs;
    use std::time::Duration;

    fn pipeline(root: &Path) -> Pipeline {
        Pipeline::new(
            ArtifactLayout::new(root),
            JpegQualities::default(),
            VideoDeriver::new(
                ExternalTool::new("/nonexistent/ffmpeg", Duration::from_secs(1)),
                1.0,
                85,
            ),
        )
    }

    fn put_source(p: &Pipeline, category: &str, name: &str, bytes: &[u8]) -> SourceFile {
        let path = p.layout().source_path(category, name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, bytes).unwrap();
        SourceFile {
            category: category.into(),
            filename: name.into(),
            extension: crate::classifier::extension_of(name).unwrap_or_default(),
            size: bytes.len() as u64,
            modified: Utc::now(),
        }
    }

    fn png(w: u32, h: u32) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([200, 10, 10])))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn test_image_writes_all_variants() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let bytes = png(3000, 2000);
        let source = put_source(&p, "family", "IMG_1.PNG", &bytes);

        let derived = match p.process(&source).await {
            FileOutcome::Derived(d) => d,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(derived.fingerprint, fingerprint::hash_bytes(&bytes));
        assert_eq!(derived.artifacts.len(), 3);
        for variant in Variant::ALL {
            assert!(p.layout().variant_path("family", variant, "IMG_1").is_file());
        }
        assert!(derived
            .dimensions
            .contains(&(Variant::Thumbnail, Dimensions { width: 400, height: 400 })));
    }

    #[tokio::test]
    async fn test_bad_files_fail_or_skip_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());

        let corrupt = put_source(&p, "family", "broken.jpg", b"not a jpeg");
        assert!(matches!(p.process(&corrupt).await, FileOutcome::Failed(DeriveError::Decode(_))));

        let doc = put_source(&p, "family", "notes.txt", b"hello");
        assert!(matches!(p.process(&doc).await, FileOutcome::Skipped(_)));

        let gone = put_source(&p, "family", "gone.png", &png(10, 10));
        fs::remove_file(gone.path(p.layout())).unwrap();
        assert!(matches!(p.process(&gone).await, FileOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_failed_remux_fails_only_that_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let clip = put_source(&p, "family", "clip.m4v", b"legacy container");
        let photo = put_source(&p, "family", "photo.png", &png(50, 50));

        assert!(matches!(p.process(&clip).await, FileOutcome::Failed(DeriveError::Remux(_))));
        assert_eq!(fs::read(clip.path(p.layout())).unwrap(), b"legacy container");
        assert!(matches!(p.process(&photo).await, FileOutcome::Derived(_)));
    }

    #[tokio::test]
    async fn test_only_legacy_containers_are_remuxed() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let mov = put_source(&p, "family", "beach.mov", b"modern container");
        // no ffmpeg: the thumbnail fails, but nothing is remuxed
        assert!(matches!(
            p.process(&mov).await,
            FileOutcome::Failed(DeriveError::FrameExtraction(_))
        ));
        assert!(mov.path(p.layout()).exists());
        assert!(!p.layout().source_path("family", "beach.mp4").exists());

        // the remux target name is taken by a different upload
        let clip = put_source(&p, "family", "clip.m4v", b"legacy container");
        put_source(&p, "family", "clip.mp4", b"someone else's video");
        assert!(matches!(p.process(&clip).await, FileOutcome::Failed(DeriveError::Remux(_))));
        assert_eq!(fs::read(clip.path(p.layout())).unwrap(), b"legacy container");
        assert_eq!(
            fs::read(p.layout().source_path("family", "clip.mp4")).unwrap(),
            b"someone else's video"
        );
    }

    #[test]
    fn test_reconcile_removes_only_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let live = put_source(&p, "family", "keep.jpg", b"x");
        for name in ["keep", "stale"] {
            for variant in Variant::ALL {
                let path = p.layout().variant_path("family", variant, name);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, b"jpeg").unwrap();
            }
        }
        let mut manifest = DimensionsManifest::default();
        manifest.set("keep", Variant::Medium, Dimensions { width: 1, height: 1 });
        manifest.set("stale", Variant::Medium, Dimensions { width: 1, height: 1 });
        manifest.save(&p.layout().dimensions_path("family")).unwrap();

        let removed = p.reconcile_orphans("family", &[live]).unwrap();
        assert_eq!(removed, 3);
        assert!(p.layout().variant_path("family", Variant::Largest, "keep").exists());
        assert!(!p.layout().variant_path("family", Variant::Largest, "stale").exists());
        assert!(p.layout().source_path("family", "keep.jpg").exists());

        let manifest = DimensionsManifest::load(&p.layout().dimensions_path("family"));
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_recorder_flushes_on_category_change() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let dims = [(Variant::Thumbnail, Dimensions { width: 400, height: 400 })];

        let mut recorder = DimensionsRecorder::new(layout.clone());
        recorder.record("alps", "a", &dims);
        assert!(!layout.dimensions_path("alps").exists());
        recorder.record("zoo", "z", &dims);
        assert!(layout.dimensions_path("alps").exists());
        drop(recorder);

        let zoo = DimensionsManifest::load(&layout.dimensions_path("zoo"));
        assert_eq!(zoo.get("z", Variant::Thumbnail), Some(dims[0].1));
    }
}
