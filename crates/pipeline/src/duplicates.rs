//! Content-addressed duplicate detection across category `source/` trees.
//!
//! Scanning only reports. Files are removed exclusively through [`resolve`],
//! which takes an explicit [`Confirmation`] and re-checks every file first.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::catalog::SourceFile;
use crate::error::ResolveError;
use crate::fingerprint::{self, Fingerprint};
use crate::layout::{basename_of, ArtifactLayout, DimensionsManifest, Scope, Variant};
use crate::storage;

/// One file taking part in a duplicate group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateEntry {
    pub category: String,
    pub filename: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl DuplicateEntry {
    fn from_source(file: &SourceFile) -> Self {
        Self {
            category: file.category.clone(),
            filename: file.filename.clone(),
            size: file.size,
            modified: file.modified,
        }
    }

    pub fn path(&self, layout: &ArtifactLayout) -> PathBuf {
        layout.source_path(&self.category, &self.filename)
    }

    /// Keep-policy order: earliest upload first, then category, then filename
    fn keep_order(&self) -> (DateTime<Utc>, &str, &str) {
        (self.modified, &self.category, &self.filename)
    }
}

/// Files sharing one fingerprint: the one to keep and the deletion candidates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub fingerprint: Fingerprint,
    pub keep: DuplicateEntry,
    pub candidates: Vec<DuplicateEntry>,
}

impl DuplicateGroup {
    pub fn reclaimable_bytes(&self) -> u64 {
        self.candidates.iter().map(|c| c.size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub scope: Scope,
    pub groups: Vec<DuplicateGroup>,
    pub files_scanned: u64,
    pub files_vanished: u64,
    pub files_unreadable: u64,
    pub reclaimable_bytes: u64,
    pub generated_at: DateTime<Utc>,
}

impl DuplicateReport {
    pub fn candidate_count(&self) -> usize {
        self.groups.iter().map(|g| g.candidates.len()).sum()
    }
}

/// What happened when fingerprinting one source file
#[derive(Debug)]
pub enum ScanOutcome {
    Hashed(Fingerprint),
    /// Removed between enumeration and hashing
    Vanished,
    Unreadable(io::Error),
}

/// Hash one enumerated source file
pub fn fingerprint_source(layout: &ArtifactLayout, file: &SourceFile) -> ScanOutcome {
    match fingerprint::hash_file(&file.path(layout)) {
        Ok(fp) => ScanOutcome::Hashed(fp),
        Err(e) if e.kind() == io::ErrorKind::NotFound => ScanOutcome::Vanished,
        Err(e) => ScanOutcome::Unreadable(e),
    }
}

/// Accumulates per-file outcomes into a report. Used directly by the
/// scan-duplicates job so it can checkpoint between files.
#[derive(Debug, Default)]
pub struct DuplicateCollector {
    by_fingerprint: BTreeMap<Fingerprint, Vec<DuplicateEntry>>,
    files_scanned: u64,
    files_vanished: u64,
    files_unreadable: u64,
}

impl DuplicateCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, file: &SourceFile, outcome: &ScanOutcome) {
        match outcome {
            ScanOutcome::Hashed(fp) => {
                self.files_scanned += 1;
                self.by_fingerprint
                    .entry(fp.clone())
                    .or_default()
                    .push(DuplicateEntry::from_source(file));
            }
            ScanOutcome::Vanished => {
                debug!("{} vanished during scan", file.key());
                self.files_vanished += 1;
            }
            ScanOutcome::Unreadable(e) => {
                warn!("Cannot read {}: {}", file.key(), e);
                self.files_unreadable += 1;
            }
        }
    }

    pub fn finish(self, scope: Scope) -> DuplicateReport {
        let mut groups = Vec::new();
        for (fingerprint, mut entries) in self.by_fingerprint {
            if entries.len() < 2 {
                continue;
            }
            entries.sort_by(|a, b| a.keep_order().cmp(&b.keep_order()));
            let keep = entries.remove(0);
            groups.push(DuplicateGroup {
                fingerprint,
                keep,
                candidates: entries,
            });
        }

        let reclaimable_bytes = groups.iter().map(DuplicateGroup::reclaimable_bytes).sum();
        DuplicateReport {
            scope,
            groups,
            files_scanned: self.files_scanned,
            files_vanished: self.files_vanished,
            files_unreadable: self.files_unreadable,
            reclaimable_bytes,
            generated_at: Utc::now(),
        }
    }
}

/// Explicit go-ahead for [`resolve`] to delete files
#[derive(Debug, Clone, Copy)]
pub struct Confirmation {
    _private: (),
}

impl Confirmation {
    pub fn delete_duplicates() -> Self {
        Self { _private: () }
    }
}

#[derive(Debug, Default)]
pub struct ResolveSummary {
    pub deleted: Vec<DuplicateEntry>,
    pub refused: Vec<(DuplicateEntry, ResolveError)>,
    pub bytes_reclaimed: u64,
    pub artifacts_removed: u64,
}

/// Delete the candidates of a report. Every kept file and candidate is
/// re-fingerprinted first; anything that no longer matches is left alone.
/// Only files are removed, never directories.
pub fn resolve(
    layout: &ArtifactLayout,
    report: &DuplicateReport,
    _confirmation: Confirmation,
) -> ResolveSummary {
    let mut summary = ResolveSummary::default();

    for group in &report.groups {
        let kept_path = group.keep.path(layout);
        if !matches_fingerprint(&kept_path, &group.fingerprint) {
            warn!(
                "Keeping all copies of {}: {} changed",
                group.fingerprint.short(),
                kept_path.display()
            );
            for candidate in &group.candidates {
                summary.refused.push((
                    candidate.clone(),
                    ResolveError::KeptFileChanged {
                        path: kept_path.clone(),
                    },
                ));
            }
            continue;
        }

        for candidate in &group.candidates {
            match delete_candidate(layout, candidate, &group.fingerprint) {
                Ok(artifacts) => {
                    info!(
                        "Deleted duplicate {}/{} (kept {}/{})",
                        candidate.category, candidate.filename, group.keep.category, group.keep.filename
                    );
                    summary.bytes_reclaimed += candidate.size;
                    summary.artifacts_removed += artifacts;
                    summary.deleted.push(candidate.clone());
                }
                Err(e) => {
                    warn!("Not deleting {}/{}: {}", candidate.category, candidate.filename, e);
                    summary.refused.push((candidate.clone(), e));
                }
            }
        }
    }

    summary
}

fn matches_fingerprint(path: &Path, expected: &Fingerprint) -> bool {
    matches!(fingerprint::hash_file(path), Ok(fp) if &fp == expected)
}

fn delete_candidate(
    layout: &ArtifactLayout,
    candidate: &DuplicateEntry,
    expected: &Fingerprint,
) -> Result<u64, ResolveError> {
    let path = candidate.path(layout);
    match fingerprint::hash_file(&path) {
        Ok(fp) if &fp == expected => {}
        Ok(_) => return Err(ResolveError::CandidateChanged { path }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ResolveError::CandidateMissing { path })
        }
        Err(source) => return Err(ResolveError::Io { path, source }),
    }

    storage::delete(&path).map_err(|source| ResolveError::Io {
        path: path.clone(),
        source,
    })?;

    remove_artifacts(layout, &candidate.category, &candidate.filename)
}

/// Remove derived artifacts of a deleted source unless another source in
/// the category still maps to the same basename
fn remove_artifacts(layout: &ArtifactLayout, category: &str, filename: &str) -> Result<u64, ResolveError> {
    let basename = basename_of(filename);
    let source_dir = layout.source_dir(category);
    let siblings = storage::list_dir(&source_dir).map_err(|source| ResolveError::Io {
        path: source_dir.clone(),
        source,
    })?;
    if siblings.iter().any(|name| basename_of(name) == basename) {
        debug!("Artifacts of {} still belong to another source", basename);
        return Ok(0);
    }

    let mut removed = 0;
    for variant in Variant::ALL {
        let artifact = layout.variant_path(category, variant, basename);
        if storage::delete(&artifact).map_err(|source| ResolveError::Io {
            path: artifact.clone(),
            source,
        })? {
            removed += 1;
        }
    }

    let manifest_path = layout.dimensions_path(category);
    let mut manifest = DimensionsManifest::load(&manifest_path);
    if manifest.retain_basenames(|name| name != basename) > 0 {
        manifest.save(&manifest_path).map_err(|source| ResolveError::Io {
            path: manifest_path.clone(),
            source,
        })?;
    }

    Ok(removed)
}
