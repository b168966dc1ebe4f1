use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::classifier::extension_of;
use crate::error::JobError;
use crate::layout::{ArtifactLayout, Scope};

/// One original upload under `<root>/<category>/source/`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub category: String,
    pub filename: String,
    /// Lower-cased, empty when the name has none
    pub extension: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl SourceFile {
    pub fn path(&self, layout: &ArtifactLayout) -> PathBuf {
        layout.source_path(&self.category, &self.filename)
    }

    /// Stable key used by the progress store
    pub fn key(&self) -> String {
        format!("{}/{}", self.category, self.filename)
    }
}

/// Enumerate the source files of a scope in stable order: categories by
/// name, then files by name. Only a missing or unreadable scope root is an
/// error; individual entries that vanish are skipped.
pub fn enumerate(layout: &ArtifactLayout, scope: &Scope) -> Result<Vec<SourceFile>, JobError> {
    let categories = match scope {
        Scope::Category(name) => {
            let dir = layout.source_dir(name);
            check_readable(&dir, scope)?;
            vec![name.clone()]
        }
        Scope::All => list_categories(layout, scope)?,
    };

    let mut files = Vec::new();
    for category in &categories {
        let dir = layout.source_dir(category);
        if !dir.is_dir() {
            warn!("Category {} has no {} directory, skipping", category, dir.display());
            continue;
        }
        let before = files.len();
        collect_category(category, &dir, &mut files);
        debug!("Category {}: {} source files", category, files.len() - before);
    }

    info!(
        "Enumerated {} source files across {} categories in scope {}",
        files.len(),
        categories.len(),
        scope
    );
    Ok(files)
}

/// Category directory names directly under the root, sorted
pub fn list_categories(layout: &ArtifactLayout, scope: &Scope) -> Result<Vec<String>, JobError> {
    let root = layout.root();
    check_readable(root, scope)?;

    let mut names = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading category entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        match entry.file_name().to_str() {
            Some(name) if !name.starts_with('.') => names.push(name.to_string()),
            _ => {}
        }
    }
    Ok(names)
}

fn collect_category(category: &str, dir: &Path, out: &mut Vec<SourceFile>) {
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry in {}: {}", category, e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let filename = match entry.file_name().to_str() {
            Some(name) if !name.starts_with('.') => name.to_string(),
            Some(_) => continue,
            None => {
                warn!("Skipping non UTF-8 filename in {}: {:?}", category, entry.file_name());
                continue;
            }
        };

        // the file may be gone by the time we stat it
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!("Skipping {}/{}: {}", category, filename, e);
                continue;
            }
        };
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        out.push(SourceFile {
            category: category.to_string(),
            extension: extension_of(&filename).unwrap_or_default(),
            filename,
            size: metadata.len(),
            modified,
        });
    }
}

fn check_readable(dir: &Path, scope: &Scope) -> Result<(), JobError> {
    let unreadable = |source| JobError::ScopeUnreadable {
        scope: scope.clone(),
        path: dir.to_path_buf(),
        source,
    };
    let metadata = std::fs::metadata(dir).map_err(unreadable)?;
    if !metadata.is_dir() {
        return Err(unreadable(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a directory",
        )));
    }
    std::fs::read_dir(dir).map_err(unreadable)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(layout: &ArtifactLayout, category: &str, name: &str) {
        let dir = layout.source_dir(category);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), name.as_bytes()).unwrap();
    }

    #[test]
    fn test_category_scope_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        touch(&layout, "family", "b.JPG");
        touch(&layout, "family", "a.mov");
        touch(&layout, "family", ".tmp-123.mp4");
        touch(&layout, "family", "README");
        fs::create_dir_all(layout.source_dir("family").join("nested")).unwrap();

        let files = enumerate(&layout, &Scope::Category("family".into())).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["README", "a.mov", "b.JPG"]);
        assert_eq!(files[2].extension, "jpg");
        assert_eq!(files[0].extension, "");
        assert_eq!(files[1].size, "a.mov".len() as u64);
    }

    #[test]
    fn test_all_scope_orders_categories_and_skips_bare_ones() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        touch(&layout, "zoo", "z.png");
        touch(&layout, "alps", "a.png");
        fs::create_dir_all(dir.path().join("empty-category")).unwrap();
        fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let files = enumerate(&layout, &Scope::All).unwrap();
        let keys: Vec<_> = files.iter().map(SourceFile::key).collect();
        assert_eq!(keys, vec!["alps/a.png", "zoo/z.png"]);
    }

    #[test]
    fn test_missing_category_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let err = enumerate(&layout, &Scope::Category("ghost".into())).unwrap_err();
        match err {
            JobError::ScopeUnreadable { scope, source, .. } => {
                assert_eq!(scope, Scope::Category("ghost".into()));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected {:?}", other),
        }

        let missing_root = ArtifactLayout::new(dir.path().join("nope"));
        assert!(enumerate(&missing_root, &Scope::All).is_err());
    }
}
