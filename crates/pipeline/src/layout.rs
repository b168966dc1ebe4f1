//! On-disk artifact layout shared with the gallery renderer and bulk download.
//!
//! ```text
//! <root>/<category>/source/<filename>            original upload
//! <root>/<category>/largest/<basename>.jpeg      image variants
//! <root>/<category>/medium/<basename>.jpeg
//! <root>/<category>/thumbnail/<basename>.jpeg    image and video thumbnails
//! <root>/<category>/dimensions.json              variant sizes per basename
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::storage;

pub const SOURCE_DIR: &str = "source";
pub const DIMENSIONS_FILE: &str = "dimensions.json";
pub const DERIVED_EXTENSION: &str = "jpeg";

/// The set of categories a job operates over
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    All,
    Category(String),
}

impl Scope {
    /// Two scopes overlap when they can touch the same category subtree
    pub fn overlaps(&self, other: &Scope) -> bool {
        match (self, other) {
            (Scope::All, _) | (_, Scope::All) => true,
            (Scope::Category(a), Scope::Category(b)) => a == b,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => write!(f, "all"),
            Scope::Category(name) => write!(f, "{}", name),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("scope must not be empty".to_string());
        }
        if s == "all" {
            return Ok(Scope::All);
        }
        if s.contains('/') || s.contains('\\') || s == "." || s == ".." {
            return Err(format!("invalid category name: {:?}", s));
        }
        Ok(Scope::Category(s.to_string()))
    }
}

/// Derived image rendition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Largest,
    Medium,
    Thumbnail,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Largest, Variant::Medium, Variant::Thumbnail];

    /// Directory name under the category
    pub fn dir_name(self) -> &'static str {
        match self {
            Variant::Largest => "largest",
            Variant::Medium => "medium",
            Variant::Thumbnail => "thumbnail",
        }
    }

    /// Bounding box (width, height)
    pub fn bounds(self) -> (u32, u32) {
        match self {
            Variant::Largest => (2880, 1620),
            Variant::Medium => (1920, 1080),
            Variant::Thumbnail => (400, 400),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Path arithmetic over the upload root
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn category_dir(&self, category: &str) -> PathBuf {
        self.root.join(category)
    }

    pub fn source_dir(&self, category: &str) -> PathBuf {
        self.category_dir(category).join(SOURCE_DIR)
    }

    pub fn source_path(&self, category: &str, filename: &str) -> PathBuf {
        self.source_dir(category).join(filename)
    }

    pub fn variant_dir(&self, category: &str, variant: Variant) -> PathBuf {
        self.category_dir(category).join(variant.dir_name())
    }

    /// `<category>/<variant>/<basename>.jpeg`
    pub fn variant_path(&self, category: &str, variant: Variant, basename: &str) -> PathBuf {
        self.variant_dir(category, variant)
            .join(format!("{}.{}", basename, DERIVED_EXTENSION))
    }

    pub fn dimensions_path(&self, category: &str) -> PathBuf {
        self.category_dir(category).join(DIMENSIONS_FILE)
    }
}

/// File name without its final extension
pub fn basename_of(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// `dimensions.json` of one category: basename -> variant -> size
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DimensionsManifest {
    entries: BTreeMap<String, BTreeMap<Variant, Dimensions>>,
}

impl DimensionsManifest {
    /// Load the manifest of a category; a missing or corrupt file starts empty
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                log::warn!("Ignoring corrupt dimensions manifest {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        storage::write_atomic(path, &json)
    }

    pub fn set(&mut self, basename: &str, variant: Variant, dims: Dimensions) {
        self.entries
            .entry(basename.to_string())
            .or_default()
            .insert(variant, dims);
    }

    pub fn get(&self, basename: &str, variant: Variant) -> Option<Dimensions> {
        self.entries.get(basename).and_then(|m| m.get(&variant)).copied()
    }

    /// Drop entries whose basename is not in `keep`; returns how many were removed
    pub fn retain_basenames<F>(&mut self, keep: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|name, _| keep(name));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
