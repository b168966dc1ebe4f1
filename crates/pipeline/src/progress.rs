use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::storage;

/// Items completed under one progress key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub items: BTreeMap<String, DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Persisted record of which items each resumable job has finished, keyed
/// by `<kind>:<scope>`. Every mutation is written through to disk.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, ProgressEntry>>,
}

impl ProgressStore {
    /// Open the store at `path`; a missing or corrupt file starts empty
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring corrupt progress store {}: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn processed(&self, key: &str) -> HashSet<String> {
        self.lock()
            .get(key)
            .map(|e| e.items.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn mark(&self, key: &str, item: &str) -> io::Result<()> {
        let mut entries = self.lock();
        let now = Utc::now();
        let entry = entries.entry(key.to_string()).or_default();
        entry.items.insert(item.to_string(), now);
        entry.updated_at = Some(now);
        self.persist(&entries)
    }

    /// Forget everything recorded under `key`
    pub fn reset(&self, key: &str) -> io::Result<()> {
        let mut entries = self.lock();
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ProgressEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, entries: &BTreeMap<String, ProgressEntry>) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        storage::write_atomic(&self.path, &json)
    }
}
