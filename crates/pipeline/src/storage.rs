use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// Prefix of in-flight temporaries; enumeration skips dot-files
pub const TEMP_PREFIX: &str = ".tmp-";

/// Read a whole file
pub fn read_bytes(path: &Path) -> io::Result<Vec<u8>> {
    fs::read(path)
}

/// Create an empty temporary file next to `target`, so a later rename stays
/// on the same filesystem
pub fn temp_sibling(target: &Path) -> io::Result<NamedTempFile> {
    let parent = parent_dir(target)?;
    fs::create_dir_all(&parent)?;
    let suffix = target
        .extension()
        .and_then(|s| s.to_str())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default();
    tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(&suffix)
        .tempfile_in(&parent)
}

/// Write `bytes` to `target` via temp file + fsync + rename. Readers see
/// either the previous content or the complete new content.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = temp_sibling(target)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Names of the entries in a directory, sorted
pub fn list_dir(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Remove a file. Returns false if it was already gone.
pub fn delete(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn parent_dir(path: &Path) -> io::Result<PathBuf> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path has no parent directory: {}", path.display()),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cat/medium/a.jpeg");

        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();

        assert_eq!(read_bytes(&target).unwrap(), b"second");
        // no temporaries left behind
        assert_eq!(list_dir(target.parent().unwrap()).unwrap(), vec!["a.jpeg"]);
    }

    #[test]
    fn test_temp_sibling_is_hidden_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("clip.mp4");
        let tmp_path = {
            let tmp = temp_sibling(&target).unwrap();
            let name = tmp.path().file_name().unwrap().to_str().unwrap().to_string();
            assert!(name.starts_with(TEMP_PREFIX));
            assert!(name.ends_with(".mp4"));
            tmp.path().to_path_buf()
        };
        assert!(!tmp_path.exists());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, b"x").unwrap();
        assert!(delete(&path).unwrap());
        assert!(!delete(&path).unwrap());
    }
}
