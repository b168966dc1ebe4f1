use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 digest of a source file's bytes, rendered as lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, enough for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash an in-memory buffer
pub fn hash_bytes(bytes: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Fingerprint(format!("{:x}", hasher.finalize()))
}

/// Hash a file by streaming it; the whole file is read, never a prefix
pub fn hash_file(path: &Path) -> io::Result<Fingerprint> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(Fingerprint(format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            hash_bytes(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hash_bytes(b"abc").short(), "ba7816bf8f01");
    }

    #[test]
    fn test_file_and_buffer_agree_across_chunk_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..(64 * 1024 * 2 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = hash_file(&dir.path().join("gone.jpg")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_fingerprint_is_stable(data in prop::collection::vec(any::<u8>(), 0..4096)) {
            let first = hash_bytes(&data);
            let second = hash_bytes(&data);
            prop_assert_eq!(first.as_str().len(), 64);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn test_fingerprint_changes_with_content(
            data in prop::collection::vec(any::<u8>(), 1..4096),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut changed = data.clone();
            let i = index.index(changed.len());
            changed[i] ^= flip;
            prop_assert_ne!(hash_bytes(&data), hash_bytes(&changed));
        }
    }
}
