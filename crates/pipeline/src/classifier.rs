use std::path::Path;
use serde::{Deserialize, Serialize};

/// Still-image extensions the pipeline derives variants for
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "heic", "heif", "webp", "tiff", "bmp", "dng", "gif",
];

/// Video extensions the pipeline derives thumbnails for
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "m4v", "3gp"];

/// Legacy container that gets remuxed into mp4
pub const LEGACY_VIDEO_EXTENSION: &str = "m4v";

/// Kind of media a source file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Unsupported,
}

/// One derived output a source file requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivation {
    Largest,
    Medium,
    Thumbnail,
    Remux,
}

/// Result of classifying a filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: MediaKind,
    /// Lower-cased extension, empty when the name has none
    pub extension: String,
    pub derivations: Vec<Derivation>,
}

impl Classification {
    pub fn needs_remux(&self) -> bool {
        self.derivations.contains(&Derivation::Remux)
    }
}

/// Lower-cased extension of a filename, if any
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

/// Classify a file by its extension (case-insensitive). Never fails:
/// anything outside the allow-lists is `Unsupported`.
pub fn classify(filename: &str) -> Classification {
    let extension = extension_of(filename).unwrap_or_default();

    let (kind, derivations) = if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        (
            MediaKind::Image,
            vec![Derivation::Largest, Derivation::Medium, Derivation::Thumbnail],
        )
    } else if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
        let mut derivations = vec![Derivation::Thumbnail];
        if extension == LEGACY_VIDEO_EXTENSION {
            derivations.push(Derivation::Remux);
        }
        (MediaKind::Video, derivations)
    } else {
        (MediaKind::Unsupported, Vec::new())
    };

    Classification {
        kind,
        extension,
        derivations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_images_need_three_variants() {
        let c = classify("IMG_0001.HEIC");
        assert_eq!(c.kind, MediaKind::Image);
        assert_eq!(c.extension, "heic");
        assert_eq!(
            c.derivations,
            vec![Derivation::Largest, Derivation::Medium, Derivation::Thumbnail]
        );
    }

    #[test]
    fn test_only_m4v_needs_remux() {
        assert!(classify("clip.M4V").needs_remux());
        assert!(!classify("clip.mov").needs_remux());
        assert_eq!(classify("clip.3gp").derivations, vec![Derivation::Thumbnail]);
    }

    #[test]
    fn test_unsupported_is_a_value_not_an_error() {
        for name in ["notes.txt", "README", ".hidden", "archive.tar.gz", "photo."] {
            let c = classify(name);
            assert_eq!(c.kind, MediaKind::Unsupported, "{}", name);
            assert!(c.derivations.is_empty());
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_classification_ignores_case(
            stem in "[a-zA-Z0-9_-]{1,16}",
            ext in prop::sample::select(
                IMAGE_EXTENSIONS.iter().chain(VIDEO_EXTENSIONS.iter()).copied().collect::<Vec<_>>()
            ),
            upper in prop::bool::ANY,
        ) {
            let ext = if upper { ext.to_uppercase() } else { ext.to_string() };
            let name = format!("{}.{}", stem, ext);
            let c = classify(&name);

            prop_assert_ne!(c.kind, MediaKind::Unsupported);
            prop_assert_eq!(c.extension, ext.to_lowercase());
        }
    }
}
