//! Output cleanup and skip detection.
//!
//! The builder emits platform-suffixed, lower-cased bundle names plus
//! `.manifest` sidecars and a build log. The runtime expects plain bundle
//! files under their canonical-cased names. Cleanup bridges the two after
//! the final build pass. Skip detection runs before any fetch and looks
//! for exactly the cleaned-up names.

use std::path::Path;

use crate::{
    address::CasingTable,
    build::{BUILD_LOG_NAME, MANIFEST_EXTENSION},
};

pub const PLATFORM_SUFFIXES: [&str; 2] = ["_windows", "_osx"];

/// Strips a known platform suffix, if any.
pub fn strip_platform_suffix(name: &str) -> Option<&str> {
    PLATFORM_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
}

/// True when every expected bundle already exists under its final name.
///
/// Opt-in; callers translate a skip into the already-converted outcome.
pub fn should_skip(bundle_dir: &Path, expected: &[String], skip_if_exists: bool) -> bool {
    if !skip_if_exists || expected.is_empty() {
        return false;
    }
    expected
        .iter()
        .all(|name| bundle_dir.join(name).is_file())
}

/// Post-build cleanup: removes the build log and `.manifest` sidecars,
/// strips platform suffixes and restores canonical casing on bundle files.
///
/// Best effort per entry. A bundle that fails to rename is left under its
/// suffixed name and the failure is logged; the run does not fail for it.
#[tracing::instrument(skip(casing), fields(dir = %bundle_dir.display()))]
pub fn cleanup(bundle_dir: &Path, casing: &CasingTable) {
    let entries = match std::fs::read_dir(bundle_dir) {
        Err(err) => {
            tracing::error!(
                "Failed to scan bundle directory '{}'. {:#}",
                bundle_dir.display(),
                err
            );
            return;
        }
        Ok(entries) => entries,
    };

    for entry in entries {
        let entry = match entry {
            Err(err) => {
                tracing::error!(
                    "Failed to read entry in '{}'. {:#}",
                    bundle_dir.display(),
                    err
                );
                continue;
            }
            Ok(entry) => entry,
        };

        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if name == BUILD_LOG_NAME
            || path.extension().map_or(false, |e| e == MANIFEST_EXTENSION)
        {
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::error!("Failed to remove '{}'. {:#}", path.display(), err);
            }
            continue;
        }

        if let Some(stripped) = strip_platform_suffix(name) {
            let final_name = casing.restore(stripped);
            let final_path = path.with_file_name(&final_name);
            if let Err(err) = std::fs::rename(&path, &final_path) {
                tracing::error!(
                    "Failed to rename bundle '{}' to '{}'. {:#}",
                    path.display(),
                    final_path.display(),
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;

    #[test]
    fn suffix_stripping() {
        assert_eq!(strip_platform_suffix("abc123_windows"), Some("abc123"));
        assert_eq!(strip_platform_suffix("abc123_osx"), Some("abc123"));
        assert_eq!(strip_platform_suffix("abc123"), None);
    }

    #[test]
    fn cleanup_renames_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc123_windows"), b"bundle").unwrap();
        std::fs::write(dir.path().join("abc123_windows.manifest"), b"[]").unwrap();
        std::fs::write(dir.path().join(BUILD_LOG_NAME), b"log").unwrap();

        let mut casing = CasingTable::new();
        casing.record(&ContentHash::from("AbC123"));

        cleanup(dir.path(), &casing);

        assert!(dir.path().join("AbC123").is_file());
        assert!(!dir.path().join("abc123_windows").exists());
        assert!(!dir.path().join("abc123_windows.manifest").exists());
        assert!(!dir.path().join(BUILD_LOG_NAME).exists());
    }

    #[test]
    fn skip_requires_opt_in_and_all_bundles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AbC123"), b"bundle").unwrap();

        let expected = vec!["AbC123".to_owned(), "FF00".to_owned()];
        assert!(!should_skip(dir.path(), &expected, true));

        std::fs::write(dir.path().join("FF00"), b"bundle").unwrap();
        assert!(should_skip(dir.path(), &expected, true));
        assert!(!should_skip(dir.path(), &expected, false));
        assert!(!should_skip(dir.path(), &[], true));
    }
}
