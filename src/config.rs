//! Conversion run configuration.

use std::{path::PathBuf, str::FromStr};

use url::Url;

pub const DEFAULT_FETCH_CONCURRENCY: usize = 16;

/// Bundle target platform. Validated before any work starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Osx,
}

impl Platform {
    /// Suffix the builder appends to every bundle name.
    pub fn suffix(&self) -> &'static str {
        match self {
            Platform::Windows => "_windows",
            Platform::Osx => "_osx",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown platform '{0}', expected 'windows' or 'osx'")]
pub struct InvalidPlatform(pub String);

impl FromStr for Platform {
    type Err = InvalidPlatform;

    fn from_str(s: &str) -> Result<Self, InvalidPlatform> {
        if s.eq_ignore_ascii_case("windows") {
            Ok(Platform::Windows)
        } else if s.eq_ignore_ascii_case("osx") {
            Ok(Platform::Osx)
        } else {
            Err(InvalidPlatform(s.to_owned()))
        }
    }
}

/// One conversion run's settings. Immutable once the run starts.
#[derive(Clone, Debug)]
pub struct Config {
    /// Hash or entity pointer naming the batch target.
    pub target: String,

    /// Root under which asset folders and final bundles land.
    pub output_root: PathBuf,

    /// Remote content store base.
    pub base_url: Url,

    /// Shader variant assigned to extracted materials.
    pub shader: String,

    pub platform: Platform,

    /// Rebuild bundles even when outputs look current.
    pub always_rebuild: bool,

    /// Keep fetched blobs under `<root>/downloads/` for debugging.
    pub keep_downloads: bool,

    /// Report already-converted instead of redoing finished work.
    pub skip_if_exists: bool,

    /// In-flight fetch cap; 0 means unbounded.
    pub fetch_concurrency: usize,
}

impl Config {
    /// Directory final bundles are written to and cleaned up in.
    pub fn bundle_dir(&self) -> PathBuf {
        self.output_root.join("Bundles")
    }

    /// Directory fetched blobs are mirrored to when `keep_downloads` is set.
    pub fn downloads_dir(&self) -> PathBuf {
        self.output_root.join("downloads")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_parse_is_case_insensitive() {
        assert_eq!("Windows".parse::<Platform>().unwrap(), Platform::Windows);
        assert_eq!("OSX".parse::<Platform>().unwrap(), Platform::Osx);
        assert!("linux".parse::<Platform>().is_err());
    }

    #[test]
    fn platform_suffixes() {
        assert_eq!(Platform::Windows.suffix(), "_windows");
        assert_eq!(Platform::Osx.suffix(), "_osx");
    }
}
