//! Dependency-aware bundle building.
//!
//! Bundle dependencies are only known after a build pass has walked the
//! asset folders, but the dependency metadata has to end up *inside* the
//! bundles. So the build runs twice: a discovery pass to learn the
//! dependency graph, a metadata write into each asset folder, then the
//! final pass that packs the metadata along with everything else.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use hashbrown::HashMap;

use crate::{address::CasingTable, artifacts::SIDECAR_EXTENSION};

pub const BUILD_LOG_NAME: &str = "lading-build.log";
pub const METADATA_NAME: &str = "metadata.json";
pub const MANIFEST_EXTENSION: &str = "manifest";

/// Build-time dependency injected into every bundle. Flagged so it never
/// appears in runtime metadata.
pub const BUILTIN_SHADERS: &str = "builtin-shaders";

const METADATA_VERSION: u32 = 1;

/// 100ns intervals between 0001-01-01 and the UNIX epoch.
const UNIX_EPOCH_TICKS: u64 = 621_355_968_000_000_000;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Bundle build produced no manifest during {pass} pass")]
    EmptyManifest { pass: &'static str },

    #[error("Failed to scan asset folder '{path}': {error}")]
    Scan {
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Failed to pack bundle '{name}': {error}")]
    Pack {
        error: std::io::Error,
        name: String,
    },

    #[error("Failed to encode bundle '{name}': {error}")]
    Encode {
        error: bincode::Error,
        name: String,
    },

    #[error("Failed to write metadata '{path}': {error}")]
    MetadataWrite {
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Failed to serialize metadata for bundle '{name}': {error}")]
    MetadataSerialize {
        error: serde_json::Error,
        name: String,
    },
}

/// One dependency edge reported by the builder.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Dependency {
    pub name: String,

    /// Build-time only. Ignored dependencies never reach runtime metadata.
    pub ignore: bool,
}

impl Dependency {
    pub fn runtime(name: impl Into<String>) -> Self {
        Dependency {
            name: name.into(),
            ignore: false,
        }
    }

    pub fn build_only(name: impl Into<String>) -> Self {
        Dependency {
            name: name.into(),
            ignore: true,
        }
    }
}

/// Builder's report: bundle name to its direct dependencies.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct BuildManifest {
    pub bundles: HashMap<String, Vec<Dependency>>,
}

impl BuildManifest {
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BuildOptions {
    pub force_rebuild: bool,
    pub compress: bool,
}

/// Asset folder marked for bundling, named by its lower-cased hash.
#[derive(Clone, Debug)]
pub struct MarkedAsset {
    pub name: String,
    pub folder: PathBuf,

    /// Lower-cased bundle names this asset references.
    pub refs: Vec<String>,
}

/// Bundle production backend.
pub trait BundleBuilder {
    /// Builds one bundle per marked asset into `output`, returning the
    /// manifest of produced bundles. `None` means the backend built
    /// nothing at all.
    fn build_bundles(
        &mut self,
        output: &Path,
        marked: &[MarkedAsset],
        options: &BuildOptions,
        platform_suffix: &str,
    ) -> Result<Option<BuildManifest>, BuildError>;
}

/// Runtime metadata packed inside every bundle.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct BundleMetadata {
    pub version: u32,

    /// 100ns intervals since 0001-01-01.
    pub timestamp: u64,

    pub dependencies: Vec<String>,
}

/// Ticks (100ns intervals since 0001-01-01) for the current time.
pub fn ticks(now: SystemTime) -> u64 {
    match now.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => UNIX_EPOCH_TICKS + d.as_secs() * 10_000_000 + u64::from(d.subsec_nanos() / 100),
        Err(_) => UNIX_EPOCH_TICKS,
    }
}

/// Runs the two-pass build.
///
/// Discovery always forces a rebuild without compression so dependency
/// edges reflect the current folder contents, never a cached bundle. The
/// final pass also always rebuilds, with the caller's compression: the
/// discovery artifacts predate the metadata write and must not survive.
/// An empty manifest from either pass fails the build.
#[tracing::instrument(skip_all, fields(bundles = marked.len()))]
pub fn build_with_metadata(
    builder: &mut dyn BundleBuilder,
    output: &Path,
    marked: &[MarkedAsset],
    options: &BuildOptions,
    platform_suffix: &str,
    casing: &CasingTable,
) -> Result<BuildManifest, BuildError> {
    let discovery = BuildOptions {
        force_rebuild: true,
        compress: false,
    };

    let manifest = builder
        .build_bundles(output, marked, &discovery, platform_suffix)?
        .ok_or(BuildError::EmptyManifest { pass: "discovery" })?;
    if manifest.is_empty() {
        return Err(BuildError::EmptyManifest { pass: "discovery" });
    }

    write_metadata(marked, &manifest, casing)?;

    let finalize = BuildOptions {
        force_rebuild: true,
        compress: options.compress,
    };
    let manifest = builder
        .build_bundles(output, marked, &finalize, platform_suffix)?
        .ok_or(BuildError::EmptyManifest { pass: "final" })?;
    if manifest.is_empty() {
        return Err(BuildError::EmptyManifest { pass: "final" });
    }

    Ok(manifest)
}

/// Writes `metadata.json` into each bundle's asset folder.
///
/// Ignored dependencies are dropped and lower-cased bundle names are
/// restored to their canonical casing so runtime lookups match the final
/// renamed bundle files.
fn write_metadata(
    marked: &[MarkedAsset],
    manifest: &BuildManifest,
    casing: &CasingTable,
) -> Result<(), BuildError> {
    let timestamp = ticks(SystemTime::now());

    let folders: HashMap<&str, &Path> = marked
        .iter()
        .map(|asset| (asset.name.as_str(), asset.folder.as_path()))
        .collect();

    for (name, deps) in &manifest.bundles {
        let Some(folder) = folders.get(name.as_str()) else {
            tracing::debug!("Bundle '{}' has no marked asset folder", name);
            continue;
        };

        let mut dependencies: Vec<String> = deps
            .iter()
            .filter(|dep| !dep.ignore)
            .map(|dep| casing.restore(&dep.name))
            .collect();
        dependencies.sort();
        dependencies.dedup();

        let metadata = BundleMetadata {
            version: METADATA_VERSION,
            timestamp,
            dependencies,
        };

        let text = serde_json::to_string_pretty(&metadata).map_err(|error| {
            BuildError::MetadataSerialize {
                error,
                name: name.clone(),
            }
        })?;

        let path = folder.join(METADATA_NAME);
        std::fs::write(&path, text.as_bytes())
            .map_err(|error| BuildError::MetadataWrite { error, path })?;
    }

    Ok(())
}

/// Bundle payload. Entries are sorted by relative path before encoding so
/// identical folder contents encode to identical bytes.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct BundlePayload {
    pub entries: Vec<(String, Vec<u8>)>,
}

/// Directory-packing bundle builder.
///
/// Packs each marked asset folder into a bincode blob at
/// `<output>/<name><platform_suffix>`, writes a `.manifest` sidecar with
/// the dependency list, and appends to the build log. Every bundle also
/// depends on the builtin shader bundle at build time only.
pub struct DirBundler;

impl DirBundler {
    pub fn new() -> Self {
        DirBundler
    }

    fn collect_entries(folder: &Path) -> Result<Vec<(String, Vec<u8>)>, BuildError> {
        let mut entries = Vec::new();
        let mut stack = vec![folder.to_owned()];

        while let Some(dir) = stack.pop() {
            let read = std::fs::read_dir(&dir).map_err(|error| BuildError::Scan {
                error,
                path: dir.clone(),
            })?;
            for entry in read {
                let entry = entry.map_err(|error| BuildError::Scan {
                    error,
                    path: dir.clone(),
                })?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().map_or(true, |e| e != SIDECAR_EXTENSION) {
                    // Identity sidecars are store bookkeeping, not content.
                    let rel = path
                        .strip_prefix(folder)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .replace('\\', "/");
                    let bytes = std::fs::read(&path).map_err(|error| BuildError::Scan {
                        error,
                        path: path.clone(),
                    })?;
                    entries.push((rel, bytes));
                }
            }
        }

        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(entries)
    }
}

impl Default for DirBundler {
    fn default() -> Self {
        DirBundler::new()
    }
}

impl BundleBuilder for DirBundler {
    #[tracing::instrument(skip_all, fields(output = %output.display()))]
    fn build_bundles(
        &mut self,
        output: &Path,
        marked: &[MarkedAsset],
        options: &BuildOptions,
        platform_suffix: &str,
    ) -> Result<Option<BuildManifest>, BuildError> {
        if marked.is_empty() {
            return Ok(None);
        }

        let mut manifest = BuildManifest::default();
        let mut log = String::new();

        for asset in marked {
            let bundle_name = format!("{}{}", asset.name, platform_suffix);
            let bundle_path = output.join(&bundle_name);

            if bundle_path.exists() && !options.force_rebuild {
                tracing::debug!("Bundle '{}' is up to date", bundle_name);
            } else {
                let entries = Self::collect_entries(&asset.folder)?;
                let payload = BundlePayload { entries };
                let encoded =
                    bincode::serialize(&payload).map_err(|error| BuildError::Encode {
                        error,
                        name: bundle_name.clone(),
                    })?;
                std::fs::write(&bundle_path, &encoded).map_err(|error| BuildError::Pack {
                    error,
                    name: bundle_name.clone(),
                })?;
            }

            let mut deps: Vec<Dependency> = asset
                .refs
                .iter()
                .map(|name| Dependency::runtime(name.clone()))
                .collect();
            deps.push(Dependency::build_only(BUILTIN_SHADERS));

            let manifest_path = bundle_path.with_extension(MANIFEST_EXTENSION);
            let text = serde_json::to_string_pretty(&deps).map_err(|error| {
                BuildError::MetadataSerialize {
                    error,
                    name: bundle_name.clone(),
                }
            })?;
            std::fs::write(&manifest_path, text.as_bytes()).map_err(|error| {
                BuildError::Pack {
                    error,
                    name: bundle_name.clone(),
                }
            })?;

            log.push_str(&bundle_name);
            log.push('\n');

            manifest.bundles.insert(asset.name.clone(), deps);
        }

        let log_path = output.join(BUILD_LOG_NAME);
        std::fs::write(&log_path, log.as_bytes()).map_err(|error| BuildError::MetadataWrite {
            error,
            path: log_path,
        })?;

        Ok(Some(manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;

    fn marked(dir: &Path, name: &str, refs: &[&str]) -> MarkedAsset {
        let folder = dir.join(name);
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join(format!("{name}.bin")), name.as_bytes()).unwrap();
        MarkedAsset {
            name: name.to_owned(),
            folder,
            refs: refs.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn ticks_at_unix_epoch() {
        assert_eq!(ticks(SystemTime::UNIX_EPOCH), UNIX_EPOCH_TICKS);
        let later = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1);
        assert_eq!(ticks(later), UNIX_EPOCH_TICKS + 10_000_000);
    }

    #[test]
    fn two_pass_build_writes_filtered_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let assets = vec![
            marked(dir.path(), "abc123", &["ff00"]),
            marked(dir.path(), "ff00", &[]),
        ];

        let mut casing = CasingTable::new();
        casing.record(&ContentHash::from("AbC123"));
        casing.record(&ContentHash::from("FF00"));

        let options = BuildOptions {
            force_rebuild: false,
            compress: false,
        };
        let manifest = build_with_metadata(
            &mut DirBundler::new(),
            dir.path(),
            &assets,
            &options,
            "_windows",
            &casing,
        )
        .unwrap();

        assert_eq!(manifest.bundles.len(), 2);
        assert!(dir.path().join("abc123_windows").is_file());
        assert!(dir.path().join("abc123_windows.manifest").is_file());
        assert!(dir.path().join(BUILD_LOG_NAME).is_file());

        let text =
            std::fs::read_to_string(dir.path().join("abc123").join(METADATA_NAME)).unwrap();
        let metadata: BundleMetadata = serde_json::from_str(&text).unwrap();
        assert_eq!(metadata.version, 1);
        assert!(metadata.timestamp >= UNIX_EPOCH_TICKS);
        // Ignored builtin dependency is dropped, casing restored.
        assert_eq!(metadata.dependencies, vec!["FF00".to_owned()]);
    }

    #[test]
    fn metadata_is_packed_by_final_pass() {
        let dir = tempfile::tempdir().unwrap();
        let asset_root = dir.path().join("assets");
        std::fs::create_dir_all(&asset_root).unwrap();
        let assets = vec![marked(&asset_root, "abc123", &[])];
        let options = BuildOptions {
            force_rebuild: true,
            compress: false,
        };

        build_with_metadata(
            &mut DirBundler::new(),
            dir.path(),
            &assets,
            &options,
            "",
            &CasingTable::new(),
        )
        .unwrap();

        let encoded = std::fs::read(dir.path().join("abc123")).unwrap();
        let payload: BundlePayload = bincode::deserialize(&encoded).unwrap();
        assert!(payload
            .entries
            .iter()
            .any(|(name, _)| name == METADATA_NAME));
    }

    #[test]
    fn empty_batch_is_a_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let options = BuildOptions {
            force_rebuild: false,
            compress: false,
        };
        let err = build_with_metadata(
            &mut DirBundler::new(),
            dir.path(),
            &[],
            &options,
            "",
            &CasingTable::new(),
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::EmptyManifest { pass: "discovery" }));
    }

    #[test]
    fn up_to_date_bundle_is_not_repacked() {
        let dir = tempfile::tempdir().unwrap();
        let assets = vec![marked(dir.path(), "abc123", &[])];
        std::fs::write(dir.path().join("abc123_osx"), b"cached").unwrap();

        let options = BuildOptions {
            force_rebuild: false,
            compress: false,
        };
        DirBundler::new()
            .build_bundles(dir.path(), &assets, &options, "_osx")
            .unwrap()
            .unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("abc123_osx")).unwrap(),
            b"cached"
        );

        let forced = BuildOptions {
            force_rebuild: true,
            compress: false,
        };
        DirBundler::new()
            .build_bundles(dir.path(), &assets, &forced, "_osx")
            .unwrap()
            .unwrap();
        assert_ne!(
            std::fs::read(dir.path().join("abc123_osx")).unwrap(),
            b"cached"
        );
    }

    #[test]
    fn payload_entries_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("a");
        std::fs::create_dir_all(folder.join("Textures")).unwrap();
        std::fs::write(folder.join("z.bin"), b"z").unwrap();
        std::fs::write(folder.join("Textures").join("t.png"), b"t").unwrap();
        std::fs::write(folder.join("a.glb"), b"a").unwrap();

        let entries = DirBundler::collect_entries(&folder).unwrap();
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Textures/t.png", "a.glb", "z.bin"]);
    }
}
