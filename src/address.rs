//! Content-addressed layout resolution.
//!
//! Turns a (hash, logical path) mapping into a deterministic on-disk layout
//! under the output root. Pure functions of their inputs, no I/O.

use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::hash::ContentHash;

/// Mapping of a content hash to the logical file path dependents use to
/// reference it. Many logical paths may map to one hash.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ContentMapping {
    pub hash: ContentHash,

    /// Relative, slash-normalized path.
    #[serde(rename = "file")]
    pub logical_path: String,
}

impl ContentMapping {
    pub fn new(hash: impl Into<ContentHash>, logical_path: impl Into<String>) -> Self {
        ContentMapping {
            hash: hash.into(),
            logical_path: logical_path.into().replace('\\', "/"),
        }
    }

    /// Final path component of the logical path.
    pub fn basename(&self) -> &str {
        basename(&self.logical_path)
    }
}

pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn extension(path: &str) -> Option<&str> {
    let name = basename(path);
    let dot = name.rfind('.')?;
    if dot == 0 || dot + 1 == name.len() {
        None
    } else {
        Some(&name[dot + 1..])
    }
}

/// On-disk layout for one asset. Immutable once constructed,
/// discarded at run end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedLocation {
    asset_folder: PathBuf,
    final_path: PathBuf,
    sibling_path: PathBuf,
}

impl ResolvedLocation {
    /// Folder owning the artifact and its extracted sub-resources:
    /// `<root>/<hash>/`.
    pub fn asset_folder(&self) -> &Path {
        &self.asset_folder
    }

    /// Final artifact path: `<root>/<hash>/<hash>.<ext>`.
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Extension-preserving hashed path beside the asset folder:
    /// `<root>/<hash>.<ext>`.
    pub fn sibling_path(&self) -> &Path {
        &self.sibling_path
    }

    pub fn textures_dir(&self) -> PathBuf {
        self.asset_folder.join("Textures")
    }

    pub fn materials_dir(&self) -> PathBuf {
        self.asset_folder.join("Materials")
    }
}

/// Resolves the on-disk layout for a mapping under `base`.
///
/// The layout is keyed by the lower-cased hash so that remote-assigned
/// casing differences cannot produce two folders for one content.
pub fn resolve(base: &Path, mapping: &ContentMapping) -> ResolvedLocation {
    let hash = mapping.hash.lower();

    let file = match extension(&mapping.logical_path) {
        Some(ext) => format!("{}.{}", hash, ext),
        None => hash.clone(),
    };

    let asset_folder = base.join(&hash);

    ResolvedLocation {
        final_path: asset_folder.join(&file),
        sibling_path: base.join(&file),
        asset_folder,
    }
}

/// Side table mapping lower-cased hashes to their first-seen casing.
///
/// Built once per run before any fetch begins. Metadata generation and
/// output cleanup consult it so remote-assigned lower-case identifiers
/// never leak into final file names.
#[derive(Debug, Default)]
pub struct CasingTable {
    canonical: HashMap<String, String>,
}

impl CasingTable {
    pub fn new() -> Self {
        CasingTable::default()
    }

    /// Records the hash spelling. First-seen casing wins.
    pub fn record(&mut self, hash: &ContentHash) {
        self.canonical
            .entry(hash.lower())
            .or_insert_with(|| hash.as_str().to_owned());
    }

    pub fn canonical(&self, lower: &str) -> Option<&str> {
        self.canonical.get(lower).map(String::as_str)
    }

    /// Restores canonical casing for a lower-cased name.
    /// Names without a recorded casing pass through unchanged.
    pub fn restore(&self, name: &str) -> String {
        match self.canonical.get(&name.to_ascii_lowercase()) {
            Some(canonical) => canonical.clone(),
            None => name.to_owned(),
        }
    }
}
