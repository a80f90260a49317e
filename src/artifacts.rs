//! Artifact store collaborator.
//!
//! Stand-in for the host engine's asset database: a stateful, single-writer
//! service with an explicit refresh/save transaction boundary. All calls
//! must come from the orchestrator's worker thread.

use std::{
    collections::VecDeque,
    ffi::OsString,
    path::{Path, PathBuf},
    time::SystemTime,
};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::identity::ArtifactId;

pub const SIDECAR_EXTENSION: &str = "lading";
const DOT_SIDECAR_EXTENSION: &str = ".lading";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read sidecar '{path}': {error}")]
    SidecarRead {
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Failed to write sidecar '{path}': {error}")]
    SidecarWrite {
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Failed to deserialize sidecar '{path}': {error}")]
    SidecarDeserialize {
        error: toml::de::Error,
        path: PathBuf,
    },

    #[error("Failed to serialize sidecar '{path}': {error}")]
    SidecarSerialize {
        error: toml::ser::Error,
        path: PathBuf,
    },

    #[error("Failed to delete '{path}': {error}")]
    Delete {
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Failed to move '{from}' to '{to}': {error}")]
    Move {
        error: std::io::Error,
        from: PathBuf,
        to: PathBuf,
    },

    #[error("Failed to scan '{path}': {error}")]
    Scan {
        error: std::io::Error,
        path: PathBuf,
    },
}

/// Identity record stored alongside every imported artifact.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct IdentityRecord {
    pub id: ArtifactId,

    /// Seconds since UNIX epoch at first import.
    pub imported_at: u64,
}

impl IdentityRecord {
    pub fn read(path: &Path) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path).map_err(|error| StoreError::SidecarRead {
            error,
            path: path.to_owned(),
        })?;
        toml::from_str(&text).map_err(|error| StoreError::SidecarDeserialize {
            error,
            path: path.to_owned(),
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), StoreError> {
        let text = toml::to_string_pretty(self).map_err(|error| StoreError::SidecarSerialize {
            error,
            path: path.to_owned(),
        })?;
        std::fs::write(path, text.as_bytes()).map_err(|error| StoreError::SidecarWrite {
            error,
            path: path.to_owned(),
        })
    }
}

/// Host-side artifact database.
pub trait ArtifactStore {
    /// Re-scans the store, dropping stale registrations and picking up
    /// artifacts whose sidecars changed on disk.
    fn refresh(&mut self) -> Result<(), StoreError>;

    /// Flushes pending registrations. Transaction boundary for a batch of
    /// imports.
    fn save_all(&mut self) -> Result<(), StoreError>;

    /// Registers the artifact at `path`, assigning a fresh identifier if it
    /// has none. The assigned identifier is NOT a function of content.
    fn import_at_path(&mut self, path: &Path) -> Result<ArtifactId, StoreError>;

    /// Reads the identifier of the artifact at `path` without registering
    /// it. `None` when no identity sidecar exists.
    fn load_at_path(&self, path: &Path) -> Result<Option<ArtifactId>, StoreError>;

    /// Removes the artifact and its sidecar, dropping the registration.
    fn delete_at_path(&mut self, path: &Path) -> Result<(), StoreError>;

    /// Path of the identity sidecar for an artifact path.
    fn sidecar_path_for(&self, path: &Path) -> PathBuf;

    /// Moves the artifact together with its sidecar.
    fn move_asset(&mut self, src: &Path, dst: &Path) -> Result<(), StoreError>;
}

/// Filesystem-backed artifact store.
///
/// Keeps a TOML identity sidecar next to every artifact and an in-memory
/// registry rebuilt on `refresh`.
pub struct FsArtifactStore {
    root: PathBuf,
    registry: HashMap<ArtifactId, PathBuf>,
    id_gen: IdGen,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsArtifactStore {
            root: root.into(),
            registry: HashMap::new(),
            id_gen: IdGen::new(),
        }
    }

    pub fn registered(&self, id: ArtifactId) -> Option<&Path> {
        self.registry.get(&id).map(PathBuf::as_path)
    }

    pub fn registered_id(&self, path: &Path) -> Option<ArtifactId> {
        self.registry
            .iter()
            .find(|(_, registered)| registered.as_path() == path)
            .map(|(id, _)| *id)
    }

    fn sidecar_of(path: &Path) -> PathBuf {
        let mut filename: OsString = path.file_name().unwrap_or_default().to_owned();
        filename.push(DOT_SIDECAR_EXTENSION);
        path.with_file_name(filename)
    }

    fn is_sidecar(path: &Path) -> bool {
        path.extension().map_or(false, |e| e == SIDECAR_EXTENSION)
    }
}

impl ArtifactStore for FsArtifactStore {
    #[tracing::instrument(skip(self), fields(root = %self.root.display()))]
    fn refresh(&mut self) -> Result<(), StoreError> {
        self.registry.clear();

        if !self.root.exists() {
            return Ok(());
        }

        let mut queue = VecDeque::new();
        queue.push_back(self.root.clone());

        while let Some(dir_path) = queue.pop_front() {
            let dir = match std::fs::read_dir(&dir_path) {
                Err(error) if dir_path == self.root => {
                    return Err(StoreError::Scan {
                        error,
                        path: dir_path,
                    });
                }
                Err(err) => {
                    tracing::error!(
                        "Failed to scan directory '{}'. {:#}",
                        dir_path.display(),
                        err
                    );
                    continue;
                }
                Ok(dir) => dir,
            };

            for entry in dir {
                let entry = match entry {
                    Err(err) => {
                        tracing::error!(
                            "Failed to read entry in directory '{}'. {:#}",
                            dir_path.display(),
                            err
                        );
                        continue;
                    }
                    Ok(entry) => entry,
                };
                let path = dir_path.join(entry.file_name());
                let ft = match entry.file_type() {
                    Err(err) => {
                        tracing::error!("Failed to check '{}'. {:#}", path.display(), err);
                        continue;
                    }
                    Ok(ft) => ft,
                };

                if ft.is_dir() {
                    queue.push_back(path);
                } else if ft.is_file() && Self::is_sidecar(&path) {
                    let artifact = path.with_extension("");
                    if !artifact.is_file() {
                        // Orphaned sidecar; registration is stale.
                        continue;
                    }
                    match IdentityRecord::read(&path) {
                        Err(err) => {
                            tracing::error!(
                                "Failed to read sidecar '{}'. {:#}",
                                path.display(),
                                err
                            );
                        }
                        Ok(record) => {
                            self.registry.insert(record.id, artifact);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn save_all(&mut self) -> Result<(), StoreError> {
        // Sidecar writes land immediately; nothing buffered to flush.
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn import_at_path(&mut self, path: &Path) -> Result<ArtifactId, StoreError> {
        let sidecar = Self::sidecar_of(path);

        let id = if sidecar.is_file() {
            IdentityRecord::read(&sidecar)?.id
        } else {
            let record = IdentityRecord {
                id: self.id_gen.next(),
                imported_at: SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map_or(0, |d| d.as_secs()),
            };
            record.write(&sidecar)?;
            record.id
        };

        self.registry.insert(id, path.to_owned());
        Ok(id)
    }

    fn load_at_path(&self, path: &Path) -> Result<Option<ArtifactId>, StoreError> {
        let sidecar = Self::sidecar_of(path);
        if !sidecar.is_file() {
            return Ok(None);
        }
        Ok(Some(IdentityRecord::read(&sidecar)?.id))
    }

    fn delete_at_path(&mut self, path: &Path) -> Result<(), StoreError> {
        let sidecar = Self::sidecar_of(path);

        std::fs::remove_file(path).map_err(|error| StoreError::Delete {
            error,
            path: path.to_owned(),
        })?;
        match std::fs::remove_file(&sidecar) {
            Err(error) if error.kind() != std::io::ErrorKind::NotFound => {
                return Err(StoreError::Delete {
                    error,
                    path: sidecar,
                });
            }
            _ => {}
        }

        self.registry
            .retain(|_, registered| registered.as_path() != path);
        Ok(())
    }

    fn sidecar_path_for(&self, path: &Path) -> PathBuf {
        Self::sidecar_of(path)
    }

    fn move_asset(&mut self, src: &Path, dst: &Path) -> Result<(), StoreError> {
        std::fs::rename(src, dst).map_err(|error| StoreError::Move {
            error,
            from: src.to_owned(),
            to: dst.to_owned(),
        })?;

        let src_sidecar = Self::sidecar_of(src);
        if src_sidecar.is_file() {
            let dst_sidecar = Self::sidecar_of(dst);
            std::fs::rename(&src_sidecar, &dst_sidecar).map_err(|error| StoreError::Move {
                error,
                from: src_sidecar,
                to: dst_sidecar,
            })?;
        }

        for registered in self.registry.values_mut() {
            if registered.as_path() == src {
                *registered = dst.to_owned();
            }
        }
        Ok(())
    }
}

/// First-import identifier generation.
///
/// Mimics the host store: identifiers derive from import time and a
/// counter, not from content, so they differ across runs. The identity
/// normalizer exists to fix exactly this.
struct IdGen {
    state: Mutex<IdGenState>,
}

struct IdGenState {
    last_secs: u64,
    counter: u32,
}

impl IdGen {
    fn new() -> Self {
        IdGen {
            state: Mutex::new(IdGenState {
                last_secs: 0,
                counter: 0,
            }),
        }
    }

    fn next(&self) -> ArtifactId {
        let mut state = self.state.lock();

        let secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        if secs == state.last_secs {
            state.counter += 1;
        } else {
            state.last_secs = secs;
            state.counter = 0;
        }

        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&secs.to_be_bytes());
        bytes[8..12].copy_from_slice(&state.counter.to_be_bytes());
        ArtifactId::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_assigns_and_keeps_id() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.bin");
        std::fs::write(&artifact, b"data").unwrap();

        let mut store = FsArtifactStore::new(dir.path());
        let id = store.import_at_path(&artifact).unwrap();

        // Re-import reads the existing sidecar instead of assigning anew.
        let again = store.import_at_path(&artifact).unwrap();
        assert_eq!(id, again);
        assert_eq!(store.registered(id), Some(artifact.as_path()));
        assert_eq!(store.load_at_path(&artifact).unwrap(), Some(id));

        let stranger = dir.path().join("b.bin");
        assert_eq!(store.load_at_path(&stranger).unwrap(), None);
    }

    #[test]
    fn move_asset_carries_sidecar_and_registration() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        let dst = dir.path().join("sub").join("a.bin");
        std::fs::create_dir_all(dst.parent().unwrap()).unwrap();
        std::fs::write(&src, b"data").unwrap();

        let mut store = FsArtifactStore::new(dir.path());
        let id = store.import_at_path(&src).unwrap();
        store.move_asset(&src, &dst).unwrap();

        assert!(!src.exists());
        assert!(dst.is_file());
        assert!(store.sidecar_path_for(&dst).is_file());
        assert_eq!(store.registered(id), Some(dst.as_path()));
    }

    #[test]
    fn refresh_rebuilds_registry() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("sub").join("a.bin");
        std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        std::fs::write(&artifact, b"data").unwrap();

        let mut store = FsArtifactStore::new(dir.path());
        let id = store.import_at_path(&artifact).unwrap();

        let mut fresh = FsArtifactStore::new(dir.path());
        fresh.refresh().unwrap();
        assert_eq!(fresh.registered(id), Some(artifact.as_path()));
    }

    #[test]
    fn delete_drops_registration_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.bin");
        std::fs::write(&artifact, b"data").unwrap();

        let mut store = FsArtifactStore::new(dir.path());
        let id = store.import_at_path(&artifact).unwrap();
        store.delete_at_path(&artifact).unwrap();

        assert!(!artifact.exists());
        assert!(!store.sidecar_path_for(&artifact).exists());
        assert_eq!(store.registered(id), None);
    }
}
