//! Deterministic identity assignment.
//!
//! The artifact store assigns identifiers at first-import time that are not
//! a function of content, so two runs against the same input can register
//! the same artifact under different identifiers and break bundle-to-bundle
//! references. This module rewrites the identifier to one derived from the
//! content hash, then forces the store to drop the stale registration.

use std::{
    fmt::{self, Debug, Display, LowerHex, UpperHex},
    num::ParseIntError,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{
    de::{Error as _, Unexpected},
    Deserialize, Deserializer, Serialize, Serializer,
};

use crate::{
    address::ResolvedLocation,
    artifacts::{ArtifactStore, StoreError},
    hash::{ContentHash, Sha256Hash},
};

/// 128-bit artifact identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ArtifactId([u8; 16]);

impl ArtifactId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        ArtifactId(bytes)
    }

    pub const fn to_bytes(self) -> [u8; 16] {
        self.0
    }

    /// Derives the identifier deterministically from a content hash.
    ///
    /// Case differences in the hash spelling produce the same identifier.
    pub fn derive(hash: &ContentHash) -> Self {
        let digest = Sha256Hash::hash(hash.lower().as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        ArtifactId(bytes)
    }
}

impl Debug for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        LowerHex::fmt(self, f)
    }
}

impl Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        LowerHex::fmt(self, f)
    }
}

impl LowerHex for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", u128::from_be_bytes(self.0))
    }
}

impl UpperHex for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032X}", u128::from_be_bytes(self.0))
    }
}

impl FromStr for ArtifactId {
    type Err = ParseIntError;

    fn from_str(mut s: &str) -> Result<Self, ParseIntError> {
        if s.starts_with("0x") || s.starts_with("0X") {
            s = &s[2..];
        }
        let value = u128::from_str_radix(s, 16)?;
        Ok(ArtifactId(value.to_be_bytes()))
    }
}

impl Serialize for ArtifactId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format!("{:032x}", u128::from_be_bytes(self.0)))
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

struct ArtifactIdVisitor;

impl<'de> serde::de::Visitor<'de> for ArtifactIdVisitor {
    type Value = ArtifactId;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a 32-char hex string or 16-byte slice")
    }

    fn visit_str<E>(self, v: &str) -> Result<ArtifactId, E>
    where
        E: serde::de::Error,
    {
        v.parse().map_err(E::custom)
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<ArtifactId, E>
    where
        E: serde::de::Error,
    {
        let bytes: [u8; 16] = v
            .try_into()
            .map_err(|_| E::invalid_value(Unexpected::Bytes(v), &self))?;
        Ok(ArtifactId(bytes))
    }
}

impl<'de> Deserialize<'de> for ArtifactId {
    fn deserialize<D>(deserializer: D) -> Result<ArtifactId, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            deserializer.deserialize_str(ArtifactIdVisitor)
        } else {
            deserializer.deserialize_bytes(ArtifactIdVisitor)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Failed to read identity sidecar '{path}': {error}")]
    Sidecar {
        error: std::io::Error,
        path: PathBuf,
    },

    #[error("Identity record in '{path}' has no id field")]
    MalformedSidecar { path: PathBuf },

    #[error("Failed to stash artifact '{path}' to '{temp}': {error}")]
    Stash {
        error: std::io::Error,
        path: PathBuf,
        temp: PathBuf,
    },

    #[error("Failed to restore artifact '{path}' from '{temp}': {error}")]
    Restore {
        error: std::io::Error,
        path: PathBuf,
        temp: PathBuf,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Rewrites the artifact's identifier to `ArtifactId::derive(hash)`.
///
/// Rewriting the sidecar alone does not make the store pick up the new
/// identifier; the stale registration survives until the artifact is gone.
/// So the rewrite runs as one transaction: stash the artifact bytes aside,
/// delete artifact and sidecar, refresh (dropping the stale registration),
/// restore the bytes and the rewritten sidecar, refresh again to register
/// under the new identifier. The stash file is removed on every exit path.
#[tracing::instrument(skip(store, location))]
pub fn normalize(
    store: &mut dyn ArtifactStore,
    location: &ResolvedLocation,
    hash: &ContentHash,
) -> Result<(), IdentityError> {
    let path = location.final_path();
    let sidecar = store.sidecar_path_for(path);
    let new_id = ArtifactId::derive(hash);

    let text = std::fs::read_to_string(&sidecar).map_err(|error| IdentityError::Sidecar {
        error,
        path: sidecar.clone(),
    })?;
    let rewritten = substitute_id(&text, new_id)
        .ok_or_else(|| IdentityError::MalformedSidecar {
            path: sidecar.clone(),
        })?;

    let stash = Stash::create(path)?;
    store.delete_at_path(path)?;
    store.refresh()?;
    stash.restore(path)?;
    std::fs::write(&sidecar, rewritten).map_err(|error| IdentityError::Sidecar {
        error,
        path: sidecar.clone(),
    })?;
    store.refresh()?;

    tracing::debug!("'{}' registered as {}", path.display(), new_id);
    Ok(())
}

/// Textual substitution of the `id` field value, leaving the rest of the
/// sidecar byte-identical. Returns `None` when no id field is present.
fn substitute_id(text: &str, id: ArtifactId) -> Option<String> {
    let field = text.find("id")?;
    let after = &text[field + 2..];
    let eq = after.find('=')?;
    let open = after[eq..].find('"')? + eq;
    let close = after[open + 1..].find('"')? + open + 1;

    let mut out = String::with_capacity(text.len());
    out.push_str(&text[..field + 2 + open + 1]);
    out.push_str(&format!("{:032x}", u128::from_be_bytes(id.to_bytes())));
    out.push_str(&after[close..]);
    Some(out)
}

/// Scoped stash of artifact bytes. Removes the stash file on drop unless it
/// was already consumed by a successful restore.
struct Stash {
    temp: PathBuf,
}

impl Stash {
    fn create(path: &Path) -> Result<Self, IdentityError> {
        let mut name = path.file_name().unwrap_or_default().to_owned();
        name.push(".stash");
        let temp = path.with_file_name(name);

        std::fs::copy(path, &temp).map_err(|error| IdentityError::Stash {
            error,
            path: path.to_owned(),
            temp: temp.clone(),
        })?;

        Ok(Stash { temp })
    }

    fn restore(&self, path: &Path) -> Result<(), IdentityError> {
        std::fs::rename(&self.temp, path).map_err(|error| IdentityError::Restore {
            error,
            path: path.to_owned(),
            temp: self.temp.clone(),
        })
    }
}

impl Drop for Stash {
    fn drop(&mut self) {
        if self.temp.exists() {
            if let Err(err) = std::fs::remove_file(&self.temp) {
                tracing::error!(
                    "Failed to remove stash file '{}'. {:#}",
                    self.temp.display(),
                    err
                );
            }
        }
    }
}
