use std::{
    fmt::{self, Debug, Display, LowerHex, UpperHex},
    hash::{Hash, Hasher},
    io::Read,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Content-derived identifier of an asset.
///
/// The remote store treats hashes as case-insensitive, so comparison and
/// hashing ignore ASCII case. The original spelling is preserved because
/// final output naming must use the casing dependents referenced.
#[derive(Clone)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(value: impl Into<String>) -> Self {
        ContentHash(value.into())
    }

    /// Original spelling, as first seen.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-cased form used for case-insensitive keying and on-disk layout.
    pub fn lower(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl PartialEq for ContentHash {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for ContentHash {}

impl Hash for ContentHash {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.0.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl From<&str> for ContentHash {
    fn from(value: &str) -> Self {
        ContentHash(value.to_owned())
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<ContentHash, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(ContentHash)
    }
}

/// 256-bit digest used to derive deterministic identifiers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sha256Hash {
    bytes: [u8; 32],
}

impl Sha256Hash {
    pub fn hash(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let hash = hasher.finalize();
        let mut bytes = [0; 32];
        bytes.copy_from_slice(&hash);
        Sha256Hash { bytes }
    }

    pub fn read_hash(mut read: impl Read) -> std::io::Result<Sha256Hash> {
        let mut hasher = Sha256::new();

        std::io::copy(&mut read, &mut hasher)?;

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        Ok(Sha256Hash { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        LowerHex::fmt(self, f)
    }
}

impl LowerHex for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            f.write_str("0x")?;
        }

        let v = u128::from_be_bytes(self.bytes[0..16].try_into().unwrap());
        write!(f, "{:032x}", v)?;
        let v = u128::from_be_bytes(self.bytes[16..32].try_into().unwrap());
        write!(f, "{:032x}", v)?;

        Ok(())
    }
}

impl UpperHex for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            f.write_str("0X")?;
        }

        let v = u128::from_be_bytes(self.bytes[0..16].try_into().unwrap());
        write!(f, "{:032X}", v)?;
        let v = u128::from_be_bytes(self.bytes[16..32].try_into().unwrap());
        write!(f, "{:032X}", v)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_ignores_case() {
        let a = ContentHash::from("AbC123");
        let b = ContentHash::from("abc123");

        assert_eq!(a, b);
        assert_eq!(a.lower(), b.lower());
        assert_eq!(a.as_str(), "AbC123");
        assert_eq!(b.as_str(), "abc123");
    }

    #[test]
    fn content_hash_map_key() {
        let mut map = hashbrown::HashMap::new();
        map.insert(ContentHash::from("AbC123"), 1);
        assert_eq!(map.get(&ContentHash::from("ABC123")), Some(&1));
    }

    #[test]
    fn sha256_hex() {
        let hash = Sha256Hash::hash(b"");
        assert_eq!(
            format!("{:x}", hash),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
