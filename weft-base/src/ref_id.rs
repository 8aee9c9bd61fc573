//! Identifiers for content-addressed refs.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// The hash algorithms a ref can be addressed by.
///
/// Every stored blob has both identifiers; either one resolves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefHashAlg {
    Sha1,
    Sha3,
}

impl RefHashAlg {
    /// Length in bytes of a digest under this algorithm.
    pub fn digest_len(&self) -> usize {
        match self {
            RefHashAlg::Sha1 => 20,
            RefHashAlg::Sha3 => 32,
        }
    }
}

impl fmt::Display for RefHashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefHashAlg::Sha1 => f.write_str("sha1"),
            RefHashAlg::Sha3 => f.write_str("sha3"),
        }
    }
}

/// The identifier of an immutable content-addressed blob.
///
/// SHA-1 digests are stored left-aligned in the 32-byte buffer with zero
/// padding; the text form only renders the digest bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId {
    pub alg: RefHashAlg,
    pub hash: [u8; 32],
}

impl RefId {
    /// Build a SHA-1 ref id from a 20-byte digest.
    pub fn sha1(digest: [u8; 20]) -> Self {
        let mut hash = [0u8; 32];
        hash[..20].copy_from_slice(&digest);
        RefId {
            alg: RefHashAlg::Sha1,
            hash,
        }
    }

    /// Build a SHA-3 ref id from a 32-byte digest.
    pub fn sha3(digest: [u8; 32]) -> Self {
        RefId {
            alg: RefHashAlg::Sha3,
            hash: digest,
        }
    }

    /// The digest bytes, without padding.
    pub fn digest(&self) -> &[u8] {
        &self.hash[..self.alg.digest_len()]
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.alg, hex::encode(self.digest()))
    }
}

impl fmt::Debug for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefId({self})")
    }
}

/// Error parsing the text form of a [`RefId`].
#[derive(Debug, thiserror::Error)]
#[error("invalid ref id: {0}")]
pub struct ParseRefIdError(String);

impl FromStr for RefId {
    type Err = ParseRefIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (alg, digest) = s
            .split_once(':')
            .ok_or_else(|| ParseRefIdError(s.to_string()))?;
        let alg = match alg {
            "sha1" => RefHashAlg::Sha1,
            "sha3" => RefHashAlg::Sha3,
            _ => return Err(ParseRefIdError(s.to_string())),
        };
        let digest = hex::decode(digest).map_err(|_| ParseRefIdError(s.to_string()))?;
        if digest.len() != alg.digest_len() {
            return Err(ParseRefIdError(s.to_string()));
        }
        let mut hash = [0u8; 32];
        hash[..digest.len()].copy_from_slice(&digest);
        Ok(RefId { alg, hash })
    }
}

impl Serialize for RefId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RefId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}
