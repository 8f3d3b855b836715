//! EIP-4844 blob payloads and their versioned hashes.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Version byte prefixed to every KZG commitment hash.
pub const VERSIONED_HASH_VERSION_KZG: u8 = 0x01;

/// Number of bytes in a versioned hash.
pub const VERSIONED_HASH_LEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum VersionedHashError {
    #[error("versioned hash must start with 0x: {0}")]
    MissingPrefix(String),
    #[error("versioned hash must be {VERSIONED_HASH_LEN} bytes, got {0}")]
    InvalidLength(usize),
    #[error("versioned hash is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("unsupported versioned hash version byte 0x{0:02x}")]
    UnsupportedVersion(u8),
}

/// Identity of a blob: `0x01 || sha256(kzg_commitment)[1..]`, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionedHash([u8; VERSIONED_HASH_LEN]);

impl VersionedHash {
    /// Derive the versioned hash for a KZG commitment.
    pub fn from_kzg_commitment(commitment: &[u8]) -> Self {
        let digest = Sha256::digest(commitment);
        let mut bytes = [0u8; VERSIONED_HASH_LEN];
        bytes.copy_from_slice(&digest);
        bytes[0] = VERSIONED_HASH_VERSION_KZG;
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERSIONED_HASH_LEN] {
        &self.0
    }

    /// Lowercase hex without the `0x` prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for VersionedHash {
    type Err = VersionedHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .ok_or_else(|| VersionedHashError::MissingPrefix(s.to_string()))?;
        let decoded = hex::decode(digits)?;
        if decoded.len() != VERSIONED_HASH_LEN {
            return Err(VersionedHashError::InvalidLength(decoded.len()));
        }
        if decoded[0] != VERSIONED_HASH_VERSION_KZG {
            return Err(VersionedHashError::UnsupportedVersion(decoded[0]));
        }
        let mut bytes = [0u8; VERSIONED_HASH_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for VersionedHash {
    type Error = VersionedHashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionedHash> for String {
    fn from(value: VersionedHash) -> Self {
        value.to_string()
    }
}

impl fmt::Display for VersionedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

/// A blob handed to the propagation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub versioned_hash: VersionedHash,
    pub data: Bytes,
    /// Block the blob was first seen in, if known. Only used to scale priority.
    pub block_number: Option<u64>,
}

impl Blob {
    pub fn new(versioned_hash: VersionedHash, data: impl Into<Bytes>) -> Self {
        Self {
            versioned_hash,
            data: data.into(),
            block_number: None,
        }
    }

    pub fn with_block_number(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_commitment_sets_version_byte() {
        let hash = VersionedHash::from_kzg_commitment(&[7u8; 48]);
        assert_eq!(hash.as_bytes()[0], VERSIONED_HASH_VERSION_KZG);

        let digest = Sha256::digest([7u8; 48]);
        assert_eq!(&hash.as_bytes()[1..], &digest[1..]);
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let hash = VersionedHash::from_kzg_commitment(b"commitment");
        let rendered = hash.to_string();
        assert!(rendered.starts_with("0x01"));
        assert_eq!(rendered.len(), 2 + VERSIONED_HASH_LEN * 2);
        assert_eq!(rendered.parse::<VersionedHash>().unwrap(), hash);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            "01aa".parse::<VersionedHash>(),
            Err(VersionedHashError::MissingPrefix(_))
        ));
        assert_eq!(
            "0x01aa".parse::<VersionedHash>(),
            Err(VersionedHashError::InvalidLength(2))
        );
        let wrong_version = format!("0x02{}", "00".repeat(31));
        assert_eq!(
            wrong_version.parse::<VersionedHash>(),
            Err(VersionedHashError::UnsupportedVersion(0x02))
        );
        assert!(matches!(
            format!("0x01{}", "zz".repeat(31)).parse::<VersionedHash>(),
            Err(VersionedHashError::InvalidHex(_))
        ));
        assert_eq!(
            "0x0g".parse::<VersionedHash>(),
            Err(VersionedHashError::InvalidHex(
                hex::FromHexError::InvalidHexCharacter { c: 'g', index: 1 }
            ))
        );
    }

    #[test]
    fn test_serde_as_string() {
        let hash = VersionedHash::from_kzg_commitment(b"serde");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash));
        let back: VersionedHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
