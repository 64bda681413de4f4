use core::fmt;
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::constants::MAX_SHARDS;
use crate::error::{Result, ShardError};

/// SHA-256 content hash identifying a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentHash(pub [u8; 32]);

impl DocumentHash {
    /// Hashes `data` with SHA-256.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        DocumentHash(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DocumentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for DocumentHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(DocumentHash(out))
    }
}

/// Serialized as a lowercase hex string so manifests and storage stay readable.
impl Serialize for DocumentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DocumentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HashVisitor;

        impl<'de> Visitor<'de> for HashVisitor {
            type Value = DocumentHash;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a 64 character hex encoded SHA-256 digest")
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<DocumentHash, E>
            where
                E: de::Error,
            {
                DocumentHash::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(HashVisitor)
    }
}

/// A raw byte document and its content hash, computed once at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    bytes: Vec<u8>,
    hash: DocumentHash,
}

impl Document {
    pub fn new(bytes: Vec<u8>) -> Self {
        let hash = DocumentHash::of(&bytes);
        Document { bytes, hash }
    }

    pub fn hash(&self) -> DocumentHash {
        self.hash
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<&[u8]> for Document {
    fn from(bytes: &[u8]) -> Self {
        Document::new(bytes.to_vec())
    }
}

/// The declared type of a document. Each type fixes the number of shards the document is split
/// into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Quaternion,
    Octonion,
    MathieuM24,
    Genetic,
    RDFa,
    IPv6,
    Byte,
    Monster,
}

impl DataType {
    pub const ALL: [DataType; 9] = [
        DataType::Boolean,
        DataType::Quaternion,
        DataType::Octonion,
        DataType::MathieuM24,
        DataType::Genetic,
        DataType::RDFa,
        DataType::IPv6,
        DataType::Byte,
        DataType::Monster,
    ];

    pub fn shard_count(&self) -> usize {
        match self {
            DataType::Boolean => 2,
            DataType::Quaternion => 4,
            DataType::Octonion => 8,
            DataType::MathieuM24 => 24,
            DataType::Genetic => 64,
            DataType::RDFa => 71,
            DataType::IPv6 => 128,
            DataType::Byte => 256,
            DataType::Monster => 196_883,
        }
    }

    /// Returns the shard count if it fits in the GF(256) evaluation domain.
    pub fn checked_shard_count(&self) -> Result<usize> {
        let n = self.shard_count();
        if n > MAX_SHARDS {
            return Err(ShardError::InvalidConfiguration(format!(
                "{self:?} requires {n} shards, at most {MAX_SHARDS} are supported"
            )));
        }
        Ok(n)
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        DataType::ALL
            .iter()
            .find(|t| format!("{t:?}").eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown data type {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_and_hex_roundtrips() {
        let doc = Document::new(b"hello".to_vec());
        assert_eq!(doc.hash(), DocumentHash::of(b"hello"));
        assert_eq!(
            doc.hash().to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let parsed: DocumentHash = doc.hash().to_hex().parse().unwrap();
        assert_eq!(parsed, doc.hash());
    }

    #[test]
    fn test_hash_serializes_as_hex_string() {
        let hash = DocumentHash::of(b"");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: DocumentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
        assert!(serde_json::from_str::<DocumentHash>("\"abcd\"").is_err());
    }

    #[test]
    fn test_data_type_shard_counts() {
        assert_eq!(DataType::Boolean.shard_count(), 2);
        assert_eq!(DataType::Quaternion.shard_count(), 4);
        assert_eq!(DataType::Octonion.shard_count(), 8);
        assert_eq!(DataType::MathieuM24.shard_count(), 24);
        assert_eq!(DataType::Genetic.shard_count(), 64);
        assert_eq!(DataType::RDFa.shard_count(), 71);
        assert_eq!(DataType::IPv6.shard_count(), 128);
        assert_eq!(DataType::Byte.shard_count(), 256);
        assert_eq!(DataType::Monster.shard_count(), 196_883);
    }

    #[test]
    fn test_oversized_data_types_are_rejected() {
        assert_eq!(DataType::IPv6.checked_shard_count(), Ok(128));
        assert!(matches!(
            DataType::Byte.checked_shard_count(),
            Err(ShardError::InvalidConfiguration(_))
        ));
        assert!(DataType::Monster.checked_shard_count().is_err());
    }

    #[test]
    fn test_data_type_from_str() {
        assert_eq!("octonion".parse::<DataType>(), Ok(DataType::Octonion));
        assert_eq!("RDFa".parse::<DataType>(), Ok(DataType::RDFa));
        assert!("sedenion".parse::<DataType>().is_err());
    }
}
