use thiserror::Error;

use crate::document::DocumentHash;

/// Errors raised by the sharding core.
///
/// `UnauthorizedHolder` and `InvalidSignature` are local to a single shard: callers drop the
/// shard and keep collecting. `InsufficientShards` is the expected state before the threshold is
/// reached. `DuplicateShardIndex` and `IntegrityMismatch` are hard failures for the current shard
/// set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShardError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unauthorized holder: {0}")]
    UnauthorizedHolder(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("conflicting payloads for shard index {0}")]
    DuplicateShardIndex(u8),

    #[error("insufficient shards: have {have}, need {need}")]
    InsufficientShards { have: usize, need: usize },

    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        expected: DocumentHash,
        actual: String,
    },
}

/// Errors raised by the holder registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("holder {address} is not in the top {n} at {snapshot}")]
    NotFound {
        address: String,
        snapshot: String,
        n: usize,
    },

    #[error("unknown snapshot {0}")]
    UnknownSnapshot(String),

    #[error("snapshot {0} is already sealed")]
    SnapshotSealed(String),

    #[error("invalid snapshot: {0}")]
    InvalidConfiguration(String),
}

impl From<RegistryError> for ShardError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidConfiguration(msg) => ShardError::InvalidConfiguration(msg),
            RegistryError::UnknownSnapshot(s) => {
                ShardError::InvalidConfiguration(format!("unknown snapshot {s}"))
            }
            RegistryError::SnapshotSealed(s) => {
                ShardError::InvalidConfiguration(format!("snapshot {s} is already sealed"))
            }
            e @ RegistryError::NotFound { .. } => ShardError::UnauthorizedHolder(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShardError>;
