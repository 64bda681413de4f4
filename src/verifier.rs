use std::sync::Arc;

use crate::error::{Result, ShardError};
use crate::registry::{HolderRegistry, SnapshotRef};
use crate::shard::{Shard, ShardedDocument};
use crate::signing;

/// Decides whether a shard may take part in reconstructing a document.
pub trait ShardValidator: Send + Sync {
    fn validate(&self, shard: &Shard, sharded: &ShardedDocument) -> Result<()>;
}

/// Checks a shard against the holder registry and its holder's signature.
///
/// Holds nothing but a registry handle, so one verifier can be shared by any number of
/// threads.
#[derive(Debug, Clone)]
pub struct ShardVerifier {
    registry: Arc<HolderRegistry>,
}

impl ShardVerifier {
    pub fn new(registry: Arc<HolderRegistry>) -> Self {
        ShardVerifier { registry }
    }

    /// Verifies `shard` as one of `total_shards` shards cut at `snapshot`.
    ///
    /// The holder must be the one ranked at the shard's index within the top `total_shards`
    /// (`UnauthorizedHolder`), and the signature must verify under the holder's key
    /// (`InvalidSignature`).
    pub fn verify(&self, shard: &Shard, snapshot: &SnapshotRef, total_shards: usize) -> Result<()> {
        if &shard.snapshot != snapshot {
            return Err(ShardError::UnauthorizedHolder(format!(
                "shard {} was cut at {}, expected {}",
                shard.shard_index, shard.snapshot, snapshot
            )));
        }

        let record = self
            .registry
            .verify_holder(&shard.holder_address, snapshot, total_shards)?;
        if record.rank != shard.shard_index as usize {
            return Err(ShardError::UnauthorizedHolder(format!(
                "holder {} has rank {} but presented shard {}",
                shard.holder_address, record.rank, shard.shard_index
            )));
        }

        let signature = shard.signature.as_deref().ok_or_else(|| {
            ShardError::InvalidSignature(format!("shard {} is unsigned", shard.shard_index))
        })?;
        signing::verify(&shard.holder_address, &shard.signing_message(), signature)
    }

    pub fn is_valid(&self, shard: &Shard, snapshot: &SnapshotRef, total_shards: usize) -> bool {
        self.verify(shard, snapshot, total_shards).is_ok()
    }
}

impl ShardValidator for ShardVerifier {
    fn validate(&self, shard: &Shard, sharded: &ShardedDocument) -> Result<()> {
        if shard.document_hash != sharded.document_hash {
            return Err(ShardError::UnauthorizedHolder(format!(
                "shard {} belongs to document {}",
                shard.shard_index, shard.document_hash
            )));
        }
        self.verify(shard, &sharded.snapshot, sharded.total_shards)
    }
}
