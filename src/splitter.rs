use tracing::debug;

use crate::document::{DataType, Document};
use crate::error::{Result, ShardError};
use crate::registry::{HolderRegistry, SnapshotRef};
use crate::shard::{Shard, ShardedDocument};
use crate::sss::{split_secret, validate_parameters};

/// Splits `document` into `n` payloads, all of which are required to recover it.
///
/// Payload `i` is the share evaluated at `x = i + 1`.
pub fn split(document: &[u8], n: usize) -> Result<Vec<Vec<u8>>> {
    ShardSplitter::new(n)?.split(document)
}

/// Turns documents into unsigned sharded documents with a fixed `(threshold, total)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSplitter {
    total_shards: usize,
    threshold: usize,
    data_type: Option<DataType>,
}

impl ShardSplitter {
    /// A full threshold splitter: every one of the `n` shards is needed.
    pub fn new(n: usize) -> Result<Self> {
        Self::with_threshold(n, n)
    }

    /// A splitter where any `threshold` of `total_shards` shards recover the document.
    pub fn with_threshold(threshold: usize, total_shards: usize) -> Result<Self> {
        validate_parameters(threshold, total_shards)?;
        Ok(ShardSplitter {
            total_shards,
            threshold,
            data_type: None,
        })
    }

    /// A full threshold splitter sized by the document's declared type.
    pub fn for_data_type(data_type: DataType) -> Result<Self> {
        let n = data_type.checked_shard_count()?;
        Ok(ShardSplitter {
            data_type: Some(data_type),
            ..Self::new(n)?
        })
    }

    pub fn total_shards(&self) -> usize {
        self.total_shards
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn split(&self, document: &[u8]) -> Result<Vec<Vec<u8>>> {
        let shares = split_secret(document, self.threshold, self.total_shards)?;
        Ok(shares.into_values().collect())
    }

    /// Splits `document` and assigns shard `i` to the holder ranked `i` in `snapshot`.
    ///
    /// Fails with `InvalidConfiguration` if the snapshot has fewer than `total_shards` holders.
    pub fn shard_document(
        &self,
        document: &Document,
        registry: &HolderRegistry,
        snapshot: &SnapshotRef,
    ) -> Result<ShardedDocument> {
        let holders = registry.get_top_n(self.total_shards, snapshot)?;
        if holders.len() < self.total_shards {
            return Err(ShardError::InvalidConfiguration(format!(
                "snapshot {snapshot} has {} holders, {} required",
                holders.len(),
                self.total_shards
            )));
        }

        let payloads = self.split(document.as_bytes())?;
        let document_hash = document.hash();

        let shards = payloads
            .into_iter()
            .zip(holders)
            .enumerate()
            .map(|(i, (payload, holder))| Shard {
                document_hash,
                // total_shards <= 255
                shard_index: i as u8,
                payload,
                holder_address: holder.address,
                signature: None,
                snapshot: snapshot.clone(),
            })
            .collect::<Vec<_>>();

        debug!(
            "Split document {} into {} shards (threshold {}) at {}",
            document_hash,
            shards.len(),
            self.threshold,
            snapshot
        );

        Ok(ShardedDocument {
            document_hash,
            data_type: self.data_type,
            total_shards: self.total_shards,
            threshold: self.threshold,
            shards,
            snapshot: snapshot.clone(),
        })
    }
}
