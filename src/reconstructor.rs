use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::debug;

use crate::document::Document;
use crate::error::{Result, ShardError};
use crate::shard::{Shard, ShardedDocument};
use crate::sss::combine_shares;
use crate::verifier::ShardValidator;

/// Groups `collected` by shard index, keeping every copy seen at each index.
///
/// Shards for another document or snapshot are ignored. Two shards at the same index with
/// different payloads fail with `DuplicateShardIndex`.
pub fn dedup_by_index<'a>(
    sharded: &ShardedDocument,
    collected: &'a [Shard],
) -> Result<BTreeMap<u8, Vec<&'a Shard>>> {
    let mut by_index: BTreeMap<u8, Vec<&Shard>> = BTreeMap::new();

    for shard in collected.iter().filter(|s| sharded.owns(s)) {
        match by_index.entry(shard.shard_index) {
            Entry::Vacant(e) => {
                e.insert(vec![shard]);
            }
            Entry::Occupied(mut e) => {
                if e.get()[0].payload != shard.payload {
                    return Err(ShardError::DuplicateShardIndex(shard.shard_index));
                }
                e.get_mut().push(shard);
            }
        }
    }

    Ok(by_index)
}

/// Recovers the original document from the collected shards.
///
/// Steps: deduplicate by index, keep the first copy at each index the validator accepts,
/// require `threshold` distinct valid shards, interpolate each byte position, and check the
/// result against the document hash.
pub fn reconstruct(
    sharded: &ShardedDocument,
    collected: &[Shard],
    validator: &dyn ShardValidator,
) -> Result<Document> {
    let by_index = dedup_by_index(sharded, collected)?;

    let valid: Vec<&Shard> = by_index
        .into_values()
        .filter_map(|copies| {
            copies
                .into_iter()
                .find(|shard| match validator.validate(shard, sharded) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(
                            "Dropping shard {} of {} from {}: {}",
                            shard.shard_index, sharded.document_hash, shard.holder_address, e
                        );
                        false
                    }
                })
        })
        .collect();

    if valid.len() < sharded.threshold {
        return Err(ShardError::InsufficientShards {
            have: valid.len(),
            need: sharded.threshold,
        });
    }

    let points: BTreeMap<u8, Vec<u8>> = valid
        .into_iter()
        .take(sharded.threshold)
        .map(|shard| (shard.x(), shard.payload.clone()))
        .collect();

    let bytes = combine_shares(&points).ok_or_else(|| ShardError::IntegrityMismatch {
        expected: sharded.document_hash,
        actual: "shards disagree on payload length".to_string(),
    })?;

    let document = Document::new(bytes);
    if document.hash() != sharded.document_hash {
        return Err(ShardError::IntegrityMismatch {
            expected: sharded.document_hash,
            actual: document.hash().to_string(),
        });
    }

    debug!(
        "Reconstructed document {} ({} bytes)",
        document.hash(),
        document.len()
    );
    Ok(document)
}

/// Accepts every shard. Only for callers that have already verified their shards.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ShardValidator for AcceptAll {
    fn validate(&self, _shard: &Shard, _sharded: &ShardedDocument) -> Result<()> {
        Ok(())
    }
}
