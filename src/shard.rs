use libp2p::identity::Keypair;
use serde::{Deserialize, Serialize};

use crate::document::{DataType, DocumentHash};
use crate::error::{Result, ShardError};
use crate::registry::{HolderAddress, SnapshotRef};
use crate::signing;

/// One piece of a split document, assigned to a single holder.
///
/// A shard starts unsigned. Its holder signs it once with [`Shard::sign`]; the payload never
/// changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub document_hash: DocumentHash,
    pub shard_index: u8,
    pub payload: Vec<u8>,
    pub holder_address: HolderAddress,
    pub signature: Option<Vec<u8>>,
    pub snapshot: SnapshotRef,
}

impl Shard {
    /// The field point this shard was evaluated at.
    pub fn x(&self) -> u8 {
        self.shard_index + 1
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// The bytes a holder signs for this shard.
    pub fn signing_message(&self) -> Vec<u8> {
        signing::shard_message(
            &self.document_hash,
            &self.snapshot,
            self.shard_index,
            &self.payload,
        )
    }

    /// Signs the shard as its holder. Fails if `keypair` does not belong to the assigned holder
    /// or the shard already carries a signature.
    pub fn sign(&mut self, keypair: &Keypair) -> Result<()> {
        let signer = HolderAddress::new(keypair.public().to_peer_id());
        if signer != self.holder_address {
            return Err(ShardError::UnauthorizedHolder(format!(
                "shard {} of {} is assigned to {}, not {}",
                self.shard_index, self.document_hash, self.holder_address, signer
            )));
        }
        if self.is_signed() {
            return Err(ShardError::InvalidSignature(format!(
                "shard {} of {} is already signed",
                self.shard_index, self.document_hash
            )));
        }
        self.signature = Some(signing::sign(keypair, &self.signing_message())?);
        Ok(())
    }

    /// Storage key for this shard: `<document_hash>/<shard_index>`.
    pub fn key(&self) -> String {
        shard_key(&self.document_hash, self.shard_index)
    }
}

pub fn shard_key(document_hash: &DocumentHash, shard_index: u8) -> String {
    format!("{document_hash}/{shard_index}")
}

/// A document split across `total_shards` holders of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedDocument {
    pub document_hash: DocumentHash,
    pub data_type: Option<DataType>,
    pub total_shards: usize,
    pub threshold: usize,
    pub shards: Vec<Shard>,
    pub snapshot: SnapshotRef,
}

impl ShardedDocument {
    /// The document metadata without any shard payloads, as written to a manifest.
    pub fn manifest(&self) -> ShardedDocument {
        ShardedDocument {
            shards: Vec::new(),
            ..self.clone()
        }
    }

    /// Whether `shard` claims to belong to this document and snapshot.
    pub fn owns(&self, shard: &Shard) -> bool {
        shard.document_hash == self.document_hash && shard.snapshot == self.snapshot
    }
}
