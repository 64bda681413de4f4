use serde::{Deserialize, Serialize};

use crate::document::DocumentHash;
use crate::shard::Shard;

/// Represents a request in the shard exchange protocol.
///
/// # Variants
///
/// * `AssignShard(AssignShardRequest)` - Hands an unsigned shard to the holder it was assigned to.
/// * `GetShard(GetShardRequest)` - Asks a holder for the signed shard it keeps for a document.
///
/// # Examples
///
/// ```rust
/// use libp2p::PeerId;
/// use docshard::document::DocumentHash;
/// use docshard::protocol::{GetShardRequest, Request};
///
/// let request = Request::GetShard(GetShardRequest {
///     document_hash: DocumentHash::of(b"hello"),
///     sender: PeerId::random().to_bytes(),
/// });
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    AssignShard(AssignShardRequest),
    GetShard(GetShardRequest),
}

/// Represents a response in the shard exchange protocol.
///
/// # Variants
///
/// * `AssignShard(AssignShardResponse)` - Response to an `AssignShard` request.
/// * `GetShard(GetShardResponse)` - Response to a `GetShard` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    AssignShard(AssignShardResponse),
    GetShard(GetShardResponse),
}

/// Represents a request to store and sign a shard.
///
/// # Fields
///
/// * `shard` - The unsigned shard. Its `holder_address` must be the receiving peer.
/// * `sender` - The peer id bytes of the splitting node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignShardRequest {
    pub shard: Shard,
    pub sender: Vec<u8>,
}

/// Represents a response to an `AssignShard` request.
///
/// # Fields
///
/// * `success` - Whether the holder accepted and stored the shard.
/// * `signature` - The holder's signature over the shard when accepted.
///
/// # Examples
///
/// ```rust
/// use docshard::protocol::AssignShardResponse;
///
/// let response = AssignShardResponse {
///     success: false,
///     signature: None,
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignShardResponse {
    pub success: bool,
    pub signature: Option<Vec<u8>>,
}

/// Represents a request for the shard a holder keeps for `document_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetShardRequest {
    pub document_hash: DocumentHash,
    pub sender: Vec<u8>,
}

/// The signed shard, or `None` if the holder has nothing for the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetShardResponse {
    pub shard: Option<Shard>,
}
