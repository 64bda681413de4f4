use libp2p::identity::{Keypair, PublicKey};

use crate::constants::SIGNING_DOMAIN;
use crate::document::DocumentHash;
use crate::error::{Result, ShardError};
use crate::registry::{HolderAddress, SnapshotRef};

/// Multihash code of the identity hash, used by peer ids that inline their public key.
const IDENTITY_MULTIHASH: u8 = 0x00;

/// Builds the byte string a holder signs for a shard.
///
/// The message binds the payload to its document, snapshot and index, so a payload moved to
/// another document or index no longer verifies.
pub fn shard_message(
    document_hash: &DocumentHash,
    snapshot: &SnapshotRef,
    shard_index: u8,
    payload: &[u8],
) -> Vec<u8> {
    let asset = snapshot.asset.as_bytes();
    let mut msg = Vec::with_capacity(
        SIGNING_DOMAIN.len() + 32 + 8 + asset.len() + 8 + 1 + 8 + payload.len(),
    );
    msg.extend_from_slice(SIGNING_DOMAIN);
    msg.extend_from_slice(document_hash.as_bytes());
    msg.extend_from_slice(&(asset.len() as u64).to_be_bytes());
    msg.extend_from_slice(asset);
    msg.extend_from_slice(&snapshot.height.to_be_bytes());
    msg.push(shard_index);
    msg.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    msg.extend_from_slice(payload);
    msg
}

/// Recovers the public key inlined in a holder address.
///
/// Ed25519 peer ids use the identity multihash, so the protobuf encoded key is the digest.
pub fn public_key_of(address: &HolderAddress) -> Option<PublicKey> {
    let bytes = address.peer_id().to_bytes();
    match bytes.as_slice() {
        [IDENTITY_MULTIHASH, len, key @ ..] if *len as usize == key.len() => {
            PublicKey::try_decode_protobuf(key).ok()
        }
        _ => None,
    }
}

pub fn sign(keypair: &Keypair, message: &[u8]) -> Result<Vec<u8>> {
    keypair
        .sign(message)
        .map_err(|e| ShardError::InvalidSignature(format!("signing failed: {e}")))
}

/// Checks `signature` over `message` under the key inlined in `address`.
pub fn verify(address: &HolderAddress, message: &[u8], signature: &[u8]) -> Result<()> {
    let key = public_key_of(address).ok_or_else(|| {
        ShardError::InvalidSignature(format!("no public key recoverable from {address}"))
    })?;
    if key.verify(message, signature) {
        Ok(())
    } else {
        Err(ShardError::InvalidSignature(format!(
            "signature does not verify under {address}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;

    #[test]
    fn test_public_key_recovered_from_ed25519_peer_id() {
        let keypair = Keypair::generate_ed25519();
        let address = HolderAddress::new(keypair.public().to_peer_id());
        assert_eq!(public_key_of(&address), Some(keypair.public()));
    }

    #[test]
    fn test_random_peer_id_has_no_key() {
        // random peer ids carry a sha256 multihash, not an inlined key
        let address = HolderAddress::new(PeerId::random());
        assert!(public_key_of(&address).is_none());
        assert!(verify(&address, b"msg", b"sig").is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::generate_ed25519();
        let address = HolderAddress::new(keypair.public().to_peer_id());
        let msg = shard_message(
            &DocumentHash::of(b"doc"),
            &SnapshotRef::new("TEST", 1),
            0,
            b"payload",
        );
        let sig = sign(&keypair, &msg).unwrap();
        assert!(verify(&address, &msg, &sig).is_ok());

        let other = Keypair::generate_ed25519();
        let other_address = HolderAddress::new(other.public().to_peer_id());
        assert!(matches!(
            verify(&other_address, &msg, &sig),
            Err(ShardError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_message_binds_every_field() {
        let hash = DocumentHash::of(b"doc");
        let snap = SnapshotRef::new("TEST", 1);
        let base = shard_message(&hash, &snap, 0, b"payload");

        assert_ne!(base, shard_message(&DocumentHash::of(b"other"), &snap, 0, b"payload"));
        assert_ne!(base, shard_message(&hash, &SnapshotRef::new("TEST", 2), 0, b"payload"));
        assert_ne!(base, shard_message(&hash, &SnapshotRef::new("TESTX", 1), 0, b"payload"));
        assert_ne!(base, shard_message(&hash, &snap, 1, b"payload"));
        assert_ne!(base, shard_message(&hash, &snap, 0, b"paylOad"));
    }
}
