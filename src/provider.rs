use crate::event::Event;
use crate::{
    client::Client,
    document::DocumentHash,
    protocol::{Request, Response},
    repository::{HashMapShardEntryDao, ShardEntry, ShardEntryDaoTrait, SledShardEntryDao},
    shard::Shard,
};
use futures::prelude::*;
use libp2p::identity::Keypair;
use libp2p::request_response::ResponseChannel;
use libp2p::PeerId;
use std::error::Error;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Shared handle on the shard store.
pub type Dao = Arc<Mutex<Box<dyn ShardEntryDaoTrait>>>;

/// Accepts a shard assigned to the local node, signs it and stores it.
///
/// The assignment is refused when the shard names another holder, arrives already signed, or
/// conflicts with a different payload stored for the same index. Re-sending an identical
/// assignment returns the stored signature.
///
/// # Returns
/// The signed shard when accepted. The response is sent on `channel` either way.
pub async fn execute_assign_shard(
    shard: Shard,
    sender: &PeerId,
    channel: ResponseChannel<Response>,
    keypair: &Keypair,
    dao: &Dao,
    network_client: &mut Client,
) -> Result<Option<Shard>, Box<dyn Error>> {
    let key = shard.key();
    debug!("-- Assignment of {} from {}.", key, sender);

    let signed = match accept_assignment(shard, keypair, dao) {
        Ok(signed) => Some(signed),
        Err(e) => {
            warn!("⚠️ Refused shard {key} from {sender}: {e}");
            None
        }
    };
    let Some(signed) = signed else {
        network_client
            .respond_assign_shard(false, None, channel)
            .await;
        return Ok(None);
    };

    network_client
        .start_providing(signed.document_hash.to_string())
        .await;
    network_client
        .respond_assign_shard(true, signed.signature.clone(), channel)
        .await;
    info!("🚀 Stored shard {key}.");
    Ok(Some(signed))
}

/// Validates, signs and stores an assignment. Split from the network reply so the storage rules
/// can be exercised without a swarm.
pub fn accept_assignment(
    mut shard: Shard,
    keypair: &Keypair,
    dao: &Dao,
) -> Result<Shard, Box<dyn Error>> {
    let key = shard.key();
    let dao = dao.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(existing) = dao.get(&key)? {
        let same = Shard {
            signature: None,
            ..existing.shard.clone()
        } == shard;
        if !same {
            return Err(format!("a different shard is already stored under {key}").into());
        }
        return Ok(existing.shard);
    }

    shard.sign(keypair)?;
    dao.insert(
        &key,
        &ShardEntry {
            shard: shard.clone(),
        },
    )?;
    Ok(shard)
}

/// Looks up the signed shard stored for `document_hash`, if any.
pub fn stored_shard(
    document_hash: &DocumentHash,
    dao: &Dao,
) -> Result<Option<Shard>, Box<dyn Error>> {
    let entries = dao
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .scan_prefix(&format!("{document_hash}/"))?;
    Ok(entries.into_iter().map(|e| e.shard).next())
}

/// Sends the locally stored shard for `document_hash` back to the requester.
pub async fn execute_get_shard(
    document_hash: &DocumentHash,
    sender: &PeerId,
    channel: ResponseChannel<Response>,
    dao: &Dao,
    network_client: &mut Client,
) -> Result<(), Box<dyn Error>> {
    let shard = stored_shard(document_hash, dao)?;
    debug!("-- Sender: {:#?}.", sender);

    match &shard {
        Some(s) => info!("💡 Sent shard {} to {}.", s.key(), sender),
        None => debug!("No shard stored for {document_hash}"),
    }
    network_client.respond_get_shard(shard, channel).await;
    Ok(())
}

/// Creates the shard store: sled when a path is given, otherwise an in-memory map.
pub fn dao(db_path: Option<String>) -> Result<Dao, Box<dyn Error>> {
    let dao: Dao = match db_path {
        Some(path) => {
            debug!("Using Sled DB at {path}");
            Arc::new(Mutex::new(Box::new(SledShardEntryDao::new(&path)?)))
        }
        None => {
            debug!("Using HashMap DB");
            Arc::new(Mutex::new(Box::new(HashMapShardEntryDao::default())))
        }
    };
    Ok(dao)
}

/// Serves shard assignments and shard requests until the event stream ends.
///
/// On start the node re-announces every document it already holds a shard of.
pub async fn run_loop(
    db_path: Option<String>,
    keypair: Keypair,
    network_client: &mut Client,
    mut network_events: impl Stream<Item = Event> + Unpin,
) -> Result<(), Box<dyn Error>> {
    let dao = dao(db_path)?;

    let stored = dao
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_all()?;
    for (key, entry) in stored {
        debug!("Providing stored shard {key}");
        network_client
            .start_providing(entry.shard.document_hash.to_string())
            .await;
    }

    while let Some(event) = network_events.next().await {
        let Event::InboundRequest { request, channel } = event;
        match request {
            Request::AssignShard(req) => {
                let sender = match PeerId::from_bytes(&req.sender) {
                    Ok(sender) => sender,
                    Err(e) => {
                        warn!("Malformed sender in assignment: {e}");
                        network_client
                            .respond_assign_shard(false, None, channel)
                            .await;
                        continue;
                    }
                };
                if let Err(e) = execute_assign_shard(
                    req.shard,
                    &sender,
                    channel,
                    &keypair,
                    &dao,
                    network_client,
                )
                .await
                {
                    warn!("Failed to handle assignment: {e}");
                }
            }
            Request::GetShard(req) => {
                let Ok(sender) = PeerId::from_bytes(&req.sender) else {
                    warn!("Malformed sender in shard request");
                    network_client.respond_get_shard(None, channel).await;
                    continue;
                };
                if let Err(e) = execute_get_shard(
                    &req.document_hash,
                    &sender,
                    channel,
                    &dao,
                    network_client,
                )
                .await
                {
                    warn!("Failed to serve shard for {}: {e}", req.document_hash);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HolderAddress, SnapshotRef};
    use crate::repository::tests::reopen;

    fn assignment(holder: &Keypair, index: u8) -> Shard {
        Shard {
            document_hash: DocumentHash::of(b"held"),
            shard_index: index,
            payload: vec![3, 1, 4, 1, 5],
            holder_address: HolderAddress::new(holder.public().to_peer_id()),
            signature: None,
            snapshot: SnapshotRef::new("TEST", 11),
        }
    }

    #[test]
    fn test_accepts_and_signs_own_shard() {
        let local = Keypair::generate_ed25519();
        let dao = dao(None).unwrap();

        let signed = accept_assignment(assignment(&local, 0), &local, &dao).unwrap();
        assert!(signed.is_signed());
        assert_eq!(
            stored_shard(&DocumentHash::of(b"held"), &dao).unwrap(),
            Some(signed.clone())
        );

        // an identical assignment gets the stored signature back
        let again = accept_assignment(assignment(&local, 0), &local, &dao).unwrap();
        assert_eq!(again, signed);
    }

    #[test]
    fn test_refuses_foreign_and_conflicting_shards() {
        let local = Keypair::generate_ed25519();
        let other = Keypair::generate_ed25519();
        let dao = dao(None).unwrap();

        assert!(accept_assignment(assignment(&other, 0), &local, &dao).is_err());
        assert_eq!(stored_shard(&DocumentHash::of(b"held"), &dao).unwrap(), None);

        accept_assignment(assignment(&local, 1), &local, &dao).unwrap();
        let mut conflicting = assignment(&local, 1);
        conflicting.payload[0] = 9;
        assert!(accept_assignment(conflicting, &local, &dao).is_err());
    }

    #[test]
    fn test_sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shards").to_string_lossy().to_string();
        let local = Keypair::generate_ed25519();

        let signed = {
            let dao = dao(Some(path.clone())).unwrap();
            accept_assignment(assignment(&local, 2), &local, &dao).unwrap()
        };
        let dao: Dao = Arc::new(Mutex::new(Box::new(reopen(&path))));
        assert_eq!(
            stored_shard(&DocumentHash::of(b"held"), &dao).unwrap(),
            Some(signed)
        );
    }
}
