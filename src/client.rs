use futures::channel::{mpsc, oneshot};
use futures::future::BoxFuture;
use futures::prelude::*;
use futures::stream::BoxStream;
use libp2p::{core::Multiaddr, request_response::ResponseChannel, PeerId};

use std::collections::HashSet;
use std::error::Error;
use tracing::{debug, warn};

use crate::command::Command;
use crate::constants::MAX_SHARDS;
use crate::document::DocumentHash;
use crate::protocol::{AssignShardResponse, Response};
use crate::registry::HolderAddress;
use crate::shard::Shard;
use crate::transport::ShardTransport;

fn boxed<E: Error + Send + 'static>(e: E) -> Box<dyn Error + Send> {
    Box::new(e)
}

/// Represents a client in the network capable of issuing commands.
///
/// A `Client` is a cheap handle on the network event loop: cloning it clones the command channel.
///
/// # Fields
///
/// * `sender` - A channel sender used to send commands to the network event loop.
/// * `peer_id` - The local node's identity, sent along with every request.
///
/// # Examples
///
/// Creating a new `Client`:
///
/// ```rust
/// use futures::channel::mpsc;
/// use libp2p::PeerId;
/// use docshard::client::Client;
/// use docshard::command::Command;
///
/// let (sender, receiver) = mpsc::channel::<Command>(10);
/// let client = Client { sender, peer_id: PeerId::random() };
/// ```
#[derive(Clone)]
pub struct Client {
    pub sender: mpsc::Sender<Command>,
    pub peer_id: PeerId,
}

impl Client {
    /// Listen for incoming connections on the given address.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// client.start_listening("/ip4/0.0.0.0/tcp/0".parse()?).await?;
    /// ```
    pub async fn start_listening(&mut self, addr: Multiaddr) -> Result<(), Box<dyn Error + Send>> {
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send(Command::StartListening { addr, sender })
            .await
            .map_err(boxed)?;
        receiver.await.map_err(boxed)?
    }

    /// Dial the given peer at the given address.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// client.dial(peer_id, peer_addr).await?;
    /// ```
    pub async fn dial(
        &mut self,
        peer_id: PeerId,
        peer_addr: Multiaddr,
    ) -> Result<(), Box<dyn Error + Send>> {
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send(Command::Dial {
                peer_id,
                peer_addr,
                sender,
            })
            .await
            .map_err(boxed)?;
        receiver.await.map_err(boxed)?
    }

    /// Advertise the local node as the provider of the given key on the DHT.
    ///
    /// Holders provide the hex document hash of every shard they keep.
    pub async fn start_providing(&mut self, key: String) {
        let (sender, receiver) = oneshot::channel();
        if let Err(e) = self
            .sender
            .send(Command::StartProviding { key, sender })
            .await
        {
            warn!("Network event loop is gone: {e}");
            return;
        }
        let _ = receiver.await;
    }

    /// Find the providers for the given key on the DHT.
    ///
    /// Waits for the whole lookup. An unreachable network yields an empty set.
    pub async fn get_providers(&mut self, key: String) -> HashSet<PeerId> {
        self.provider_batches(key).await.concat().await
    }

    /// Streams the providers of `key` batch by batch as the DHT lookup progresses. The stream
    /// ends with the lookup.
    pub async fn provider_batches(&mut self, key: String) -> mpsc::UnboundedReceiver<HashSet<PeerId>> {
        let (sender, receiver) = mpsc::unbounded();
        if let Err(e) = self.sender.send(Command::GetProviders { key, sender }).await {
            warn!("Network event loop is gone: {e}");
        }
        receiver
    }

    /// Hand `shard` to `peer`, which must be its holder, and wait for its answer.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let response = client.request_assign_shard(shard.clone(), holder_peer).await?;
    /// ```
    pub async fn request_assign_shard(
        &mut self,
        shard: Shard,
        peer: PeerId,
    ) -> Result<AssignShardResponse, Box<dyn Error + Send>> {
        let (sender_chan, receiver) = oneshot::channel();
        self.sender
            .send(Command::RequestAssignShard {
                shard,
                peer,
                sender: self.peer_id,
                sender_chan,
            })
            .await
            .map_err(boxed)?;
        receiver.await.map_err(boxed)?
    }

    /// Respond to an assignment request.
    pub async fn respond_assign_shard(
        &mut self,
        success: bool,
        signature: Option<Vec<u8>>,
        channel: ResponseChannel<Response>,
    ) {
        if let Err(e) = self
            .sender
            .send(Command::RespondAssignShard {
                success,
                signature,
                channel,
            })
            .await
        {
            warn!("Network event loop is gone: {e}");
        }
    }

    /// Request the signed shard `peer` keeps for `document_hash`.
    pub async fn request_get_shard(
        &mut self,
        document_hash: DocumentHash,
        peer: PeerId,
    ) -> Result<Option<Shard>, Box<dyn Error + Send>> {
        let (sender_chan, receiver) = oneshot::channel();
        self.sender
            .send(Command::RequestGetShard {
                document_hash,
                peer,
                sender: self.peer_id,
                sender_chan,
            })
            .await
            .map_err(boxed)?;
        receiver.await.map_err(boxed)?
    }

    /// Respond with the stored shard, if any.
    pub async fn respond_get_shard(
        &mut self,
        shard: Option<Shard>,
        channel: ResponseChannel<Response>,
    ) {
        if let Err(e) = self
            .sender
            .send(Command::RespondGetShard { shard, channel })
            .await
        {
            warn!("Network event loop is gone: {e}");
        }
    }
}

impl ShardTransport for Client {
    /// Sends the shard to the peer named by its holder address. Acknowledged once the holder
    /// has stored and signed it.
    fn publish(&self, shard: Shard) -> BoxFuture<'_, bool> {
        let mut client = self.clone();
        async move {
            let holder = *shard.holder_address.peer_id();
            let key = shard.key();
            match client.request_assign_shard(shard, holder).await {
                Ok(AssignShardResponse {
                    success: true,
                    signature: Some(_),
                }) => {
                    debug!("Holder {holder} accepted shard {key}");
                    true
                }
                Ok(_) => {
                    warn!("Holder {holder} refused shard {key}");
                    false
                }
                Err(e) => {
                    warn!("Failed to publish shard {key} to {holder}: {e}");
                    false
                }
            }
        }
        .boxed()
    }

    /// Looks up the providers of the document hash and asks each one for its shard.
    fn subscribe(&self, document_hash: DocumentHash) -> BoxStream<'static, Shard> {
        self.fetch_shards(document_hash, HashSet::new())
    }
}

impl Client {
    /// Asks `known` holders and every provider the DHT turns up for their shard of
    /// `document_hash`. Each peer is asked once; requests run concurrently.
    pub fn fetch_shards(
        &self,
        document_hash: DocumentHash,
        known: HashSet<PeerId>,
    ) -> BoxStream<'static, Shard> {
        let client = self.clone();
        let mut lookup = self.clone();
        let local = self.peer_id;
        let mut asked = HashSet::new();

        let discovered = stream::once(async move {
            lookup.provider_batches(document_hash.to_string()).await
        })
        .flatten();

        stream::once(future::ready(known))
            .chain(discovered)
            .flat_map(move |batch| {
                let peers = unasked(&mut asked, batch, &local);
                if !peers.is_empty() {
                    debug!("Asking {} holders for document {}", peers.len(), document_hash);
                }
                stream::iter(peers)
            })
            .map(move |peer| {
                let mut client = client.clone();
                async move { (peer, client.request_get_shard(document_hash, peer).await) }
            })
            .buffer_unordered(MAX_SHARDS)
            .filter_map(|(peer, response)| async move {
                match response {
                    Ok(shard) => shard,
                    Err(e) => {
                        debug!("Shard request to {peer} failed: {e}");
                        None
                    }
                }
            })
            .boxed()
    }

    /// A transport that also asks `holders` directly, for combiners that know which holders the
    /// document was assigned to.
    pub fn with_known_holders<I>(&self, holders: I) -> KnownHolders
    where
        I: IntoIterator<Item = HolderAddress>,
    {
        KnownHolders {
            client: self.clone(),
            holders: holders.into_iter().map(|h| *h.peer_id()).collect(),
        }
    }
}

/// Peers of `batch` not asked yet, excluding the local node.
fn unasked(asked: &mut HashSet<PeerId>, batch: HashSet<PeerId>, local: &PeerId) -> Vec<PeerId> {
    batch
        .into_iter()
        .filter(|peer| peer != local && asked.insert(*peer))
        .collect()
}

/// A [`Client`] that asks a fixed set of holders for shards in addition to the DHT providers.
#[derive(Clone)]
pub struct KnownHolders {
    client: Client,
    holders: HashSet<PeerId>,
}

impl ShardTransport for KnownHolders {
    fn publish(&self, shard: Shard) -> BoxFuture<'_, bool> {
        self.client.publish(shard)
    }

    fn subscribe(&self, document_hash: DocumentHash) -> BoxStream<'static, Shard> {
        self.client.fetch_shards(document_hash, self.holders.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SnapshotRef;
    use crate::verifier::tests::{holders, signed};
    use std::collections::HashMap;

    /// Answers client commands the way the event loop would: provider lookups return
    /// `batches` one after the other, shard requests are served from `held`.
    async fn serve(
        mut commands: mpsc::Receiver<Command>,
        batches: Vec<HashSet<PeerId>>,
        held: HashMap<PeerId, Shard>,
    ) -> Vec<PeerId> {
        let mut asked = Vec::new();
        while let Some(command) = commands.next().await {
            match command {
                Command::GetProviders { sender, .. } => {
                    for batch in batches.iter().cloned() {
                        sender.unbounded_send(batch).unwrap();
                    }
                }
                Command::RequestGetShard {
                    peer, sender_chan, ..
                } => {
                    asked.push(peer);
                    let _ = sender_chan.send(Ok(held.get(&peer).cloned()));
                }
                other => panic!("unexpected command {other:?}"),
            }
        }
        asked
    }

    #[tokio::test]
    async fn test_subscribe_uses_every_provider_batch() {
        let snap = SnapshotRef::new("TEST", 1);
        let (registry, keys) = holders(4, &snap);
        let sharded = signed(b"spread out", &registry, &keys, &snap, 4);
        let held: HashMap<PeerId, Shard> = sharded
            .shards
            .iter()
            .map(|s| (*s.holder_address.peer_id(), s.clone()))
            .collect();
        let peers: Vec<PeerId> = held.keys().copied().collect();

        // the DHT reports the holders over two steps, repeating one of them
        let batches = vec![
            HashSet::from([peers[0], peers[1]]),
            HashSet::from([peers[1], peers[2], peers[3]]),
        ];
        let (sender, receiver) = mpsc::channel(0);
        let client = Client {
            sender,
            peer_id: PeerId::random(),
        };
        let event_loop = tokio::spawn(serve(receiver, batches, held));

        let shards: Vec<Shard> = client.subscribe(sharded.document_hash).collect().await;
        drop(client);
        assert_eq!(shards.len(), 4);

        let asked = event_loop.await.unwrap();
        assert_eq!(asked.len(), 4);
        assert_eq!(asked.iter().collect::<HashSet<_>>().len(), 4);
    }

    #[tokio::test]
    async fn test_known_holders_are_asked_without_providers() {
        let snap = SnapshotRef::new("TEST", 1);
        let (registry, keys) = holders(3, &snap);
        let sharded = signed(b"no dht", &registry, &keys, &snap, 3);
        let held: HashMap<PeerId, Shard> = sharded
            .shards
            .iter()
            .map(|s| (*s.holder_address.peer_id(), s.clone()))
            .collect();

        let (sender, receiver) = mpsc::channel(0);
        let client = Client {
            sender,
            peer_id: PeerId::random(),
        };
        let event_loop = tokio::spawn(serve(receiver, vec![], held));

        let transport =
            client.with_known_holders(sharded.shards.iter().map(|s| s.holder_address));
        let shards: Vec<Shard> = transport.subscribe(sharded.document_hash).collect().await;
        drop(transport);
        drop(client);
        assert_eq!(shards.len(), 3);
        assert_eq!(event_loop.await.unwrap().len(), 3);
    }

    #[test]
    fn test_each_peer_is_asked_once_and_never_self() {
        let local = PeerId::random();
        let a = PeerId::random();
        let b = PeerId::random();
        let mut asked = HashSet::new();

        let mut first = unasked(&mut asked, HashSet::from([a, local]), &local);
        first.sort();
        assert_eq!(first, vec![a]);
        assert_eq!(unasked(&mut asked, HashSet::from([a, b]), &local), vec![b]);
        assert!(unasked(&mut asked, HashSet::from([a, b]), &local).is_empty());
    }
}
