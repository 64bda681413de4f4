use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::prelude::*;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::collector::{CollectorState, ShardCollector};
use crate::document::{Document, DocumentHash};
use crate::error::{Result, ShardError};
use crate::shard::Shard;

/// The broadcast layer the engine publishes shards to and collects them from.
///
/// `publish` resolves to whether the shard was accepted. `subscribe` yields every shard
/// published for the document, including those published before the subscription.
pub trait ShardTransport: Send + Sync {
    fn publish(&self, shard: Shard) -> BoxFuture<'_, bool>;

    fn subscribe(&self, document_hash: DocumentHash) -> BoxStream<'static, Shard>;
}

/// In-process broadcast over unbounded channels.
#[derive(Default)]
pub struct LocalBroadcast {
    inner: Mutex<Topics>,
}

#[derive(Default)]
struct Topics {
    published: HashMap<DocumentHash, Vec<Shard>>,
    subscribers: HashMap<DocumentHash, Vec<mpsc::UnboundedSender<Shard>>>,
}

impl LocalBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of shards published for `document_hash`.
    pub fn published(&self, document_hash: &DocumentHash) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .published
            .get(document_hash)
            .map_or(0, Vec::len)
    }

    /// Drops all subscriptions for `document_hash`, ending their streams.
    pub fn close(&self, document_hash: &DocumentHash) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .remove(document_hash);
    }
}

impl ShardTransport for LocalBroadcast {
    fn publish(&self, shard: Shard) -> BoxFuture<'_, bool> {
        let mut topics = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let hash = shard.document_hash;
        if let Some(subscribers) = topics.subscribers.get_mut(&hash) {
            subscribers.retain(|tx| tx.unbounded_send(shard.clone()).is_ok());
        }
        topics.published.entry(hash).or_default().push(shard);
        future::ready(true).boxed()
    }

    fn subscribe(&self, document_hash: DocumentHash) -> BoxStream<'static, Shard> {
        let (tx, rx) = mpsc::unbounded();
        let mut topics = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for shard in topics.published.get(&document_hash).into_iter().flatten() {
            let _ = tx.unbounded_send(shard.clone());
        }
        topics.subscribers.entry(document_hash).or_default().push(tx);
        rx.boxed()
    }
}

/// Publishes every shard and returns how many were acknowledged.
pub async fn publish_all<T>(transport: &T, shards: &[Shard]) -> usize
where
    T: ShardTransport + ?Sized,
{
    let acks = future::join_all(shards.iter().cloned().map(|s| transport.publish(s))).await;
    acks.into_iter().filter(|ack| *ack).count()
}

/// Feeds the transport's shards for the collector's document into it until the document is
/// reconstructed, the subscription ends or `timeout` elapses.
///
/// Invalid shards are dropped. A hard reconstruction failure does not stop collection: the
/// collector retries once its shard set changes.
pub async fn collect<T>(
    transport: &T,
    collector: &ShardCollector,
    timeout: Duration,
) -> Result<Document>
where
    T: ShardTransport + ?Sized,
{
    if let Some(document) = collector.document() {
        return Ok(document.clone());
    }

    let deadline = Instant::now() + timeout;
    let mut shards = transport.subscribe(collector.document_hash());

    loop {
        let shard = match timeout_at(deadline, shards.next()).await {
            Ok(Some(shard)) => shard,
            Ok(None) => {
                debug!("Subscription for {} ended", collector.document_hash());
                break;
            }
            Err(_) => {
                warn!(
                    "Timed out collecting shards for {} after {:?}",
                    collector.document_hash(),
                    timeout
                );
                break;
            }
        };

        let index = shard.shard_index;
        match collector.offer(shard) {
            Ok(CollectorState::Reconstructable) => {}
            Ok(state) if state.is_terminal() => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Dropped shard {index}: {e}");
                continue;
            }
        }

        match collector.try_reconstruct() {
            Ok(Some(document)) => {
                info!("Collected document {}", document.hash());
                return Ok(document);
            }
            Ok(None) => {}
            Err(e) => debug!("Reconstruction not possible yet: {e}"),
        }
    }

    if let Some(document) = collector.document() {
        return Ok(document.clone());
    }
    Err(collector
        .last_error()
        .filter(|_| collector.state() == CollectorState::Failed)
        .unwrap_or(ShardError::InsufficientShards {
            have: collector.distinct(),
            need: collector.manifest().threshold,
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstructor::AcceptAll;
    use crate::registry::SnapshotRef;
    use crate::verifier::tests::{holders, signed};
    use crate::verifier::ShardVerifier;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_publish_then_collect() {
        let snap = SnapshotRef::new("TEST", 7);
        let (registry, keys) = holders(5, &snap);
        let sharded = signed(b"broadcast document", &registry, &keys, &snap, 5);
        let transport = LocalBroadcast::new();

        assert_eq!(publish_all(&transport, &sharded.shards).await, 5);
        assert_eq!(transport.published(&sharded.document_hash), 5);

        let collector = ShardCollector::new(&sharded, Arc::new(ShardVerifier::new(registry)));
        let doc = collect(&transport, &collector, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(doc.as_bytes(), b"broadcast document");
        assert_eq!(collector.state(), CollectorState::Reconstructed);
    }

    #[tokio::test]
    async fn test_concurrent_publishers_and_collector() {
        let snap = SnapshotRef::new("TEST", 7);
        let (registry, keys) = holders(12, &snap);
        let sharded = signed(&[42u8; 1024], &registry, &keys, &snap, 12);
        let transport = Arc::new(LocalBroadcast::new());
        let collector = Arc::new(ShardCollector::new(
            &sharded,
            Arc::new(ShardVerifier::new(registry)),
        ));

        let collecting = {
            let transport = Arc::clone(&transport);
            let collector = Arc::clone(&collector);
            tokio::spawn(async move {
                collect(transport.as_ref(), &collector, Duration::from_secs(5)).await
            })
        };

        let publishers: Vec<_> = sharded
            .shards
            .iter()
            .cloned()
            .map(|shard| {
                let transport = Arc::clone(&transport);
                tokio::spawn(async move { transport.publish(shard).await })
            })
            .collect();
        for publisher in publishers {
            assert!(publisher.await.unwrap());
        }

        let doc = collecting.await.unwrap().unwrap();
        assert_eq!(doc.as_bytes(), &[42u8; 1024][..]);
        assert_eq!(collector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_collect_ends_incomplete() {
        let snap = SnapshotRef::new("TEST", 7);
        let (registry, keys) = holders(3, &snap);
        let sharded = signed(b"hello", &registry, &keys, &snap, 3);
        let transport = LocalBroadcast::new();
        publish_all(&transport, &sharded.shards[..2]).await;

        let collector = ShardCollector::new(&sharded, Arc::new(ShardVerifier::new(registry)));
        let err = collect(&transport, &collector, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, ShardError::InsufficientShards { have: 2, need: 3 });
        assert_eq!(collector.state(), CollectorState::Incomplete);
    }

    #[tokio::test]
    async fn test_collect_skips_forged_shards() {
        let snap = SnapshotRef::new("TEST", 7);
        let (registry, keys) = holders(3, &snap);
        let sharded = signed(b"hello", &registry, &keys, &snap, 3);
        let transport = LocalBroadcast::new();

        let mut forged = sharded.shards[0].clone();
        forged.payload[0] ^= 0x80;
        transport.publish(forged).await;
        publish_all(&transport, &sharded.shards).await;
        transport.close(&sharded.document_hash);

        let collector = ShardCollector::new(&sharded, Arc::new(ShardVerifier::new(registry)));
        let doc = collect(&transport, &collector, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(doc.as_bytes(), b"hello");
    }

    #[tokio::test]
    async fn test_collect_reports_integrity_failure() {
        let snap = SnapshotRef::new("TEST", 7);
        let (registry, keys) = holders(2, &snap);
        let sharded = signed(b"hello", &registry, &keys, &snap, 2);
        let transport = LocalBroadcast::new();

        let mut corrupt = sharded.shards[1].clone();
        corrupt.payload[2] ^= 0x04;
        transport.publish(sharded.shards[0].clone()).await;
        transport.publish(corrupt).await;

        let collector = ShardCollector::new(&sharded, Arc::new(AcceptAll));
        let err = collect(&transport, &collector, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::IntegrityMismatch { .. }));
        assert_eq!(collector.state(), CollectorState::Failed);
    }

    /// Rebuilds the document as soon as it is subscribed to, then yields one more shard and
    /// stays open.
    struct FinishesOnSubscribe {
        collector: Arc<ShardCollector>,
        shards: Vec<Shard>,
    }

    impl ShardTransport for FinishesOnSubscribe {
        fn publish(&self, _shard: Shard) -> BoxFuture<'_, bool> {
            future::ready(false).boxed()
        }

        fn subscribe(&self, _document_hash: DocumentHash) -> BoxStream<'static, Shard> {
            for shard in &self.shards {
                self.collector.offer(shard.clone()).unwrap();
            }
            self.collector.try_reconstruct().unwrap();
            stream::iter(self.shards[..1].to_vec())
                .chain(stream::pending())
                .boxed()
        }
    }

    #[tokio::test]
    async fn test_collect_returns_once_reconstructed_elsewhere() {
        let snap = SnapshotRef::new("TEST", 7);
        let (registry, keys) = holders(2, &snap);
        let sharded = signed(b"done elsewhere", &registry, &keys, &snap, 2);
        let collector = Arc::new(ShardCollector::new(
            &sharded,
            Arc::new(ShardVerifier::new(registry)),
        ));
        let transport = FinishesOnSubscribe {
            collector: Arc::clone(&collector),
            shards: sharded.shards.clone(),
        };

        let doc = tokio::time::timeout(
            Duration::from_secs(2),
            collect(&transport, &collector, Duration::from_secs(60)),
        )
        .await
        .expect("collect kept waiting after the document was rebuilt")
        .unwrap();
        assert_eq!(doc.as_bytes(), b"done elsewhere");
        assert_eq!(collector.attempts(), 1);
    }
}
