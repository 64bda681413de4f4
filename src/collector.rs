use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{debug, info, warn};

use crate::document::{Document, DocumentHash};
use crate::error::{Result, ShardError};
use crate::reconstructor::reconstruct;
use crate::registry::HolderAddress;
use crate::shard::{Shard, ShardedDocument};
use crate::verifier::ShardValidator;

/// Reconstruction state of one sharded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectorState {
    /// Fewer than `threshold` distinct valid shards collected.
    Incomplete = 0,
    /// Enough shards are present and no attempt is running.
    Reconstructable = 1,
    /// An attempt is in flight.
    Reconstructing = 2,
    /// Terminal: the document was recovered.
    Reconstructed = 3,
    /// The last attempt failed hard. Left only when the shard set changes.
    Failed = 4,
}

impl CollectorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CollectorState::Incomplete,
            1 => CollectorState::Reconstructable,
            2 => CollectorState::Reconstructing,
            3 => CollectorState::Reconstructed,
            _ => CollectorState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CollectorState::Reconstructed)
    }
}

/// Collects shards for one document from any number of concurrent publishers and reconstructs
/// it once the threshold is reached.
///
/// Shards are validated before the pool lock is taken; the lock only covers the append and the
/// recount. At most one reconstruction runs at a time: concurrent triggers race on a
/// compare-and-swap and the losers return immediately.
pub struct ShardCollector {
    sharded: ShardedDocument,
    validator: Arc<dyn ShardValidator>,
    shards: Mutex<Vec<Shard>>,
    state: AtomicU8,
    /// Bumped whenever the pool changes.
    generation: AtomicU64,
    attempts: AtomicUsize,
    last_error: Mutex<Option<ShardError>>,
    document: OnceLock<Document>,
}

impl ShardCollector {
    /// A collector for `sharded`. Only the manifest fields are used; any shards already attached
    /// to `sharded` are not collected.
    pub fn new(sharded: &ShardedDocument, validator: Arc<dyn ShardValidator>) -> Self {
        ShardCollector {
            sharded: sharded.manifest(),
            validator,
            shards: Mutex::new(Vec::new()),
            state: AtomicU8::new(CollectorState::Incomplete as u8),
            generation: AtomicU64::new(0),
            attempts: AtomicUsize::new(0),
            last_error: Mutex::new(None),
            document: OnceLock::new(),
        }
    }

    pub fn document_hash(&self) -> DocumentHash {
        self.sharded.document_hash
    }

    pub fn manifest(&self) -> &ShardedDocument {
        &self.sharded
    }

    pub fn state(&self) -> CollectorState {
        CollectorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Number of reconstruction attempts that actually ran.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn document(&self) -> Option<&Document> {
        self.document.get()
    }

    pub fn last_error(&self) -> Option<ShardError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of distinct shard indices in the pool.
    pub fn distinct(&self) -> usize {
        distinct_indices(&self.pool())
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, Vec<Shard>> {
        self.shards.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, from: CollectorState, to: CollectorState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn set_state(&self, to: CollectorState) {
        self.state.store(to as u8, Ordering::SeqCst);
    }

    /// Moves between `Incomplete`, `Reconstructable` and `Failed` after the pool changed.
    fn settle(&self, distinct: usize) {
        let ready = distinct >= self.sharded.threshold;
        loop {
            let current = self.state();
            let next = match (current, ready) {
                (CollectorState::Incomplete, true) => CollectorState::Reconstructable,
                (CollectorState::Reconstructable, false) => CollectorState::Incomplete,
                (CollectorState::Failed, true) => CollectorState::Reconstructable,
                (CollectorState::Failed, false) => CollectorState::Incomplete,
                _ => return,
            };
            if self.transition(current, next) {
                debug!(
                    "Document {} moved {:?} -> {:?} with {} shards",
                    self.sharded.document_hash, current, next, distinct
                );
                return;
            }
        }
    }

    /// Validates `shard` and appends it to the pool.
    ///
    /// Validation errors are returned so the caller can drop the shard; they never change the
    /// collector's state. Re-offering an identical shard is a no-op.
    pub fn offer(&self, shard: Shard) -> Result<CollectorState> {
        if !self.sharded.owns(&shard) {
            return Err(ShardError::UnauthorizedHolder(format!(
                "shard {} belongs to {} at {}",
                shard.shard_index, shard.document_hash, shard.snapshot
            )));
        }
        self.validator.validate(&shard, &self.sharded)?;

        let distinct = {
            let mut pool = self.pool();
            if pool.iter().any(|s| s == &shard) {
                return Ok(self.state());
            }
            debug!(
                "Collected shard {} of {} from {}",
                shard.shard_index, self.sharded.document_hash, shard.holder_address
            );
            pool.push(shard);
            self.generation.fetch_add(1, Ordering::SeqCst);
            distinct_indices(&pool)
        };

        self.settle(distinct);
        Ok(self.state())
    }

    /// Removes every shard presented by `holder`, for example after it was found to publish a
    /// conflicting shard. Returns the number of shards removed.
    pub fn exclude_holder(&self, holder: &HolderAddress) -> usize {
        let (removed, distinct) = {
            let mut pool = self.pool();
            let before = pool.len();
            pool.retain(|s| &s.holder_address != holder);
            let removed = before - pool.len();
            if removed > 0 {
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            (removed, distinct_indices(&pool))
        };

        if removed > 0 {
            warn!(
                "Excluded {} shards from {} for document {}",
                removed, holder, self.sharded.document_hash
            );
            self.settle(distinct);
        }
        removed
    }

    /// Attempts reconstruction if the collector is `Reconstructable`.
    ///
    /// Returns `Ok(Some(document))` once reconstructed, `Ok(None)` if another attempt is already
    /// in flight, `InsufficientShards` while incomplete, and the recorded hard failure while the
    /// collector is `Failed` with an unchanged shard set.
    pub fn try_reconstruct(&self) -> Result<Option<Document>> {
        if !self.transition(CollectorState::Reconstructable, CollectorState::Reconstructing) {
            return match self.state() {
                CollectorState::Reconstructed => Ok(self.document.get().cloned()),
                CollectorState::Reconstructing => Ok(None),
                CollectorState::Incomplete => Err(ShardError::InsufficientShards {
                    have: self.distinct(),
                    need: self.sharded.threshold,
                }),
                CollectorState::Failed => Err(self.last_error().unwrap_or_else(|| {
                    ShardError::InsufficientShards {
                        have: self.distinct(),
                        need: self.sharded.threshold,
                    }
                })),
                // lost the race to a concurrent settle; let the caller retry
                CollectorState::Reconstructable => Ok(None),
            };
        }

        self.attempts.fetch_add(1, Ordering::AcqRel);
        let (shards, generation) = {
            let pool = self.pool();
            (pool.clone(), self.generation.load(Ordering::SeqCst))
        };

        match reconstruct(&self.sharded, &shards, self.validator.as_ref()) {
            Ok(document) => {
                let document = self.document.get_or_init(|| document).clone();
                self.set_state(CollectorState::Reconstructed);
                info!("📄 Reconstructed document {}", self.sharded.document_hash);
                Ok(Some(document))
            }
            Err(err) => {
                warn!(
                    "Reconstruction of {} failed: {}",
                    self.sharded.document_hash, err
                );
                *self
                    .last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(err.clone());

                self.set_state(match err {
                    ShardError::InsufficientShards { .. } => CollectorState::Incomplete,
                    _ => CollectorState::Failed,
                });
                // an offer that saw `Reconstructing` either settles after this store or bumped
                // the generation before the load below
                if self.generation.load(Ordering::SeqCst) != generation {
                    self.settle(self.distinct());
                }
                Err(err)
            }
        }
    }
}

fn distinct_indices(pool: &[Shard]) -> usize {
    pool.iter()
        .map(|s| s.shard_index)
        .collect::<BTreeSet<_>>()
        .len()
}

/// Routes shards to the collector of their document.
///
/// A collector is dropped from the pool once its document is reconstructed. Callers that still
/// hold its `Arc` keep the result; later shards for that document are reported as unregistered.
pub struct ShardPool {
    validator: Arc<dyn ShardValidator>,
    collectors: Mutex<HashMap<DocumentHash, Arc<ShardCollector>>>,
}

impl ShardPool {
    pub fn new(validator: Arc<dyn ShardValidator>) -> Self {
        ShardPool {
            validator,
            collectors: Mutex::new(HashMap::new()),
        }
    }

    /// Starts collecting for `sharded`, or returns the existing collector for its hash.
    pub fn register(&self, sharded: &ShardedDocument) -> Arc<ShardCollector> {
        let mut collectors = self
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            collectors
                .entry(sharded.document_hash)
                .or_insert_with(|| Arc::new(ShardCollector::new(sharded, Arc::clone(&self.validator)))),
        )
    }

    /// Number of documents still being collected.
    pub fn len(&self) -> usize {
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, document_hash: &DocumentHash) -> Option<Arc<ShardCollector>> {
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document_hash)
            .cloned()
    }

    /// Offers `shard` to its document's collector and reconstructs opportunistically once the
    /// threshold is crossed.
    pub fn offer(&self, shard: Shard) -> Result<CollectorState> {
        let collector = self.get(&shard.document_hash).ok_or_else(|| {
            ShardError::InvalidConfiguration(format!(
                "no collector registered for document {}",
                shard.document_hash
            ))
        })?;
        let state = collector.offer(shard)?;
        if state == CollectorState::Reconstructable {
            if let Err(e) = collector.try_reconstruct() {
                debug!("Opportunistic reconstruction failed: {}", e);
            }
        }

        let state = collector.state();
        if state.is_terminal() {
            let mut collectors = self
                .collectors
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if collectors
                .get(&collector.document_hash())
                .is_some_and(|c| Arc::ptr_eq(c, &collector))
            {
                collectors.remove(&collector.document_hash());
                debug!("Evicted collector for {}", collector.document_hash());
            }
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstructor::AcceptAll;
    use crate::registry::SnapshotRef;
    use crate::verifier::tests::{holders, signed};
    use crate::verifier::ShardVerifier;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Barrier, Weak};
    use std::thread;

    /// Accepts every shard. Once armed, the first validation offers `late` to the collector,
    /// which lands while a reconstruction attempt is running.
    #[derive(Default)]
    struct OfferDuringAttempt {
        collector: OnceLock<Weak<ShardCollector>>,
        late: Mutex<Option<Shard>>,
        armed: AtomicBool,
    }

    impl ShardValidator for OfferDuringAttempt {
        fn validate(&self, _shard: &Shard, _sharded: &ShardedDocument) -> Result<()> {
            if self.armed.load(Ordering::SeqCst) {
                let late = self.late.lock().unwrap().take();
                if let Some(shard) = late {
                    let collector = self.collector.get().and_then(Weak::upgrade).unwrap();
                    collector.offer(shard).unwrap();
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_state_machine_follows_threshold() {
        let snap = SnapshotRef::new("TEST", 1);
        let (registry, keys) = holders(3, &snap);
        let sharded = signed(b"hello", &registry, &keys, &snap, 3);
        let collector = ShardCollector::new(&sharded, Arc::new(ShardVerifier::new(registry)));

        assert_eq!(collector.state(), CollectorState::Incomplete);
        assert_eq!(
            collector.try_reconstruct().unwrap_err(),
            ShardError::InsufficientShards { have: 0, need: 3 }
        );

        collector.offer(sharded.shards[0].clone()).unwrap();
        assert_eq!(
            collector.offer(sharded.shards[1].clone()).unwrap(),
            CollectorState::Incomplete
        );
        assert_eq!(
            collector.try_reconstruct().unwrap_err(),
            ShardError::InsufficientShards { have: 2, need: 3 }
        );
        assert_eq!(
            collector.offer(sharded.shards[2].clone()).unwrap(),
            CollectorState::Reconstructable
        );

        let doc = collector.try_reconstruct().unwrap().unwrap();
        assert_eq!(doc.as_bytes(), b"hello");
        assert_eq!(collector.state(), CollectorState::Reconstructed);
        assert!(collector.state().is_terminal());

        // later calls return the cached result without another attempt
        assert_eq!(collector.try_reconstruct().unwrap().unwrap(), doc);
        assert_eq!(collector.attempts(), 1);
    }

    #[test]
    fn test_invalid_shards_are_dropped_without_state_change() {
        let snap = SnapshotRef::new("TEST", 1);
        let (registry, keys) = holders(2, &snap);
        let sharded = signed(b"hi", &registry, &keys, &snap, 2);
        let collector = ShardCollector::new(&sharded, Arc::new(ShardVerifier::new(registry)));

        let mut unsigned = sharded.shards[0].clone();
        unsigned.signature = None;
        assert!(matches!(
            collector.offer(unsigned),
            Err(ShardError::InvalidSignature(_))
        ));
        assert_eq!(collector.distinct(), 0);

        // identical re-offers are no-ops
        collector.offer(sharded.shards[0].clone()).unwrap();
        collector.offer(sharded.shards[0].clone()).unwrap();
        assert_eq!(collector.distinct(), 1);
        assert_eq!(collector.state(), CollectorState::Incomplete);
    }

    #[test]
    fn test_concurrent_publishers() {
        let snap = SnapshotRef::new("TEST", 1);
        let (registry, keys) = holders(16, &snap);
        let sharded = signed(b"many holders at once", &registry, &keys, &snap, 16);
        let collector = ShardCollector::new(&sharded, Arc::new(ShardVerifier::new(registry)));

        thread::scope(|s| {
            for shard in &sharded.shards {
                let collector = &collector;
                s.spawn(move || {
                    // every holder publishes twice
                    collector.offer(shard.clone()).unwrap();
                    collector.offer(shard.clone()).unwrap();
                });
            }
        });

        assert_eq!(collector.distinct(), 16);
        assert_eq!(collector.state(), CollectorState::Reconstructable);
        assert_eq!(
            collector.try_reconstruct().unwrap().unwrap().as_bytes(),
            b"many holders at once"
        );
    }

    #[test]
    fn test_concurrent_triggers_coalesce() {
        let snap = SnapshotRef::new("TEST", 1);
        let (registry, keys) = holders(8, &snap);
        let sharded = signed(&[7u8; 4096], &registry, &keys, &snap, 8);
        let collector = ShardCollector::new(&sharded, Arc::new(ShardVerifier::new(registry)));
        for shard in &sharded.shards {
            collector.offer(shard.clone()).unwrap();
        }

        let barrier = Barrier::new(8);
        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        collector.try_reconstruct()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(collector.attempts(), 1);
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(results.iter().any(|r| matches!(r, Ok(Some(_)))));
        assert_eq!(collector.state(), CollectorState::Reconstructed);
        assert_eq!(collector.document().unwrap().as_bytes(), &[7u8; 4096][..]);
    }

    #[test]
    fn test_failed_attempt_is_not_retried_until_pool_changes() {
        let snap = SnapshotRef::new("TEST", 1);
        let (registry, keys) = holders(3, &snap);
        let sharded = signed(b"retry me", &registry, &keys, &snap, 3);
        // signatures are bypassed so a corrupted shard reaches interpolation
        let collector = ShardCollector::new(&sharded, Arc::new(AcceptAll));

        let mut corrupt = sharded.shards[1].clone();
        corrupt.payload[0] ^= 0x01;
        collector.offer(sharded.shards[0].clone()).unwrap();
        collector.offer(corrupt).unwrap();
        collector.offer(sharded.shards[2].clone()).unwrap();

        assert!(matches!(
            collector.try_reconstruct(),
            Err(ShardError::IntegrityMismatch { .. })
        ));
        assert_eq!(collector.state(), CollectorState::Failed);

        // same shard set: the recorded failure is returned, nothing is recomputed
        assert!(matches!(
            collector.try_reconstruct(),
            Err(ShardError::IntegrityMismatch { .. })
        ));
        assert_eq!(collector.attempts(), 1);

        // drop the bad holder, then the honest shard arrives
        assert_eq!(collector.exclude_holder(&sharded.shards[1].holder_address), 1);
        assert_eq!(collector.state(), CollectorState::Incomplete);
        assert_eq!(
            collector.offer(sharded.shards[1].clone()).unwrap(),
            CollectorState::Reconstructable
        );

        let doc = collector.try_reconstruct().unwrap().unwrap();
        assert_eq!(doc.as_bytes(), b"retry me");
        assert_eq!(collector.attempts(), 2);
    }

    #[test]
    fn test_conflicting_shard_fails_hard() {
        let snap = SnapshotRef::new("TEST", 1);
        let (registry, keys) = holders(2, &snap);
        let sharded = signed(b"hello", &registry, &keys, &snap, 2);
        let collector = ShardCollector::new(&sharded, Arc::new(ShardVerifier::new(registry)));

        // the holder of shard 0 equivocates with a second, properly signed payload
        let mut equivocation = sharded.shards[0].clone();
        equivocation.payload[0] ^= 0x10;
        equivocation.signature = None;
        equivocation.sign(&keys[0]).unwrap();

        collector.offer(sharded.shards[0].clone()).unwrap();
        collector.offer(equivocation).unwrap();
        collector.offer(sharded.shards[1].clone()).unwrap();

        assert_eq!(
            collector.try_reconstruct().unwrap_err(),
            ShardError::DuplicateShardIndex(0)
        );
        assert_eq!(collector.state(), CollectorState::Failed);
        assert_eq!(collector.last_error(), Some(ShardError::DuplicateShardIndex(0)));
    }

    #[test]
    fn test_pool_routes_and_reconstructs_opportunistically() {
        let snap = SnapshotRef::new("TEST", 1);
        let (registry, keys) = holders(3, &snap);
        let first = signed(b"first", &registry, &keys, &snap, 3);
        let second = signed(b"second", &registry, &keys, &snap, 3);
        let pool = ShardPool::new(Arc::new(ShardVerifier::new(registry.clone())));

        let a = pool.register(&first);
        let b = pool.register(&second);
        assert!(Arc::ptr_eq(&a, &pool.register(&first)));

        for shard in first.shards.iter().chain(second.shards.iter()) {
            pool.offer(shard.clone()).unwrap();
        }

        assert_eq!(a.state(), CollectorState::Reconstructed);
        assert_eq!(a.document().unwrap().as_bytes(), b"first");
        assert_eq!(b.document().unwrap().as_bytes(), b"second");

        // finished documents leave the pool
        assert!(pool.get(&first.document_hash).is_none());
        assert!(pool.is_empty());
        assert!(matches!(
            pool.offer(first.shards[0].clone()),
            Err(ShardError::InvalidConfiguration(_))
        ));

        let stray = signed(b"unregistered", &registry, &keys, &snap, 3);
        assert!(matches!(
            pool.offer(stray.shards[0].clone()),
            Err(ShardError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_shard_arriving_mid_attempt_allows_retry() {
        let snap = SnapshotRef::new("TEST", 1);
        let (registry, keys) = holders(3, &snap);
        let sharded = signed(b"late shard", &registry, &keys, &snap, 2);
        let validator = Arc::new(OfferDuringAttempt::default());
        let collector = Arc::new(ShardCollector::new(&sharded, validator.clone()));
        validator.collector.set(Arc::downgrade(&collector)).unwrap();
        *validator.late.lock().unwrap() = Some(sharded.shards[1].clone());

        let mut corrupt = sharded.shards[2].clone();
        corrupt.payload[0] ^= 0x01;
        collector.offer(sharded.shards[0].clone()).unwrap();
        assert_eq!(
            collector.offer(corrupt).unwrap(),
            CollectorState::Reconstructable
        );

        validator.armed.store(true, Ordering::SeqCst);
        assert!(matches!(
            collector.try_reconstruct(),
            Err(ShardError::IntegrityMismatch { .. })
        ));

        // the pool changed during the attempt, so the failure is not sticky
        assert_eq!(collector.distinct(), 3);
        assert_eq!(collector.state(), CollectorState::Reconstructable);
        let doc = collector.try_reconstruct().unwrap().unwrap();
        assert_eq!(doc.as_bytes(), b"late shard");
        assert_eq!(collector.attempts(), 2);
    }
}
