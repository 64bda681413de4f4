use core::fmt;
use libp2p::PeerId;
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::error::RegistryError;

/// The address of a holder: the peer id derived from the holder's ed25519 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderAddress(PeerId);

impl HolderAddress {
    pub fn new(peer_id: PeerId) -> Self {
        HolderAddress(peer_id)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.0
    }
}

impl From<PeerId> for HolderAddress {
    fn from(peer_id: PeerId) -> Self {
        HolderAddress(peer_id)
    }
}

impl fmt::Display for HolderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HolderAddress {
    type Err = libp2p::identity::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(HolderAddress(PeerId::from_str(s)?))
    }
}

/// Addresses order by their base58 text so tie-breaking matches what users see.
impl Ord for HolderAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.to_base58().cmp(&other.0.to_base58())
    }
}

impl PartialOrd for HolderAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for HolderAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_base58())
    }
}

impl<'de> Deserialize<'de> for HolderAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AddressVisitor;

        impl<'de> Visitor<'de> for AddressVisitor {
            type Value = HolderAddress;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a base58 encoded peer id")
            }

            fn visit_str<E>(self, v: &str) -> Result<HolderAddress, E>
            where
                E: de::Error,
            {
                HolderAddress::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(AddressVisitor)
    }
}

/// Identifies a holder snapshot: the asset whose weights are ranked and the sequence position
/// (block height) the weights were taken at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub asset: String,
    pub height: u64,
}

impl SnapshotRef {
    pub fn new(asset: impl Into<String>, height: u64) -> Self {
        SnapshotRef {
            asset: asset.into(),
            height,
        }
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.asset, self.height)
    }
}

/// A holder's position in a sealed snapshot. `rank` is 0-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderRecord {
    pub address: HolderAddress,
    pub weight: u64,
    pub rank: usize,
}

/// An immutable, ranked view of holder weights at one snapshot reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderSnapshot {
    reference: SnapshotRef,
    ranked: Vec<HolderRecord>,
}

impl HolderSnapshot {
    /// Ranks `entries` by weight descending, breaking ties by address.
    pub fn new(
        reference: SnapshotRef,
        entries: Vec<(HolderAddress, u64)>,
    ) -> Result<Self, RegistryError> {
        let mut seen = HashSet::with_capacity(entries.len());
        for (address, _) in &entries {
            if !seen.insert(*address) {
                return Err(RegistryError::InvalidConfiguration(format!(
                    "holder {address} appears twice in {reference}"
                )));
            }
        }

        let mut entries = entries;
        entries.sort_by(|(a_addr, a_weight), (b_addr, b_weight)| {
            b_weight.cmp(a_weight).then_with(|| a_addr.cmp(b_addr))
        });

        let ranked = entries
            .into_iter()
            .enumerate()
            .map(|(rank, (address, weight))| HolderRecord {
                address,
                weight,
                rank,
            })
            .collect();

        Ok(HolderSnapshot { reference, ranked })
    }

    pub fn reference(&self) -> &SnapshotRef {
        &self.reference
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }

    pub fn top_n(&self, n: usize) -> &[HolderRecord] {
        &self.ranked[..n.min(self.ranked.len())]
    }

    pub fn find_in_top_n(&self, address: &HolderAddress, n: usize) -> Option<&HolderRecord> {
        self.top_n(n).iter().find(|h| &h.address == address)
    }
}

/// Holds sealed snapshots and answers ranking queries against them.
///
/// The registry is owned by the caller and handed by reference to the verifier; snapshots are
/// never modified once sealed, so readers only contend on the map lookup.
#[derive(Debug, Default)]
pub struct HolderRegistry {
    snapshots: RwLock<BTreeMap<SnapshotRef, Arc<HolderSnapshot>>>,
}

impl HolderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seals a snapshot of `(address, weight)` pairs. A reference can only be sealed once.
    pub fn seal(
        &self,
        reference: SnapshotRef,
        entries: Vec<(HolderAddress, u64)>,
    ) -> Result<Arc<HolderSnapshot>, RegistryError> {
        let snapshot = Arc::new(HolderSnapshot::new(reference.clone(), entries)?);

        let mut snapshots = self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if snapshots.contains_key(&reference) {
            return Err(RegistryError::SnapshotSealed(reference.to_string()));
        }
        debug!("Sealed snapshot {} with {} holders", reference, snapshot.len());
        snapshots.insert(reference, Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn snapshot(&self, reference: &SnapshotRef) -> Result<Arc<HolderSnapshot>, RegistryError> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownSnapshot(reference.to_string()))
    }

    /// Returns the top `n` holders of a snapshot, highest weight first.
    pub fn get_top_n(
        &self,
        n: usize,
        reference: &SnapshotRef,
    ) -> Result<Vec<HolderRecord>, RegistryError> {
        Ok(self.snapshot(reference)?.top_n(n).to_vec())
    }

    /// Looks up `address` among the top `n` holders of a snapshot.
    pub fn verify_holder(
        &self,
        address: &HolderAddress,
        reference: &SnapshotRef,
        n: usize,
    ) -> Result<HolderRecord, RegistryError> {
        self.snapshot(reference)?
            .find_in_top_n(address, n)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                address: address.to_string(),
                snapshot: reference.to_string(),
                n,
            })
    }
}

/// A snapshot as read from disk.
///
/// ```json
/// { "asset": "ERDFA", "height": 100, "holders": [ { "address": "12D3Koo...", "weight": 10 } ] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub asset: String,
    pub height: u64,
    pub holders: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub address: HolderAddress,
    pub weight: u64,
}

impl SnapshotFile {
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn reference(&self) -> SnapshotRef {
        SnapshotRef::new(self.asset.clone(), self.height)
    }

    /// Seals this snapshot into `registry`.
    pub fn seal_into(
        &self,
        registry: &HolderRegistry,
    ) -> Result<Arc<HolderSnapshot>, RegistryError> {
        let entries = self
            .holders
            .iter()
            .map(|e| (e.address, e.weight))
            .collect();
        registry.seal(self.reference(), entries)
    }
}
