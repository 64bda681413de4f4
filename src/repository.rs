use serde::{Deserialize, Serialize};
use sled::Db;
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Mutex, PoisonError};

use crate::shard::Shard;

/// Represents a shard kept by a holder node.
///
/// # Fields
///
/// * `shard` - The shard, signed by the local node once accepted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShardEntry {
    pub shard: Shard,
}

/// Defines the Data Access Object (DAO) trait for `ShardEntry`.
///
/// Entries are keyed by `<document_hash>/<shard_index>`.
pub trait ShardEntryDaoTrait: Send + Sync {
    /// Inserts a `ShardEntry` into the data store, replacing any entry under `key`.
    fn insert(&self, key: &str, entry: &ShardEntry) -> Result<(), Box<dyn Error>>;

    /// Retrieves a `ShardEntry` from the data store by its key.
    ///
    /// # Returns
    ///
    /// A `Result` containing an `Option<ShardEntry>`. `None` if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<ShardEntry>, Box<dyn Error>>;

    fn get_all(&self) -> Result<Vec<(String, ShardEntry)>, Box<dyn Error>>;

    /// Returns every entry whose key starts with `prefix`.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<ShardEntry>, Box<dyn Error>>;
}

/// A `ShardEntryDaoTrait` implementation using Sled, an embedded database.
///
/// Entries are stored as JSON.
pub struct SledShardEntryDao {
    db: Db,
}

impl SledShardEntryDao {
    /// Opens or creates the database at `db_path`.
    ///
    /// ```ignore
    /// use docshard::repository::SledShardEntryDao;
    ///
    /// let dao = SledShardEntryDao::new("path/to/db").unwrap();
    /// ```
    pub fn new(db_path: &str) -> Result<Self, Box<dyn Error>> {
        let db = sled::open(db_path)?;
        Ok(SledShardEntryDao { db })
    }
}

impl ShardEntryDaoTrait for SledShardEntryDao {
    fn insert(&self, key: &str, entry: &ShardEntry) -> Result<(), Box<dyn Error>> {
        let serialized = serde_json::to_string(entry)?;
        self.db.insert(key, serialized.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<ShardEntry>, Box<dyn Error>> {
        if let Some(found) = self.db.get(key)? {
            let entry: ShardEntry = serde_json::from_slice(&found)?;
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    fn get_all(&self) -> Result<Vec<(String, ShardEntry)>, Box<dyn Error>> {
        let mut entries = Vec::new();
        for entry in self.db.iter() {
            let (key, value) = entry?;
            let entry: ShardEntry = serde_json::from_slice(&value)?;
            entries.push((String::from_utf8(key.to_vec())?, entry));
        }
        Ok(entries)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<ShardEntry>, Box<dyn Error>> {
        let mut entries = Vec::new();
        for entry in self.db.scan_prefix(prefix) {
            let (_, value) = entry?;
            entries.push(serde_json::from_slice(&value)?);
        }
        Ok(entries)
    }
}

/// An in-memory `ShardEntryDaoTrait`, used when no database path is configured.
///
/// ```rust
/// use docshard::repository::{HashMapShardEntryDao, ShardEntryDaoTrait};
///
/// let dao = HashMapShardEntryDao::default();
/// assert!(dao.get("some_key").unwrap().is_none());
/// ```
#[derive(Default)]
pub struct HashMapShardEntryDao {
    pub map: Mutex<HashMap<String, ShardEntry>>,
}

impl ShardEntryDaoTrait for HashMapShardEntryDao {
    fn insert(&self, key: &str, entry: &ShardEntry) -> Result<(), Box<dyn Error>> {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        map.insert(key.to_string(), entry.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<ShardEntry>, Box<dyn Error>> {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(key).cloned())
    }

    fn get_all(&self) -> Result<Vec<(String, ShardEntry)>, Box<dyn Error>> {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<ShardEntry>, Box<dyn Error>> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v)
            .collect())
    }
}
