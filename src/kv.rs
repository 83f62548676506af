//! Module for handling key-value store operations.
//!
//! This module manages the small on-disk kv side channel using sled.

use std::path::Path;

use sled::{Db, IVec};
use tracing::{debug, error};

// Keys are namespaced per collection, delimited by a slash:
// `<collection_name>/<key>`
// e.g. `iv-ledger/user-storage` for the nonce of the user store, or
// `keystore/root` for a TPM-sealed device root secret.

/// A struct representing the kv side channel.
/// A wrapper around sled's `Db` type, which is itself cheap to clone.
#[derive(Clone)]
pub struct KvStore {
    db: Db,
}

impl KvStore {
    /// Opens (or creates) the kv store at the specified path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, sled::Error> {
        let path = path.as_ref();
        match sled::open(path) {
            Ok(db) => {
                debug!(?path, "opened kv store");
                Ok(Self { db })
            }
            Err(e) => {
                error!("Failed to open sled database at {:?}: {}", path, e);
                Err(e)
            }
        }
    }

    /// A throwaway store that is deleted on drop.
    pub fn temporary() -> Result<Self, sled::Error> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Returns a handle on the named collection.
    pub fn collection(&self, name: impl Into<String>) -> Collection {
        Collection {
            db: self.db.clone(),
            name: name.into(),
        }
    }
}

/// A prefix-scoped view of the kv store.
#[derive(Clone)]
pub struct Collection {
    db: Db,
    name: String,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self, key: &str) -> String {
        format!("{prefix}/{key}", prefix = self.name)
    }

    /// Inserts a value and flushes it to disk before returning.
    pub fn insert(&self, key: &str, value: impl Into<IVec>) -> Result<(), sled::Error> {
        self.db.insert(self.path(key), value)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<IVec>, sled::Error> {
        self.db.get(self.path(key))
    }

    /// Removes a value. Returns whether one was present.
    pub fn remove(&self, key: &str) -> Result<bool, sled::Error> {
        let removed = self.db.remove(self.path(key))?.is_some();
        if removed {
            self.db.flush()?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collections_do_not_collide() {
        let kv = KvStore::temporary().unwrap();
        let a = kv.collection("a");
        let b = kv.collection("b");

        a.insert("k", b"one".to_vec()).unwrap();
        b.insert("k", b"two".to_vec()).unwrap();

        assert_eq!(a.get("k").unwrap().unwrap().as_ref(), b"one");
        assert_eq!(b.get("k").unwrap().unwrap().as_ref(), b"two");
        assert_eq!(a.path("k"), "a/k");
    }

    #[test]
    fn test_remove_reports_presence() {
        let kv = KvStore::temporary().unwrap();
        let c = kv.collection("c");
        assert!(!c.remove("missing").unwrap());
        c.insert("k", b"v".to_vec()).unwrap();
        assert!(c.remove("k").unwrap());
        assert!(c.get("k").unwrap().is_none());
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = KvStore::open(dir.path().join("db")).unwrap();
            kv.collection("c").insert("k", b"v".to_vec()).unwrap();
        }
        let kv = KvStore::open(dir.path().join("db")).unwrap();
        assert_eq!(kv.collection("c").get("k").unwrap().unwrap().as_ref(), b"v");
    }
}
