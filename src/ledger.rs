use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, warn};

use crate::crypt::{NONCE_LEN, Nonce};
use crate::error::Result;
use crate::kv::{Collection, KvStore};
use crate::store::StoreId;

const LEDGER_COLLECTION: &str = "iv-ledger";

/// Durable record of the nonce used for each store's latest ciphertext.
///
/// One slot per store, overwritten on every successful encryption and kept
/// apart from the ciphertext file so it survives restarts. Values are
/// stored as base64 text.
#[derive(Clone)]
pub struct IvLedger {
    slots: Collection,
}

impl IvLedger {
    pub fn new(kv: &KvStore) -> Self {
        Self {
            slots: kv.collection(LEDGER_COLLECTION),
        }
    }

    pub fn put(&self, store: &StoreId, nonce: &Nonce) -> Result<()> {
        self.slots
            .insert(store.as_str(), BASE64.encode(nonce).into_bytes())?;
        debug!(%store, "recorded nonce");
        Ok(())
    }

    /// The stored nonce, or `None` if the slot is empty or unreadable.
    pub fn get(&self, store: &StoreId) -> Result<Option<Nonce>> {
        let Some(raw) = self.slots.get(store.as_str())? else {
            return Ok(None);
        };
        let decoded = match BASE64.decode(raw.as_ref()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(%store, error = %e, "nonce slot is not valid base64");
                return Ok(None);
            }
        };
        match <Nonce>::try_from(decoded.as_slice()) {
            Ok(nonce) => Ok(Some(nonce)),
            Err(_) => {
                warn!(
                    %store,
                    len = decoded.len(),
                    "nonce slot has wrong length, expected {NONCE_LEN}"
                );
                Ok(None)
            }
        }
    }

    pub fn remove(&self, store: &StoreId) -> Result<bool> {
        Ok(self.slots.remove(store.as_str())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_overwrite() {
        let kv = KvStore::temporary().unwrap();
        let ledger = IvLedger::new(&kv);
        let store = StoreId::user();

        assert_eq!(ledger.get(&store).unwrap(), None);
        ledger.put(&store, &[1u8; NONCE_LEN]).unwrap();
        ledger.put(&store, &[2u8; NONCE_LEN]).unwrap();
        assert_eq!(ledger.get(&store).unwrap(), Some([2u8; NONCE_LEN]));

        // per store slots
        assert_eq!(ledger.get(&StoreId::mpin()).unwrap(), None);

        assert!(ledger.remove(&store).unwrap());
        assert_eq!(ledger.get(&store).unwrap(), None);
    }

    #[test]
    fn test_slot_is_base64_text() {
        let kv = KvStore::temporary().unwrap();
        let ledger = IvLedger::new(&kv);
        ledger.put(&StoreId::mpin(), &[0xffu8; NONCE_LEN]).unwrap();

        let raw = kv
            .collection(LEDGER_COLLECTION)
            .get("mpin-storage")
            .unwrap()
            .unwrap();
        assert_eq!(raw.as_ref(), b"////////////////");
    }

    #[test]
    fn test_corrupt_slot_reads_as_empty() {
        let kv = KvStore::temporary().unwrap();
        let ledger = IvLedger::new(&kv);
        let slots = kv.collection(LEDGER_COLLECTION);

        slots.insert("user-storage", b"not base64!".to_vec()).unwrap();
        assert_eq!(ledger.get(&StoreId::user()).unwrap(), None);

        slots
            .insert("user-storage", BASE64.encode([0u8; 4]).into_bytes())
            .unwrap();
        assert_eq!(ledger.get(&StoreId::user()).unwrap(), None);
    }
}
