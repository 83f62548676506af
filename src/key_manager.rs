//! Lifecycle of the store's key and the authoritative answer to "can the key
//! be used right now?".

use std::sync::Arc;

use rand::RngCore;
use tracing::{debug, error, info, instrument};

use crate::crypt::{NONCE_LEN, Nonce};
use crate::error::{KeystoreError, Result, StoreError};
use crate::keystore::{KeyHandle, KeySpec, Keystore};

/// Fixed payload sealed by the usability probe. The ciphertext is discarded.
const PROBE_PAYLOAD: &[u8] = b"credstore-probe";

/// Usability of the store's key as observed by the last probe.
///
/// ```text
/// NoKey --ensure_key--> Ready <--presence lapses / re-auth--> UserNotAuthenticated
///   ^                     |                                        |
///   |                     +------ enrollment change ---------------+
///   |                     v
///   +--invalidate-- PermanentlyInvalidated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAuthState {
    NoKey,
    Ready,
    /// Recoverable: the user must re-prove presence.
    UserNotAuthenticated,
    /// Not recoverable: the key must be deleted and regenerated.
    PermanentlyInvalidated,
    /// Below the minimum capability level; encryption is skipped entirely.
    NotSupported,
}

pub struct KeyManager {
    keystore: Arc<dyn Keystore>,
    spec: KeySpec,
}

impl KeyManager {
    pub fn new(keystore: Arc<dyn Keystore>, spec: KeySpec) -> Self {
        Self { keystore, spec }
    }

    pub fn alias(&self) -> &str {
        &self.spec.alias
    }

    pub fn spec(&self) -> &KeySpec {
        &self.spec
    }

    pub fn keystore(&self) -> &Arc<dyn Keystore> {
        &self.keystore
    }

    /// Current handle, without probing whether it is usable.
    pub fn handle(&self) -> Result<Option<KeyHandle>> {
        Ok(self.keystore.get(&self.spec.alias)?)
    }

    /// Return the existing key, generating one if the alias is empty.
    #[instrument(level = "debug", skip(self), fields(alias = %self.spec.alias))]
    pub fn ensure_key(&self) -> Result<KeyHandle> {
        if let Some(handle) = self.keystore.get(&self.spec.alias)? {
            debug!(?handle, "key already present");
            return Ok(handle);
        }
        let handle = self.keystore.generate(&self.spec)?;
        info!(?handle, "created store key");
        Ok(handle)
    }

    /// Classify current key usability with a zero-effect seal attempt.
    #[instrument(level = "debug", skip(self), fields(alias = %self.spec.alias))]
    pub fn state(&self) -> Result<KeyAuthState> {
        if !self.keystore.is_supported() {
            return Ok(KeyAuthState::NotSupported);
        }
        let handle = match self.keystore.get(&self.spec.alias) {
            Ok(Some(handle)) => handle,
            Ok(None) => return Ok(KeyAuthState::NoKey),
            Err(KeystoreError::NotSupported) => return Ok(KeyAuthState::NotSupported),
            Err(e) => return Err(e.into()),
        };

        let mut nonce: Nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let state = match self.keystore.seal(&handle, &nonce, PROBE_PAYLOAD) {
            Ok(_) => KeyAuthState::Ready,
            Err(KeystoreError::UserNotAuthenticated { .. }) => KeyAuthState::UserNotAuthenticated,
            Err(KeystoreError::KeyPermanentlyInvalidated { .. }) => {
                KeyAuthState::PermanentlyInvalidated
            }
            Err(KeystoreError::NotSupported) => KeyAuthState::NotSupported,
            // Deleted between get and seal
            Err(KeystoreError::KeyNotFound(_)) => KeyAuthState::NoKey,
            Err(e) => {
                error!(error = %e, "key probe failed");
                return Err(StoreError::from(e));
            }
        };
        debug!(?state, "probed key");
        Ok(state)
    }

    /// Delete the key material. Returns whether a key was removed.
    #[instrument(level = "debug", skip(self), fields(alias = %self.spec.alias))]
    pub fn invalidate(&self) -> Result<bool> {
        let removed = self.keystore.delete(&self.spec.alias)?;
        if removed {
            info!("store key deleted");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeystore;

    fn manager() -> (Arc<MemoryKeystore>, KeyManager) {
        let ks = Arc::new(MemoryKeystore::new());
        let manager = KeyManager::new(ks.clone(), KeySpec::new("test-key"));
        (ks, manager)
    }

    #[test]
    fn ensure_key_is_idempotent() {
        let (_ks, manager) = manager();
        assert_eq!(manager.state().unwrap(), KeyAuthState::NoKey);

        let first = manager.ensure_key().unwrap();
        let second = manager.ensure_key().unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.state().unwrap(), KeyAuthState::Ready);
        assert_eq!(manager.handle().unwrap(), Some(first));
    }

    #[test]
    fn state_follows_presence() {
        let (ks, manager) = manager();
        manager.ensure_key().unwrap();

        ks.presence().revoke_presence();
        assert_eq!(manager.state().unwrap(), KeyAuthState::UserNotAuthenticated);

        ks.presence().confirm_presence();
        assert_eq!(manager.state().unwrap(), KeyAuthState::Ready);
    }

    #[test]
    fn invalidation_then_regeneration_yields_new_key() {
        let (ks, manager) = manager();
        let old = manager.ensure_key().unwrap();

        ks.presence().enroll(b"new fingerprint");
        assert_eq!(manager.state().unwrap(), KeyAuthState::PermanentlyInvalidated);

        assert!(manager.invalidate().unwrap());
        assert_eq!(manager.state().unwrap(), KeyAuthState::NoKey);

        let new = manager.ensure_key().unwrap();
        assert_ne!(old, new);
        assert_eq!(manager.state().unwrap(), KeyAuthState::Ready);
    }

    #[test]
    fn unsupported_platform() {
        let manager = KeyManager::new(Arc::new(MemoryKeystore::unsupported()), KeySpec::default());
        assert_eq!(manager.state().unwrap(), KeyAuthState::NotSupported);
        assert!(manager.ensure_key().is_err());
    }
}
