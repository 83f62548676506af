use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::{KeyHandle, KeySpec, Keystore, authorize};
use crate::crypt::{KeyMaterial, Nonce};
use crate::error::KeystoreError;
use crate::presence::{EnrollmentFingerprint, PresenceGate};

struct StoredKey {
    handle: KeyHandle,
    validity: Duration,
    require_presence: bool,
    enrollment: EnrollmentFingerprint,
    invalidated: bool,
}

/// Software keystore that keeps its device root secret in process memory.
///
/// Working keys are derived from the root per handle, so they never exist
/// outside a single seal/open call. Suitable for hosts without a TPM and
/// for tests; keys do not survive the process.
pub struct MemoryKeystore {
    root: KeyMaterial,
    keys: Mutex<HashMap<String, StoredKey>>,
    gate: PresenceGate,
    supported: bool,
}

impl MemoryKeystore {
    /// A keystore whose user has just proved presence.
    pub fn new() -> Self {
        Self::with_gate(PresenceGate::confirmed())
    }

    pub fn with_gate(gate: PresenceGate) -> Self {
        Self {
            root: KeyMaterial::generate(),
            keys: Mutex::new(HashMap::new()),
            gate,
            supported: true,
        }
    }

    /// A keystore standing in for a platform below the minimum capability level.
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    /// Presence and enrollment state the host drives.
    pub fn presence(&self) -> &PresenceGate {
        &self.gate
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredKey>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_supported(&self) -> Result<(), KeystoreError> {
        if self.supported {
            Ok(())
        } else {
            Err(KeystoreError::NotSupported)
        }
    }

    /// Authorize `key` and derive its working key.
    fn working_key(&self, key: &KeyHandle) -> Result<KeyMaterial, KeystoreError> {
        self.ensure_supported()?;
        let mut keys = self.lock();
        let stored = keys
            .get_mut(key.alias())
            .filter(|stored| stored.handle == *key)
            .ok_or_else(|| KeystoreError::KeyNotFound(key.alias().to_string()))?;

        let verdict = authorize(
            key.alias(),
            &stored.enrollment,
            stored.invalidated,
            stored.validity,
            stored.require_presence,
            &self.gate,
        );
        if let Err(KeystoreError::KeyPermanentlyInvalidated { .. }) = &verdict {
            if !stored.invalidated {
                warn!(alias = key.alias(), "key invalidated by enrollment change");
            }
            stored.invalidated = true;
        }
        verdict?;

        self.root.derive(key.id(), key.alias().as_bytes())
    }
}

impl Default for MemoryKeystore {
    fn default() -> Self {
        Self::new()
    }
}

impl Keystore for MemoryKeystore {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn get(&self, alias: &str) -> Result<Option<KeyHandle>, KeystoreError> {
        self.ensure_supported()?;
        Ok(self.lock().get(alias).map(|stored| stored.handle.clone()))
    }

    #[instrument(level = "debug", skip(self, spec), fields(alias = %spec.alias))]
    fn generate(&self, spec: &KeySpec) -> Result<KeyHandle, KeystoreError> {
        self.ensure_supported()?;
        let handle = KeyHandle::generate(spec.alias.clone());
        let stored = StoredKey {
            handle: handle.clone(),
            validity: spec.validity,
            require_presence: spec.require_presence,
            enrollment: self.gate.enrollment(),
            invalidated: false,
        };
        if self.lock().insert(spec.alias.clone(), stored).is_some() {
            debug!("replaced existing key");
        }
        info!(?handle, "generated key");
        Ok(handle)
    }

    fn delete(&self, alias: &str) -> Result<bool, KeystoreError> {
        self.ensure_supported()?;
        let removed = self.lock().remove(alias).is_some();
        if removed {
            info!(alias, "deleted key");
        }
        Ok(removed)
    }

    fn seal(
        &self,
        key: &KeyHandle,
        nonce: &Nonce,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KeystoreError> {
        self.working_key(key)?.seal(nonce, plaintext)
    }

    fn open(
        &self,
        key: &KeyHandle,
        nonce: &Nonce,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeystoreError> {
        self.working_key(key)?.open(nonce, ciphertext)
    }
}
