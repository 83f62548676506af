//! Platform keystore contract.
//!
//! A keystore owns AES-256-GCM keys by alias and never hands out key bytes.
//! Callers get a [`KeyHandle`] and ask the keystore to seal or open data
//! under it. Every use is authorized against the key's presence window and
//! the enrollment it was created under; the two refusal classes
//! ([`KeystoreError::UserNotAuthenticated`] and
//! [`KeystoreError::KeyPermanentlyInvalidated`]) must stay distinguishable.
//!
//! Backends:
//! - [`MemoryKeystore`]: software keystore, device root secret held in process memory
//! - `TpmKeystore` (feature `tpm`): device root secret sealed by a TPM 2.0

use std::fmt;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypt::Nonce;
use crate::error::KeystoreError;

mod memory;
#[cfg(feature = "tpm")]
pub mod tpm;

pub use memory::MemoryKeystore;
#[cfg(feature = "tpm")]
pub use tpm::TpmKeystore;

pub const KEY_ID_LEN: usize = 16;
pub const DEFAULT_KEY_ALIAS: &str = "credstore-aes-key";
pub const DEFAULT_AUTH_VALIDITY: Duration = Duration::from_secs(600);

/// Opaque reference to a keystore-held key.
///
/// `id` is random per generated key, so a key regenerated under the same
/// alias never compares equal to the one it replaced.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyHandle {
    alias: String,
    id: [u8; KEY_ID_LEN],
}

impl KeyHandle {
    pub(crate) fn new(alias: impl Into<String>, id: [u8; KEY_ID_LEN]) -> Self {
        Self {
            alias: alias.into(),
            id,
        }
    }

    pub(crate) fn generate(alias: impl Into<String>) -> Self {
        let mut id = [0u8; KEY_ID_LEN];
        rand::rng().fill_bytes(&mut id);
        Self::new(alias, id)
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn id(&self) -> &[u8; KEY_ID_LEN] {
        &self.id
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHandle({}#", self.alias)?;
        for b in &self.id[..4] {
            write!(f, "{b:02x}")?;
        }
        f.write_str(")")
    }
}

/// Parameters for generating a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    pub alias: String,
    /// How long a presence proof keeps the key usable.
    pub validity: Duration,
    pub require_presence: bool,
}

impl KeySpec {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            validity: DEFAULT_AUTH_VALIDITY,
            require_presence: true,
        }
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_presence(mut self, required: bool) -> Self {
        self.require_presence = required;
        self
    }
}

impl Default for KeySpec {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_ALIAS)
    }
}

/// The keystore operations the store depends on.
pub trait Keystore: Send + Sync {
    /// Capability probe. An unsupported keystore fails every other call
    /// with [`KeystoreError::NotSupported`].
    fn is_supported(&self) -> bool {
        true
    }

    /// Handle for `alias`, if a key exists under it.
    fn get(&self, alias: &str) -> Result<Option<KeyHandle>, KeystoreError>;

    /// Generate a new key, replacing whatever was stored under the alias.
    fn generate(&self, spec: &KeySpec) -> Result<KeyHandle, KeystoreError>;

    /// Delete the key under `alias`. Returns whether a key was removed.
    fn delete(&self, alias: &str) -> Result<bool, KeystoreError>;

    /// Authenticated encryption; the tag is appended to the ciphertext.
    fn seal(
        &self,
        key: &KeyHandle,
        nonce: &Nonce,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KeystoreError>;

    /// Authenticated decryption; fails with [`KeystoreError::Crypto`] when
    /// the tag does not verify.
    fn open(
        &self,
        key: &KeyHandle,
        nonce: &Nonce,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeystoreError>;
}

/// Authorization shared by backends: enrollment binding first, then presence.
///
/// Returns `Err` with the refusal class; the caller is responsible for
/// making an invalidation sticky.
pub(crate) fn authorize(
    alias: &str,
    bound_enrollment: &[u8; 32],
    invalidated: bool,
    validity: Duration,
    require_presence: bool,
    gate: &crate::presence::PresenceGate,
) -> Result<(), KeystoreError> {
    if invalidated || *bound_enrollment != gate.enrollment() {
        return Err(KeystoreError::KeyPermanentlyInvalidated {
            alias: alias.to_string(),
        });
    }
    if require_presence && !gate.is_fresh(validity) {
        return Err(KeystoreError::UserNotAuthenticated {
            alias: alias.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_differ_per_generation() {
        let a = KeyHandle::generate("alias");
        let b = KeyHandle::generate("alias");
        assert_eq!(a.alias(), b.alias());
        assert_ne!(a, b);
        assert!(format!("{a:?}").starts_with("KeyHandle(alias#"));
    }

    #[test]
    fn key_spec_defaults() {
        let spec = KeySpec::default();
        assert_eq!(spec.alias, DEFAULT_KEY_ALIAS);
        assert_eq!(spec.validity, Duration::from_secs(600));
        assert!(spec.require_presence);
    }

    #[test]
    fn handle_and_spec_persist_as_json() {
        let handle = KeyHandle::generate("persisted");
        let json = serde_json::to_string(&handle).unwrap();
        assert_eq!(serde_json::from_str::<KeyHandle>(&json).unwrap(), handle);

        let spec = KeySpec::new("persisted")
            .with_validity(Duration::from_secs(30))
            .with_presence(false);
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(serde_json::from_str::<KeySpec>(&json).unwrap(), spec);
    }
}
