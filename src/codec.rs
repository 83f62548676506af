use std::sync::Arc;

use rand::RngCore;
use tracing::trace;

use crate::crypt::{NONCE_LEN, Nonce};
use crate::error::{KeystoreError, Result, StoreError};
use crate::keystore::{KeyHandle, Keystore};

/// Ciphertext (tag appended) plus the nonce it was produced with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub ciphertext: Vec<u8>,
    pub nonce: Nonce,
}

/// AES-256-GCM through a keystore handle, with a fresh nonce per encryption.
///
/// Stateless apart from the keystore reference; persisting the nonce is
/// the caller's job.
#[derive(Clone)]
pub struct CipherCodec {
    keystore: Arc<dyn Keystore>,
}

impl CipherCodec {
    pub fn new(keystore: Arc<dyn Keystore>) -> Self {
        Self { keystore }
    }

    pub fn encrypt(&self, key: &KeyHandle, plaintext: &[u8]) -> Result<EncryptedBlob> {
        let mut nonce: Nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .keystore
            .seal(key, &nonce, plaintext)
            .map_err(classify)?;
        trace!(len = ciphertext.len(), "encrypted payload");
        Ok(EncryptedBlob { ciphertext, nonce })
    }

    pub fn decrypt(&self, key: &KeyHandle, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce: &Nonce = nonce.try_into().map_err(|_| {
            StoreError::CryptoFailure(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            ))
        })?;
        self.keystore
            .open(key, nonce, ciphertext)
            .map_err(classify)
    }
}

/// Key-state refusals keep their class; anything else is a generic crypto failure.
fn classify(err: KeystoreError) -> StoreError {
    match err {
        KeystoreError::UserNotAuthenticated { .. } => StoreError::UserNotAuthenticated,
        KeystoreError::KeyPermanentlyInvalidated { .. } => StoreError::KeyPermanentlyInvalidated,
        other => StoreError::CryptoFailure(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::keystore::{KeySpec, MemoryKeystore};

    fn codec() -> (Arc<MemoryKeystore>, CipherCodec, KeyHandle) {
        let ks = Arc::new(MemoryKeystore::new());
        let key = ks.generate(&KeySpec::default()).unwrap();
        (ks.clone(), CipherCodec::new(ks), key)
    }

    #[test]
    fn test_roundtrip() {
        let (_ks, codec, key) = codec();
        for plaintext in [&b""[..], &b"a"[..], &b"hello-world"[..], &[0xffu8; 4096][..]] {
            let blob = codec.encrypt(&key, plaintext).unwrap();
            let opened = codec.decrypt(&key, &blob.nonce, &blob.ciphertext).unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn test_nonce_never_repeats() {
        let (_ks, codec, key) = codec();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let blob = codec.encrypt(&key, b"same plaintext").unwrap();
            assert!(seen.insert(blob.nonce), "nonce reused");
        }
    }

    #[test]
    fn test_wrong_nonce_or_tamper_is_crypto_failure() {
        let (_ks, codec, key) = codec();
        let blob = codec.encrypt(&key, b"payload").unwrap();

        let mut other = blob.nonce;
        other[0] ^= 1;
        assert!(matches!(
            codec.decrypt(&key, &other, &blob.ciphertext),
            Err(StoreError::CryptoFailure(_))
        ));

        let mut tampered = blob.ciphertext.clone();
        *tampered.last_mut().unwrap() ^= 1;
        assert!(matches!(
            codec.decrypt(&key, &blob.nonce, &tampered),
            Err(StoreError::CryptoFailure(_))
        ));

        assert!(matches!(
            codec.decrypt(&key, &blob.nonce[..8], &blob.ciphertext),
            Err(StoreError::CryptoFailure(_))
        ));
    }

    #[test]
    fn test_key_state_refusals_propagate() {
        let (ks, codec, key) = codec();
        let blob = codec.encrypt(&key, b"payload").unwrap();

        ks.presence().revoke_presence();
        assert!(matches!(
            codec.encrypt(&key, b"x"),
            Err(StoreError::UserNotAuthenticated)
        ));
        assert!(matches!(
            codec.decrypt(&key, &blob.nonce, &blob.ciphertext),
            Err(StoreError::UserNotAuthenticated)
        ));

        ks.presence().confirm_presence();
        ks.presence().enroll(b"new device credential");
        assert!(matches!(
            codec.encrypt(&key, b"x"),
            Err(StoreError::KeyPermanentlyInvalidated)
        ));
    }
}
