use aes_gcm::{Aes256Gcm, aead::Aead, aead::KeyInit};
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretSlice};
use zeroize::Zeroizing;

use crate::error::KeystoreError;

/// Size of an AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of an AES-GCM nonce in bytes.
pub const NONCE_LEN: usize = 12;
/// Size of the AES-GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

pub type Nonce = [u8; NONCE_LEN];

/// 256 bits of symmetric key material held inside a keystore.
///
/// This is either the device root secret, or a working key derived from it
/// for one alias. Key bytes live in a `SecretSlice` and are wiped on drop;
/// nothing outside a keystore backend ever holds one of these.
pub struct KeyMaterial {
    key: SecretSlice<u8>,
}

impl KeyMaterial {
    /// Fresh random key material from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        rand::rng().fill_bytes(bytes.as_mut_slice());
        Self::from_array(&bytes)
    }

    pub fn from_slice(key: &[u8]) -> Result<Self, KeystoreError> {
        if key.len() != KEY_SIZE {
            return Err(KeystoreError::Crypto(format!(
                "key material must be {KEY_SIZE} bytes, got {}",
                key.len()
            )));
        }
        Ok(Self {
            key: SecretSlice::new(key.to_vec().into()),
        })
    }

    fn from_array(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            key: SecretSlice::new(key.to_vec().into()),
        }
    }

    /// Derive a child key with HKDF-SHA256.
    ///
    /// `salt` makes every generated key unique, `info` binds it to its alias.
    pub fn derive(&self, salt: &[u8], info: &[u8]) -> Result<Self, KeystoreError> {
        if salt.is_empty() {
            return Err(KeystoreError::Crypto(
                "salt cannot be empty for key derivation".into(),
            ));
        }

        let hkdf = Hkdf::<sha2::Sha256>::new(Some(salt), self.key.expose_secret());
        let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
        hkdf.expand(info, okm.as_mut_slice())
            .map_err(|e| KeystoreError::Crypto(format!("hkdf expansion failed: {e}")))?;

        Ok(Self::from_array(&okm))
    }

    /// AES-256-GCM encrypt; the 16-byte tag is appended to the output.
    pub fn seal(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        self.cipher()?
            .encrypt(nonce.into(), plaintext)
            .map_err(|_| KeystoreError::Crypto("encryption failed".into()))
    }

    /// AES-256-GCM decrypt and verify the tag.
    pub fn open(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        self.cipher()?
            .decrypt(nonce.into(), ciphertext)
            .map_err(|_| KeystoreError::Crypto("authentication tag mismatch".into()))
    }

    #[cfg_attr(not(feature = "tpm"), allow(dead_code))]
    pub(crate) fn expose(&self) -> &[u8] {
        self.key.expose_secret()
    }

    fn cipher(&self) -> Result<Aes256Gcm, KeystoreError> {
        Aes256Gcm::new_from_slice(self.key.expose_secret())
            .map_err(|_| KeystoreError::Crypto("invalid AES-256 key length".into()))
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = KeyMaterial::generate();
        let nonce = [7u8; NONCE_LEN];
        let ciphertext = key.seal(&nonce, b"identity state").unwrap();
        assert_eq!(ciphertext.len(), b"identity state".len() + TAG_LEN);
        assert_eq!(key.open(&nonce, &ciphertext).unwrap(), b"identity state");
    }

    #[test]
    fn test_open_rejects_tampering() {
        let key = KeyMaterial::generate();
        let nonce = [1u8; NONCE_LEN];
        let mut ciphertext = key.seal(&nonce, b"payload").unwrap();
        ciphertext[0] ^= 0x80;
        assert!(matches!(
            key.open(&nonce, &ciphertext),
            Err(KeystoreError::Crypto(_))
        ));

        // right ciphertext, wrong nonce
        let ciphertext = key.seal(&nonce, b"payload").unwrap();
        assert!(key.open(&[2u8; NONCE_LEN], &ciphertext).is_err());
    }

    #[test]
    fn test_derive_is_deterministic_and_salted() {
        let root = KeyMaterial::from_slice(&[9u8; KEY_SIZE]).unwrap();
        let a = root.derive(b"salt-a", b"alias").unwrap();
        let a_again = root.derive(b"salt-a", b"alias").unwrap();
        let b = root.derive(b"salt-b", b"alias").unwrap();
        assert_eq!(a.expose(), a_again.expose());
        assert_ne!(a.expose(), b.expose());
        assert!(root.derive(b"", b"alias").is_err());
    }

    #[test]
    fn test_from_slice_checks_length() {
        assert!(KeyMaterial::from_slice(&[0u8; 16]).is_err());
        assert_eq!(format!("{:?}", KeyMaterial::generate()), "KeyMaterial([REDACTED])");
    }
}
