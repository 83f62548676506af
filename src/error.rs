//! Error taxonomy for the keystore seam and the store built on top of it.

use thiserror::Error;

/// Failures reported by a [`Keystore`](crate::keystore::Keystore) backend.
///
/// The first two variants are the distinguishable refusal classes every
/// platform keystore must report; the store reacts to each differently.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// The presence window lapsed. Recoverable once the user re-proves presence.
    #[error("user must re-authenticate before key `{alias}` can be used")]
    UserNotAuthenticated { alias: String },
    /// The key was revoked by an enrollment change. Data sealed under it is gone.
    #[error("key `{alias}` was permanently invalidated")]
    KeyPermanentlyInvalidated { alias: String },
    #[error("no key `{0}` in the keystore")]
    KeyNotFound(String),
    #[error("keystore is not supported on this platform")]
    NotSupported,
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
    #[error("keystore backend failure: {0}")]
    Backend(String),
}

/// Errors surfaced by [`SecureStore`](crate::store::SecureStore) and its parts.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on store `{store}`: {source}")]
    Io {
        store: String,
        #[source]
        source: std::io::Error,
    },
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),
    #[error("user is not authenticated")]
    UserNotAuthenticated,
    #[error("key was permanently invalidated")]
    KeyPermanentlyInvalidated,
    #[error("crypto failure: {0}")]
    CryptoFailure(String),
    #[error("nonce ledger failure: {0}")]
    Ledger(#[from] sled::Error),
    #[error("invalid store id `{0}`")]
    InvalidStoreId(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    pub(crate) fn io(store: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            store: store.into(),
            source,
        }
    }
}

impl From<KeystoreError> for StoreError {
    fn from(err: KeystoreError) -> Self {
        match err {
            KeystoreError::UserNotAuthenticated { .. } => Self::UserNotAuthenticated,
            KeystoreError::KeyPermanentlyInvalidated { .. } => Self::KeyPermanentlyInvalidated,
            KeystoreError::Crypto(msg) => Self::CryptoFailure(msg),
            other @ (KeystoreError::KeyNotFound(_)
            | KeystoreError::NotSupported
            | KeystoreError::Backend(_)) => Self::KeyUnavailable(other.to_string()),
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
