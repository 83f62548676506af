//! The write/read path tying key state to the cipher and storage primitives.
//!
//! Capability is decided once, when the store is opened: a supported
//! keystore yields [`SecureStore::Encrypting`], an unsupported one yields
//! [`SecureStore::Passthrough`] if plaintext fallback is enabled and an
//! error otherwise.
//!
//! Key-state trouble never surfaces as an error from `read`/`write`. It is
//! resolved locally (regenerate, return empty, withhold the write) and
//! reported on the [`EventChannel`] and through [`SecureStore::last_error`].
//! Only I/O and ledger failures come back as `Err`.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, info, instrument, warn};

use crate::blob::BlobStore;
use crate::codec::CipherCodec;
use crate::config::{LEDGER_DIR, StoreConfig};
use crate::error::{Result, StoreError};
use crate::event::{EventChannel, EventKind, EventReceiver, StoreEvent};
use crate::key_manager::{KeyAuthState, KeyManager};
use crate::keystore::{KeyHandle, Keystore};
use crate::kv::KvStore;
use crate::ledger::IvLedger;

/// Name of a logical store. Maps to one file and one nonce slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(String);

impl StoreId {
    pub const MPIN_STORAGE: &'static str = "mpin-storage";
    pub const USER_STORAGE: &'static str = "user-storage";

    /// Validate a store name. It becomes a file name next to the nonce
    /// ledger, so separators, dot entries and the ledger's name are rejected.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let invalid = name.is_empty()
            || name == "."
            || name == ".."
            || name == LEDGER_DIR
            || name.contains(['/', '\\', '\0']);
        if invalid {
            return Err(StoreError::InvalidStoreId(name));
        }
        Ok(Self(name))
    }

    /// Store for the authentication engine's identity state.
    pub fn mpin() -> Self {
        Self(Self::MPIN_STORAGE.to_string())
    }

    /// Store for the user list.
    pub fn user() -> Self {
        Self(Self::USER_STORAGE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StoreId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for StoreId {
    type Error = StoreError;

    fn try_from(name: &str) -> Result<Self> {
        Self::new(name)
    }
}

/// What a successful `write` did with the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Encrypted,
    /// Passthrough mode: written as-is.
    Plaintext,
    /// The key was not usable; nothing was persisted and the previous
    /// content is untouched. See [`SecureStore::last_error`].
    Withheld,
}

impl WriteOutcome {
    pub fn is_persisted(&self) -> bool {
        !matches!(self, Self::Withheld)
    }
}

/// A store session. Owned by whoever sets up the authentication engine;
/// one worker drives it, which `&mut self` on every operation enforces.
pub enum SecureStore {
    Encrypting(EncryptingStore),
    Passthrough(PassthroughStore),
}

impl SecureStore {
    pub fn open(config: &StoreConfig, keystore: Arc<dyn Keystore>) -> Result<Self> {
        config.validate()?;
        let events = EventChannel::new(config.event_capacity);

        if keystore.is_supported() {
            info!(root = ?config.root, "opening encrypting store");
            return Ok(Self::Encrypting(EncryptingStore::new(config, keystore, events)?));
        }
        if config.allow_plaintext_fallback {
            warn!(
                root = ?config.root,
                "keystore not supported, data will be stored WITHOUT encryption"
            );
            return Ok(Self::Passthrough(PassthroughStore::new(config, events)));
        }
        Err(StoreError::KeyUnavailable(
            "keystore is not supported on this platform and plaintext fallback is disabled".into(),
        ))
    }

    pub fn write(&mut self, store: &StoreId, plaintext: &[u8]) -> Result<WriteOutcome> {
        match self {
            Self::Encrypting(inner) => inner.write(store, plaintext),
            Self::Passthrough(inner) => inner.write(store, plaintext),
        }
    }

    /// Stored payload, or empty when there is none or it cannot be read.
    pub fn read(&mut self, store: &StoreId) -> Result<Vec<u8>> {
        match self {
            Self::Encrypting(inner) => inner.read(store),
            Self::Passthrough(inner) => inner.read(store),
        }
    }

    /// Delete the store. Returns whether there was anything to delete.
    pub fn clear(&mut self, store: &StoreId) -> Result<bool> {
        match self {
            Self::Encrypting(inner) => inner.clear(store),
            Self::Passthrough(inner) => inner.clear(store),
        }
    }

    /// Why the last operation failed or was withheld, if it was.
    pub fn last_error(&self) -> Option<&str> {
        match self {
            Self::Encrypting(inner) => inner.last_error.as_deref(),
            Self::Passthrough(inner) => inner.last_error.as_deref(),
        }
    }

    pub fn events(&self) -> &EventChannel {
        match self {
            Self::Encrypting(inner) => &inner.events,
            Self::Passthrough(inner) => &inner.events,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events().subscribe()
    }

    pub fn is_encrypting(&self) -> bool {
        matches!(self, Self::Encrypting(_))
    }

    /// Handle of the current store key. Always `None` in passthrough mode.
    pub fn key_handle(&self) -> Result<Option<KeyHandle>> {
        match self {
            Self::Encrypting(inner) => inner.keys.handle(),
            Self::Passthrough(_) => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Read,
    Write,
}

pub struct EncryptingStore {
    keys: KeyManager,
    codec: CipherCodec,
    ledger: IvLedger,
    blobs: BlobStore,
    events: EventChannel,
    last_error: Option<String>,
}

impl EncryptingStore {
    fn new(
        config: &StoreConfig,
        keystore: Arc<dyn Keystore>,
        events: EventChannel,
    ) -> Result<Self> {
        let kv = KvStore::open(config.ledger_path())?;
        let keys = KeyManager::new(keystore.clone(), config.key_spec());
        if let Err(e) = keys.ensure_key() {
            warn!(error = %e, "could not create store key yet");
        }

        Ok(Self {
            keys,
            codec: CipherCodec::new(keystore),
            ledger: IvLedger::new(&kv),
            blobs: BlobStore::new(&config.root, config.read_chunk_size, events.clone()),
            events,
            last_error: None,
        })
    }

    #[instrument(level = "debug", skip(self, plaintext), fields(len = plaintext.len()))]
    fn write(&mut self, store: &StoreId, plaintext: &[u8]) -> Result<WriteOutcome> {
        self.last_error = None;
        let Some(key) = self.usable_key(store, Op::Write)? else {
            warn!(%store, "write withheld, key not usable");
            return Ok(WriteOutcome::Withheld);
        };

        let blob = match self.codec.encrypt(&key, plaintext) {
            Ok(blob) => blob,
            Err(e) => {
                self.refused(store, Op::Write, e);
                warn!(%store, "write withheld, encryption refused");
                return Ok(WriteOutcome::Withheld);
            }
        };

        let encoded = BASE64.encode(&blob.ciphertext);
        self.track(self.blobs.write(store, encoded.as_bytes()))?;
        self.track(self.ledger.put(store, &blob.nonce))?;
        debug!(%store, "stored encrypted payload");
        Ok(WriteOutcome::Encrypted)
    }

    #[instrument(level = "debug", skip(self))]
    fn read(&mut self, store: &StoreId) -> Result<Vec<u8>> {
        self.last_error = None;
        let raw = self.track(self.blobs.read(store))?;
        if raw.is_empty() {
            return Ok(raw);
        }

        let Some(key) = self.usable_key(store, Op::Read)? else {
            return Ok(Vec::new());
        };
        let Some(nonce) = self.track(self.ledger.get(store))? else {
            self.unreadable(store, "no nonce recorded for stored ciphertext");
            return Ok(Vec::new());
        };

        // tolerate line-wrapped base64 from older writers
        let text: Vec<u8> = raw
            .into_iter()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        let ciphertext = match BASE64.decode(&text) {
            Ok(ciphertext) => ciphertext,
            Err(_) => {
                self.unreadable(store, "stored data is not base64 ciphertext");
                return Ok(Vec::new());
            }
        };

        match self.codec.decrypt(&key, &nonce, &ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                self.refused(store, Op::Read, e);
                Ok(Vec::new())
            }
        }
    }

    fn clear(&mut self, store: &StoreId) -> Result<bool> {
        self.last_error = None;
        let cleared = self.track(self.blobs.clear(store))?;
        self.track(self.ledger.remove(store))?;
        if cleared {
            info!(%store, "store cleared");
        }
        Ok(cleared)
    }

    /// Resolve a key that can be used right now, reacting to its state.
    fn usable_key(&mut self, store: &StoreId, op: Op) -> Result<Option<KeyHandle>> {
        let state = match self.keys.state() {
            Ok(state) => state,
            Err(e) => {
                self.fail(e.to_string());
                return Ok(None);
            }
        };

        match state {
            KeyAuthState::Ready => match self.keys.handle() {
                Ok(Some(handle)) => Ok(Some(handle)),
                Ok(None) => {
                    self.fail("store key disappeared".into());
                    Ok(None)
                }
                Err(e) => {
                    self.fail(e.to_string());
                    Ok(None)
                }
            },
            KeyAuthState::NoKey => match op {
                Op::Write => Ok(self.fresh_key()),
                Op::Read => {
                    self.unreadable(store, "no store key, stored data is orphaned");
                    Ok(None)
                }
            },
            KeyAuthState::UserNotAuthenticated => {
                self.refused(store, op, StoreError::UserNotAuthenticated);
                Ok(None)
            }
            KeyAuthState::PermanentlyInvalidated => {
                self.refused(store, op, StoreError::KeyPermanentlyInvalidated);
                if let Err(e) = self.keys.invalidate() {
                    self.fail(e.to_string());
                    return Ok(None);
                }
                self.track(self.ledger.remove(store))?;
                match op {
                    // retried once against a new key
                    Op::Write => Ok(self.fresh_key()),
                    Op::Read => Ok(None),
                }
            }
            KeyAuthState::NotSupported => {
                self.fail("keystore reports encryption is not supported".into());
                Ok(None)
            }
        }
    }

    fn fresh_key(&mut self) -> Option<KeyHandle> {
        match self.keys.ensure_key() {
            Ok(handle) => Some(handle),
            Err(e) => {
                self.fail(e.to_string());
                None
            }
        }
    }

    /// Record a key-state or crypto refusal and notify the host.
    fn refused(&mut self, store: &StoreId, op: Op, err: StoreError) {
        match &err {
            StoreError::UserNotAuthenticated => {
                warn!(%store, "user must re-authenticate");
                self.events
                    .emit(StoreEvent::new(EventKind::UserShouldAuthenticate, store.clone()));
            }
            StoreError::KeyPermanentlyInvalidated => {
                warn!(%store, "store key permanently invalidated, stored data is unrecoverable");
                self.events
                    .emit(StoreEvent::new(EventKind::KeyPermanentlyInvalidated, store.clone()));
            }
            StoreError::CryptoFailure(_) if op == Op::Read => {
                warn!(%store, "stored data failed authentication, treating as unreadable");
            }
            StoreError::CryptoFailure(reason) => {
                warn!(%store, %reason, "encryption failed");
            }
            _ => {}
        }
        self.fail(err.to_string());
    }

    fn unreadable(&mut self, store: &StoreId, reason: &str) {
        warn!(%store, reason, "stored data is unreadable");
        self.fail(reason.to_string());
    }

    fn fail(&mut self, message: String) {
        self.last_error = Some(message);
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        result
    }
}

/// Reduced-security mode for platforms without a usable keystore.
pub struct PassthroughStore {
    blobs: BlobStore,
    events: EventChannel,
    last_error: Option<String>,
}

impl PassthroughStore {
    fn new(config: &StoreConfig, events: EventChannel) -> Self {
        Self {
            blobs: BlobStore::new(&config.root, config.read_chunk_size, events.clone()),
            events,
            last_error: None,
        }
    }

    fn write(&mut self, store: &StoreId, plaintext: &[u8]) -> Result<WriteOutcome> {
        self.last_error = None;
        self.track(self.blobs.write(store, plaintext))?;
        Ok(WriteOutcome::Plaintext)
    }

    fn read(&mut self, store: &StoreId) -> Result<Vec<u8>> {
        self.last_error = None;
        self.track(self.blobs.read(store))
    }

    fn clear(&mut self, store: &StoreId) -> Result<bool> {
        self.last_error = None;
        self.track(self.blobs.clear(store))
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        result
    }
}
