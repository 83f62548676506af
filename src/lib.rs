//! Encrypted local storage for authentication credentials.
//!
//! Small payloads (serialized identity state, user lists) are sealed with
//! AES-256-GCM under a keystore-held key, written one file per store, and
//! read back after the keystore confirms the key is still usable. Key-state
//! changes are reported to the host through an [`EventChannel`].
//!
//! Without the `tpm` feature the only keystore is [`MemoryKeystore`], whose
//! root secret lives in process memory and is regenerated on every start.
//! Data it sealed cannot be read back after a restart; reads return empty
//! as for any orphaned store. Enable `tpm` and use `TpmKeystore` for a root
//! secret that survives restarts.

pub mod blob;
pub mod codec;
pub mod config;
pub mod crypt;
pub mod error;
pub mod event;
pub mod key_manager;
pub mod keystore;
pub mod kv;
pub mod ledger;
pub mod presence;
pub mod store;

pub use config::StoreConfig;
pub use error::{KeystoreError, Result, StoreError};
pub use event::{EventChannel, EventKind, EventReceiver, StoreEvent};
pub use key_manager::{KeyAuthState, KeyManager};
#[cfg(feature = "tpm")]
pub use keystore::TpmKeystore;
pub use keystore::{KeyHandle, KeySpec, Keystore, MemoryKeystore};
pub use presence::PresenceGate;
pub use store::{SecureStore, StoreId, WriteOutcome};
