use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::blob::DEFAULT_CHUNK_SIZE;
use crate::error::{Result, StoreError};
use crate::event::DEFAULT_EVENT_CAPACITY;
use crate::keystore::{DEFAULT_AUTH_VALIDITY, DEFAULT_KEY_ALIAS, KeySpec};

/// Directory under the root holding the nonce ledger. Never a valid store id.
pub const LEDGER_DIR: &str = "ledger";

/// Store configuration.
///
/// Every field has a default, so a partial document deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the store files and the nonce ledger.
    pub root: PathBuf,
    /// Keystore alias of the store key.
    pub key_alias: String,
    /// Seconds a presence proof keeps the key usable.
    pub auth_validity_secs: u64,
    pub require_user_presence: bool,
    /// Store plaintext when the keystore is unsupported instead of refusing to open.
    pub allow_plaintext_fallback: bool,
    /// Queue depth of each event subscriber.
    pub event_capacity: usize,
    pub read_chunk_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./credstore"),
            key_alias: DEFAULT_KEY_ALIAS.to_string(),
            auth_validity_secs: DEFAULT_AUTH_VALIDITY.as_secs(),
            require_user_presence: true,
            allow_plaintext_fallback: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            read_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_key_alias(mut self, alias: impl Into<String>) -> Self {
        self.key_alias = alias.into();
        self
    }

    pub fn with_auth_validity(mut self, validity: Duration) -> Self {
        self.auth_validity_secs = validity.as_secs();
        self
    }

    pub fn with_user_presence(mut self, required: bool) -> Self {
        self.require_user_presence = required;
        self
    }

    pub fn with_plaintext_fallback(mut self, allowed: bool) -> Self {
        self.allow_plaintext_fallback = allowed;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    pub fn auth_validity(&self) -> Duration {
        Duration::from_secs(self.auth_validity_secs)
    }

    pub fn key_spec(&self) -> KeySpec {
        KeySpec::new(self.key_alias.clone())
            .with_validity(self.auth_validity())
            .with_presence(self.require_user_presence)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_DIR)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_alias.trim().is_empty() {
            return Err(StoreError::Config("key_alias must not be empty".into()));
        }
        if self.event_capacity == 0 {
            return Err(StoreError::Config("event_capacity must be positive".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(StoreError::Config("read_chunk_size must be positive".into()));
        }
        Ok(())
    }

    /// Load configuration from `CREDSTORE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// unset variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(root) = lookup("CREDSTORE_ROOT") {
            config.root = root.into();
        }
        if let Some(alias) = lookup("CREDSTORE_KEY_ALIAS") {
            config.key_alias = alias;
        }
        if let Some(secs) = lookup("CREDSTORE_AUTH_VALIDITY_SECS") {
            config.auth_validity_secs = parse("CREDSTORE_AUTH_VALIDITY_SECS", &secs)?;
        }
        if let Some(flag) = lookup("CREDSTORE_REQUIRE_PRESENCE") {
            config.require_user_presence = parse_flag("CREDSTORE_REQUIRE_PRESENCE", &flag)?;
        }
        if let Some(flag) = lookup("CREDSTORE_PLAINTEXT_FALLBACK") {
            config.allow_plaintext_fallback = parse_flag("CREDSTORE_PLAINTEXT_FALLBACK", &flag)?;
        }
        if let Some(capacity) = lookup("CREDSTORE_EVENT_CAPACITY") {
            config.event_capacity = parse("CREDSTORE_EVENT_CAPACITY", &capacity)?;
        }
        if let Some(size) = lookup("CREDSTORE_READ_CHUNK_SIZE") {
            config.read_chunk_size = parse("CREDSTORE_READ_CHUNK_SIZE", &size)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| StoreError::Config(format!("{name}: {e}")))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(StoreError::Config(format!("{name}: not a boolean: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = StoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.auth_validity(), Duration::from_secs(600));
        assert!(!config.allow_plaintext_fallback);
        assert_eq!(config.read_chunk_size, 255);
    }

    #[test]
    fn env_overrides() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("CREDSTORE_ROOT", "/var/lib/credstore"),
            ("CREDSTORE_KEY_ALIAS", "session-key"),
            ("CREDSTORE_AUTH_VALIDITY_SECS", "30"),
            ("CREDSTORE_PLAINTEXT_FALLBACK", "yes"),
            ("CREDSTORE_REQUIRE_PRESENCE", "0"),
        ]))
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/var/lib/credstore"));
        assert!(config.allow_plaintext_fallback);

        let spec = config.key_spec();
        assert_eq!(spec.alias, "session-key");
        assert_eq!(spec.validity, Duration::from_secs(30));
        assert!(!spec.require_presence);
    }

    #[test]
    fn rejects_bad_values() {
        let rejected =
            |name: &str, value: &str| StoreConfig::from_lookup(lookup(&[(name, value)])).is_err();
        assert!(rejected("CREDSTORE_AUTH_VALIDITY_SECS", "soon"));
        assert!(rejected("CREDSTORE_PLAINTEXT_FALLBACK", "maybe"));
        assert!(rejected("CREDSTORE_EVENT_CAPACITY", "0"));
        assert!(StoreConfig::new("/tmp").with_key_alias(" ").validate().is_err());
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config: StoreConfig = serde_json::from_str(
            r#"{ "root": "/srv/credstore", "allow_plaintext_fallback": true }"#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/credstore"));
        assert!(config.allow_plaintext_fallback);
        assert_eq!(config.key_alias, DEFAULT_KEY_ALIAS);
        assert_eq!(config.auth_validity_secs, 600);
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.read_chunk_size, DEFAULT_CHUNK_SIZE);

        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<StoreConfig>(&json).unwrap(), config);
    }
}
